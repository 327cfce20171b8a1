//! SQLite hook layer: capture inside the engine's transactions.
//!
//! Three callbacks are installed per write connection. The pre-update hook
//! fires before each row mutation and appends a [`Change`] to the
//! connection's buffer; the commit hook drains the buffer into a
//! [`Changeset`] and gates the engine's commit on publication; the rollback
//! hook discards the buffer.
//!
//! The applier removes all three hooks from its dedicated connection for
//! the duration of a remote replay. That per-connection disable is the
//! first echo-prevention layer; the subscriber's origin filter is the
//! backstop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sqlx::sqlite::{LockedSqliteHandle, PreupdateHookResult, SqliteConnection, SqliteOperation};

use crate::{Change, Changeset, ChangesetPublisher, CdcError, SchemaCache, TransactionBuffer};

/// Maps raw connection handles to their transaction buffers.
///
/// The execution layer uses this to append opaque `SQL` changes (DDL
/// replication) to the buffer of the connection that is about to run the
/// statement.
#[derive(Default)]
pub struct HookRegistry {
    buffers: Mutex<HashMap<usize, Arc<TransactionBuffer>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self, key: usize) -> Option<Arc<TransactionBuffer>> {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
    }

    fn register(&self, key: usize, buffer: Arc<TransactionBuffer>) {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, buffer);
    }

    fn unregister(&self, key: usize) {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.buffers.lock().unwrap_or_else(|e| e.into_inner()).len();
        f.debug_struct("HookRegistry").field("connections", &len).finish()
    }
}

/// Everything the hooks need, cloned into each connection's callbacks.
#[derive(Clone)]
pub struct HookContext {
    pub node: String,
    pub schema: Arc<SchemaCache>,
    pub publisher: Option<Arc<dyn ChangesetPublisher>>,
    pub registry: Arc<HookRegistry>,
}

/// Installs and removes the capture hooks on engine connections.
pub struct TransactionHooks;

impl TransactionHooks {
    /// Installs the pre-update, commit and rollback hooks on a connection.
    ///
    /// Called from the pool's after-connect hook so every pooled write
    /// connection captures changes from the moment it exists.
    pub async fn install(conn: &mut SqliteConnection, ctx: &HookContext) -> Result<(), CdcError> {
        let mut handle = conn.lock_handle().await?;
        let key = handle.as_raw_handle().as_ptr() as usize;

        let buffer = Arc::new(TransactionBuffer::new());
        ctx.registry.register(key, Arc::clone(&buffer));

        let schema = Arc::clone(&ctx.schema);
        let capture = Arc::clone(&buffer);
        handle.set_preupdate_hook(move |result: PreupdateHookResult<'_>| {
            if result.table.starts_with("sqlite_") {
                return;
            }
            match build_change(&result, &schema) {
                Ok(change) => capture.push(change),
                Err(error) => {
                    tracing::error!(
                        %error,
                        database = result.database,
                        table = result.table,
                        "failed to capture change"
                    );
                }
            }
        });

        let node = ctx.node.clone();
        let publisher = ctx.publisher.clone();
        let commit = Arc::clone(&buffer);
        handle.set_commit_hook(move || -> bool {
            let changes = commit.drain();
            if changes.is_empty() {
                return true;
            }
            let Some(publisher) = publisher.as_ref() else {
                return true;
            };
            let changeset = Changeset::new(node.clone(), changes);
            tracing::debug!(node = %changeset.node, changes = changeset.len(), "sending changeset");
            match publisher.publish_blocking(changeset) {
                Ok(_) => true,
                Err(error) => {
                    tracing::error!(%error, "failed to publish changeset; aborting commit");
                    false
                }
            }
        });

        let discard = Arc::clone(&buffer);
        handle.set_rollback_hook(move || {
            discard.clear();
        });

        Ok(())
    }

    /// Removes all capture hooks from a connection.
    pub async fn remove(conn: &mut SqliteConnection, registry: &HookRegistry) -> Result<(), CdcError> {
        let mut handle = conn.lock_handle().await?;
        let key = handle.as_raw_handle().as_ptr() as usize;
        Self::remove_from_handle(&mut handle);
        registry.unregister(key);
        Ok(())
    }

    /// Removes all capture hooks from an already-locked handle.
    ///
    /// The applier uses this on its dedicated connection before replaying a
    /// remote changeset.
    pub fn remove_from_handle(handle: &mut LockedSqliteHandle<'_>) {
        handle.remove_preupdate_hook();
        handle.remove_commit_hook();
        handle.remove_rollback_hook();
    }
}

/// Finds the transaction buffer belonging to a connection, if its hooks are
/// installed.
pub async fn connection_buffer(
    conn: &mut SqliteConnection,
    registry: &HookRegistry,
) -> Result<Option<Arc<TransactionBuffer>>, CdcError> {
    let mut handle = conn.lock_handle().await?;
    let key = handle.as_raw_handle().as_ptr() as usize;
    drop(handle);
    Ok(registry.buffer(key))
}

/// Builds a [`Change`] from the engine's pre-update callback data.
///
/// Values are copied out of the engine's transient buffers immediately and
/// normalised using the column's declared type.
fn build_change(
    result: &PreupdateHookResult<'_>,
    schema: &SchemaCache,
) -> Result<Change, CdcError> {
    let database = result.database;
    let table = result.table;
    let count = result.get_column_count();

    let mut table_schema = schema.lookup_blocking(database, table)?;
    if table_schema.len() != count as usize {
        // The cached schema predates a schema change in this transaction.
        schema.invalidate();
        table_schema = schema.lookup_blocking(database, table)?;
    }
    if table_schema.len() != count as usize {
        return Err(CdcError::Arity {
            table: table.to_string(),
            columns: table_schema.len(),
            values: count as usize,
        });
    }

    let old_values = |target: &mut Vec<crate::SqlValue>| -> Result<(), CdcError> {
        for i in 0..count {
            let value = crate::SqlValue::try_from(result.get_old_column_value(i)?)?;
            target.push(value.normalized_for(&table_schema.declared_types[i as usize]));
        }
        Ok(())
    };
    let new_values = |target: &mut Vec<crate::SqlValue>| -> Result<(), CdcError> {
        for i in 0..count {
            let value = crate::SqlValue::try_from(result.get_new_column_value(i)?)?;
            target.push(value.normalized_for(&table_schema.declared_types[i as usize]));
        }
        Ok(())
    };

    match result.operation {
        SqliteOperation::Insert => {
            let mut values = Vec::with_capacity(count as usize);
            new_values(&mut values)?;
            Ok(Change::insert(
                database,
                table,
                table_schema.columns.clone(),
                result.get_new_row_id()?,
                values,
            ))
        }
        SqliteOperation::Update => {
            let mut old = Vec::with_capacity(count as usize);
            let mut new = Vec::with_capacity(count as usize);
            old_values(&mut old)?;
            new_values(&mut new)?;
            Ok(Change::update(
                database,
                table,
                table_schema.columns.clone(),
                result.get_old_row_id()?,
                result.get_new_row_id()?,
                old,
                new,
            ))
        }
        SqliteOperation::Delete => {
            let mut values = Vec::with_capacity(count as usize);
            old_values(&mut values)?;
            Ok(Change::delete(
                database,
                table,
                table_schema.columns.clone(),
                result.get_old_row_id()?,
                values,
            ))
        }
        _ => Err(CdcError::UnsupportedSqliteType {
            type_name: "unknown pre-update operation".to_string(),
        }),
    }
}
