//! Idempotent replay of remote changesets.
//!
//! The applier owns a dedicated connection with capture hooks removed, so
//! nothing it replays is ever re-captured on the same connection. All
//! changes of a changeset run inside a single transaction, in capture
//! order; any statement error rolls the whole transaction back so the
//! delivery is redelivered.
//!
//! Idempotence comes from the generated SQL: an INSERT replays as an
//! upsert keyed on rowid, so re-delivery (or a later changeset for the
//! same row) lands as an overwrite, which is exactly last-writer-wins.

use std::path::Path;
use std::sync::Arc;

use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{Connection, Transaction};

use quill_cdc::{Change, Changeset, Operation, TransactionHooks};

use crate::{ChangesetInterceptor, ReplicationError};

/// What the applier did with a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Every change was applied and committed.
    Applied,
    /// The interceptor's before hook skipped the changeset.
    Skipped,
}

/// Replays remote changesets against the local engine.
pub struct Applier {
    conn: tokio::sync::Mutex<SqliteConnection>,
    interceptor: Option<Arc<dyn ChangesetInterceptor>>,
}

impl Applier {
    /// Opens the applier's dedicated connection to the database file.
    pub async fn open(
        path: &Path,
        interceptor: Option<Arc<dyn ChangesetInterceptor>>,
    ) -> Result<Self, ReplicationError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let conn = SqliteConnection::connect_with(&options).await?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
            interceptor,
        })
    }

    /// Applies one changeset through the interceptor gateway.
    pub async fn apply(&self, changeset: &Changeset) -> Result<ApplyOutcome, ReplicationError> {
        if let Some(interceptor) = &self.interceptor {
            if interceptor.before_apply(changeset)? {
                tracing::info!(node = %changeset.node, "changeset skipped by interceptor");
                return Ok(ApplyOutcome::Skipped);
            }
        }

        let outcome = self.apply_changes(changeset).await;
        let outcome = match &self.interceptor {
            Some(interceptor) => interceptor.after_apply(changeset, outcome),
            None => outcome,
        };
        outcome.map(|_| ApplyOutcome::Applied)
    }

    async fn apply_changes(&self, changeset: &Changeset) -> Result<(), ReplicationError> {
        let mut conn = self.conn.lock().await;

        // The dedicated connection never had hooks installed, but an
        // embedder may hand the applier a pooled connection later in its
        // life; removing here keeps replay un-capturable either way.
        {
            let mut handle = conn.lock_handle().await?;
            TransactionHooks::remove_from_handle(&mut handle);
        }

        let mut tx = conn.begin().await?;
        for change in &changeset.changes {
            apply_change(&mut tx, change).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn apply_change(
    tx: &mut Transaction<'_, Sqlite>,
    change: &Change,
) -> Result<(), ReplicationError> {
    match change.operation {
        Operation::Insert => {
            change.validate()?;
            let sql = insert_sql(change);
            let mut query = sqlx::query(&sql);
            for value in change.new_values.as_deref().unwrap_or_default() {
                query = value.bind(query);
            }
            query
                .bind(change.new_rowid.unwrap_or_default())
                .execute(&mut **tx)
                .await?;
        }
        Operation::Update => {
            change.validate()?;
            let sql = update_sql(change);
            let mut query = sqlx::query(&sql);
            for value in change.new_values.as_deref().unwrap_or_default() {
                query = value.bind(query);
            }
            query
                .bind(change.old_rowid.unwrap_or_default())
                .execute(&mut **tx)
                .await?;
        }
        Operation::Delete => {
            change.validate()?;
            let sql = delete_sql(change);
            sqlx::query(&sql)
                .bind(change.old_rowid.unwrap_or_default())
                .execute(&mut **tx)
                .await?;
        }
        Operation::Sql => {
            let Some(command) = change.command.as_deref() else {
                tracing::warn!("SQL change without command; skipping");
                return Ok(());
            };
            sqlx::query(command).execute(&mut **tx).await?;
        }
        Operation::Unknown => {
            tracing::warn!(
                database = %change.database,
                table = %change.table,
                "unknown operation; skipping change"
            );
        }
    }
    Ok(())
}

/// Replayed INSERT: an upsert keyed on rowid with explicitly numbered
/// placeholders so the conflict clause reuses the same bound values.
fn insert_sql(change: &Change) -> String {
    let columns = change.columns.join(", ");
    let placeholders = (1..=change.columns.len() + 1)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let conflict_set = change
        .columns
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{column} = ?{}", i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {}.{} ({columns}, rowid) VALUES ({placeholders}) \
         ON CONFLICT (rowid) DO UPDATE SET {conflict_set}",
        change.database, change.table
    )
}

fn update_sql(change: &Change) -> String {
    let assignments = change
        .columns
        .iter()
        .map(|column| format!("{column} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {}.{} SET {assignments} WHERE rowid = ?",
        change.database, change.table
    )
}

fn delete_sql(change: &Change) -> String {
    format!(
        "DELETE FROM {}.{} WHERE rowid = ?",
        change.database, change.table
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InterceptorRules, RuleInterceptor};
    use quill_cdc::SqlValue;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::{Row, SqlitePool};

    async fn fixture() -> (tempfile::TempDir, SqlitePool, Applier) {
        fixture_with(None).await
    }

    async fn fixture_with(
        interceptor: Option<Arc<dyn ChangesetInterceptor>>,
    ) -> (tempfile::TempDir, SqlitePool, Applier) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        let applier = Applier::open(&path, interceptor).await.unwrap();
        (dir, pool, applier)
    }

    fn insert_change(rowid: i64, name: &str) -> Change {
        Change::insert(
            "main",
            "users",
            vec!["id".into(), "name".into()],
            rowid,
            vec![SqlValue::Integer(rowid), SqlValue::Text(name.into())],
        )
    }

    async fn names(pool: &SqlitePool) -> Vec<(i64, String)> {
        sqlx::query("SELECT id, name FROM users ORDER BY id")
            .fetch_all(pool)
            .await
            .unwrap()
            .iter()
            .map(|row| (row.get::<i64, _>(0), row.get::<String, _>(1)))
            .collect()
    }

    #[test]
    fn generated_sql_shapes() {
        let change = insert_change(1, "alice");
        assert_eq!(
            insert_sql(&change),
            "INSERT INTO main.users (id, name, rowid) VALUES (?1, ?2, ?3) \
             ON CONFLICT (rowid) DO UPDATE SET id = ?1, name = ?2"
        );
        assert_eq!(
            update_sql(&change),
            "UPDATE main.users SET id = ?, name = ? WHERE rowid = ?"
        );
        assert_eq!(delete_sql(&change), "DELETE FROM main.users WHERE rowid = ?");
    }

    #[tokio::test]
    async fn replaying_an_insert_is_idempotent() {
        let (_dir, pool, applier) = fixture().await;
        let cs = Changeset::new("node-a", vec![insert_change(1, "alice")]);

        applier.apply(&cs).await.unwrap();
        applier.apply(&cs).await.unwrap();

        assert_eq!(names(&pool).await, [(1, "alice".to_string())]);
    }

    #[tokio::test]
    async fn later_changesets_win_on_the_same_rowid() {
        let (_dir, pool, applier) = fixture().await;
        applier
            .apply(&Changeset::new("node-a", vec![insert_change(1, "alice")]))
            .await
            .unwrap();
        applier
            .apply(&Changeset::new("node-b", vec![insert_change(1, "bob")]))
            .await
            .unwrap();

        assert_eq!(names(&pool).await, [(1, "bob".to_string())]);
    }

    #[tokio::test]
    async fn update_and_delete_replay() {
        let (_dir, pool, applier) = fixture().await;
        applier
            .apply(&Changeset::new("node-a", vec![insert_change(1, "alice")]))
            .await
            .unwrap();

        let update = Change::update(
            "main",
            "users",
            vec!["id".into(), "name".into()],
            1,
            1,
            vec![SqlValue::Integer(1), SqlValue::Text("alice".into())],
            vec![SqlValue::Integer(1), SqlValue::Text("bob".into())],
        );
        applier
            .apply(&Changeset::new("node-a", vec![update]))
            .await
            .unwrap();
        assert_eq!(names(&pool).await, [(1, "bob".to_string())]);

        let delete = Change::delete(
            "main",
            "users",
            vec!["id".into(), "name".into()],
            1,
            vec![SqlValue::Integer(1), SqlValue::Text("bob".into())],
        );
        applier
            .apply(&Changeset::new("node-a", vec![delete]))
            .await
            .unwrap();
        assert!(names(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn a_failing_change_rolls_back_the_whole_changeset() {
        let (_dir, pool, applier) = fixture().await;
        let bad = Change::insert(
            "main",
            "missing_table",
            vec!["id".into()],
            1,
            vec![SqlValue::Integer(1)],
        );
        let cs = Changeset::new("node-a", vec![insert_change(1, "alice"), bad]);

        assert!(applier.apply(&cs).await.is_err());
        assert!(names(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_operations_are_skipped_not_fatal() {
        let (_dir, pool, applier) = fixture().await;
        let mut unknown = insert_change(2, "ghost");
        unknown.operation = Operation::Unknown;
        let cs = Changeset::new("node-a", vec![insert_change(1, "alice"), unknown]);

        applier.apply(&cs).await.unwrap();
        assert_eq!(names(&pool).await, [(1, "alice".to_string())]);
    }

    #[tokio::test]
    async fn sql_changes_execute_verbatim() {
        let (_dir, pool, applier) = fixture().await;
        let cs = Changeset::new(
            "node-a",
            vec![Change::sql(
                "CREATE TABLE IF NOT EXISTS audit (id INTEGER PRIMARY KEY)",
            )],
        );
        applier.apply(&cs).await.unwrap();

        let count: i64 = sqlx::query(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'audit'",
        )
        .fetch_one(&pool)
        .await
        .unwrap()
        .get(0);
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn before_hook_skips_without_applying() {
        let interceptor: Arc<dyn ChangesetInterceptor> = Arc::new(RuleInterceptor::new(
            InterceptorRules {
                skip_nodes: vec!["node-a".to_string()],
                ..Default::default()
            },
        ));
        let (_dir, pool, applier) = fixture_with(Some(interceptor)).await;

        let outcome = applier
            .apply(&Changeset::new("node-a", vec![insert_change(1, "alice")]))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Skipped);
        assert!(names(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn after_hook_swallows_alter_table_failures() {
        let interceptor: Arc<dyn ChangesetInterceptor> = Arc::new(RuleInterceptor::new(
            InterceptorRules {
                ignore_error_command_prefixes: vec!["ALTER TABLE".to_string()],
                ..Default::default()
            },
        ));
        let (_dir, _pool, applier) = fixture_with(Some(interceptor)).await;

        let cs = Changeset::new(
            "node-b",
            vec![Change::sql("ALTER TABLE missing RENAME TO still_missing")],
        );
        let outcome = applier.apply(&cs).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
    }
}
