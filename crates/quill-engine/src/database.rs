//! One registered database: hooked pool plus replication collaborators.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Column, Connection, Row, SqlitePool};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use quill_cdc::{
    connection_buffer, Change, ChangesetPublisher, HookContext, HookRegistry, SchemaCache,
    SqlValue, TransactionHooks,
};
use quill_replication::{
    resume_policy, restore_latest, Applier, Bus, CdcPublisher, CdcSubscriber, ChangesetInterceptor,
    DeliverPolicy, Outbox, ReplicationConfig, Snapshotter,
};
use quill_types::{DatabaseId, ProcessId};

use crate::params::ordered_params;
use crate::EngineError;

/// Result of executing one statement.
///
/// Statements that project rows fill `columns`/`rows`; plain mutations
/// report their counters both as a synthetic row and out-of-band.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    #[serde(skip)]
    pub rows_affected: u64,
    #[serde(skip)]
    pub last_insert_id: Option<i64>,
    #[serde(skip)]
    pub no_returning: bool,
}

/// Options for registering a database with the engine.
#[derive(Clone)]
pub struct DatabaseOptions {
    pub path: PathBuf,
    pub max_connections: u32,
    pub from_latest_snapshot: bool,
    pub replication: Option<ReplicationConfig>,
    pub interceptor: Option<Arc<dyn ChangesetInterceptor>>,
}

impl DatabaseOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: 10,
            from_latest_snapshot: false,
            replication: None,
            interceptor: None,
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn from_latest_snapshot(mut self, restore: bool) -> Self {
        self.from_latest_snapshot = restore;
        self
    }

    pub fn with_replication(mut self, config: ReplicationConfig) -> Self {
        self.replication = Some(config);
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn ChangesetInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }
}

impl std::fmt::Debug for DatabaseOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseOptions")
            .field("path", &self.path)
            .field("max_connections", &self.max_connections)
            .field("from_latest_snapshot", &self.from_latest_snapshot)
            .field("replication", &self.replication)
            .field("interceptor", &self.interceptor.is_some())
            .finish()
    }
}

struct Replication {
    subscriber: CdcSubscriber,
    snapshotter: Arc<Snapshotter>,
    tasks: Vec<JoinHandle<()>>,
}

/// A database served by this node.
pub struct Database {
    id: DatabaseId,
    path: PathBuf,
    pool: SqlitePool,
    meta_pool: SqlitePool,
    schema: Arc<SchemaCache>,
    registry: Arc<HookRegistry>,
    ddl_sync: bool,
    replication: Option<Replication>,
    shutdown: watch::Sender<bool>,
}

impl Database {
    /// Opens the database and wires its replication pipeline.
    pub(crate) async fn open(
        node: &str,
        process_id: ProcessId,
        options: DatabaseOptions,
    ) -> Result<Self, EngineError> {
        let id = DatabaseId::from_path(&options.path);

        let bus = match &options.replication {
            Some(config) => {
                config.validate()?;
                Some(Bus::connect(&config.url).await?)
            }
            None => None,
        };

        // Restoring must happen before the first connection touches the
        // file.
        let mut snapshot_seq = None;
        if options.from_latest_snapshot {
            if let (Some(bus), Some(config)) = (&bus, &options.replication) {
                snapshot_seq = restore_latest(bus, config, &options.path).await?;
            }
        }

        let connect_options = SqliteConnectOptions::new()
            .filename(&options.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let meta_pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(connect_options.clone())
            .await?;
        let schema = Arc::new(SchemaCache::new(meta_pool.clone()));
        let registry = Arc::new(HookRegistry::new());
        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::new();

        let publisher: Option<Arc<dyn ChangesetPublisher>> = match (&bus, &options.replication) {
            (Some(bus), Some(config)) => {
                let mut publisher = CdcPublisher::open(bus, config, process_id).await?;
                let outbox = match &config.outbox_dir {
                    Some(dir) => Some(Arc::new(Outbox::open(dir)?)),
                    None => None,
                };
                if let Some(outbox) = &outbox {
                    publisher = publisher.with_outbox(Arc::clone(outbox));
                }
                let publisher = Arc::new(publisher);
                if let Some(outbox) = outbox {
                    tasks.push(outbox.spawn_drain(Arc::clone(&publisher), shutdown.subscribe()));
                }
                Some(publisher as Arc<dyn ChangesetPublisher>)
            }
            _ => None,
        };

        let hook_context = HookContext {
            node: node.to_string(),
            schema: Arc::clone(&schema),
            publisher,
            registry: Arc::clone(&registry),
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .after_connect(move |conn, _meta| {
                let context = hook_context.clone();
                Box::pin(async move {
                    TransactionHooks::install(conn, &context)
                        .await
                        .map_err(|error| sqlx::Error::Configuration(Box::new(error)))
                })
            })
            .connect_with(connect_options)
            .await?;

        let replication = match (&bus, &options.replication) {
            (Some(bus), Some(config)) => {
                let policy = match snapshot_seq {
                    Some(seq) => resume_policy(seq, config.policy),
                    None => config.policy.unwrap_or(DeliverPolicy::All),
                };
                let applier = Applier::open(&options.path, options.interceptor.clone()).await?;
                let subscriber =
                    CdcSubscriber::start(bus, config, node, process_id, applier, policy).await?;
                let snapshotter = Arc::new(
                    Snapshotter::open(
                        bus,
                        config,
                        meta_pool.clone(),
                        subscriber.latest_seq_handle(),
                    )
                    .await?,
                );
                if let Some(interval) = config.snapshot_interval {
                    tasks.push(snapshotter.spawn_timer(interval, shutdown.subscribe()));
                }
                Some(Replication {
                    subscriber,
                    snapshotter,
                    tasks: std::mem::take(&mut tasks),
                })
            }
            _ => None,
        };

        let ddl_sync = options
            .replication
            .as_ref()
            .map(|config| !config.disable_ddl_sync)
            .unwrap_or(false);

        tracing::info!(id = %id, path = %options.path.display(), "database loaded");
        Ok(Self {
            id,
            path: options.path,
            pool,
            meta_pool,
            schema,
            registry,
            ddl_sync,
            replication,
            shutdown,
        })
    }

    pub fn id(&self) -> &DatabaseId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshotter(&self) -> Option<&Arc<Snapshotter>> {
        self.replication.as_ref().map(|r| &r.snapshotter)
    }

    pub fn subscriber(&self) -> Option<&CdcSubscriber> {
        self.replication.as_ref().map(|r| &r.subscriber)
    }

    /// Executes one classified statement on a pooled connection.
    pub async fn execute(
        &self,
        stmt: &quill_sql::Statement,
        params: &HashMap<String, Value>,
    ) -> Result<Response, EngineError> {
        let mut conn = self.pool.acquire().await?;
        self.execute_on(&mut conn, stmt, params).await
    }

    /// Executes a batch of requests inside a single transaction.
    ///
    /// Any failure rolls the whole batch back; the rollback hook discards
    /// whatever the earlier statements buffered.
    pub async fn transaction(
        &self,
        requests: Vec<(Arc<quill_sql::Statement>, HashMap<String, Value>)>,
    ) -> Result<Vec<Response>, EngineError> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;
        let mut responses = Vec::with_capacity(requests.len());
        for (stmt, params) in &requests {
            let response = self.execute_on(&mut tx, stmt, params).await?;
            responses.push(response);
        }
        tx.commit().await?;
        Ok(responses)
    }

    async fn execute_on(
        &self,
        conn: &mut SqliteConnection,
        stmt: &quill_sql::Statement,
        params: &HashMap<String, Value>,
    ) -> Result<Response, EngineError> {
        tracing::debug!(kind = %stmt.kind(), sql = stmt.source(), "executing statement");
        let args = ordered_params(stmt, params)?;

        if stmt.routes_as_query() {
            return run_query(conn, stmt, &args).await;
        }

        // DDL replicates as opaque SQL through the same commit path as row
        // changes. The entry is withdrawn if the statement itself fails,
        // since no commit will flush the buffer for a failed autocommit
        // statement.
        let appended = if stmt.is_ddl() && self.ddl_sync {
            match connection_buffer(conn, &self.registry).await? {
                Some(buffer) => {
                    buffer.push(Change::sql(stmt.source()));
                    Some(buffer)
                }
                None => None,
            }
        } else {
            None
        };

        let result = run_exec(conn, stmt, &args).await;
        if stmt.is_ddl() {
            self.schema.invalidate();
        }
        if result.is_err() {
            if let Some(buffer) = appended {
                buffer.remove_last();
            }
        }
        result
    }

    /// Streams a consistent backup image of the database file.
    pub async fn backup(&self) -> Result<Vec<u8>, EngineError> {
        let staging = tempfile::tempdir()?;
        let image = staging.path().join("backup.db");
        let vacuum = format!("VACUUM INTO '{}'", image.display());
        sqlx::query(&vacuum).execute(&self.meta_pool).await?;
        Ok(tokio::fs::read(&image).await?)
    }

    /// Closes replication collaborators, then the pools.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        if let Some(replication) = &self.replication {
            replication.subscriber.close().await;
            for task in &replication.tasks {
                task.abort();
            }
        }
        self.pool.close().await;
        self.meta_pool.close().await;
        tracing::info!(id = %self.id, "database closed");
    }
}

async fn run_query(
    conn: &mut SqliteConnection,
    stmt: &quill_sql::Statement,
    args: &[SqlValue],
) -> Result<Response, EngineError> {
    let mut query = sqlx::query(stmt.source());
    for value in args {
        query = value.bind(query);
    }
    let rows = query.fetch_all(&mut *conn).await?;

    let columns = match rows.first() {
        Some(row) => row
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect(),
        None => stmt.columns().to_vec(),
    };

    let mut data = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut values = Vec::with_capacity(row.len());
        for i in 0..row.len() {
            values.push(SqlValue::try_from(row.try_get_raw(i)?)?);
        }
        data.push(values);
    }

    Ok(Response {
        columns,
        rows: data,
        rows_affected: 0,
        last_insert_id: None,
        no_returning: false,
    })
}

async fn run_exec(
    conn: &mut SqliteConnection,
    stmt: &quill_sql::Statement,
    args: &[SqlValue],
) -> Result<Response, EngineError> {
    let mut query = sqlx::query(stmt.source());
    for value in args {
        query = value.bind(query);
    }
    let result = query.execute(&mut *conn).await?;
    let rows_affected = result.rows_affected();
    let last_insert_id = result.last_insert_rowid();

    Ok(Response {
        columns: vec!["rows_affected".to_string(), "last_insert_id".to_string()],
        rows: vec![vec![
            SqlValue::Integer(rows_affected as i64),
            SqlValue::Integer(last_insert_id),
        ]],
        rows_affected,
        last_insert_id: Some(last_insert_id),
        no_returning: true,
    })
}
