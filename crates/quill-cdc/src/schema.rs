//! Column metadata cache for the pre-update hook.
//!
//! SQLite's pre-update callback reports positional values only; column
//! names and declared types come from `pragma_table_info`. Metadata is
//! fetched lazily per `(database, table)` over a dedicated pool and cached
//! for the lifetime of the engine. DDL execution invalidates the cache so
//! schema drift is observed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sqlx::{Row, SqlitePool};

use crate::{block_on_bridge, CdcError};

/// Column names and declared types of one table, in column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<String>,
    pub declared_types: Vec<String>,
}

impl TableSchema {
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Shared cache of table schemas, safe to consult from hook callbacks.
#[derive(Debug)]
pub struct SchemaCache {
    pool: SqlitePool,
    runtime: tokio::runtime::Handle,
    tables: RwLock<HashMap<(String, String), Arc<TableSchema>>>,
}

impl SchemaCache {
    /// Creates a cache backed by a metadata pool on the same database file.
    ///
    /// Must be called from async context; the captured runtime handle is
    /// what hook callbacks block on for cache misses.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            runtime: tokio::runtime::Handle::current(),
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Looks up a table's schema, fetching and caching it on a miss.
    ///
    /// Safe to call from the pre-update hook: the fetch runs on a separate
    /// connection, so it never contends with the mutating transaction.
    pub fn lookup_blocking(&self, database: &str, table: &str) -> Result<Arc<TableSchema>, CdcError> {
        let key = (database.to_string(), table.to_string());
        {
            let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
            if let Some(schema) = tables.get(&key) {
                return Ok(Arc::clone(schema));
            }
        }

        let schema = Arc::new(block_on_bridge(&self.runtime, self.fetch(database, table))?);
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(tables.entry(key).or_insert(schema)))
    }

    /// Async variant for callers already on the runtime.
    pub async fn lookup(&self, database: &str, table: &str) -> Result<Arc<TableSchema>, CdcError> {
        let key = (database.to_string(), table.to_string());
        {
            let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
            if let Some(schema) = tables.get(&key) {
                return Ok(Arc::clone(schema));
            }
        }

        let schema = Arc::new(self.fetch(database, table).await?);
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(tables.entry(key).or_insert(schema)))
    }

    /// Drops all cached schemas. Called after DDL executes.
    pub fn invalidate(&self) {
        self.tables.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    async fn fetch(&self, database: &str, table: &str) -> Result<TableSchema, CdcError> {
        let sql = format!("SELECT name, type FROM {database}.pragma_table_info(?1)");
        let rows = sqlx::query(&sql).bind(table).fetch_all(&self.pool).await?;

        let mut columns = Vec::with_capacity(rows.len());
        let mut declared_types = Vec::with_capacity(rows.len());
        for row in &rows {
            columns.push(row.try_get::<String, _>(0)?);
            declared_types.push(row.try_get::<String, _>(1)?);
        }
        if columns.is_empty() {
            return Err(CdcError::UnknownTable {
                database: database.to_string(),
                table: table.to_string(),
            });
        }
        Ok(TableSchema {
            columns,
            declared_types,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    async fn pool(path: &std::path::Path) -> SqlitePool {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn fetches_columns_and_declared_types() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir.path().join("schema.db")).await;
        sqlx::query("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, photo BLOB)")
            .execute(&pool)
            .await
            .unwrap();

        let cache = SchemaCache::new(pool);
        let schema = cache.lookup("main", "users").await.unwrap();
        assert_eq!(schema.columns, ["id", "name", "photo"]);
        assert_eq!(schema.declared_types, ["INTEGER", "TEXT", "BLOB"]);
    }

    #[tokio::test]
    async fn invalidate_observes_schema_drift() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir.path().join("drift.db")).await;
        sqlx::query("CREATE TABLE t (a INTEGER)")
            .execute(&pool)
            .await
            .unwrap();

        let cache = SchemaCache::new(pool.clone());
        assert_eq!(cache.lookup("main", "t").await.unwrap().len(), 1);

        sqlx::query("ALTER TABLE t ADD COLUMN b TEXT")
            .execute(&pool)
            .await
            .unwrap();
        // Stale until invalidated.
        assert_eq!(cache.lookup("main", "t").await.unwrap().len(), 1);
        cache.invalidate();
        assert_eq!(cache.lookup("main", "t").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_table_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir.path().join("missing.db")).await;
        let cache = SchemaCache::new(pool);
        assert!(matches!(
            cache.lookup("main", "nope").await,
            Err(CdcError::UnknownTable { .. })
        ));
    }
}
