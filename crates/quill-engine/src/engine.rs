//! The engine: process identity, classifier and database registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use quill_sql::Classifier;
use quill_types::{DatabaseId, ProcessId};

use crate::{Database, DatabaseOptions, EngineError};

/// Node-local orchestrator.
///
/// Holds the per-process state the replication pipeline depends on — the
/// node name and the startup-timestamp sentinel — as an explicit value
/// threaded through constructors, plus the registry mapping database ids
/// to their instances. The first-loaded database is aliased under the
/// reserved empty id.
pub struct Engine {
    node: String,
    process_id: ProcessId,
    classifier: Classifier,
    databases: RwLock<HashMap<String, Arc<Database>>>,
    load_lock: tokio::sync::Mutex<()>,
}

impl Engine {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            process_id: ProcessId::at_startup(),
            classifier: Classifier::new(),
            databases: RwLock::new(HashMap::new()),
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Opens a database and registers it.
    ///
    /// Insertion is serialised: concurrent loads of the same path race on
    /// the registry, not on the file.
    pub async fn load(&self, options: DatabaseOptions) -> Result<DatabaseId, EngineError> {
        let _guard = self.load_lock.lock().await;

        let id = DatabaseId::from_path(&options.path);
        if self.lookup(id.as_str()).is_some() {
            return Err(EngineError::DatabaseExists(id.to_string()));
        }

        let database = Arc::new(Database::open(&self.node, self.process_id, options).await?);

        let mut databases = self.databases.write().unwrap_or_else(|e| e.into_inner());
        let first = databases.is_empty();
        databases.insert(id.to_string(), Arc::clone(&database));
        if first {
            databases.insert(String::new(), database);
        }
        Ok(id)
    }

    /// Resolves a database by id; the empty id aliases the first loaded.
    pub fn database(&self, id: &str) -> Result<Arc<Database>, EngineError> {
        self.lookup(id)
            .ok_or_else(|| EngineError::DatabaseNotFound(id.to_string()))
    }

    /// Registered database ids, excluding the default alias.
    pub fn database_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .databases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|id| !id.is_empty())
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Closes a database's collaborators and removes it from the registry.
    /// Returns the backing file path.
    pub async fn remove(&self, id: &str) -> Result<PathBuf, EngineError> {
        let _guard = self.load_lock.lock().await;
        let database = {
            let mut databases = self.databases.write().unwrap_or_else(|e| e.into_inner());
            let database = databases
                .remove(id)
                .ok_or_else(|| EngineError::DatabaseNotFound(id.to_string()))?;
            if databases
                .get("")
                .is_some_and(|aliased| Arc::ptr_eq(aliased, &database))
            {
                databases.remove("");
            }
            database
        };
        database.close().await;
        Ok(database.path().to_path_buf())
    }

    /// Drains and closes every registered database.
    pub async fn shutdown(&self) {
        let databases: Vec<Arc<Database>> = {
            let mut guard = self.databases.write().unwrap_or_else(|e| e.into_inner());
            let mut seen = Vec::new();
            for (_, database) in guard.drain() {
                if !seen.iter().any(|d| Arc::ptr_eq(d, &database)) {
                    seen.push(database);
                }
            }
            seen
        };
        for database in databases {
            database.close().await;
        }
    }

    fn lookup(&self, id: &str) -> Option<Arc<Database>> {
        self.databases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap as Map;

    fn options(dir: &tempfile::TempDir, name: &str) -> DatabaseOptions {
        DatabaseOptions::new(dir.path().join(name))
    }

    async fn exec(engine: &Engine, db: &Database, sql: &str) -> crate::Response {
        let stmt = engine.classifier().classify(sql).unwrap();
        db.execute(&stmt, &Map::new()).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn first_database_is_aliased_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new("node-a");
        engine.load(options(&dir, "app.db")).await.unwrap();
        engine.load(options(&dir, "aux.db")).await.unwrap();

        assert!(Arc::ptr_eq(
            &engine.database("").unwrap(),
            &engine.database("app.db").unwrap()
        ));
        assert_eq!(engine.database_ids(), ["app.db", "aux.db"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new("node-a");
        engine.load(options(&dir, "app.db")).await.unwrap();
        assert!(matches!(
            engine.load(options(&dir, "app.db")).await,
            Err(EngineError::DatabaseExists(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn executes_classified_statements() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new("node-a");
        engine.load(options(&dir, "app.db")).await.unwrap();
        let db = engine.database("").unwrap();

        exec(
            &engine,
            &db,
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
        )
        .await;
        let insert = exec(&engine, &db, "INSERT INTO users VALUES (1, 'alice')").await;
        assert_eq!(insert.rows_affected, 1);
        assert_eq!(insert.last_insert_id, Some(1));
        assert!(insert.no_returning);

        let select = exec(&engine, &db, "SELECT id, name FROM users").await;
        assert_eq!(select.columns, ["id", "name"]);
        assert_eq!(
            select.rows,
            [[
                quill_cdc::SqlValue::Integer(1),
                quill_cdc::SqlValue::Text("alice".into())
            ]]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn returning_statements_route_as_queries() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new("node-a");
        engine.load(options(&dir, "app.db")).await.unwrap();
        let db = engine.database("").unwrap();

        exec(
            &engine,
            &db,
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
        )
        .await;
        let stmt = engine
            .classifier()
            .classify("INSERT INTO users (name) VALUES ('alice') RETURNING id")
            .unwrap();
        let response = db.execute(&stmt, &Map::new()).await.unwrap();
        assert!(!response.no_returning);
        assert_eq!(response.rows, [[quill_cdc::SqlValue::Integer(1)]]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn binds_named_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new("node-a");
        engine.load(options(&dir, "app.db")).await.unwrap();
        let db = engine.database("").unwrap();

        exec(
            &engine,
            &db,
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
        )
        .await;
        let insert = engine
            .classifier()
            .classify("INSERT INTO users (id, name) VALUES (:id, :name)")
            .unwrap();
        let mut params = Map::new();
        params.insert("id".to_string(), json!(7));
        params.insert("name".to_string(), json!("grace"));
        db.execute(&insert, &params).await.unwrap();

        let select = exec(&engine, &db, "SELECT name FROM users WHERE id = 7").await;
        assert_eq!(select.rows, [[quill_cdc::SqlValue::Text("grace".into())]]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn a_failing_batch_rolls_back_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new("node-a");
        engine.load(options(&dir, "app.db")).await.unwrap();
        let db = engine.database("").unwrap();
        exec(
            &engine,
            &db,
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
        )
        .await;

        let good = engine
            .classifier()
            .classify("INSERT INTO users VALUES (1, 'alice')")
            .unwrap();
        let bad = engine
            .classifier()
            .classify("INSERT INTO missing VALUES (1)")
            .unwrap();
        let result = db
            .transaction(vec![(good, Map::new()), (bad, Map::new())])
            .await;
        assert!(result.is_err());

        let select = exec(&engine, &db, "SELECT count(*) FROM users").await;
        assert_eq!(select.rows, [[quill_cdc::SqlValue::Integer(0)]]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_closes_and_returns_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new("node-a");
        engine.load(options(&dir, "app.db")).await.unwrap();

        let path = engine.remove("app.db").await.unwrap();
        assert_eq!(path, dir.path().join("app.db"));
        assert!(engine.database("app.db").is_err());
        assert!(engine.database("").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn backup_produces_a_readable_image() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new("node-a");
        engine.load(options(&dir, "app.db")).await.unwrap();
        let db = engine.database("").unwrap();
        exec(
            &engine,
            &db,
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
        )
        .await;
        exec(&engine, &db, "INSERT INTO users VALUES (1, 'alice')").await;

        let image = db.backup().await.unwrap();
        assert!(image.len() > 0);
        assert_eq!(&image[0..16], b"SQLite format 3\0");
    }
}
