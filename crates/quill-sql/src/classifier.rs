//! The statement classifier.
//!
//! Wraps `sqlparser` with the SQLite dialect. A handful of statement forms
//! are recognised by a trimmed-uppercase prefix before the full parse:
//! BEGIN (cheap fast path for transaction control), VACUUM and ANALYZE
//! (maintenance commands outside the parser's grammar), RELEASE (SQLite
//! allows omitting the SAVEPOINT keyword), and CREATE TRIGGER (trigger
//! bodies embed semicolons that would otherwise trip the multi-statement
//! check).

use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use sqlparser::ast::{visit_expressions, Expr, SelectItem, SetExpr, Statement as Ast, Value};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use crate::error::ClassifyError;
use crate::statement::{Statement, StatementKind};

/// Number of classified statements kept in the replacement cache.
const CACHE_CAPACITY: usize = 256;

/// Columns projected by EXPLAIN output.
const EXPLAIN_COLUMNS: [&str; 4] = ["id", "parent", "notused", "detail"];

/// Classifies SQL statements, caching results by source text.
///
/// The cache is shared across connections: classification is pure, so a
/// statement classified on one connection is reused everywhere.
#[derive(Debug)]
pub struct Classifier {
    cache: Mutex<LruCache<String, Arc<Statement>>>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::with_capacity(CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Classifies a single SQL statement.
    ///
    /// # Errors
    ///
    /// Returns [`ClassifyError::MultipleStatements`] if the input contains
    /// more than one statement (trailing semicolons are ignored), and
    /// [`ClassifyError::Parse`] with a line/column-annotated message for
    /// syntactically invalid input.
    pub fn classify(&self, sql: &str) -> Result<Arc<Statement>, ClassifyError> {
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(stmt) = cache.get(sql) {
                return Ok(Arc::clone(stmt));
            }
        }

        let stmt = Arc::new(build_statement(sql)?);

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(sql.to_string(), Arc::clone(&stmt));
        Ok(stmt)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

fn build_statement(sql: &str) -> Result<Statement, ClassifyError> {
    let trimmed = trim_statement(sql);
    if trimmed.is_empty() {
        return Err(ClassifyError::Empty);
    }

    if let Some(kind) = prefix_kind(trimmed) {
        return Ok(Statement {
            source: sql.to_string(),
            kind,
            ddl: kind.is_ddl(),
            has_distinct: false,
            has_returning: false,
            parameters: Vec::new(),
            columns: Vec::new(),
        });
    }

    let parsed = Parser::parse_sql(&SQLiteDialect {}, trimmed)
        .map_err(|e| ClassifyError::Parse(e.to_string()))?;
    let ast = match parsed.as_slice() {
        [] => return Err(ClassifyError::Empty),
        [one] => one,
        _ => return Err(ClassifyError::MultipleStatements),
    };

    let kind = classify_ast(ast);
    let mut statement = Statement {
        source: sql.to_string(),
        kind,
        ddl: kind.is_ddl(),
        has_distinct: false,
        has_returning: false,
        parameters: collect_parameters(ast),
        columns: Vec::new(),
    };

    match ast {
        Ast::Query(query) => {
            if let SetExpr::Select(select) = query.body.as_ref() {
                statement.has_distinct = select.distinct.is_some();
                statement.columns = projected_columns(&select.projection);
            }
        }
        Ast::Insert(insert) => {
            if let Some(returning) = &insert.returning {
                statement.has_returning = true;
                statement.columns = projected_columns(returning);
            }
        }
        Ast::Update { returning, .. } => {
            if let Some(returning) = returning {
                statement.has_returning = true;
                statement.columns = projected_columns(returning);
            }
        }
        Ast::Delete(delete) => {
            if let Some(returning) = &delete.returning {
                statement.has_returning = true;
                statement.columns = projected_columns(returning);
            }
        }
        Ast::Explain { .. } => {
            statement.columns = EXPLAIN_COLUMNS.iter().map(|c| c.to_string()).collect();
        }
        _ => {}
    }

    Ok(statement)
}

/// Strips surrounding whitespace and trailing statement terminators.
///
/// A trailing semicolon (or several) is punctuation, not an extra
/// statement, and must not trip the multi-statement rejection.
fn trim_statement(sql: &str) -> &str {
    let mut s = sql.trim();
    while let Some(stripped) = s.strip_suffix(';') {
        s = stripped.trim_end();
    }
    s
}

/// Statement forms recognised before the full parse.
fn prefix_kind(trimmed: &str) -> Option<StatementKind> {
    let upper = trimmed.to_uppercase();
    let mut words = upper.split_whitespace();
    match words.next()? {
        "BEGIN" => Some(StatementKind::Begin),
        "VACUUM" => Some(StatementKind::Vacuum),
        "ANALYZE" => Some(StatementKind::Analyze),
        "RELEASE" => Some(StatementKind::Release),
        "CREATE" => match words.next() {
            Some("TRIGGER") => Some(StatementKind::CreateTrigger),
            Some("TEMP") | Some("TEMPORARY") => match words.next() {
                Some("TRIGGER") => Some(StatementKind::CreateTrigger),
                _ => None,
            },
            _ => None,
        },
        _ => None,
    }
}

fn classify_ast(ast: &Ast) -> StatementKind {
    match ast {
        Ast::Query(_) => StatementKind::Select,
        Ast::Insert(_) => StatementKind::Insert,
        Ast::Update { .. } => StatementKind::Update,
        Ast::Delete(_) => StatementKind::Delete,
        Ast::CreateTable(_) => StatementKind::CreateTable,
        Ast::CreateIndex(_) => StatementKind::CreateIndex,
        Ast::CreateView { .. } => StatementKind::CreateView,
        Ast::CreateVirtualTable { .. } => StatementKind::CreateVirtualTable,
        Ast::AlterTable { .. } => StatementKind::AlterTable,
        Ast::Drop { .. } => StatementKind::Drop,
        Ast::Explain { .. } => StatementKind::Explain,
        Ast::StartTransaction { .. } => StatementKind::Begin,
        Ast::Commit { .. } => StatementKind::Commit,
        Ast::Rollback { .. } => StatementKind::Rollback,
        Ast::Savepoint { .. } => StatementKind::Savepoint,
        _ => StatementKind::Other,
    }
}

/// Collects bind markers in first-seen order.
///
/// Named markers are deduplicated; every anonymous `?` is retained so the
/// binder can substitute positional values one per occurrence.
fn collect_parameters(ast: &Ast) -> Vec<String> {
    let mut parameters: Vec<String> = Vec::new();
    let _ = visit_expressions(ast, |expr: &Expr| {
        if let Expr::Value(Value::Placeholder(marker)) = expr {
            if marker == "?" || !parameters.contains(marker) {
                parameters.push(marker.clone());
            }
        }
        ControlFlow::<()>::Continue(())
    });
    parameters
}

fn projected_columns(items: &[SelectItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| match item {
            SelectItem::UnnamedExpr(expr) => expr.to_string(),
            SelectItem::ExprWithAlias { alias, .. } => alias.value.clone(),
            SelectItem::QualifiedWildcard(name, _) => format!("{name}.*"),
            SelectItem::Wildcard(_) => "*".to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(sql: &str) -> Arc<Statement> {
        Classifier::new().classify(sql).unwrap()
    }

    #[test]
    fn classifies_select() {
        let stmt = classify("SELECT id, name FROM users");
        assert_eq!(stmt.kind(), StatementKind::Select);
        assert!(!stmt.is_ddl());
        assert!(stmt.routes_as_query());
        assert_eq!(stmt.columns(), ["id", "name"]);
    }

    #[test]
    fn classifies_select_star() {
        let stmt = classify("SELECT * FROM users");
        assert_eq!(stmt.columns(), ["*"]);
    }

    #[test]
    fn classifies_distinct() {
        let stmt = classify("SELECT DISTINCT name FROM users");
        assert!(stmt.has_distinct());
        assert!(!classify("SELECT name FROM users").has_distinct());
    }

    #[test]
    fn classifies_dml() {
        assert_eq!(
            classify("INSERT INTO users VALUES (1, 'a')").kind(),
            StatementKind::Insert
        );
        assert_eq!(
            classify("UPDATE users SET name = 'b' WHERE id = 1").kind(),
            StatementKind::Update
        );
        assert_eq!(
            classify("DELETE FROM users WHERE id = 1").kind(),
            StatementKind::Delete
        );
    }

    #[test]
    fn insert_returning_routes_as_query_but_stays_insert() {
        let stmt = classify("INSERT INTO users (name) VALUES ('a') RETURNING id");
        assert_eq!(stmt.kind(), StatementKind::Insert);
        assert!(stmt.has_returning());
        assert!(stmt.routes_as_query());
        assert_eq!(stmt.columns(), ["id"]);
    }

    #[test]
    fn ddl_statements_are_flagged() {
        for (sql, kind) in [
            (
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
                StatementKind::CreateTable,
            ),
            ("CREATE INDEX idx ON users (name)", StatementKind::CreateIndex),
            (
                "CREATE VIEW v AS SELECT id FROM users",
                StatementKind::CreateView,
            ),
            ("DROP TABLE users", StatementKind::Drop),
            (
                "ALTER TABLE users ADD COLUMN age INTEGER",
                StatementKind::AlterTable,
            ),
        ] {
            let stmt = classify(sql);
            assert_eq!(stmt.kind(), kind, "{sql}");
            assert!(stmt.is_ddl(), "{sql}");
        }
    }

    #[test]
    fn create_trigger_takes_the_prefix_path() {
        let stmt = classify(
            "CREATE TRIGGER audit AFTER INSERT ON users BEGIN \
             INSERT INTO log VALUES (new.id); END",
        );
        assert_eq!(stmt.kind(), StatementKind::CreateTrigger);
        assert!(stmt.is_ddl());
    }

    #[test]
    fn transaction_boundaries() {
        for (sql, kind) in [
            ("BEGIN", StatementKind::Begin),
            ("begin transaction", StatementKind::Begin),
            ("COMMIT", StatementKind::Commit),
            ("ROLLBACK", StatementKind::Rollback),
            ("SAVEPOINT sp1", StatementKind::Savepoint),
            ("RELEASE sp1", StatementKind::Release),
        ] {
            let stmt = classify(sql);
            assert_eq!(stmt.kind(), kind, "{sql}");
            assert!(stmt.is_transaction_boundary(), "{sql}");
        }
    }

    #[test]
    fn maintenance_commands() {
        assert_eq!(classify("VACUUM").kind(), StatementKind::Vacuum);
        assert_eq!(classify("ANALYZE").kind(), StatementKind::Analyze);
    }

    #[test]
    fn explain_projects_fixed_columns() {
        let stmt = classify("EXPLAIN SELECT * FROM users");
        assert_eq!(stmt.kind(), StatementKind::Explain);
        assert_eq!(stmt.columns(), ["id", "parent", "notused", "detail"]);
        assert!(stmt.routes_as_query());
    }

    #[test]
    fn rejects_multiple_statements() {
        let err = Classifier::new()
            .classify("SELECT 1; SELECT 2")
            .unwrap_err();
        assert_eq!(err, ClassifyError::MultipleStatements);
    }

    #[test]
    fn tolerates_trailing_semicolons() {
        assert_eq!(
            classify("SELECT 1;").kind(),
            StatementKind::Select
        );
        assert_eq!(classify("SELECT 1 ; ; ").kind(), StatementKind::Select);
    }

    #[test]
    fn rejects_invalid_sql() {
        let err = Classifier::new().classify("SELEKT 1").unwrap_err();
        assert!(matches!(err, ClassifyError::Parse(_)));
    }

    #[test]
    fn rejects_empty_input() {
        assert_eq!(
            Classifier::new().classify("   ").unwrap_err(),
            ClassifyError::Empty
        );
    }

    #[test]
    fn named_parameters_are_deduplicated() {
        let stmt = classify("SELECT * FROM users WHERE id = :x OR parent = :x");
        assert_eq!(stmt.parameters(), [":x"]);
    }

    #[test]
    fn anonymous_parameters_are_kept_per_occurrence() {
        let stmt = classify("SELECT * FROM users WHERE id = ? OR parent = ?");
        assert_eq!(stmt.parameters(), ["?", "?"]);
    }

    #[test]
    fn numbered_parameters_preserve_first_seen_order() {
        let stmt = classify("SELECT * FROM users WHERE name = $2 AND id = $1");
        assert_eq!(stmt.parameters(), ["$2", "$1"]);
    }

    #[test]
    fn classification_is_stable_across_the_cache() {
        let classifier = Classifier::new();
        let first = classifier.classify("SELECT * FROM users WHERE id = :id").unwrap();
        let second = classifier.classify("SELECT * FROM users WHERE id = :id").unwrap();
        assert_eq!(first.kind(), second.kind());
        assert_eq!(first.parameters(), second.parameters());
        assert!(Arc::ptr_eq(&first, &second));
    }
}
