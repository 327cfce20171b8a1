//! Classified statement representation.

use std::fmt::Display;

use serde::Serialize;

/// The classified kind of a single SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatementKind {
    Explain,
    Select,
    Insert,
    Update,
    Delete,
    CreateTable,
    CreateIndex,
    CreateView,
    CreateTrigger,
    CreateVirtualTable,
    AlterTable,
    Vacuum,
    Drop,
    Analyze,
    Begin,
    Commit,
    Rollback,
    Savepoint,
    Release,
    Other,
}

impl StatementKind {
    /// Returns true for schema-changing statements.
    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            StatementKind::CreateTable
                | StatementKind::CreateIndex
                | StatementKind::CreateView
                | StatementKind::CreateTrigger
                | StatementKind::CreateVirtualTable
                | StatementKind::AlterTable
                | StatementKind::Drop
        )
    }

    /// Returns true for BEGIN/COMMIT/ROLLBACK/SAVEPOINT/RELEASE.
    pub fn is_transaction_boundary(&self) -> bool {
        matches!(
            self,
            StatementKind::Begin
                | StatementKind::Commit
                | StatementKind::Rollback
                | StatementKind::Savepoint
                | StatementKind::Release
        )
    }
}

impl Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            StatementKind::Explain => "EXPLAIN",
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::CreateTable => "CREATE TABLE",
            StatementKind::CreateIndex => "CREATE INDEX",
            StatementKind::CreateView => "CREATE VIEW",
            StatementKind::CreateTrigger => "CREATE TRIGGER",
            StatementKind::CreateVirtualTable => "CREATE VIRTUAL TABLE",
            StatementKind::AlterTable => "ALTER TABLE",
            StatementKind::Vacuum => "VACUUM",
            StatementKind::Drop => "DROP",
            StatementKind::Analyze => "ANALYZE",
            StatementKind::Begin => "BEGIN",
            StatementKind::Commit => "COMMIT",
            StatementKind::Rollback => "ROLLBACK",
            StatementKind::Savepoint => "SAVEPOINT",
            StatementKind::Release => "RELEASE",
            StatementKind::Other => "OTHER",
        };
        write!(f, "{tag}")
    }
}

/// A classified SQL statement.
///
/// Built once per unique SQL string and shared behind an `Arc` through the
/// classifier cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub(crate) source: String,
    pub(crate) kind: StatementKind,
    pub(crate) ddl: bool,
    pub(crate) has_distinct: bool,
    pub(crate) has_returning: bool,
    pub(crate) parameters: Vec<String>,
    pub(crate) columns: Vec<String>,
}

impl Statement {
    /// The original SQL text.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn is_ddl(&self) -> bool {
        self.ddl
    }

    pub fn has_distinct(&self) -> bool {
        self.has_distinct
    }

    pub fn has_returning(&self) -> bool {
        self.has_returning
    }

    /// Bind markers in first-seen order.
    ///
    /// Named markers (`:x`, `@x`, `$x`) appear once regardless of how many
    /// times they occur; each anonymous `?` occurrence is retained. The
    /// leading sigil is preserved for the binder.
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    /// Output column names for statements that project rows.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn is_select(&self) -> bool {
        self.kind == StatementKind::Select
    }

    pub fn is_explain(&self) -> bool {
        self.kind == StatementKind::Explain
    }

    pub fn is_transaction_boundary(&self) -> bool {
        self.kind.is_transaction_boundary()
    }

    /// Returns true when the statement must be executed through the query
    /// path: SELECT, EXPLAIN, and any mutation carrying RETURNING.
    pub fn routes_as_query(&self) -> bool {
        self.is_select() || self.is_explain() || self.has_returning
    }
}
