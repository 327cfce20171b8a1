//! Row-level change records.

use serde::{Deserialize, Serialize};

use crate::{CdcError, SqlValue};

/// What a [`Change`] did to its row.
///
/// `Sql` carries opaque statement text (DDL replication); `Unknown` absorbs
/// operations introduced by newer peers so one unrecognised change never
/// poisons a whole stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operation {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "SQL")]
    Sql,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(match tag.as_str() {
            "INSERT" => Operation::Insert,
            "UPDATE" => Operation::Update,
            "DELETE" => Operation::Delete,
            "SQL" => Operation::Sql,
            _ => Operation::Unknown,
        })
    }
}

/// A single row-level mutation captured by the pre-update hook.
///
/// Invariants: INSERT carries only the new side, DELETE only the old side,
/// UPDATE both; value vectors match the column vector's arity. The record's
/// own `columns` are authoritative on replay so schema drift at the origin
/// is followed on the replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub columns: Vec<String>,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_rowid: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_rowid: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_values: Option<Vec<SqlValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_values: Option<Vec<SqlValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl Change {
    pub fn insert(
        database: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<String>,
        new_rowid: i64,
        new_values: Vec<SqlValue>,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            columns,
            operation: Operation::Insert,
            old_rowid: None,
            new_rowid: Some(new_rowid),
            old_values: None,
            new_values: Some(new_values),
            command: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update(
        database: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<String>,
        old_rowid: i64,
        new_rowid: i64,
        old_values: Vec<SqlValue>,
        new_values: Vec<SqlValue>,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            columns,
            operation: Operation::Update,
            old_rowid: Some(old_rowid),
            new_rowid: Some(new_rowid),
            old_values: Some(old_values),
            new_values: Some(new_values),
            command: None,
        }
    }

    pub fn delete(
        database: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<String>,
        old_rowid: i64,
        old_values: Vec<SqlValue>,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            columns,
            operation: Operation::Delete,
            old_rowid: Some(old_rowid),
            new_rowid: None,
            old_values: Some(old_values),
            new_values: None,
            command: None,
        }
    }

    /// An opaque SQL change: the statement text is replayed verbatim.
    pub fn sql(command: impl Into<String>) -> Self {
        Self {
            database: String::new(),
            table: String::new(),
            columns: Vec::new(),
            operation: Operation::Sql,
            old_rowid: None,
            new_rowid: None,
            old_values: None,
            new_values: None,
            command: Some(command.into()),
        }
    }

    /// Checks the structural invariants before replay.
    pub fn validate(&self) -> Result<(), CdcError> {
        let arity = |values: &Option<Vec<SqlValue>>| -> Result<(), CdcError> {
            let len = values.as_ref().map(Vec::len).unwrap_or_default();
            if len != self.columns.len() {
                return Err(CdcError::Arity {
                    table: self.table.clone(),
                    columns: self.columns.len(),
                    values: len,
                });
            }
            Ok(())
        };
        let rowid = |value: &Option<i64>| -> Result<(), CdcError> {
            if value.is_none() {
                return Err(CdcError::MissingRowid {
                    table: self.table.clone(),
                });
            }
            Ok(())
        };
        match self.operation {
            Operation::Insert => {
                rowid(&self.new_rowid)?;
                arity(&self.new_values)
            }
            Operation::Delete => {
                rowid(&self.old_rowid)?;
                arity(&self.old_values)
            }
            Operation::Update => {
                rowid(&self.old_rowid)?;
                rowid(&self.new_rowid)?;
                arity(&self.old_values)?;
                arity(&self.new_values)
            }
            Operation::Sql | Operation::Unknown => Ok(()),
        }
    }
}
