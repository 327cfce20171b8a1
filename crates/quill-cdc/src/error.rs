//! Error types for the capture layer.

use quill_types::PublishError;

/// Errors that can occur while capturing or decoding changes.
#[derive(thiserror::Error, Debug)]
pub enum CdcError {
    /// Underlying SQLite/sqlx database error.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Encountered a SQLite type that cannot be mapped to [`SqlValue`](crate::SqlValue).
    #[error("unsupported sqlite type: {type_name}")]
    UnsupportedSqliteType { type_name: String },

    /// Failed to decode a SQLite value to its Rust representation.
    #[error("failed to decode {type_name}: {source}")]
    DecodeError {
        type_name: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The table is not known to the schema (it may have been dropped
    /// mid-transaction or never existed in this database).
    #[error("no column metadata for {database}.{table}")]
    UnknownTable { database: String, table: String },

    /// A change record violated its arity invariant.
    #[error("change for {table} carries {values} values for {columns} columns")]
    Arity {
        table: String,
        columns: usize,
        values: usize,
    },

    /// A row change is missing the row identifier its operation requires.
    #[error("change for {table} is missing a row identifier")]
    MissingRowid { table: String },

    /// The wire payload was not a valid changeset.
    #[error("invalid changeset payload: {0}")]
    Codec(#[from] serde_json::Error),

    /// Publishing the committed changeset failed.
    #[error(transparent)]
    Publish(#[from] PublishError),
}
