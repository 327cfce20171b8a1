//! Error types for the engine.

/// Errors that can occur in the engine layer.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// The statement did not classify.
    #[error(transparent)]
    Classify(#[from] quill_sql::ClassifyError),

    /// Capture-layer failure.
    #[error(transparent)]
    Cdc(#[from] quill_cdc::CdcError),

    /// Replication-layer failure.
    #[error(transparent)]
    Replication(#[from] quill_replication::ReplicationError),

    /// Underlying SQLite/sqlx database error.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A database with this id is already registered.
    #[error("database with id {0:?} already added")]
    DatabaseExists(String),

    /// No database registered under this id.
    #[error("database with id {0:?} not found")]
    DatabaseNotFound(String),

    /// A bind parameter could not be resolved from the request.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// The operation needs replication, which this database runs without.
    #[error("replication is not configured for this database")]
    ReplicationDisabled,
}
