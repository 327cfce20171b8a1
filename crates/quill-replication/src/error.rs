//! Error types for the replication engine.

use quill_types::PublishError;

/// Errors that can occur in the replication engine.
#[derive(thiserror::Error, Debug)]
pub enum ReplicationError {
    /// Connection, stream or consumer operation failed on the message bus.
    #[error("message bus error: {0}")]
    Bus(String),

    /// Publishing a changeset failed.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// A configuration value was rejected.
    #[error("invalid replication configuration: {0}")]
    Config(String),

    /// A deliver policy string did not parse.
    #[error("invalid deliver policy: {0}")]
    Policy(String),

    /// A change record was structurally invalid.
    #[error(transparent)]
    Change(#[from] quill_cdc::CdcError),

    /// Replay against the local engine failed.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Snapshot capture or restore failed.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Interceptor rule file could not be loaded.
    #[error("interceptor error: {0}")]
    Interceptor(String),

    /// Outbox spool I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Maps any bus-side error to [`ReplicationError::Bus`].
pub(crate) fn bus_err(error: impl std::fmt::Display) -> ReplicationError {
    ReplicationError::Bus(error.to_string())
}
