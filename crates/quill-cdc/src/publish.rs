//! The seam between the commit hook and the durable log.

use quill_types::{PublishError, StreamSeq};

use crate::Changeset;

/// Abstraction for publishing a committed changeset to the durable log.
///
/// This trait is the bridge between the sync SQLite commit hook and the
/// async replication layer. The commit hook calls it inline on the
/// committing connection's worker thread and gates the engine's commit on
/// the result:
///
/// - `Ok(Some(seq))` — the log acknowledged the record at `seq`; the local
///   commit proceeds.
/// - `Ok(None)` — the record was accepted for asynchronous delivery (outbox
///   spool); the local commit proceeds.
/// - `Err(_)` — the record is not durable; the commit is converted into a
///   rollback.
pub trait ChangesetPublisher: Send + Sync {
    /// Publishes a changeset, blocking until it is durable (or spooled).
    fn publish_blocking(&self, changeset: Changeset) -> Result<Option<StreamSeq>, PublishError>;
}
