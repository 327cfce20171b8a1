//! # quill-types: Core types for Quill
//!
//! This crate contains shared types used across the Quill system:
//! - Node and process identity ([`ProcessId`])
//! - Durable log positions ([`StreamSeq`])
//! - Database registry keys ([`DatabaseId`])
//! - Publish failure classification ([`PublishError`])

use std::fmt::Display;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ============================================================================
// Process identity - Copy (8-byte sentinel)
// ============================================================================

/// Per-process incarnation sentinel: the process startup timestamp in
/// nanoseconds since the Unix epoch.
///
/// A node that restarts gets a new `ProcessId`, so the subscriber's origin
/// filter only suppresses traffic produced by *this* process. Changesets
/// published by a prior incarnation of the same node are applied on restart,
/// which is how a node re-converges after a crash.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ProcessId(i64);

impl ProcessId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Captures the current wall clock as a process sentinel.
    ///
    /// Call once at startup and thread the value through constructors.
    pub fn at_startup() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        Self(nanos)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ProcessId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<ProcessId> for i64 {
    fn from(id: ProcessId) -> Self {
        id.0
    }
}

// ============================================================================
// Stream sequence - Copy (position in the durable log)
// ============================================================================

/// The monotonic position assigned by the durable log on publish.
///
/// Sequences are strictly increasing per stream and provide the total order
/// used for last-writer-wins conflict resolution.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct StreamSeq(u64);

impl StreamSeq {
    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// The position immediately after this one.
    ///
    /// A subscription resumed after restoring a snapshot taken at sequence
    /// `S` starts at `S.successor()`.
    pub fn successor(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for StreamSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StreamSeq {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<StreamSeq> for u64 {
    fn from(seq: StreamSeq) -> Self {
        seq.0
    }
}

// ============================================================================
// Database identity - Clone (registry key)
// ============================================================================

/// Identifier of a database served by a node: the basename of its file path.
///
/// The registry aliases the first-loaded database under the reserved empty
/// id, which callers address by omitting the id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatabaseId(String);

impl DatabaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the id from a database file path.
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self(name)
    }

    /// The reserved alias for the first-loaded database.
    pub fn default_alias() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default_alias(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for DatabaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DatabaseId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DatabaseId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Publish failures
// ============================================================================

/// Error returned when publishing a changeset to the durable log fails.
///
/// The commit hook uses this to decide whether to abort the local
/// transaction: in synchronous mode any publish error converts the commit
/// into a rollback, preserving "published implies locally durable".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The durable log did not acknowledge within the configured timeout.
    #[error("publish timed out waiting for durable ack")]
    Timeout,

    /// The message bus rejected the publish or the connection failed.
    #[error("message bus error: {0}")]
    Bus(String),

    /// The changeset could not be serialized.
    #[error("failed to encode changeset: {0}")]
    Encode(String),

    /// The outbox spool could not be written.
    #[error("outbox spool error: {0}")]
    Spool(String),

    /// The system is terminating.
    #[error("system is shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_id_is_monotonic_with_wall_clock() {
        let a = ProcessId::at_startup();
        let b = ProcessId::at_startup();
        assert!(a.as_i64() > 0);
        assert!(b >= a);
    }

    #[test]
    fn stream_seq_successor() {
        assert_eq!(StreamSeq::new(42).successor(), StreamSeq::new(43));
    }

    #[test]
    fn database_id_from_path_takes_basename() {
        let id = DatabaseId::from_path(Path::new("/var/lib/quill/app.db"));
        assert_eq!(id.as_str(), "app.db");
    }

    #[test]
    fn default_alias_is_empty() {
        assert!(DatabaseId::default_alias().is_default_alias());
        assert!(!DatabaseId::new("app.db").is_default_alias());
    }
}
