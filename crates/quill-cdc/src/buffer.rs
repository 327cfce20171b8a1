//! Per-connection transaction buffer.

use std::sync::Mutex;

use crate::Change;

/// Accumulates the changes of the transaction currently open on one
/// connection.
///
/// Exclusively owned by that connection's hooks: the pre-update hook
/// appends, the commit hook drains, the rollback hook clears. The execution
/// layer may also append opaque `SQL` changes (DDL replication) and remove
/// the last entry when the statement that produced it fails before commit.
#[derive(Debug, Default)]
pub struct TransactionBuffer {
    changes: Mutex<Vec<Change>>,
}

impl TransactionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, change: Change) {
        self.lock().push(change);
    }

    /// Takes all buffered changes, leaving the buffer empty.
    pub fn drain(&self) -> Vec<Change> {
        std::mem::take(&mut *self.lock())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Drops the most recently appended change.
    pub fn remove_last(&self) {
        self.lock().pop();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Change>> {
        self.changes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_empties_the_buffer() {
        let buffer = TransactionBuffer::new();
        buffer.push(Change::sql("CREATE TABLE t (id INTEGER PRIMARY KEY)"));
        buffer.push(Change::sql("DROP TABLE t"));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.drain().len(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn remove_last_pops_only_the_tail() {
        let buffer = TransactionBuffer::new();
        buffer.push(Change::sql("A"));
        buffer.push(Change::sql("B"));
        buffer.remove_last();
        let drained = buffer.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].command.as_deref(), Some("A"));
    }
}
