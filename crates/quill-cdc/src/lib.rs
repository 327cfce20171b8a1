//! quill-cdc: change-data-capture for Quill.
//!
//! This crate owns the capture side of replication: the row-level change
//! records shipped between nodes, the per-transaction buffer, and the hook
//! layer that intercepts mutations inside SQLite transactions without
//! altering their semantics.
//!
//! Capture pipeline:
//! - The pre-update hook fires before each INSERT/UPDATE/DELETE, copies the
//!   affected values out of the engine's transient buffers, and appends a
//!   [`Change`] to the connection's [`TransactionBuffer`].
//! - The commit hook drains the buffer into a [`Changeset`] and hands it to
//!   the configured [`ChangesetPublisher`]; a publish failure aborts the
//!   commit.
//! - The rollback hook discards the buffer.

mod buffer;
mod change;
mod changeset;
mod error;
mod hooks;
mod publish;
mod schema;
mod value;

pub use buffer::TransactionBuffer;
pub use change::{Change, Operation};
pub use changeset::Changeset;
pub use error::CdcError;
pub use hooks::{connection_buffer, HookContext, HookRegistry, TransactionHooks};
pub use publish::ChangesetPublisher;
pub use schema::{SchemaCache, TableSchema};
pub use value::SqlValue;

/// Bridges a sync SQLite hook callback into async code.
///
/// Hooks run on the connection's dedicated worker thread, where there is no
/// ambient runtime; from there the captured handle is blocked on directly.
/// When called from a runtime worker thread instead, the block is announced
/// so the scheduler can compensate.
pub fn block_on_bridge<F: std::future::Future>(
    handle: &tokio::runtime::Handle,
    future: F,
) -> F::Output {
    match tokio::runtime::Handle::try_current() {
        Ok(_) => tokio::task::block_in_place(|| handle.block_on(future)),
        Err(_) => handle.block_on(future),
    }
}
