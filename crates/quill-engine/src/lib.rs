//! quill-engine: the node-local orchestrator.
//!
//! An [`Engine`] owns the per-process identity (node name + startup
//! sentinel), the shared statement classifier, and the registry mapping
//! database ids to their [`Database`] instances. Each [`Database`] bundles
//! a hooked connection pool with its replication collaborators (publisher,
//! subscriber, snapshotter) and routes classified statements to the query
//! or exec path.

mod database;
mod engine;
mod error;
mod params;

pub use database::{Database, DatabaseOptions, Response};
pub use engine::Engine;
pub use error::EngineError;
pub use params::ordered_params;
