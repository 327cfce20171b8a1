//! quill-sql: SQL statement classification for Quill.
//!
//! Wire handlers and the execution layer need to know, before running a
//! statement, whether it reads, writes, changes schema, carries a RETURNING
//! clause, or marks a transaction boundary. Replication correctness depends
//! on that routing, so every statement passes through the classifier here.
//!
//! Classification is built once per unique SQL string and reused through a
//! bounded LRU cache shared across connections.

mod classifier;
mod error;
mod statement;

pub use classifier::Classifier;
pub use error::ClassifyError;
pub use statement::{Statement, StatementKind};
