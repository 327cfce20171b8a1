//! Error types for statement classification.

/// Errors produced while classifying a SQL statement.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    /// The input did not parse. The message carries the parser's
    /// line/column annotation.
    #[error("invalid SQL: {0}")]
    Parse(String),

    /// More than one statement was supplied in a single input.
    #[error("multiple SQL statements are not allowed")]
    MultipleStatements,

    /// The input was empty or whitespace only.
    #[error("empty SQL statement")]
    Empty,
}
