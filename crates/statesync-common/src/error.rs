//! Error types for the record model

use thiserror::Error;

/// Result type alias for record model operations
pub type Result<T> = std::result::Result<T, RecordError>;

/// Errors raised while building, encoding or decoding state records
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Category key must not be empty")]
    EmptyCategoryKey,

    #[error("Unknown module state '{0}', expected one of Online, Run, NotReady, Offline")]
    UnknownState(String),
}
