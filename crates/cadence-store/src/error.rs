//! Error types for job stores.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backing file parsed but violates a store invariant.
    #[error("corrupt store {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// A blocking persistence task was cancelled or panicked.
    #[error("persistence task failed: {0}")]
    Task(String),
}
