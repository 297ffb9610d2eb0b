//! Error types for the extension system.

use std::path::PathBuf;
use thiserror::Error;

use super::registry::ConnectionState;

/// Errors that can occur in the extension system.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("Extension directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Manifest not found in extension: {0}")]
    ManifestNotFound(PathBuf),

    #[error("Invalid manifest in {path}: {message}")]
    ManifestInvalid { path: PathBuf, message: String },

    #[error("Extension '{0}' is declared more than once")]
    DuplicateId(String),

    #[error("Extension '{0}' not found")]
    ExtensionNotFound(String),

    #[error("Extension '{id}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: String,
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Failed to spawn extension '{extension}': {message}")]
    SpawnFailed { extension: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for extension operations.
pub type ExtensionResult<T> = Result<T, ExtensionError>;
