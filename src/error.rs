//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration errors. These are fatal and only raised at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage backend errors raised while checking a request.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a storage adapter.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend could not be reached.
    #[error("Storage connection error: {0}")]
    Connection(String),

    /// The backend was reached but the command failed.
    #[error("Storage query error: {0}")]
    Query(String),

    /// The backend did not answer within the configured response timeout.
    #[error("Storage timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
