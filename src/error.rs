//! Error types for tgfilestream

use crate::locator::DecodeError;
use crate::telegram::UpstreamError;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration was read but holds unusable values
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A resource token did not decode
    #[error("Invalid resource token: {0}")]
    TokenDecode(#[from] DecodeError),

    /// Message deleted, carries no file, or the file name does not match
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Error reported by the upstream network
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Missing or wrong shared secret
    #[error("Unauthorized")]
    Unauthorized,

    /// Client already has the maximum number of downloads in flight
    #[error("Too many concurrent downloads")]
    AdmissionRejected,

    /// Requested range starts at or beyond the end of the file
    #[error("Range not satisfiable for a file of {size} bytes")]
    RangeNotSatisfiable { size: u64 },

    /// Byte window handed to the transfer engine is out of bounds
    #[error("Invalid byte window {offset}..{limit} for a file of {size} bytes")]
    InvalidRange { offset: u64, limit: u64, size: u64 },

    /// The connection pool was torn down
    #[error("Connection pool is closed")]
    PoolClosed,

    /// The download session was cancelled by its consumer
    #[error("Download cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error means the addressed resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::TokenDecode(_) | Error::Upstream(UpstreamError::NotFound)
        )
    }
}
