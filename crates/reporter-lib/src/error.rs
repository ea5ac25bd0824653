//! Error types for the offline cache

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors raised by offline cache providers
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to prepare cache storage at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cache database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to serialize cached record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache is closed")]
    Closed,
}
