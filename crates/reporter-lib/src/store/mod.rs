//! Offline storage for records the remote collector could not take
//!
//! Two providers implement [`OfflineCache`]:
//! - [`InMemoryCache`]: process-local, lost on restart
//! - [`SqliteCache`]: durable, batches writes through a [`BatchBuffer`]

mod buffer;
mod memory;
mod sqlite;

pub use buffer::{BatchBuffer, DEFAULT_BATCH_CAPACITY};
pub use memory::InMemoryCache;
pub use sqlite::SqliteCache;

use crate::config::{CacheConfig, CacheProvider};
use crate::error::CacheResult;
use crate::models::CachedRecord;
use async_trait::async_trait;
use tracing::info;

/// Storage for records buffered while the remote is unreachable.
///
/// Only the publisher's send loop drives a cache, so implementations need
/// not order concurrent callers.
#[async_trait]
pub trait OfflineCache: Send + Sync {
    /// Buffer one record
    async fn push(&self, record: CachedRecord) -> CacheResult<()>;

    /// Write out anything still held in the batch buffer
    async fn flush(&self) -> CacheResult<()>;

    /// Every cached record in insertion order, pending ones included
    async fn fetch(&self) -> CacheResult<Vec<CachedRecord>>;

    /// Drop every cached and pending record
    async fn clear(&self) -> CacheResult<()>;

    /// Flush and release the underlying storage
    async fn close(&self) -> CacheResult<()>;

    /// Number of records not yet written out
    fn pending(&self) -> usize;

    fn provider(&self) -> CacheProvider;
}

/// Build the cache selected by the configuration
pub async fn create_cache(config: &CacheConfig) -> CacheResult<Box<dyn OfflineCache>> {
    match config.provider {
        CacheProvider::InMemory => {
            info!(batch_size = config.batch_size, "Using in-memory offline cache");
            Ok(Box::new(InMemoryCache::new(config.batch_size)))
        }
        CacheProvider::Sqlite => {
            let path = config.resolved_db_path();
            info!(
                path = %path.display(),
                batch_size = config.batch_size,
                "Using SQLite offline cache"
            );
            let cache = SqliteCache::open(&path, config.batch_size).await?;
            Ok(Box::new(cache))
        }
    }
}
