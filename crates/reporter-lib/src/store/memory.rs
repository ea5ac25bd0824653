//! Process-local offline cache

use super::{BatchBuffer, OfflineCache};
use crate::config::CacheProvider;
use crate::error::{CacheError, CacheResult};
use crate::models::CachedRecord;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Offline cache that keeps flushed batches in memory.
///
/// Mirrors the batching of the durable provider so both behave the same
/// from the publisher's point of view.
pub struct InMemoryCache {
    buffer: BatchBuffer,
    flushed: Mutex<Vec<CachedRecord>>,
    closed: AtomicBool,
}

impl InMemoryCache {
    pub fn new(batch_size: usize) -> Self {
        Self {
            buffer: BatchBuffer::new(batch_size),
            flushed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Records moved out of the batch buffer so far
    pub async fn persisted_len(&self) -> usize {
        self.flushed.lock().await.len()
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    async fn write_batch(&self) {
        let batch = self.buffer.drain();
        if batch.is_empty() {
            return;
        }
        debug!(records = batch.len(), "Flushing batch to memory");
        self.flushed.lock().await.extend(batch);
    }
}

#[async_trait]
impl OfflineCache for InMemoryCache {
    async fn push(&self, record: CachedRecord) -> CacheResult<()> {
        self.ensure_open()?;
        if self.buffer.push(record) {
            self.write_batch().await;
        }
        Ok(())
    }

    async fn flush(&self) -> CacheResult<()> {
        self.ensure_open()?;
        self.write_batch().await;
        Ok(())
    }

    async fn fetch(&self) -> CacheResult<Vec<CachedRecord>> {
        self.ensure_open()?;
        self.write_batch().await;
        Ok(self.flushed.lock().await.clone())
    }

    async fn clear(&self) -> CacheResult<()> {
        self.ensure_open()?;
        self.buffer.drain();
        self.flushed.lock().await.clear();
        Ok(())
    }

    async fn close(&self) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.write_batch().await;
        Ok(())
    }

    fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn provider(&self) -> CacheProvider {
        CacheProvider::InMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn record(n: u64) -> CachedRecord {
        CachedRecord::new("c1", Utc::now(), json!({ "seq": n }))
    }

    #[tokio::test]
    async fn test_batches_at_capacity() {
        let cache = InMemoryCache::new(5);

        for n in 0..12 {
            cache.push(record(n)).await.unwrap();
        }

        assert_eq!(cache.persisted_len().await, 10);
        assert_eq!(cache.pending(), 2);
    }

    #[tokio::test]
    async fn test_fetch_includes_pending_in_order() {
        let cache = InMemoryCache::new(5);
        for n in 0..7 {
            cache.push(record(n)).await.unwrap();
        }

        let fetched = cache.fetch().await.unwrap();
        let seqs: Vec<_> = fetched.iter().map(|r| r.payload["seq"].as_u64().unwrap()).collect();
        assert_eq!(seqs, (0..7).collect::<Vec<_>>());
        assert_eq!(cache.pending(), 0);
    }

    #[tokio::test]
    async fn test_clear_drops_everything() {
        let cache = InMemoryCache::new(5);
        for n in 0..6 {
            cache.push(record(n)).await.unwrap();
        }

        cache.clear().await.unwrap();
        assert!(cache.fetch().await.unwrap().is_empty());
        assert_eq!(cache.pending(), 0);
    }

    #[tokio::test]
    async fn test_push_after_close_fails() {
        let cache = InMemoryCache::new(5);
        cache.push(record(0)).await.unwrap();
        cache.close().await.unwrap();

        assert_eq!(cache.persisted_len().await, 1);
        assert!(matches!(cache.push(record(1)).await, Err(CacheError::Closed)));
        cache.close().await.unwrap();
    }
}
