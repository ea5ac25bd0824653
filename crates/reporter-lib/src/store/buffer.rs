//! Capacity-bounded batch accumulator
//!
//! Records collect here until `capacity` of them are present, then the owning
//! cache writes them out as one batch. The buffer never drops a record for
//! being full; fullness is only a signal to the caller.

use crate::models::CachedRecord;
use std::sync::{Mutex, MutexGuard};

/// Batch size used when none is configured
pub const DEFAULT_BATCH_CAPACITY: usize = 5;

#[derive(Debug)]
pub struct BatchBuffer {
    capacity: usize,
    items: Mutex<Vec<CachedRecord>>,
}

impl Default for BatchBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_CAPACITY)
    }
}

impl BatchBuffer {
    /// Create a buffer; a zero capacity is raised to 1
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CachedRecord>> {
        // A panic while holding the lock cannot leave the Vec half-written.
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a record and report whether the buffer reached capacity
    pub fn push(&self, record: CachedRecord) -> bool {
        let mut items = self.lock();
        items.push(record);
        items.len() >= self.capacity
    }

    /// Take every buffered record, leaving the buffer empty
    pub fn drain(&self) -> Vec<CachedRecord> {
        std::mem::take(&mut *self.lock())
    }

    /// Put a batch back in front of anything pushed since it was drained
    pub fn requeue(&self, mut batch: Vec<CachedRecord>) {
        if batch.is_empty() {
            return;
        }
        let mut items = self.lock();
        batch.append(&mut items);
        *items = batch;
    }

    /// Copy of the buffered records, in order
    pub fn snapshot(&self) -> Vec<CachedRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn record(n: u64) -> CachedRecord {
        CachedRecord::new(format!("c{}", n), Utc::now(), json!({ "n": n }))
    }

    #[test]
    fn test_full_on_capacity_push() {
        let buffer = BatchBuffer::new(5);

        for n in 0..4 {
            assert!(!buffer.push(record(n)));
        }
        assert!(buffer.push(record(4)));
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_never_drops_past_capacity() {
        let buffer = BatchBuffer::new(2);
        buffer.push(record(0));
        buffer.push(record(1));
        assert!(buffer.push(record(2)));
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_drain_empties_and_preserves_order() {
        let buffer = BatchBuffer::new(3);
        buffer.push(record(0));
        buffer.push(record(1));

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].container_id, "c0");
        assert_eq!(drained[1].container_id, "c1");
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let buffer = BatchBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        assert!(buffer.push(record(0)));
    }

    #[test]
    fn test_snapshot_leaves_records_buffered() {
        let buffer = BatchBuffer::new(5);
        buffer.push(record(0));
        buffer.push(record(1));

        let copy = buffer.snapshot();
        assert_eq!(copy.len(), 2);
        assert_eq!(copy[1].container_id, "c1");
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_requeue_goes_to_front() {
        let buffer = BatchBuffer::new(5);
        buffer.push(record(0));
        buffer.push(record(1));
        let batch = buffer.drain();

        buffer.push(record(2));
        buffer.requeue(batch);

        let ids: Vec<_> = buffer.drain().into_iter().map(|r| r.container_id).collect();
        assert_eq!(ids, vec!["c0", "c1", "c2"]);
    }

    #[test]
    fn test_concurrent_pushes_are_counted() {
        let buffer = Arc::new(BatchBuffer::new(1000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for n in 0..50 {
                        buffer.push(record(t * 100 + n));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(buffer.len(), 200);
    }
}
