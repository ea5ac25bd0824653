//! Durable offline cache backed by SQLite

use super::{BatchBuffer, OfflineCache};
use crate::config::CacheProvider;
use crate::error::{CacheError, CacheResult};
use crate::models::CachedRecord;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS data (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        container_id TEXT,
        dataset TEXT NOT NULL,
        time TEXT NOT NULL
    )
"#;

/// Rows per INSERT statement, keeping bind parameters under SQLite's limit
const MAX_ROWS_PER_INSERT: usize = 300;

/// Offline cache that persists batches to a SQLite database file
pub struct SqliteCache {
    pool: SqlitePool,
    buffer: BatchBuffer,
    path: PathBuf,
}

impl SqliteCache {
    /// Open (creating if needed) the database at `path` and ensure the schema
    pub async fn open(path: &Path, batch_size: usize) -> CacheResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| CacheError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;

        info!(path = %path.display(), "SQLite offline cache opened");

        Ok(Self {
            pool,
            buffer: BatchBuffer::new(batch_size),
            path: path.to_path_buf(),
        })
    }

    /// Rows currently stored in the database (pending records excluded)
    pub async fn persisted_count(&self) -> CacheResult<u64> {
        self.ensure_open()?;
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM data")
            .fetch_one(&self.pool)
            .await?
            .get("count");
        Ok(count.max(0) as u64)
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.pool.is_closed() {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    /// Write the buffered batch; on failure the batch goes back to the buffer
    async fn write_batch(&self) -> CacheResult<()> {
        let batch = self.buffer.drain();
        if batch.is_empty() {
            return Ok(());
        }

        match self.insert(&batch).await {
            Ok(()) => {
                debug!(records = batch.len(), "Batch written to SQLite");
                Ok(())
            }
            Err(e) => {
                warn!(
                    records = batch.len(),
                    error = %e,
                    "Failed to write batch, keeping it buffered"
                );
                self.buffer.requeue(batch);
                Err(e)
            }
        }
    }

    async fn insert(&self, batch: &[CachedRecord]) -> CacheResult<()> {
        let rows = batch
            .iter()
            .map(|record| -> CacheResult<(String, String, String)> {
                Ok((
                    record.container_id.clone(),
                    serde_json::to_string(&record.payload)?,
                    record
                        .captured_at
                        .to_rfc3339_opts(SecondsFormat::Nanos, true),
                ))
            })
            .collect::<CacheResult<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(MAX_ROWS_PER_INSERT) {
            let mut query: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO data (container_id, dataset, time) ");
            query.push_values(chunk, |mut row, (container_id, dataset, time)| {
                row.push_bind(container_id.clone())
                    .push_bind(dataset.clone())
                    .push_bind(time.clone());
            });
            query.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }
}

fn decode_row(container_id: Option<String>, dataset: &str, time: &str) -> Option<CachedRecord> {
    let payload = serde_json::from_str(dataset).ok()?;
    let captured_at = DateTime::parse_from_rfc3339(time).ok()?.with_timezone(&Utc);
    Some(CachedRecord::new(
        container_id.unwrap_or_default(),
        captured_at,
        payload,
    ))
}

#[async_trait]
impl OfflineCache for SqliteCache {
    async fn push(&self, record: CachedRecord) -> CacheResult<()> {
        self.ensure_open()?;
        if self.buffer.push(record) {
            self.write_batch().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> CacheResult<()> {
        self.ensure_open()?;
        self.write_batch().await
    }

    async fn fetch(&self) -> CacheResult<Vec<CachedRecord>> {
        self.ensure_open()?;
        // Stored rows stay readable when the pending batch cannot be written.
        if let Err(e) = self.write_batch().await {
            warn!(
                pending = self.buffer.len(),
                error = %e,
                "Pending batch not written, returning it after stored rows"
            );
        }

        let rows = sqlx::query("SELECT id, container_id, dataset, time FROM data ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let container_id: Option<String> = row.get("container_id");
            let dataset: String = row.get("dataset");
            let time: String = row.get("time");

            match decode_row(container_id, &dataset, &time) {
                Some(record) => records.push(record),
                None => warn!(row_id = id, "Skipping malformed cached row"),
            }
        }
        records.extend(self.buffer.snapshot());

        Ok(records)
    }

    async fn clear(&self) -> CacheResult<()> {
        self.ensure_open()?;
        self.buffer.drain();
        sqlx::query("DELETE FROM data").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> CacheResult<()> {
        if self.pool.is_closed() {
            return Ok(());
        }
        let flushed = self.write_batch().await;
        self.pool.close().await;
        info!(path = %self.path.display(), "SQLite offline cache closed");
        flushed
    }

    fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn provider(&self) -> CacheProvider {
        CacheProvider::Sqlite
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(n: u64) -> CachedRecord {
        CachedRecord::new(
            format!("c{}", n % 2),
            Utc::now(),
            json!({ "seq": n, "cpu_usage_percent": 1.5 }),
        )
    }

    async fn open(dir: &TempDir) -> SqliteCache {
        SqliteCache::open(&dir.path().join("data.db"), 5).await.unwrap()
    }

    #[tokio::test]
    async fn test_twelve_pushes_persist_two_batches() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;

        for n in 0..12 {
            cache.push(record(n)).await.unwrap();
        }

        assert_eq!(cache.persisted_count().await.unwrap(), 10);
        assert_eq!(cache.pending(), 2);
    }

    #[tokio::test]
    async fn test_fetch_returns_all_in_order() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        let pushed: Vec<_> = (0..7).map(record).collect();
        for r in &pushed {
            cache.push(r.clone()).await.unwrap();
        }

        let fetched = cache.fetch().await.unwrap();
        assert_eq!(fetched, pushed);
        assert_eq!(cache.pending(), 0);
    }

    #[tokio::test]
    async fn test_clear_removes_rows_and_pending() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        for n in 0..8 {
            cache.push(record(n)).await.unwrap();
        }

        cache.clear().await.unwrap();
        assert_eq!(cache.persisted_count().await.unwrap(), 0);
        assert!(cache.fetch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let cache = open(&dir).await;
            for n in 0..3 {
                cache.push(record(n)).await.unwrap();
            }
            cache.close().await.unwrap();
        }

        let reopened = open(&dir).await;
        let fetched = reopened.fetch().await.unwrap();
        assert_eq!(fetched.len(), 3);
        assert_eq!(fetched[2].payload["seq"], 2);
    }

    #[tokio::test]
    async fn test_malformed_rows_are_skipped() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;

        sqlx::query("INSERT INTO data (container_id, dataset, time) VALUES (?, ?, ?)")
            .bind("c0")
            .bind("{not json")
            .bind("2024-01-01T00:00:00Z")
            .execute(&cache.pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO data (container_id, dataset, time) VALUES (?, ?, ?)")
            .bind("c1")
            .bind("{}")
            .bind("yesterday")
            .execute(&cache.pool)
            .await
            .unwrap();
        cache.push(record(1)).await.unwrap();

        let fetched = cache.fetch().await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].payload["seq"], 1);
    }

    #[tokio::test]
    async fn test_fetch_returns_backlog_when_writes_fail() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        for n in 0..12 {
            cache.push(record(n)).await.unwrap();
        }

        sqlx::query("PRAGMA query_only = ON")
            .execute(&cache.pool)
            .await
            .unwrap();

        let fetched = cache.fetch().await.unwrap();
        let seqs: Vec<u64> = fetched
            .iter()
            .map(|r| r.payload["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, (0..12).collect::<Vec<_>>());
        assert_eq!(cache.pending(), 2);

        // A full batch that cannot be written stays buffered and readable
        for n in 12..15 {
            let _ = cache.push(record(n)).await;
        }
        assert_eq!(cache.pending(), 5);
        assert_eq!(cache.fetch().await.unwrap().len(), 15);

        sqlx::query("PRAGMA query_only = OFF")
            .execute(&cache.pool)
            .await
            .unwrap();
        cache.flush().await.unwrap();
        assert_eq!(cache.persisted_count().await.unwrap(), 15);
        assert_eq!(cache.pending(), 0);
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        cache.push(record(0)).await.unwrap();
        cache.close().await.unwrap();

        assert!(matches!(cache.fetch().await, Err(CacheError::Closed)));
        assert!(matches!(cache.push(record(1)).await, Err(CacheError::Closed)));
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_flushes_pending() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        cache.push(record(0)).await.unwrap();
        cache.push(record(1)).await.unwrap();
        cache.close().await.unwrap();

        let reopened = open(&dir).await;
        assert_eq!(reopened.persisted_count().await.unwrap(), 2);
    }
}
