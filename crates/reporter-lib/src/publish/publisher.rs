//! Delivery coordinator
//!
//! Routes every record either to the remote sink or to the offline cache.
//! Two tasks cooperate:
//! - the send loop owns reachability and the cache
//! - the retry loop probes the remote and reports when it answers
//!
//! Reachability only flips back to available after a probe succeeded and
//! the whole backlog was replayed.

use super::sink::Sink;
use crate::config::MasterConfig;
use crate::error::CacheError;
use crate::health::{components, HealthRegistry};
use crate::models::CachedRecord;
use crate::observability::{ReporterMetrics, StructuredLogger};
use crate::store::OfflineCache;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Probe period after a failed delivery
pub const FAST_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Failed fast probes before falling back to the normal interval
pub const DEFAULT_MAX_FAST_ATTEMPTS: u32 = 20;

/// Instructions from the send loop to the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryControl {
    /// Probe on the fast interval
    FastRetry,
    /// Recovery confirmed, stop probing
    Stop,
}

/// Read-only view of the remote's reachability
#[derive(Debug, Clone, Default)]
pub struct RemoteStatus(Arc<AtomicBool>);

impl RemoteStatus {
    pub fn is_available(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, available: bool) {
        self.0.store(available, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Bound on one delivery or probe
    pub send_timeout: Duration,
    /// Probe period while no failure is being chased
    pub retry_interval: Duration,
    pub fast_retry_interval: Duration,
    pub max_fast_attempts: u32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self::from(&MasterConfig::default())
    }
}

impl From<&MasterConfig> for PublisherConfig {
    fn from(config: &MasterConfig) -> Self {
        Self {
            send_timeout: config.send_timeout(),
            retry_interval: config.retry_interval(),
            fast_retry_interval: FAST_RETRY_INTERVAL,
            max_fast_attempts: DEFAULT_MAX_FAST_ATTEMPTS,
        }
    }
}

/// Stateful publisher feeding the remote collector
pub struct Publisher {
    sink: Arc<dyn Sink>,
    cache: Box<dyn OfflineCache>,
    config: PublisherConfig,
    available: bool,
    /// Last cache operation failed and the `cache` component reports it
    cache_impaired: bool,
    status: RemoteStatus,
    metrics: Option<ReporterMetrics>,
    logger: Option<StructuredLogger>,
    health: Option<HealthRegistry>,
}

impl Publisher {
    pub fn remote_status(&self) -> RemoteStatus {
        self.status.clone()
    }

    /// Publish records until the stream closes or shutdown is signalled.
    ///
    /// The cache is flushed and closed before returning.
    pub async fn run(
        mut self,
        mut records: mpsc::Receiver<CachedRecord>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        info!(
            provider = %self.cache.provider(),
            retry_interval_ms = self.config.retry_interval.as_millis() as u64,
            "Starting publisher"
        );
        if let Some(health) = &self.health {
            health.set_degraded(components::PUBLISHER, "remote not confirmed").await;
            health.register(components::CACHE).await;
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_remote_available(false);
        }

        let (control_tx, control_rx) = mpsc::channel(8);
        let (reachable_tx, mut reachable_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let retry = RetryLoop {
            sink: self.sink.clone(),
            config: self.config.clone(),
            control: control_rx,
            reachable: reachable_tx,
            cancel: cancel.clone(),
            metrics: self.metrics.clone(),
        };
        let retry_task = tokio::spawn(retry.run());

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("Publisher received shutdown signal");
                    break;
                }
                Some(()) = reachable_rx.recv() => {
                    self.replay(&control_tx).await;
                }
                record = records.recv() => match record {
                    Some(record) => self.handle_record(record, &control_tx).await,
                    None => {
                        info!("Record stream closed");
                        break;
                    }
                },
            }
        }

        cancel.cancel();
        if let Err(e) = retry_task.await {
            error!(error = %e, "Retry loop task failed");
        }

        match self.cache.flush().await {
            Ok(()) => self.cache_recovered().await,
            Err(e) => {
                error!(
                    error = %e,
                    pending = self.cache.pending(),
                    "Failed to flush offline cache"
                );
                self.cache_failed(&e, false).await;
            }
        }

        let pending = self.cache.pending();
        if let Err(e) = self.cache.close().await {
            error!(error = %e, pending = pending, "Failed to close offline cache");
        }
        info!("Publisher stopped");

        Ok(())
    }

    async fn handle_record(&mut self, record: CachedRecord, control: &mpsc::Sender<RetryControl>) {
        if !self.available {
            self.cache_record(record).await;
            return;
        }

        match self.deliver(&record).await {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_records_sent();
                }
            }
            Err(e) => {
                warn!(
                    container_id = %record.container_id,
                    error = %e,
                    "Delivery failed, switching to offline cache"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_send_failures();
                }
                self.set_available(false).await;
                send_control(control, RetryControl::FastRetry).await;
                self.cache_record(record).await;
            }
        }
    }

    async fn deliver(&self, record: &CachedRecord) -> Result<()> {
        let started = Instant::now();
        timeout(self.config.send_timeout, self.sink.deliver(record))
            .await
            .map_err(|_| anyhow::anyhow!("delivery timed out"))??;

        if let Some(metrics) = &self.metrics {
            metrics.observe_delivery_latency(started.elapsed().as_secs_f64());
        }
        Ok(())
    }

    async fn cache_record(&mut self, record: CachedRecord) {
        let container_id = record.container_id.clone();
        match self.cache.push(record).await {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_records_cached();
                }
                self.cache_recovered().await;
            }
            Err(e) => {
                error!(container_id = %container_id, error = %e, "Failed to cache record");
                self.cache_failed(&e, false).await;
            }
        }
    }

    /// Count a cache error; an unreadable backlog makes the cache unhealthy
    async fn cache_failed(&mut self, error: &CacheError, unreadable: bool) {
        self.cache_impaired = true;
        if let Some(metrics) = &self.metrics {
            metrics.inc_cache_errors();
        }
        if let Some(health) = &self.health {
            if unreadable {
                health
                    .set_unhealthy(components::CACHE, format!("backlog unreadable: {}", error))
                    .await;
            } else {
                health.set_degraded(components::CACHE, error.to_string()).await;
            }
        }
    }

    async fn cache_recovered(&mut self) {
        if !self.cache_impaired {
            return;
        }
        self.cache_impaired = false;
        info!("Offline cache operations succeeding again");
        if let Some(health) = &self.health {
            health.set_healthy(components::CACHE).await;
        }
    }

    /// Deliver the whole backlog in order, then confirm recovery
    async fn replay(&mut self, control: &mpsc::Sender<RetryControl>) {
        let backlog = match self.cache.fetch().await {
            Ok(backlog) => backlog,
            Err(e) => {
                error!(error = %e, "Failed to read backlog");
                self.cache_failed(&e, true).await;
                send_control(control, RetryControl::FastRetry).await;
                return;
            }
        };
        self.cache_recovered().await;

        let total = backlog.len();
        debug!(records = total, "Replaying backlog");

        for (delivered, record) in backlog.iter().enumerate() {
            if let Err(e) = self.deliver(record).await {
                warn!(
                    delivered = delivered,
                    remaining = total - delivered,
                    error = %e,
                    "Backlog replay interrupted"
                );
                if let Some(logger) = &self.logger {
                    logger.log_replay(total, false);
                }
                if let Some(metrics) = &self.metrics {
                    metrics.inc_send_failures();
                }
                send_control(control, RetryControl::FastRetry).await;
                return;
            }
        }

        if let Err(e) = self.cache.clear().await {
            // Records were delivered; at worst they are sent again.
            warn!(error = %e, "Failed to clear replayed backlog");
            self.cache_failed(&e, false).await;
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_replay(total);
        }
        if let Some(logger) = &self.logger {
            logger.log_replay(total, true);
        }
        self.set_available(true).await;
        send_control(control, RetryControl::Stop).await;
    }

    async fn set_available(&mut self, available: bool) {
        if self.available == available {
            return;
        }
        self.available = available;
        self.status.set(available);

        if let Some(metrics) = &self.metrics {
            metrics.set_remote_available(available);
        }
        if let Some(logger) = &self.logger {
            logger.log_remote_status(available, self.cache.pending());
        }
        if let Some(health) = &self.health {
            if available {
                health.set_healthy(components::PUBLISHER).await;
            } else {
                health
                    .set_degraded(components::PUBLISHER, "remote unreachable, buffering")
                    .await;
            }
        }
    }
}

async fn send_control(control: &mpsc::Sender<RetryControl>, message: RetryControl) {
    if control.send(message).await.is_err() {
        debug!(?message, "Retry loop gone, control message dropped");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeMode {
    Normal,
    Fast { failed: u32 },
    /// Waiting for the send loop to confirm or reject recovery
    Paused,
    Stopped,
}

/// Probes the remote and reports reachability to the send loop
struct RetryLoop {
    sink: Arc<dyn Sink>,
    config: PublisherConfig,
    control: mpsc::Receiver<RetryControl>,
    reachable: mpsc::Sender<()>,
    cancel: CancellationToken,
    metrics: Option<ReporterMetrics>,
}

fn ticker_after(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl RetryLoop {
    async fn run(mut self) {
        let mut ticker = interval(self.config.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The immediate first tick is not a probe.
        ticker.tick().await;
        let mut mode = ProbeMode::Normal;

        loop {
            let probing = matches!(mode, ProbeMode::Normal | ProbeMode::Fast { .. });

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = self.control.recv() => match message {
                    Some(RetryControl::FastRetry) => {
                        debug!("Switching to fast probing");
                        mode = ProbeMode::Fast { failed: 0 };
                        ticker = ticker_after(self.config.fast_retry_interval);
                    }
                    Some(RetryControl::Stop) => {
                        debug!("Recovery confirmed, probing stopped");
                        mode = ProbeMode::Stopped;
                    }
                    None => break,
                },
                _ = ticker.tick(), if probing => {
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_probe_attempts();
                    }

                    match self.probe().await {
                        Ok(()) => {
                            debug!("Remote answered probe");
                            mode = ProbeMode::Paused;
                            if self.reachable.send(()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "Probe failed");
                            if let ProbeMode::Fast { failed } = mode {
                                let failed = failed + 1;
                                if failed >= self.config.max_fast_attempts {
                                    warn!(
                                        attempts = failed,
                                        interval_secs = self.config.retry_interval.as_secs(),
                                        "Remote still unreachable, slowing down probes"
                                    );
                                    mode = ProbeMode::Normal;
                                    ticker = ticker_after(self.config.retry_interval);
                                } else {
                                    mode = ProbeMode::Fast { failed };
                                }
                            }
                        }
                    }
                }
            }
        }

        debug!("Retry loop stopped");
    }

    async fn probe(&self) -> Result<()> {
        timeout(self.config.send_timeout, self.sink.probe())
            .await
            .map_err(|_| anyhow::anyhow!("probe timed out"))?
    }
}

/// Builder for [`Publisher`]
pub struct PublisherBuilder {
    sink: Option<Arc<dyn Sink>>,
    cache: Option<Box<dyn OfflineCache>>,
    config: PublisherConfig,
    metrics: Option<ReporterMetrics>,
    logger: Option<StructuredLogger>,
    health: Option<HealthRegistry>,
}

impl PublisherBuilder {
    pub fn new() -> Self {
        Self {
            sink: None,
            cache: None,
            config: PublisherConfig::default(),
            metrics: None,
            logger: None,
            health: None,
        }
    }

    pub fn sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn cache(mut self, cache: Box<dyn OfflineCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(mut self, config: PublisherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    pub fn fast_retry_interval(mut self, interval: Duration) -> Self {
        self.config.fast_retry_interval = interval;
        self
    }

    pub fn max_fast_attempts(mut self, attempts: u32) -> Self {
        self.config.max_fast_attempts = attempts;
        self
    }

    pub fn metrics(mut self, metrics: ReporterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Result<Publisher> {
        let sink = self
            .sink
            .ok_or_else(|| anyhow::anyhow!("Sink is required"))?;
        let cache = self
            .cache
            .ok_or_else(|| anyhow::anyhow!("Offline cache is required"))?;

        if self.config.retry_interval.is_zero() || self.config.fast_retry_interval.is_zero() {
            anyhow::bail!("Retry intervals must be greater than zero");
        }
        if self.config.send_timeout.is_zero() {
            anyhow::bail!("Send timeout must be greater than zero");
        }

        let mut config = self.config;
        config.max_fast_attempts = config.max_fast_attempts.max(1);

        Ok(Publisher {
            sink,
            cache,
            config,
            available: false,
            cache_impaired: false,
            status: RemoteStatus::default(),
            metrics: self.metrics,
            logger: self.logger,
            health: self.health,
        })
    }
}

impl Default for PublisherBuilder {
    fn default() -> Self {
        Self::new()
    }
}
