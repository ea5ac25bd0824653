//! Per-container statistics sampler
//!
//! A [`TrackedContainer`] owns one long-lived stats stream. On every tick of
//! its ticker the sampler task takes exactly one snapshot off the stream and
//! hands it downstream.

use crate::config::MonitorSettings;
use crate::models::RawStatSnapshot;
use crate::observability::ReporterMetrics;
use crate::runtime::{RuntimeClient, StatsStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a tracked container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Registered, stream not opened yet
    Linked,
    Sampling,
    StopRequested,
    Stopped,
}

/// Sampler tuning
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Ticker period; the first tick fires one period after start
    pub interval: Duration,
    /// Grace period for the sampler to release its stream before it is aborted
    pub stop_timeout: Duration,
    /// Consecutive decode failures that end the sampler
    pub max_decode_failures: u32,
    /// Snapshots buffered towards the fan-in
    pub buffer_size: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self::from(&MonitorSettings::default())
    }
}

impl From<&MonitorSettings> for SamplerConfig {
    fn from(settings: &MonitorSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.sampling_interval_secs.max(1)),
            stop_timeout: Duration::from_secs(settings.stop_timeout_secs),
            max_decode_failures: settings.max_decode_failures.max(1),
            buffer_size: settings.channel_buffer_size.max(1),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A container whose statistics are being (or about to be) sampled
pub struct TrackedContainer {
    id: String,
    runtime: Arc<dyn RuntimeClient>,
    config: SamplerConfig,
    cancel: CancellationToken,
    state: Arc<Mutex<ContainerState>>,
    /// Fired by the sampler task once it exited and dropped its stream
    stopped_ack: Mutex<Option<oneshot::Receiver<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Option<ReporterMetrics>,
}

impl TrackedContainer {
    pub fn new(
        id: impl Into<String>,
        runtime: Arc<dyn RuntimeClient>,
        config: SamplerConfig,
        metrics: Option<ReporterMetrics>,
    ) -> Self {
        Self {
            id: id.into(),
            runtime,
            config,
            cancel: CancellationToken::new(),
            state: Arc::new(Mutex::new(ContainerState::Linked)),
            stopped_ack: Mutex::new(None),
            task: Mutex::new(None),
            metrics,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ContainerState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ContainerState::Sampling
    }

    /// Start sampling and return the snapshot receiver.
    ///
    /// Only the first call on a linked container starts a sampler; every
    /// other call returns `None`.
    pub fn read_stats(&self) -> Option<mpsc::Receiver<RawStatSnapshot>> {
        {
            let mut state = lock(&self.state);
            if *state != ContainerState::Linked {
                return None;
            }
            *state = ContainerState::Sampling;
        }

        let (tx, rx) = mpsc::channel(self.config.buffer_size);
        let (ack_tx, ack_rx) = oneshot::channel();

        let sampler = Sampler {
            id: self.id.clone(),
            runtime: self.runtime.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
            state: self.state.clone(),
            metrics: self.metrics.clone(),
        };
        let handle = tokio::spawn(sampler.run(tx, ack_tx));

        *lock(&self.stopped_ack) = Some(ack_rx);
        *lock(&self.task) = Some(handle);

        Some(rx)
    }

    /// Stop sampling and wait for the sampler to release its stream.
    ///
    /// Waits at most `stop_timeout`, then aborts the task. Calling it again
    /// is a no-op.
    pub async fn stop(&self) {
        let ack = lock(&self.stopped_ack).take();

        {
            let mut state = lock(&self.state);
            match *state {
                ContainerState::Linked => *state = ContainerState::Stopped,
                ContainerState::Sampling => *state = ContainerState::StopRequested,
                ContainerState::StopRequested | ContainerState::Stopped => {}
            }
        }
        self.cancel.cancel();

        let Some(ack) = ack else {
            return;
        };

        match tokio::time::timeout(self.config.stop_timeout, ack).await {
            Ok(_) => debug!(container_id = %self.id, "Sampler stopped"),
            Err(_) => {
                warn!(
                    container_id = %self.id,
                    timeout_secs = self.config.stop_timeout.as_secs(),
                    "Sampler did not acknowledge stop in time, aborting"
                );
                if let Some(handle) = lock(&self.task).take() {
                    handle.abort();
                }
                *lock(&self.state) = ContainerState::Stopped;
            }
        }
    }

    /// [`stop`](Self::stop) on a shared join group; the task yields the id
    pub fn stop_in_group(self: Arc<Self>, group: &mut JoinSet<String>) {
        group.spawn(async move {
            self.stop().await;
            self.id.clone()
        });
    }
}

/// State moved into the sampler task
struct Sampler {
    id: String,
    runtime: Arc<dyn RuntimeClient>,
    config: SamplerConfig,
    cancel: CancellationToken,
    state: Arc<Mutex<ContainerState>>,
    metrics: Option<ReporterMetrics>,
}

/// Outcome of waiting for the next stream item
enum Next {
    Cancelled,
    Item(Option<anyhow::Result<RawStatSnapshot>>),
}

impl Sampler {
    async fn run(self, tx: mpsc::Sender<RawStatSnapshot>, ack: oneshot::Sender<()>) {
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = self.runtime.stream_stats(&self.id) => Some(result),
        };

        match opened {
            Some(Ok(stream)) => {
                info!(container_id = %self.id, "Stats stream opened");
                self.sample(stream, &tx).await;
            }
            Some(Err(e)) => {
                error!(container_id = %self.id, error = %e, "Failed to open stats stream");
            }
            None => {}
        }

        *lock(&self.state) = ContainerState::Stopped;
        let _ = ack.send(());
    }

    /// Sampling loop; returns once the stream is dropped
    async fn sample(&self, mut stream: StatsStream, tx: &mpsc::Sender<RawStatSnapshot>) {
        let period = self.config.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let next = tokio::select! {
                _ = self.cancel.cancelled() => Next::Cancelled,
                item = stream.next() => Next::Item(item),
            };

            match next {
                Next::Cancelled => break,
                Next::Item(None) => {
                    info!(container_id = %self.id, "Stats stream ended");
                    break;
                }
                Next::Item(Some(Ok(snapshot))) => {
                    consecutive_failures = 0;
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_samples_collected();
                    }

                    let sent = tokio::select! {
                        _ = self.cancel.cancelled() => false,
                        result = tx.send(snapshot) => result.is_ok(),
                    };
                    if !sent {
                        break;
                    }
                }
                Next::Item(Some(Err(e))) => {
                    consecutive_failures += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_sample_decode_errors();
                    }
                    warn!(
                        container_id = %self.id,
                        error = %e,
                        consecutive_failures = consecutive_failures,
                        "Failed to decode stats snapshot"
                    );

                    if consecutive_failures >= self.config.max_decode_failures {
                        error!(
                            container_id = %self.id,
                            consecutive_failures = consecutive_failures,
                            "Too many decode failures, stopping sampler"
                        );
                        break;
                    }
                }
            }
        }

        drop(stream);
        debug!(container_id = %self.id, "Stats stream released");
    }
}
