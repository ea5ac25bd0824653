//! Observability handles for the reporter
//!
//! Provides:
//! - Prometheus metrics owned by an explicit registry (no global state)
//! - A structured event logger passed down to the pipeline stages

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use tracing::{info, warn};

/// Histogram buckets for delivery latency (seconds)
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

struct MetricsInner {
    containers_tracked: IntGauge,
    samples_collected: IntCounter,
    sample_decode_errors: IntCounter,
    records_sent: IntCounter,
    records_cached: IntCounter,
    send_failures: IntCounter,
    cache_errors: IntCounter,
    probe_attempts: IntCounter,
    replays: IntCounter,
    replayed_records: IntCounter,
    remote_available: IntGauge,
    delivery_latency_seconds: Histogram,
}

/// Reporter metrics for Prometheus exposition.
///
/// Clones share the same registry and collectors.
#[derive(Clone)]
pub struct ReporterMetrics {
    registry: Registry,
    inner: Arc<MetricsInner>,
}

impl Default for ReporterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("static counter definition");
    register(registry, Box::new(counter.clone()), name);
    counter
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("static gauge definition");
    register(registry, Box::new(gauge.clone()), name);
    gauge
}

fn register(registry: &Registry, collector: Box<dyn prometheus::core::Collector>, name: &str) {
    if let Err(e) = registry.register(collector) {
        warn!(metric = %name, error = %e, "Failed to register metric");
    }
}

impl ReporterMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let delivery_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "dmon_reporter_delivery_latency_seconds",
                "Time spent delivering one record to the remote collector",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )
        .expect("static histogram definition");
        register(
            &registry,
            Box::new(delivery_latency_seconds.clone()),
            "dmon_reporter_delivery_latency_seconds",
        );

        let inner = MetricsInner {
            containers_tracked: gauge(
                &registry,
                "dmon_reporter_containers_tracked",
                "Number of containers currently being sampled",
            ),
            samples_collected: counter(
                &registry,
                "dmon_reporter_samples_collected_total",
                "Raw stat snapshots decoded from the runtime",
            ),
            sample_decode_errors: counter(
                &registry,
                "dmon_reporter_sample_decode_errors_total",
                "Stat snapshots that failed to decode",
            ),
            records_sent: counter(
                &registry,
                "dmon_reporter_records_sent_total",
                "Records delivered live to the remote collector",
            ),
            records_cached: counter(
                &registry,
                "dmon_reporter_records_cached_total",
                "Records pushed to the offline cache",
            ),
            send_failures: counter(
                &registry,
                "dmon_reporter_send_failures_total",
                "Live deliveries that failed",
            ),
            cache_errors: counter(
                &registry,
                "dmon_reporter_cache_errors_total",
                "Offline cache operations that failed",
            ),
            probe_attempts: counter(
                &registry,
                "dmon_reporter_probe_attempts_total",
                "Reachability probes sent to the remote collector",
            ),
            replays: counter(
                &registry,
                "dmon_reporter_replays_total",
                "Completed backlog replays",
            ),
            replayed_records: counter(
                &registry,
                "dmon_reporter_replayed_records_total",
                "Records delivered from the backlog",
            ),
            remote_available: gauge(
                &registry,
                "dmon_reporter_remote_available",
                "1 when the remote collector is reachable",
            ),
            delivery_latency_seconds,
        };

        Self {
            registry,
            inner: Arc::new(inner),
        }
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        buffer
    }

    pub fn set_containers_tracked(&self, count: usize) {
        self.inner.containers_tracked.set(count as i64);
    }

    pub fn inc_samples_collected(&self) {
        self.inner.samples_collected.inc();
    }

    pub fn inc_sample_decode_errors(&self) {
        self.inner.sample_decode_errors.inc();
    }

    pub fn inc_records_sent(&self) {
        self.inner.records_sent.inc();
    }

    pub fn inc_records_cached(&self) {
        self.inner.records_cached.inc();
    }

    pub fn inc_send_failures(&self) {
        self.inner.send_failures.inc();
    }

    pub fn inc_cache_errors(&self) {
        self.inner.cache_errors.inc();
    }

    pub fn inc_probe_attempts(&self) {
        self.inner.probe_attempts.inc();
    }

    pub fn record_replay(&self, records: usize) {
        self.inner.replays.inc();
        self.inner.replayed_records.inc_by(records as u64);
    }

    pub fn set_remote_available(&self, available: bool) {
        self.inner.remote_available.set(i64::from(available));
    }

    pub fn observe_delivery_latency(&self, duration_secs: f64) {
        self.inner.delivery_latency_seconds.observe(duration_secs);
    }

    pub fn records_sent(&self) -> u64 {
        self.inner.records_sent.get()
    }

    pub fn records_cached(&self) -> u64 {
        self.inner.records_cached.get()
    }
}

/// Structured logger for reporter events
///
/// Keeps event names and fields consistent across the JSON log stream.
#[derive(Clone)]
pub struct StructuredLogger {
    host: String,
}

impl StructuredLogger {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn log_startup(&self, version: &str, cache_provider: &str, remote: &str) {
        info!(
            event = "reporter_started",
            host = %self.host,
            version = %version,
            cache_provider = %cache_provider,
            remote = %remote,
            "Reporter started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "reporter_shutdown",
            host = %self.host,
            reason = %reason,
            "Reporter shutting down"
        );
    }

    pub fn log_container_linked(&self, container_id: &str) {
        info!(
            event = "container_linked",
            host = %self.host,
            container_id = %container_id,
            "Container linked"
        );
    }

    pub fn log_container_unlinked(&self, container_id: &str) {
        info!(
            event = "container_unlinked",
            host = %self.host,
            container_id = %container_id,
            "Container unlinked"
        );
    }

    /// Log a reachability transition of the remote collector
    pub fn log_remote_status(&self, available: bool, buffered_items: usize) {
        if available {
            info!(
                event = "remote_status",
                host = %self.host,
                available = true,
                buffered_items = buffered_items,
                "Remote collector reachable, delivering live"
            );
        } else {
            warn!(
                event = "remote_status",
                host = %self.host,
                available = false,
                buffered_items = buffered_items,
                "Remote collector unreachable, buffering locally"
            );
        }
    }

    pub fn log_replay(&self, records: usize, success: bool) {
        if success {
            info!(
                event = "backlog_replayed",
                host = %self.host,
                records = records,
                "Backlog replayed to remote collector"
            );
        } else {
            warn!(
                event = "backlog_replay_failed",
                host = %self.host,
                records = records,
                "Backlog replay failed, keeping cached records"
            );
        }
    }
}
