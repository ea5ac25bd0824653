//! Container registry and lifecycle handling
//!
//! The [`Monitor`] owns every [`TrackedContainer`], follows runtime
//! lifecycle events to link and unlink them, and merges their snapshots
//! into one stream of cached records.

use super::container::{SamplerConfig, TrackedContainer};
use super::derive::derive_metrics;
use crate::config::MonitorSettings;
use crate::health::{components, HealthRegistry};
use crate::models::{CachedRecord, ContainerSummary, EventAction, RawStatSnapshot};
use crate::observability::{ReporterMetrics, StructuredLogger};
use crate::runtime::{EventStream, RuntimeClient};
use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Registry = DashMap<String, Arc<TrackedContainer>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracks the live container set and produces their metric records
pub struct Monitor {
    runtime: Arc<dyn RuntimeClient>,
    containers: Arc<Registry>,
    sampler_config: SamplerConfig,
    channel_buffer: usize,
    /// Ids linked after the fan-in started
    added_tx: mpsc::Sender<String>,
    added_rx: Mutex<Option<mpsc::Receiver<String>>>,
    fan_in_started: AtomicBool,
    listener_cancel: CancellationToken,
    fan_in_cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics: Option<ReporterMetrics>,
    logger: Option<StructuredLogger>,
    health: Option<HealthRegistry>,
}

impl Monitor {
    /// Index the running containers and start following lifecycle events.
    ///
    /// Fails if the listing or the event subscription cannot be set up.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let running = self
            .runtime
            .list_containers()
            .await
            .context("Failed to list containers")?;

        let mut linked = 0usize;
        for summary in running.into_iter().filter(|c| c.running) {
            if self.link_container(&summary).await {
                linked += 1;
            }
        }
        info!(containers = linked, "Indexed running containers");

        let events = self
            .runtime
            .stream_events()
            .await
            .context("Failed to subscribe to container events")?;

        if let Some(health) = &self.health {
            health.register(components::MONITOR).await;
            health.register(components::EVENT_LISTENER).await;
        }

        let monitor = self.clone();
        let handle = tokio::spawn(async move { monitor.handle_events(events).await });
        *lock(&self.listener) = Some(handle);

        Ok(())
    }

    /// Track a container; `false` if its id is already tracked
    pub async fn link_container(&self, summary: &ContainerSummary) -> bool {
        let container = match self.containers.entry(summary.id.clone()) {
            Entry::Occupied(_) => {
                warn!(container_id = %summary.id, "Container already linked");
                return false;
            }
            Entry::Vacant(slot) => {
                let container = Arc::new(TrackedContainer::new(
                    summary.id.clone(),
                    self.runtime.clone(),
                    self.sampler_config.clone(),
                    self.metrics.clone(),
                ));
                slot.insert(container.clone());
                container
            }
        };

        self.update_tracked_gauge();
        if let Some(logger) = &self.logger {
            logger.log_container_linked(container.id());
        }

        if self.fan_in_started.load(Ordering::SeqCst)
            && self.added_tx.send(summary.id.clone()).await.is_err()
        {
            debug!(container_id = %summary.id, "Fan-in gone, not announcing container");
        }

        true
    }

    /// Resolve `id` through the runtime, then link it
    pub async fn link_container_by_id(&self, id: &str) -> bool {
        match self.runtime.inspect_container(id).await {
            Ok(summary) => self.link_container(&summary).await,
            Err(e) => {
                warn!(container_id = %id, error = %e, "Failed to inspect container");
                false
            }
        }
    }

    /// Stop tracking a container; `false` if it was not tracked
    pub async fn unlink_container(&self, id: &str) -> bool {
        // Removal releases the shard lock before the container is stopped.
        let Some((_, container)) = self.containers.remove(id) else {
            debug!(container_id = %id, "Unlink of untracked container ignored");
            return false;
        };

        container.stop().await;
        self.update_tracked_gauge();
        if let Some(logger) = &self.logger {
            logger.log_container_unlinked(id);
        }
        true
    }

    /// Follow lifecycle events until the stream ends or the monitor stops
    pub async fn handle_events(self: Arc<Self>, mut events: EventStream) {
        info!("Listening for container events");

        loop {
            let event = tokio::select! {
                _ = self.listener_cancel.cancelled() => {
                    debug!("Event listener cancelled");
                    return;
                }
                event = events.next() => event,
            };

            match event {
                Some(Ok(event)) => match event.action {
                    EventAction::Start => {
                        self.link_container_by_id(&event.actor_id).await;
                    }
                    EventAction::Stop => {
                        self.unlink_container(&event.actor_id).await;
                    }
                    EventAction::Other(action) => {
                        debug!(container_id = %event.actor_id, action = %action, "Ignoring event");
                    }
                },
                Some(Err(e)) => {
                    warn!(error = %e, "Container event stream error");
                }
                None => break,
            }
        }

        warn!("Container event stream ended, lifecycle changes are no longer followed");
        if let Some(health) = &self.health {
            health
                .set_degraded(components::EVENT_LISTENER, "event stream ended")
                .await;
        }
    }

    /// Merged stream of records from every tracked container.
    ///
    /// Can be taken once.
    pub fn metrics(&self) -> Result<mpsc::Receiver<CachedRecord>> {
        let added_rx = lock(&self.added_rx)
            .take()
            .context("Metrics stream already taken")?;

        let (raw_tx, raw_rx) = mpsc::channel(self.channel_buffer);
        let (out_tx, out_rx) = mpsc::channel(self.channel_buffer);

        // Set before sweeping so a concurrent link is seen by one of the two.
        self.fan_in_started.store(true, Ordering::SeqCst);
        let initial = self.tracked_ids();

        let fan_in = FanIn {
            containers: self.containers.clone(),
            raw_tx,
            cancel: self.fan_in_cancel.clone(),
        };
        let supervisor = tokio::spawn(fan_in.run(initial, added_rx));
        let derive = tokio::spawn(derive_stage(raw_rx, out_tx));

        let mut tasks = lock(&self.tasks);
        tasks.push(supervisor);
        tasks.push(derive);

        Ok(out_rx)
    }

    /// Stop listening, stop every container and wait for all tasks
    pub async fn stop(&self) {
        info!(containers = self.len(), "Stopping monitor");
        self.listener_cancel.cancel();
        let listener = lock(&self.listener).take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                error!(error = %e, "Event listener task failed");
            }
        }

        let ids = self.tracked_ids();
        let mut group = JoinSet::new();
        for id in ids {
            if let Some((_, container)) = self.containers.remove(&id) {
                container.stop_in_group(&mut group);
            }
        }
        while let Some(result) = group.join_next().await {
            match result {
                Ok(id) => debug!(container_id = %id, "Container stopped"),
                Err(e) => error!(error = %e, "Container stop task failed"),
            }
        }
        self.update_tracked_gauge();

        self.fan_in_cancel.cancel();
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Monitor task failed");
            }
        }

        info!("Monitor stopped");
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.containers.contains_key(id)
    }

    pub fn tracked_ids(&self) -> Vec<String> {
        self.containers.iter().map(|e| e.key().clone()).collect()
    }

    fn update_tracked_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_containers_tracked(self.containers.len());
        }
    }
}

/// Relays every container's snapshots into one channel
struct FanIn {
    containers: Arc<Registry>,
    raw_tx: mpsc::Sender<(String, RawStatSnapshot)>,
    cancel: CancellationToken,
}

impl FanIn {
    async fn run(self, initial: Vec<String>, mut added: mpsc::Receiver<String>) {
        let mut relays = JoinSet::new();
        for id in initial {
            self.attach(&id, &mut relays);
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                id = added.recv() => match id {
                    Some(id) => self.attach(&id, &mut relays),
                    None => break,
                },
                Some(result) = relays.join_next(), if !relays.is_empty() => {
                    if let Err(e) = result {
                        error!(error = %e, "Snapshot relay failed");
                    }
                }
            }
        }

        relays.shutdown().await;
        debug!("Fan-in stopped");
    }

    /// Start relaying a container; no-op if it is already sampling or gone
    fn attach(&self, id: &str, relays: &mut JoinSet<()>) {
        let receiver = self
            .containers
            .get(id)
            .map(|entry| entry.value().clone())
            .and_then(|container| container.read_stats());

        let Some(mut receiver) = receiver else {
            return;
        };

        let id = id.to_string();
        let raw_tx = self.raw_tx.clone();
        relays.spawn(async move {
            while let Some(snapshot) = receiver.recv().await {
                if raw_tx.send((id.clone(), snapshot)).await.is_err() {
                    break;
                }
            }
            debug!(container_id = %id, "Snapshot relay finished");
        });
    }
}

/// Turn raw snapshots into cached records, preserving arrival order
async fn derive_stage(
    mut raw_rx: mpsc::Receiver<(String, RawStatSnapshot)>,
    out_tx: mpsc::Sender<CachedRecord>,
) {
    while let Some((id, snapshot)) = raw_rx.recv().await {
        let metric = derive_metrics(&id, &snapshot);
        let record = match CachedRecord::from_metric(&metric) {
            Ok(record) => record,
            Err(e) => {
                warn!(container_id = %id, error = %e, "Failed to encode metric record");
                continue;
            }
        };
        if out_tx.send(record).await.is_err() {
            debug!("Metric consumer gone, stopping derive stage");
            break;
        }
    }
}

/// Builder for [`Monitor`]
pub struct MonitorBuilder {
    runtime: Option<Arc<dyn RuntimeClient>>,
    settings: MonitorSettings,
    metrics: Option<ReporterMetrics>,
    logger: Option<StructuredLogger>,
    health: Option<HealthRegistry>,
}

impl MonitorBuilder {
    pub fn new() -> Self {
        Self {
            runtime: None,
            settings: MonitorSettings::default(),
            metrics: None,
            logger: None,
            health: None,
        }
    }

    pub fn runtime(mut self, runtime: Arc<dyn RuntimeClient>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn settings(mut self, settings: MonitorSettings) -> Self {
        self.settings = settings;
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

    pub fn build(self) -> Result<Arc<Monitor>> {
        let runtime = self
            .runtime
            .ok_or_else(|| anyhow::anyhow!("Runtime client is required"))?;

        let channel_buffer = self.settings.channel_buffer_size.max(1);
        let (added_tx, added_rx) = mpsc::channel(channel_buffer);

        Ok(Arc::new(Monitor {
            runtime,
            containers: Arc::new(DashMap::new()),
            sampler_config: SamplerConfig::from(&self.settings),
            channel_buffer,
            added_tx,
            added_rx: Mutex::new(Some(added_rx)),
            fan_in_started: AtomicBool::new(false),
            listener_cancel: CancellationToken::new(),
            fan_in_cancel: CancellationToken::new(),
            listener: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            metrics: self.metrics,
            logger: self.logger,
            health: self.health,
        }))
    }
}

impl Default for MonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
