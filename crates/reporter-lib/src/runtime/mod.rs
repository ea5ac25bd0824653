//! Container runtime access
//!
//! The monitor only talks to the runtime through [`RuntimeClient`]; the
//! Docker Engine API adapter lives in [`docker`].

mod docker;

pub use docker::{DockerClient, DockerEndpoint, LineSplitter, DEFAULT_DOCKER_SOCKET};

use crate::config::RuntimeSettings;
use crate::models::{ContainerSummary, RawStatSnapshot, RuntimeEvent};
use anyhow::Result;
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;

/// Lifecycle events; an `Err` item is a decode or transport failure
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RuntimeEvent>> + Send>>;

/// Raw stat snapshots of one container, one item per runtime sample
pub type StatsStream = Pin<Box<dyn Stream<Item = Result<RawStatSnapshot>> + Send>>;

/// Capability the monitor needs from a container runtime
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Check that the runtime answers
    async fn ping(&self) -> Result<()>;

    /// Running containers
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Resolve one container by id or name
    async fn inspect_container(&self, id: &str) -> Result<ContainerSummary>;

    /// Subscribe to container lifecycle events
    async fn stream_events(&self) -> Result<EventStream>;

    /// Open the long-lived statistics stream of a container
    async fn stream_stats(&self, id: &str) -> Result<StatsStream>;
}

/// Create the runtime client for the configured endpoint
pub fn create_runtime(settings: &RuntimeSettings) -> Result<Arc<dyn RuntimeClient>> {
    let endpoint = DockerEndpoint::resolve(settings.docker_host.as_deref())?;
    tracing::info!(endpoint = %endpoint, "Using Docker Engine API runtime");
    Ok(Arc::new(DockerClient::new(endpoint)))
}
