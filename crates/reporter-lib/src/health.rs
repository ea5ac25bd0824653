//! Component health tracking
//!
//! Each pipeline stage reports its state here; the binary exposes the
//! aggregate through `/healthz` and `/readyz`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Running with reduced guarantees (e.g. buffering while the remote is down)
    Degraded,
    Unhealthy,
}

/// Last reported state of one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Aggregate health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst component status wins
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .fold(ComponentStatus::Healthy, |acc, status| match (acc, status) {
                (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                    ComponentStatus::Unhealthy
                }
                (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            })
    }
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const MONITOR: &str = "monitor";
    pub const EVENT_LISTENER: &str = "event_listener";
    pub const PUBLISHER: &str = "publisher";
    pub const CACHE: &str = "cache";
}

/// Shared component health registry
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as healthy
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn status_of(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().await.get(name).map(|c| c.status)
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    /// Ready once startup finished and no component is unhealthy.
    ///
    /// A degraded publisher (remote down, buffering) is still ready.
    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("Reporter not yet initialized".to_string()),
            };
        }

        if self.health().await.status == ComponentStatus::Unhealthy {
            return ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            };
        }

        ReadinessResponse {
            ready: true,
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_degraded_publisher_degrades_aggregate() {
        let registry = HealthRegistry::new();
        registry.register(components::MONITOR).await;
        registry.register(components::PUBLISHER).await;

        registry
            .set_degraded(components::PUBLISHER, "remote unreachable, buffering")
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert_eq!(
            registry.status_of(components::MONITOR).await,
            Some(ComponentStatus::Healthy)
        );
    }

    #[tokio::test]
    async fn test_unhealthy_outranks_degraded() {
        let registry = HealthRegistry::new();
        registry.set_degraded(components::PUBLISHER, "buffering").await;
        registry.set_unhealthy(components::CACHE, "disk full").await;

        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_readiness() {
        let registry = HealthRegistry::new();
        assert!(!registry.readiness().await.ready);

        registry.set_ready(true).await;
        registry.set_degraded(components::PUBLISHER, "buffering").await;
        assert!(registry.readiness().await.ready);

        registry
            .set_unhealthy(components::EVENT_LISTENER, "stream closed")
            .await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }
}
