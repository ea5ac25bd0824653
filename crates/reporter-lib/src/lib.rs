//! Reporter library for container statistics delivery
//!
//! This crate provides the core functionality for:
//! - Following containers and sampling their statistics
//! - Deriving CPU and memory metrics
//! - Delivering records to a remote collector
//! - Buffering records offline and replaying them on recovery
//! - Health checks and observability

pub mod config;
pub mod error;
pub mod health;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod publish;
pub mod runtime;
pub mod store;

pub use config::{CacheProvider, ReporterConfig};
pub use error::{CacheError, CacheResult};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ReporterMetrics, StructuredLogger};
