//! Container monitoring
//!
//! This module tracks the live container set and turns per-container
//! statistics streams into metric records:
//! - [`Monitor`]: registry, lifecycle events, fan-in of all samplers
//! - [`TrackedContainer`]: one sampler task per container
//! - [`derive`]: CPU and memory formulas

mod container;
pub mod derive;
mod registry;


pub use container::{ContainerState, SamplerConfig, TrackedContainer};
pub use derive::{derive_metrics, parse_cpu, parse_memory};
pub use registry::{Monitor, MonitorBuilder};
