//! Core data models for the reporter

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cumulative CPU time counters of a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    #[serde(default)]
    pub total_usage: u64,
    #[serde(default)]
    pub percpu_usage: Vec<u64>,
    #[serde(default)]
    pub usage_in_kernelmode: u64,
    #[serde(default)]
    pub usage_in_usermode: u64,
}

/// CPU section of a runtime stat snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    #[serde(default)]
    pub cpu_usage: CpuUsage,
    /// Host-wide cumulative CPU time
    #[serde(default)]
    pub system_cpu_usage: u64,
    #[serde(default)]
    pub online_cpus: u32,
}

/// Memory section of a runtime stat snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub limit: u64,
    /// Detailed breakdown (cgroup `memory.stat` keys)
    #[serde(default)]
    pub stats: HashMap<String, u64>,
}

/// Unprocessed point-in-time counters as reported by the container runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawStatSnapshot {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cpu_stats: CpuStats,
    /// Counters of the previous runtime sample
    #[serde(default)]
    pub precpu_stats: CpuStats,
    #[serde(default)]
    pub memory_stats: MemoryStats,
}

/// Normalized metrics for one container at one sampling tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub container_id: String,
    pub cpu_usage_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_usage_percent: f64,
}

/// A record as handled by the delivery pipeline and the offline cache.
///
/// The payload is opaque JSON; the cache never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub container_id: String,
    pub captured_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl CachedRecord {
    pub fn new(
        container_id: impl Into<String>,
        captured_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            captured_at,
            payload,
        }
    }

    /// Wrap a metric record captured now
    pub fn from_metric(record: &MetricRecord) -> serde_json::Result<Self> {
        Ok(Self {
            container_id: record.container_id.clone(),
            captured_at: Utc::now(),
            payload: serde_json::to_value(record)?,
        })
    }
}

/// Container as reported by a runtime listing or inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub running: bool,
}

/// Lifecycle action carried by a runtime event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Start,
    Stop,
    Other(String),
}

impl From<&str> for EventAction {
    fn from(action: &str) -> Self {
        match action {
            "start" => EventAction::Start,
            "stop" => EventAction::Stop,
            other => EventAction::Other(other.to_string()),
        }
    }
}

/// Container lifecycle event from the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub action: EventAction,
    pub actor_id: String,
}

impl RuntimeEvent {
    pub fn new(action: impl AsRef<str>, actor_id: impl Into<String>) -> Self {
        Self {
            action: EventAction::from(action.as_ref()),
            actor_id: actor_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_decodes_with_missing_sections() {
        let json = r#"{"id":"abc","cpu_stats":{"cpu_usage":{"total_usage":10}},"memory_stats":{}}"#;
        let snapshot: RawStatSnapshot = serde_json::from_str(json).unwrap();

        assert_eq!(snapshot.id, "abc");
        assert_eq!(snapshot.cpu_stats.cpu_usage.total_usage, 10);
        assert_eq!(snapshot.cpu_stats.online_cpus, 0);
        assert_eq!(snapshot.precpu_stats, CpuStats::default());
        assert!(snapshot.memory_stats.stats.is_empty());
    }

    #[test]
    fn test_event_action_parsing() {
        assert_eq!(EventAction::from("start"), EventAction::Start);
        assert_eq!(EventAction::from("stop"), EventAction::Stop);
        assert_eq!(
            EventAction::from("die"),
            EventAction::Other("die".to_string())
        );
    }

    #[test]
    fn test_cached_record_from_metric() {
        let metric = MetricRecord {
            container_id: "c1".to_string(),
            cpu_usage_percent: 12.5,
            memory_usage_bytes: 2048,
            memory_usage_percent: 50.0,
        };

        let record = CachedRecord::from_metric(&metric).unwrap();
        assert_eq!(record.container_id, "c1");
        assert_eq!(record.payload["memory_usage_bytes"], 2048);

        let back: MetricRecord = serde_json::from_value(record.payload).unwrap();
        assert_eq!(back, metric);
    }
}
