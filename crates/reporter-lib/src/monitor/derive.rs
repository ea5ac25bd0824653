//! Metric derivation from raw runtime counters

use crate::models::{CpuStats, MemoryStats, MetricRecord, RawStatSnapshot};

/// Key of the page-cache share subtracted from memory usage
const INACTIVE_FILE: &str = "inactive_file";

/// CPU utilization in percent of one CPU, scaled by the online CPU count.
///
/// Deltas are taken in floating point: a counter reset yields a negative
/// value instead of wrapping.
pub fn parse_cpu(current: &CpuStats, previous: &CpuStats) -> f64 {
    let cpu_delta = current.cpu_usage.total_usage as f64 - previous.cpu_usage.total_usage as f64;
    let sys_delta = current.system_cpu_usage as f64 - previous.system_cpu_usage as f64;

    let online = if current.online_cpus != 0 {
        current.online_cpus as f64
    } else {
        current.cpu_usage.percpu_usage.len() as f64
    };

    if sys_delta > 0.0 {
        (cpu_delta / sys_delta) * online * 100.0
    } else {
        0.0
    }
}

/// Working-set memory usage and its share of the limit
pub fn parse_memory(memory: &MemoryStats) -> (u64, f64) {
    let inactive = memory.stats.get(INACTIVE_FILE).copied().unwrap_or(0);
    let usage = if inactive < memory.usage {
        memory.usage - inactive
    } else {
        0
    };

    let percent = if memory.limit != 0 {
        usage as f64 / memory.limit as f64 * 100.0
    } else {
        0.0
    };

    (usage, percent)
}

/// Derive one metric record from a snapshot of `container_id`
pub fn derive_metrics(container_id: &str, snapshot: &RawStatSnapshot) -> MetricRecord {
    let (memory_usage_bytes, memory_usage_percent) = parse_memory(&snapshot.memory_stats);

    MetricRecord {
        container_id: container_id.to_string(),
        cpu_usage_percent: parse_cpu(&snapshot.cpu_stats, &snapshot.precpu_stats),
        memory_usage_bytes,
        memory_usage_percent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CpuUsage;
    use std::collections::HashMap;

    fn cpu(total: u64, system: u64, online: u32, percpu: usize) -> CpuStats {
        CpuStats {
            cpu_usage: CpuUsage {
                total_usage: total,
                percpu_usage: vec![0; percpu],
                ..Default::default()
            },
            system_cpu_usage: system,
            online_cpus: online,
        }
    }

    fn memory(usage: u64, limit: u64, inactive: Option<u64>) -> MemoryStats {
        let mut stats = HashMap::new();
        if let Some(inactive) = inactive {
            stats.insert(INACTIVE_FILE.to_string(), inactive);
        }
        MemoryStats { usage, limit, stats }
    }

    #[test]
    fn test_cpu_percent_sequence() {
        let previous = cpu(1_000, 10_000, 2, 0);
        let expected = [(100, 20.0), (200, 40.0), (50, 10.0)];

        for (delta, pct) in expected {
            let current = cpu(1_000 + delta, 11_000, 2, 0);
            assert!((parse_cpu(&current, &previous) - pct).abs() < 1e-9);
        }
    }

    #[test]
    fn test_cpu_falls_back_to_percpu_count() {
        let previous = cpu(0, 0, 0, 4);
        let current = cpu(250, 1_000, 0, 4);
        assert!((parse_cpu(&current, &previous) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_zero_system_delta() {
        let stats = cpu(500, 1_000, 2, 0);
        assert_eq!(parse_cpu(&stats, &stats), 0.0);

        let backwards = cpu(600, 900, 2, 0);
        assert_eq!(parse_cpu(&backwards, &stats), 0.0);
    }

    #[test]
    fn test_cpu_counter_reset_goes_negative() {
        let previous = cpu(1_000, 1_000, 1, 0);
        let current = cpu(500, 2_000, 1, 0);
        assert!(parse_cpu(&current, &previous) < 0.0);
    }

    #[test]
    fn test_memory_subtracts_inactive_file() {
        let (usage, pct) = parse_memory(&memory(1_000, 4_000, Some(200)));
        assert_eq!(usage, 800);
        assert!((pct - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_memory_missing_inactive_key() {
        let (usage, _) = parse_memory(&memory(1_000, 4_000, None));
        assert_eq!(usage, 1_000);
    }

    #[test]
    fn test_memory_inactive_not_smaller_yields_zero() {
        let (usage, pct) = parse_memory(&memory(1_000, 4_000, Some(1_000)));
        assert_eq!(usage, 0);
        assert_eq!(pct, 0.0);
    }

    #[test]
    fn test_memory_zero_limit() {
        let (usage, pct) = parse_memory(&memory(1_000, 0, Some(100)));
        assert_eq!(usage, 900);
        assert_eq!(pct, 0.0);
    }

    #[test]
    fn test_stopped_container_snapshot() {
        let record = derive_metrics("c1", &RawStatSnapshot::default());
        assert_eq!(record.container_id, "c1");
        assert_eq!(record.cpu_usage_percent, 0.0);
        assert_eq!(record.memory_usage_bytes, 0);
        assert_eq!(record.memory_usage_percent, 0.0);
    }
}
