//! Metric correlation
//!
//! Joins usage samples across two scrape cycles (CPU counter → rate) and
//! across the two exporters (usage ↔ declared resources and pod metadata).
//! [`correlate`] is a pure function of the current snapshot, the baseline
//! snapshot and the policy snapshot.

mod policy;


pub use policy::{enrich_from_cluster, PolicyBuilder};

use crate::exposition::{MetricKind, Sample};
use crate::models::{IdentityKey, PolicySnapshot, UnifiedRecord, UsageSnapshot, UNKNOWN};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// What to do when a CPU counter is lower than its baseline value
/// (typically a container restart)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterResetPolicy {
    /// Emit a rate of 0.0 and log the reset
    #[default]
    Clamp,
    /// Emit nothing for the key this cycle; the current value becomes the new baseline
    Rebaseline,
    /// Emit the negative rate as is
    PassThrough,
}

/// Counters describing one correlation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    pub emitted: usize,
    /// Keys with no usable CPU counter in the baseline or current snapshot
    pub cold_starts: usize,
    pub counter_resets: usize,
    /// Emitted records that had no declared resources
    pub without_policy: usize,
}

/// Output of one correlation pass, records sorted by identity
#[derive(Debug, Clone, Default)]
pub struct Correlation {
    pub records: Vec<UnifiedRecord>,
    pub stats: CorrelationStats,
}

/// Fold usage samples into `snapshot`, stamping them with `timestamp`.
///
/// Samples without a valid container identity are discarded.
pub fn collect_usage<I>(snapshot: &mut UsageSnapshot, samples: I, timestamp: DateTime<Utc>)
where
    I: IntoIterator<Item = Sample>,
{
    for sample in samples {
        let Some(key) = sample.identity().container_key() else {
            continue;
        };

        match sample.kind() {
            MetricKind::CpuUsageSeconds => snapshot.record_cpu(key, sample.value, timestamp),
            MetricKind::MemoryUsageBytes => snapshot.record_memory(key, sample.value, timestamp),
            _ => {}
        }
    }
}

/// Seconds elapsed between two sample times (negative on clock skew)
pub fn elapsed_secs(previous: DateTime<Utc>, current: DateTime<Utc>) -> f64 {
    let elapsed = current.signed_duration_since(previous);
    elapsed
        .num_microseconds()
        .map(|us| us as f64 / 1_000_000.0)
        .unwrap_or_else(|| elapsed.num_milliseconds() as f64 / 1000.0)
}

/// Rate of a counter between two samples, in units per second.
///
/// Returns exactly 0.0 when the elapsed time is not positive.
pub fn counter_rate(
    previous: f64,
    previous_ts: DateTime<Utc>,
    current: f64,
    current_ts: DateTime<Utc>,
) -> f64 {
    let elapsed = elapsed_secs(previous_ts, current_ts);
    if elapsed <= 0.0 {
        return 0.0;
    }
    (current - previous) / elapsed
}

/// Correlate the current snapshot against the baseline and the policy.
///
/// A record is produced for every key that has a CPU counter in both
/// snapshots. Missing memory or policy data degrades to defaults.
pub fn correlate(
    current: &UsageSnapshot,
    baseline: Option<&UsageSnapshot>,
    policy: &PolicySnapshot,
    reset_policy: CounterResetPolicy,
) -> Correlation {
    let mut correlation = Correlation::default();

    for (key, entry) in current.iter() {
        let previous = baseline.and_then(|b| b.get(key));
        let (Some(current_cpu), Some(previous)) = (entry.cpu_seconds, previous) else {
            correlation.stats.cold_starts += 1;
            continue;
        };
        let Some(previous_cpu) = previous.cpu_seconds else {
            correlation.stats.cold_starts += 1;
            continue;
        };

        let mut rate = counter_rate(previous_cpu, previous.timestamp, current_cpu, entry.timestamp);
        if current_cpu < previous_cpu {
            correlation.stats.counter_resets += 1;
            warn!(
                event = "counter_reset",
                identity = %key,
                previous = previous_cpu,
                current = current_cpu,
                policy = ?reset_policy,
                "CPU counter decreased"
            );
            match reset_policy {
                CounterResetPolicy::Clamp => rate = 0.0,
                CounterResetPolicy::Rebaseline => continue,
                CounterResetPolicy::PassThrough => {}
            }
        }

        let record = build_record(key, rate, entry.memory_bytes, entry.timestamp, policy);
        if !policy.container(key).is_some_and(|p| p.is_declared()) {
            correlation.stats.without_policy += 1;
        }
        correlation.records.push(record);
    }

    correlation.stats.emitted = correlation.records.len();
    correlation
}

fn build_record(
    key: &IdentityKey,
    cpu_usage_cores: f64,
    memory_bytes: Option<f64>,
    timestamp: DateTime<Utc>,
    policy: &PolicySnapshot,
) -> UnifiedRecord {
    let resources = policy.container(key).cloned().unwrap_or_default();
    let pod = policy.pod(&key.pod_key());

    UnifiedRecord {
        identity: key.clone(),
        node: pod
            .and_then(|p| p.node.clone())
            .unwrap_or_else(|| UNKNOWN.to_string()),
        owner_kind: pod
            .and_then(|p| p.owner_kind.clone())
            .unwrap_or_else(|| UNKNOWN.to_string()),
        cpu_usage_cores,
        memory_usage_bytes: memory_bytes.map(|b| b.max(0.0) as u64).unwrap_or(0),
        cpu_request_cores: resources.cpu_request.unwrap_or(0.0),
        cpu_limit_cores: resources.cpu_limit.unwrap_or(0.0),
        memory_request_bytes: resources.memory_request.unwrap_or(0.0),
        memory_limit_bytes: resources.memory_limit.unwrap_or(0.0),
        timestamp,
    }
}
