use crate::config::{MetricsDetail, PercentilePolicy};
use crate::message::MessageType;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Latency recorded for a message that exhausted its retries.
pub const FAILURE_SENTINEL_MS: i64 = -1;

/// Width of a throughput-over-time bucket.
pub const BUCKET_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    Ok,
    Fail,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Ok => "OK",
            RecordStatus::Fail => "FAIL",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One terminal outcome. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyRecord {
    /// Wall-clock epoch milliseconds of the send (or of the final failure)
    pub timestamp_ms: i64,
    pub message_type: MessageType,
    /// Round-trip in milliseconds, or `FAILURE_SENTINEL_MS`
    pub latency_ms: i64,
    pub status: RecordStatus,
    pub room: u32,
}

impl LatencyRecord {
    pub fn success(timestamp_ms: i64, message_type: MessageType, latency_ms: i64, room: u32) -> Self {
        Self {
            timestamp_ms,
            message_type,
            latency_ms,
            status: RecordStatus::Ok,
            room,
        }
    }

    pub fn failure(timestamp_ms: i64, message_type: MessageType, room: u32) -> Self {
        Self {
            timestamp_ms,
            message_type,
            latency_ms: FAILURE_SENTINEL_MS,
            status: RecordStatus::Fail,
            room,
        }
    }
}

/// Process-wide run metrics: lock-free counters plus an append-only latency log.
///
/// Workers push onto a lock-free queue; readers move pending records into
/// `settled` under its lock, so append order is kept across reads.
pub struct Metrics {
    detail: MetricsDetail,
    success: AtomicU64,
    fail: AtomicU64,
    connections: AtomicU64,
    reconnections: AtomicU64,
    pending: SegQueue<LatencyRecord>,
    settled: Mutex<Vec<LatencyRecord>>,
}

impl Metrics {
    pub fn new(detail: MetricsDetail) -> Self {
        Self {
            detail,
            success: AtomicU64::new(0),
            fail: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
            pending: SegQueue::new(),
            settled: Mutex::new(Vec::new()),
        }
    }

    pub fn detail(&self) -> MetricsDetail {
        self.detail
    }

    /// Record a terminal outcome. The record is kept only at `MetricsDetail::Full`.
    pub fn record_outcome(&self, record: LatencyRecord) {
        match record.status {
            RecordStatus::Ok => self.success.fetch_add(1, Ordering::Relaxed),
            RecordStatus::Fail => self.fail.fetch_add(1, Ordering::Relaxed),
        };
        if self.detail == MetricsDetail::Full {
            self.pending.push(record);
        }
    }

    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn fail_count(&self) -> u64 {
        self.fail.load(Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn reconnection_count(&self) -> u64 {
        self.reconnections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            success: self.success_count(),
            fail: self.fail_count(),
            connections: self.connection_count(),
            reconnections: self.reconnection_count(),
        }
    }

    /// Copy of the latency log in append order.
    pub fn records(&self) -> Vec<LatencyRecord> {
        self.settle().clone()
    }

    pub fn record_count(&self) -> usize {
        self.settle().len()
    }

    /// Cumulative report: throughput is all successes so far over `elapsed`.
    pub fn report(&self, phase: &str, elapsed: Duration) -> PhaseReport {
        self.report_since(phase, &MetricsSnapshot::default(), elapsed)
    }

    /// Report on what happened after `baseline` was taken.
    pub fn report_since(&self, phase: &str, baseline: &MetricsSnapshot, elapsed: Duration) -> PhaseReport {
        let now = self.snapshot();
        let successes = now.success.saturating_sub(baseline.success);
        let duration_secs = elapsed.as_secs_f64();
        PhaseReport {
            phase: phase.to_string(),
            successes,
            failures: now.fail.saturating_sub(baseline.fail),
            duration_secs,
            throughput: throughput(successes, duration_secs),
            connections: now.connections.saturating_sub(baseline.connections),
            reconnections: now.reconnections.saturating_sub(baseline.reconnections),
        }
    }

    fn settle(&self) -> parking_lot::MutexGuard<'_, Vec<LatencyRecord>> {
        let mut settled = self.settled.lock();
        while let Some(record) = self.pending.pop() {
            settled.push(record);
        }
        settled
    }

    /// Nearest-rank latency statistics over the log, or `None` if it is empty.
    pub fn statistics(&self, policy: PercentilePolicy) -> Option<LatencyStatistics> {
        LatencyStatistics::from_records(&self.records(), policy)
    }

    pub fn throughput_over_time(&self, baseline_ms: i64) -> Vec<ThroughputBucket> {
        bucket_throughput(&self.records(), baseline_ms)
    }
}

fn throughput(successes: u64, duration_secs: f64) -> f64 {
    if duration_secs > 0.0 {
        successes as f64 / duration_secs
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub success: u64,
    pub fail: u64,
    pub connections: u64,
    pub reconnections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: String,
    pub successes: u64,
    pub failures: u64,
    pub duration_secs: f64,
    pub throughput: f64,
    pub connections: u64,
    pub reconnections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyStatistics {
    pub policy: PercentilePolicy,
    /// Samples the percentiles were computed over
    pub count: usize,
    /// FAIL records among those samples
    pub failures_in_sample: usize,
    pub mean_ms: f64,
    pub median_ms: i64,
    pub p95_ms: i64,
    pub p99_ms: i64,
    pub min_ms: i64,
    pub max_ms: i64,
    /// Counts over every record, regardless of policy
    pub per_room: BTreeMap<u32, u64>,
    pub per_type: BTreeMap<MessageType, u64>,
    pub total_records: usize,
}

impl LatencyStatistics {
    pub fn from_records(records: &[LatencyRecord], policy: PercentilePolicy) -> Option<Self> {
        let mut latencies: Vec<i64> = records
            .iter()
            .filter(|r| policy == PercentilePolicy::IncludeFailures || r.status == RecordStatus::Ok)
            .map(|r| r.latency_ms)
            .collect();
        if latencies.is_empty() {
            return None;
        }
        latencies.sort_unstable();

        let n = latencies.len();
        let at = |q: f64| latencies[((n as f64 * q) as usize).min(n - 1)];
        let sum: i64 = latencies.iter().sum();

        let mut per_room = BTreeMap::new();
        let mut per_type = BTreeMap::new();
        for r in records {
            *per_room.entry(r.room).or_insert(0) += 1;
            *per_type.entry(r.message_type).or_insert(0) += 1;
        }

        let failures_in_sample = match policy {
            PercentilePolicy::IncludeFailures => {
                records.iter().filter(|r| r.status == RecordStatus::Fail).count()
            }
            PercentilePolicy::ExcludeFailures => 0,
        };

        Some(Self {
            policy,
            count: n,
            failures_in_sample,
            mean_ms: sum as f64 / n as f64,
            median_ms: latencies[n / 2],
            p95_ms: at(0.95),
            p99_ms: at(0.99),
            min_ms: latencies[0],
            max_ms: latencies[n - 1],
            per_room,
            per_type,
            total_records: records.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputBucket {
    /// Bucket start, seconds from the baseline
    pub start_secs: i64,
    pub messages: u64,
}

impl ThroughputBucket {
    pub fn per_second(&self) -> f64 {
        self.messages as f64 / BUCKET_SECS as f64
    }
}

/// Count records per 10-second bucket keyed by `floor((ts - baseline) / 10s) * 10`.
pub fn bucket_throughput(records: &[LatencyRecord], baseline_ms: i64) -> Vec<ThroughputBucket> {
    let mut buckets: BTreeMap<i64, u64> = BTreeMap::new();
    for r in records {
        let key = (r.timestamp_ms - baseline_ms).div_euclid(BUCKET_SECS * 1_000) * BUCKET_SECS;
        *buckets.entry(key).or_insert(0) += 1;
    }
    buckets
        .into_iter()
        .map(|(start_secs, messages)| ThroughputBucket { start_secs, messages })
        .collect()
}
