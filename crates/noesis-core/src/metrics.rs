//! Metrics sink (C8, §4.8): a bounded, lock-free ring buffer of operation
//! latencies, exposing p50/p95/p99 and a per-operation breakdown over a
//! sliding window. Out of scope per §1 is external metrics *export*; this
//! module only collects and snapshots in-process.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use crossbeam_queue::ArrayQueue;

/// Capacity of the ring buffer (§4.8: 10,000). On overflow the oldest
/// entries are dropped — `ArrayQueue::force_push` evicts the head to make
/// room for the newest sample rather than rejecting it.
pub const CAPACITY: usize = 10_000;

/// One recorded operation latency.
#[derive(Debug, Clone)]
pub struct MetricRecord {
    pub timestamp: DateTime<Utc>,
    pub op_name: String,
    pub duration_ms: u64,
    pub user_id: Option<String>,
}

/// Latency breakdown for a single operation name within a snapshot window.
#[derive(Debug, Clone, Default)]
pub struct OpStats {
    pub count: u64,
    pub mean_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

/// A point-in-time view over the records within `snapshot`'s window.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub total_ops: u64,
    pub mean_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub ops_per_sec: f64,
    pub by_op: HashMap<String, OpStats>,
}

/// Bounded concurrent queue of operation latencies. Enqueue never blocks and
/// never suspends (§5: the metrics sink is lock-free via an atomic-enqueue
/// queue).
pub struct MetricsSink {
    records: ArrayQueue<MetricRecord>,
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink {
    pub fn new() -> Self {
        Self {
            records: ArrayQueue::new(CAPACITY),
        }
    }

    /// Records one operation's latency. Drops the oldest record on overflow
    /// rather than rejecting the newest (§4.8).
    pub fn record(&self, op_name: impl Into<String>, duration: std::time::Duration, user_id: Option<&str>) {
        let mut record = MetricRecord {
            timestamp: Utc::now(),
            op_name: op_name.into(),
            duration_ms: duration.as_millis() as u64,
            user_id: user_id.map(String::from),
        };
        // On overflow, drop the oldest entry to make room (§4.8). If another
        // thread races us for the freed slot, the sample is dropped instead
        // of looping indefinitely.
        for _ in 0..2 {
            match self.records.push(record) {
                Ok(()) => return,
                Err(rejected) => {
                    record = rejected;
                    let _ = self.records.pop();
                }
            }
        }
    }

    /// Total operations, mean/p50/p95/p99 latency, ops/sec, and a per-op
    /// breakdown over records with `timestamp >= now - window`.
    pub fn snapshot(&self, window: Duration) -> MetricsSnapshot {
        let cutoff = Utc::now() - window;
        let mut drained = Vec::with_capacity(self.records.len());
        while let Some(record) = self.records.pop() {
            drained.push(record);
        }

        let in_window: Vec<&MetricRecord> = drained
            .iter()
            .filter(|r| r.timestamp >= cutoff && !r.op_name.is_empty())
            .collect();

        let snapshot = Self::build_snapshot(&in_window, window);

        for record in drained {
            let _ = self.records.push(record);
        }

        snapshot
    }

    fn build_snapshot(records: &[&MetricRecord], window: Duration) -> MetricsSnapshot {
        if records.is_empty() {
            return MetricsSnapshot::default();
        }

        let mut all_durations: Vec<u64> = records.iter().map(|r| r.duration_ms).collect();
        all_durations.sort_unstable();

        let mut by_op: HashMap<String, Vec<u64>> = HashMap::new();
        for record in records {
            by_op.entry(record.op_name.clone()).or_default().push(record.duration_ms);
        }

        let window_secs = (window.num_milliseconds() as f64 / 1000.0).max(1e-9);

        MetricsSnapshot {
            total_ops: records.len() as u64,
            mean_ms: mean(&all_durations),
            p50_ms: percentile(&all_durations, 0.50),
            p95_ms: percentile(&all_durations, 0.95),
            p99_ms: percentile(&all_durations, 0.99),
            ops_per_sec: records.len() as f64 / window_secs,
            by_op: by_op
                .into_iter()
                .map(|(name, mut durations)| {
                    durations.sort_unstable();
                    let stats = OpStats {
                        count: durations.len() as u64,
                        mean_ms: mean(&durations),
                        p50_ms: percentile(&durations, 0.50),
                        p95_ms: percentile(&durations, 0.95),
                        p99_ms: percentile(&durations, 0.99),
                    };
                    (name, stats)
                })
                .collect(),
        }
    }
}

fn mean(sorted: &[u64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
}

/// Nearest-rank percentile over an already-sorted slice.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

/// Measures `f`'s wall-clock duration and records it against `sink` under
/// `op_name`, regardless of whether `f` succeeds.
pub async fn timed<T, F>(sink: &MetricsSink, op_name: &str, user_id: Option<&str>, f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = std::time::Instant::now();
    let result = f.await;
    sink.record(op_name, start.elapsed(), user_id);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_within_window_are_counted() {
        let sink = MetricsSink::new();
        sink.record("store", std::time::Duration::from_millis(10), Some("u1"));
        sink.record("store", std::time::Duration::from_millis(20), Some("u1"));
        let snapshot = sink.snapshot(Duration::hours(1));
        assert_eq!(snapshot.total_ops, 2);
        assert!(snapshot.by_op.contains_key("store"));
    }

    #[test]
    fn percentiles_are_monotonic() {
        let sink = MetricsSink::new();
        for ms in [5, 10, 15, 20, 100] {
            sink.record("op", std::time::Duration::from_millis(ms), None);
        }
        let snapshot = sink.snapshot(Duration::hours(1));
        assert!(snapshot.p50_ms <= snapshot.p95_ms);
        assert!(snapshot.p95_ms <= snapshot.p99_ms);
    }

    #[test]
    fn snapshot_excludes_old_records() {
        let sink = MetricsSink::new();
        sink.record("op", std::time::Duration::from_millis(5), None);
        let snapshot = sink.snapshot(Duration::milliseconds(-1));
        assert_eq!(snapshot.total_ops, 0);
    }

    #[test]
    fn overflow_drops_oldest_without_panicking() {
        let sink = MetricsSink::new();
        for i in 0..(CAPACITY + 10) {
            sink.record(format!("op{i}"), std::time::Duration::from_millis(1), None);
        }
        let snapshot = sink.snapshot(Duration::hours(1));
        assert!(snapshot.total_ops <= CAPACITY as u64);
    }

    #[tokio::test]
    async fn timed_records_a_sample() {
        let sink = MetricsSink::new();
        let result = timed(&sink, "query", None, async { 42 }).await;
        assert_eq!(result, 42);
        assert_eq!(sink.snapshot(Duration::hours(1)).total_ops, 1);
    }
}
