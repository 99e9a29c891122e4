//! Statistics accumulation points and the run report.
//!
//! A [`Statistics`] instance is the per-sequence accumulator a session
//! records into; workers keep them local and the runner merges them once at
//! collection time, so the hot path never crosses a lock. Aggregation
//! beyond merging — export, persistence, SLA evaluation — belongs to the
//! layers above; this module only derives the percentile readout for the
//! final [`RunReport`].

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::phase::Status;

/// Latency significant figures kept by the histogram.
const SIGFIGS: u8 = 3;

/// Per-sequence accumulator: latency histogram, status-class counters and
/// activity timestamps.
#[derive(Debug, Clone)]
pub struct Statistics {
    started_at_ns: i64,
    ended_at_ns: i64,
    aborted: u64,
    statuses: [u64; 6],
    histogram: Histogram<u64>,
}

impl Statistics {
    pub fn new() -> Self {
        Statistics {
            started_at_ns: 0,
            ended_at_ns: 0,
            aborted: 0,
            statuses: [0; 6],
            histogram: Histogram::new(SIGFIGS).expect("valid histogram sigfigs"),
        }
    }

    /// Marks the start of collection; only the first call sticks.
    pub fn start(&mut self, timestamp_ns: i64) {
        if self.started_at_ns == 0 {
            self.started_at_ns = timestamp_ns;
        }
    }

    /// Extends the end of collection.
    pub fn end(&mut self, timestamp_ns: i64) {
        self.ended_at_ns = self.ended_at_ns.max(timestamp_ns);
    }

    pub fn record_response(&mut self, latency_ns: u64) {
        self.histogram.saturating_record(latency_ns);
    }

    /// Counts a response by status class; 0 counts as a transport error.
    pub fn add_status(&mut self, status: u16) {
        let class = (status / 100).min(5) as usize;
        self.statuses[class] += 1;
    }

    /// Counts a request abandoned in flight by a forced termination.
    pub fn record_aborted(&mut self) {
        self.aborted += 1;
    }

    pub fn requests(&self) -> u64 {
        self.histogram.len()
    }

    pub fn merge(&mut self, other: &Statistics) {
        self.histogram.add(&other.histogram).expect("histogram merge");
        for (mine, theirs) in self.statuses.iter_mut().zip(other.statuses) {
            *mine += theirs;
        }
        self.aborted += other.aborted;
        if other.started_at_ns != 0 {
            self.start(other.started_at_ns);
            self.started_at_ns = self.started_at_ns.min(other.started_at_ns);
        }
        self.end(other.ended_at_ns);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            requests: self.histogram.len(),
            aborted: self.aborted,
            statuses: self.statuses,
            mean_ns: self.histogram.mean() as u64,
            p50_ns: self.histogram.value_at_quantile(0.50),
            p90_ns: self.histogram.value_at_quantile(0.90),
            p99_ns: self.histogram.value_at_quantile(0.99),
            max_ns: self.histogram.max(),
            started_at_ns: self.started_at_ns,
            ended_at_ns: self.ended_at_ns,
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Pure-data readout of one [`Statistics`] accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub requests: u64,
    pub aborted: u64,
    /// Response counts by status class (`statuses[2]` counts 2xx);
    /// class 0 holds transport errors.
    pub statuses: [u64; 6],
    pub mean_ns: u64,
    pub p50_ns: u64,
    pub p90_ns: u64,
    pub p99_ns: u64,
    pub max_ns: u64,
    pub started_at_ns: i64,
    pub ended_at_ns: i64,
}

impl StatisticsSnapshot {
    /// Successful responses (2xx).
    pub fn ok(&self) -> u64 {
        self.statuses[2]
    }
}

/// Final result of a run: one report per phase, in definition order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub benchmark: String,
    pub phases: Vec<PhaseReport>,
}

impl RunReport {
    pub fn phase(&self, name: &str) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub name: String,
    /// Terminal status; failure shows up in `success`, not as its own state.
    pub status: Status,
    pub success: bool,
    pub error: Option<String>,
    pub session_limit_exceeded: bool,
    /// Total sessions the phase started.
    pub started_sessions: u64,
    /// Peak concurrently active sessions observed by the phase's pool.
    pub max_sessions_used: usize,
    /// Offsets from run start, for the phases that ran.
    pub started_at_ms: Option<u64>,
    pub terminated_at_ms: Option<u64>,
    pub sequences: Vec<SequenceReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceReport {
    pub sequence: String,
    pub stats: StatisticsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_reads_back_latencies() {
        let mut stats = Statistics::new();
        for latency in [100u64, 200, 300, 400] {
            stats.record_response(latency);
            stats.add_status(200);
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests, 4);
        assert_eq!(snapshot.ok(), 4);
        assert!(snapshot.max_ns >= 400 && snapshot.max_ns <= 401);
        assert!(snapshot.p50_ns >= 200);
    }

    #[test]
    fn status_classes_bucket_correctly() {
        let mut stats = Statistics::new();
        stats.add_status(200);
        stats.add_status(204);
        stats.add_status(404);
        stats.add_status(503);
        stats.add_status(0);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.statuses[2], 2);
        assert_eq!(snapshot.statuses[4], 1);
        assert_eq!(snapshot.statuses[5], 1);
        assert_eq!(snapshot.statuses[0], 1);
    }

    #[test]
    fn merge_combines_counts_and_timestamps() {
        let mut a = Statistics::new();
        a.start(100);
        a.end(200);
        a.record_response(1_000);
        a.add_status(200);
        let mut b = Statistics::new();
        b.start(50);
        b.end(400);
        b.record_response(3_000);
        b.add_status(500);
        b.record_aborted();

        a.merge(&b);
        let snapshot = a.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.statuses[2], 1);
        assert_eq!(snapshot.statuses[5], 1);
        assert_eq!(snapshot.aborted, 1);
        assert_eq!(snapshot.started_at_ns, 50);
        assert_eq!(snapshot.ended_at_ns, 400);
    }

    #[test]
    fn snapshot_serializes() {
        let mut stats = Statistics::new();
        stats.record_response(5_000);
        stats.add_status(200);
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        let back: StatisticsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats.snapshot());
    }
}
