// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core domain types for the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Worker identifier, unique across the fleet
pub type WorkerId = String;

/// Test identifier, assigned by the master on submission
pub type TestId = String;

/// Worker state as tracked by the fleet registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Idle and eligible for assignment
    Ready,
    /// Running an assigned test, reporting progress
    Busy,
    /// Test execution complete, results being flushed
    Finishing,
    /// Test aborted on this worker
    Error,
    /// Stream ended or liveness lapsed
    Offline,
}

impl WorkerState {
    /// Whether this state is a terminal signal for the worker's current test
    pub fn is_terminal_signal(self) -> bool {
        matches!(self, Self::Finishing | Self::Error)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Busy => write!(f, "busy"),
            Self::Finishing => write!(f, "finishing"),
            Self::Error => write!(f, "error"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Worker record held by the fleet registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Worker ID
    pub worker_id: WorkerId,
    /// Reachable address (host:port) for assignment dispatch
    pub address: String,
    /// Current state
    pub state: WorkerState,
    /// Test currently assigned to this worker, if any
    pub current_test_id: Option<TestId>,
    /// Last human-readable progress message
    pub progress_message: String,
    /// Requests completed so far for the current test
    pub completed_requests: u64,
    /// Total requests planned for the current test
    pub total_requests: u64,
    /// Last time any status update or registration was seen
    pub last_seen: DateTime<Utc>,
    /// First registration time
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Create a fresh record for a newly registered worker
    pub fn new(worker_id: impl Into<WorkerId>, address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            address: address.into(),
            state: WorkerState::Ready,
            current_test_id: None,
            progress_message: String::new(),
            completed_requests: 0,
            total_requests: 0,
            last_seen: now,
            registered_at: now,
        }
    }

    /// Eligible for a new assignment
    pub fn is_available(&self) -> bool {
        self.state == WorkerState::Ready
    }

    /// No update seen within the given number of seconds
    pub fn is_silent(&self, timeout_seconds: u64) -> bool {
        let elapsed = Utc::now()
            .signed_duration_since(self.last_seen)
            .num_seconds();
        elapsed >= 0 && elapsed as u64 >= timeout_seconds
    }
}

/// Test lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    /// Accepted, not yet dispatched to any worker
    Pending,
    /// At least one worker accepted the assignment
    Running,
    /// All assigned workers finished successfully
    Completed,
    /// Some workers finished, some failed
    PartiallyFailed,
    /// No worker finished successfully
    Failed,
}

impl TestStatus {
    /// Terminal statuses are durable and never reopened
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyFailed | Self::Failed)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::PartiallyFailed => write!(f, "partially_failed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// How the requested total rate is split across selected workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateDistribution {
    /// Total rate divided evenly, remainder to the first workers
    Shared,
    /// Every worker receives the full rate
    Same,
    /// Rate split proportionally to a weights vector
    Weighted,
    /// Monotonically non-decreasing split across workers
    Ramped,
    /// Mirror of ramped: front-loaded split
    Burst,
}

impl RateDistribution {
    /// Parse a submission string, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "shared" => Some(Self::Shared),
            "same" => Some(Self::Same),
            "weighted" => Some(Self::Weighted),
            "ramped" => Some(Self::Ramped),
            "burst" => Some(Self::Burst),
            _ => None,
        }
    }
}

impl fmt::Display for RateDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Same => write!(f, "same"),
            Self::Weighted => write!(f, "weighted"),
            Self::Ramped => write!(f, "ramped"),
            Self::Burst => write!(f, "burst"),
        }
    }
}

/// Durable record of a submitted test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRecord {
    /// Server-assigned unique id
    pub test_id: TestId,
    /// Display name
    pub name: String,
    /// Requester id
    pub requester: String,
    /// Attack duration, forwarded verbatim to workers (e.g. "30s")
    pub duration: String,
    /// Requested total rate in requests/second
    pub rate_per_second: u64,
    /// Target list, opaque base64 blob forwarded to workers
    pub targets_base64: String,
    /// Transport/attack options, opaque JSON blob forwarded to workers
    pub attack_options_json: String,
    /// Desired parallelism
    pub worker_count: u32,
    /// Rate-distribution policy
    pub distribution: RateDistribution,
    /// Weights vector for the weighted policy
    pub rate_weights: Option<Vec<f64>>,
    /// Lifecycle status
    pub status: TestStatus,
    /// Workers the test was dispatched to; frozen once terminal
    pub assigned_workers: BTreeSet<WorkerId>,
    /// Workers that finished successfully
    pub completed_workers: BTreeSet<WorkerId>,
    /// Workers that aborted or never accepted
    pub failed_workers: BTreeSet<WorkerId>,
    /// Submission time
    pub created_at: DateTime<Utc>,
}

impl TestRecord {
    /// Number of assigned workers that reached a terminal signal
    pub fn finished_count(&self) -> usize {
        self.completed_workers.len() + self.failed_workers.len()
    }

    /// Every assigned worker has reached a terminal signal
    pub fn all_workers_finished(&self) -> bool {
        !self.assigned_workers.is_empty()
            && self.finished_count() >= self.assigned_workers.len()
    }

    /// Terminal status implied by the completion/failure sets.
    ///
    /// Returns `None` while workers are still outstanding.
    pub fn derive_terminal(&self) -> Option<TestStatus> {
        if self.assigned_workers.is_empty() {
            return Some(TestStatus::Failed);
        }
        if !self.all_workers_finished() {
            return None;
        }
        if self.failed_workers.is_empty() {
            Some(TestStatus::Completed)
        } else if self.completed_workers.is_empty() {
            Some(TestStatus::Failed)
        } else {
            Some(TestStatus::PartiallyFailed)
        }
    }
}

/// Raw per-worker result as consumed from the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawResult {
    /// Test this result belongs to
    pub test_id: TestId,
    /// Worker that produced it
    pub worker_id: WorkerId,
    /// Full metric blob as produced by the worker's attacker, kept opaque
    pub metrics_json: serde_json::Value,
    /// Total requests attempted
    pub total_requests: u64,
    /// Requests completed
    pub completed_requests: u64,
    /// Wall-clock attack duration in milliseconds
    pub duration_ms: u64,
    /// Fraction of requests that succeeded, 0.0..=1.0
    pub success_rate: f64,
    /// Mean latency in milliseconds
    pub avg_latency_ms: f64,
    /// 95th-percentile latency in milliseconds
    pub p95_latency_ms: f64,
    /// Status-code histogram, e.g. "200" -> 980
    pub status_codes: BTreeMap<String, u64>,
    /// When the master received this result
    pub received_at: DateTime<Utc>,
}

/// Aggregated per-test summary, one row per test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    /// Test id
    pub test_id: TestId,
    /// Sum of requests across all participating workers
    pub total_requests: u64,
    /// Sum of successful requests
    pub successful_requests: u64,
    /// total - successful
    pub failed_requests: u64,
    /// Request-count-weighted mean of per-worker mean latencies
    pub avg_latency_ms: f64,
    /// Request-count-weighted mean of per-worker p95 latencies.
    ///
    /// This is an approximation: a true cross-worker p95 would require the
    /// workers to ship full latency histograms for exact merging.
    pub p95_latency_ms: f64,
    /// Longest per-worker attack duration in milliseconds
    pub duration_ms: u64,
    /// Elementwise sum of per-worker status-code histograms
    pub status_codes: BTreeMap<String, u64>,
    /// Mirrors the test's terminal status
    pub overall_status: String,
    /// Number of raw results that fed this aggregate
    pub worker_count: usize,
    /// When the aggregate was computed
    pub completed_at: DateTime<Utc>,
}
