// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Protocol definitions for master-worker communication.
//!
//! All messages are JSON: request/response bodies on the register and
//! assignment calls, text frames on the status stream, and the raw-result
//! payload published to the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{RawResult, TestId, WorkerId};

/// Worker registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Worker ID
    pub worker_id: WorkerId,
    /// Address (host:port) the master dispatches assignments to
    pub address: String,
}

/// Worker registration response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Registration success
    pub success: bool,
    /// Human-readable reason
    pub message: String,
}

/// Status kind carried on the worker status stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Idle heartbeat
    Ready,
    /// Running the identified test, carrying progress counters
    Busy,
    /// Test execution complete, results being flushed
    Finishing,
    /// Test aborted on this worker
    Error,
}

impl StatusKind {
    /// Finishing and Error are terminal per (test, worker)
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finishing | Self::Error)
    }
}

/// Status message pushed by a worker on the stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// Worker ID; the first message binds the stream's identity
    pub worker_id: WorkerId,
    /// Status kind
    pub status: StatusKind,
    /// Human-readable progress message
    #[serde(default)]
    pub message: String,
    /// Test the status refers to; empty on idle heartbeats
    #[serde(default)]
    pub test_id: String,
    /// Total requests planned for the current test
    #[serde(default)]
    pub total_requests: u64,
    /// Requests completed so far
    #[serde(default)]
    pub completed_requests: u64,
    /// Elapsed attack time in milliseconds
    #[serde(default)]
    pub duration_ms: u64,
}

/// Per-message acknowledgment pushed back by the master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusAck {
    /// Whether the message was applied
    pub accepted: bool,
    /// Reason when rejected
    pub message: String,
}

impl WorkerStatusAck {
    /// Accepted ack
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            message: String::new(),
        }
    }

    /// Rejected ack with a reason
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
        }
    }
}

/// Assignment dispatched to a worker's own HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestAssignment {
    /// Test ID
    pub test_id: TestId,
    /// Attack duration, verbatim from the submission (e.g. "30s")
    pub duration: String,
    /// Per-worker sub-rate derived by the scheduler
    pub rate_per_second: u64,
    /// Target list, opaque base64 blob
    pub targets_base64: String,
    /// Attack/transport options, opaque JSON blob
    pub attack_options_json: String,
}

/// Worker's synchronous answer to an assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignResponse {
    /// Whether the worker accepted the assignment
    pub accepted: bool,
    /// Reason when declined
    #[serde(default)]
    pub message: String,
}

/// Best-effort cancellation sent to a still-busy worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Test to abort
    pub test_id: TestId,
}

/// Raw-result payload published by workers to the result bus,
/// keyed by test id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawResultMessage {
    /// Test ID (also the bus message key)
    pub test_id: TestId,
    /// Worker that produced the result
    pub worker_id: WorkerId,
    /// Full metric blob from the worker's attacker
    pub metrics_json: serde_json::Value,
    /// Total requests attempted
    pub total_requests: u64,
    /// Requests completed
    pub completed_requests: u64,
    /// Attack duration in milliseconds
    pub duration_ms: u64,
    /// Success ratio, 0.0..=1.0
    pub success_rate: f64,
    /// Mean latency in milliseconds
    pub avg_latency_ms: f64,
    /// 95th-percentile latency in milliseconds
    pub p95_latency_ms: f64,
    /// Status-code histogram
    #[serde(default)]
    pub status_codes: BTreeMap<String, u64>,
    /// Producer-side timestamp
    pub produced_at: DateTime<Utc>,
}

impl RawResultMessage {
    /// Convert into the stored raw-result form, stamping the receive time
    pub fn into_raw_result(self) -> RawResult {
        RawResult {
            test_id: self.test_id,
            worker_id: self.worker_id,
            metrics_json: self.metrics_json,
            total_requests: self.total_requests,
            completed_requests: self.completed_requests,
            duration_ms: self.duration_ms,
            success_rate: self.success_rate,
            avg_latency_ms: self.avg_latency_ms,
            p95_latency_ms: self.p95_latency_ms,
            status_codes: self.status_codes,
            received_at: Utc::now(),
        }
    }
}
