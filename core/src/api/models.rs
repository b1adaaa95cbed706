// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! API request/response models.

use serde::{Deserialize, Serialize};

use crate::registry::WorkerSummary;
use crate::types::{AggregatedResult, RawResult, TestRecord};

fn default_options_json() -> String {
    "{}".to_string()
}

fn default_distribution() -> String {
    "shared".to_string()
}

/// Test submission body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTestRequest {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Requester id; a thin auth layer in front of this surface fills it in
    #[serde(default)]
    pub requester: String,
    /// Attack duration string, forwarded verbatim to workers
    pub duration: String,
    /// Requested total rate in requests/second
    pub rate_per_second: u64,
    /// Target list, base64-encoded, opaque to the master
    #[serde(default)]
    pub targets_base64: String,
    /// Attack/transport options, opaque JSON blob
    #[serde(default = "default_options_json")]
    pub attack_options_json: String,
    /// Desired parallelism; 0 selects the configured default
    #[serde(default)]
    pub worker_count: u32,
    /// Distribution policy name (shared, same, weighted, ramped, burst)
    #[serde(default = "default_distribution")]
    pub rate_distribution: String,
    /// Weights for the weighted policy
    #[serde(default)]
    pub rate_weights: Option<Vec<f64>>,
}

/// Submission answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTestResponse {
    /// Assigned test id; the test's terminal status is the authoritative
    /// outcome
    pub test_id: String,
}

/// Pagination query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct PaginationParams {
    /// 1-based page number
    #[serde(default = "default_page")]
    pub page: u64,
    /// Page size
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u64 {
    1
}

fn default_limit() -> u32 {
    20
}

/// One page of tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestListResponse {
    /// Tests on this page, newest first
    pub tests: Vec<TestRecord>,
    /// Total matching tests
    pub total: u64,
    /// Requested page
    pub page: u64,
    /// Requested page size
    pub limit: u32,
    /// Total pages at this page size
    pub total_pages: u64,
}

/// Raw results for one test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawResultsResponse {
    /// Test id
    pub test_id: String,
    /// Per-worker raw results, ordered by worker id
    pub results: Vec<RawResult>,
}

/// Aggregate answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateResponse {
    /// The per-test aggregate
    pub aggregate: AggregatedResult,
}

/// Dashboard snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardResponse {
    /// Registered workers
    pub total_workers: usize,
    /// Workers ready for assignment
    pub available_workers: usize,
    /// Workers busy or finishing
    pub busy_workers: usize,
    /// Pending and running tests
    pub active_tests: Vec<TestRecord>,
    /// Per-worker summaries
    pub worker_summaries: Vec<WorkerSummary>,
}

/// Health probe answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always "healthy" when the process is serving
    pub status: String,
    /// Crate version
    pub version: String,
}
