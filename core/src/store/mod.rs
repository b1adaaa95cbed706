// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Durable storage for tests and results.
//!
//! Two backends implement the store traits: an in-memory store (the default,
//! and the backend used by the test suite) and a PostgreSQL store behind the
//! `database` feature. Concurrency control for the worker-set mutators is
//! the backend's responsibility: each of `add_assigned` / `add_completed` /
//! `add_failed` is an atomic, idempotent read-modify-write.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "database")]
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::OrchestratorResult;
use crate::types::{AggregatedResult, RawResult, TestRecord, TestStatus};

/// Durable record of every submitted test
#[async_trait]
pub trait TestStore: Send + Sync {
    /// Insert a new test record
    async fn save(&self, test: TestRecord) -> OrchestratorResult<()>;

    /// Fetch a test by id
    async fn get(&self, test_id: &str) -> OrchestratorResult<TestRecord>;

    /// Transition a test's lifecycle status
    async fn update_status(&self, test_id: &str, status: TestStatus) -> OrchestratorResult<()>;

    /// Page through tests, newest first; returns the page and the unfiltered
    /// total
    async fn list_paginated(
        &self,
        limit: u32,
        offset: u64,
        requester: Option<&str>,
    ) -> OrchestratorResult<(Vec<TestRecord>, u64)>;

    /// Tests created within [start, end)
    async fn list_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        requester: Option<&str>,
    ) -> OrchestratorResult<Vec<TestRecord>>;

    /// Tests currently in the given status
    async fn list_by_status(&self, status: TestStatus) -> OrchestratorResult<Vec<TestRecord>>;

    /// Record a worker assignment. Idempotent.
    async fn add_assigned(&self, test_id: &str, worker_id: &str) -> OrchestratorResult<()>;

    /// Record a successful worker completion. Idempotent; a worker already
    /// counted in either terminal set is left untouched (first signal wins).
    async fn add_completed(&self, test_id: &str, worker_id: &str) -> OrchestratorResult<()>;

    /// Record a worker failure. Same idempotence contract as
    /// [`add_completed`](TestStore::add_completed).
    async fn add_failed(&self, test_id: &str, worker_id: &str) -> OrchestratorResult<()>;
}

/// Durable storage of raw per-worker results and per-test aggregates
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Upsert a raw result by its (test, worker) composite key. The bus may
    /// redeliver; the last write wins cleanly.
    async fn upsert_raw(&self, raw: RawResult) -> OrchestratorResult<()>;

    /// All raw results for a test, ordered by worker id
    async fn list_raw_for_test(&self, test_id: &str) -> OrchestratorResult<Vec<RawResult>>;

    /// Upsert the per-test aggregate
    async fn upsert_aggregate(&self, aggregate: AggregatedResult) -> OrchestratorResult<()>;

    /// Fetch the aggregate for a test, if computed
    async fn get_aggregate(&self, test_id: &str)
        -> OrchestratorResult<Option<AggregatedResult>>;
}
