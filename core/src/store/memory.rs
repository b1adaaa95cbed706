// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! In-memory store backend.
//!
//! Default backend when no database URL is configured, and the backend the
//! test suite runs against. Every mutator takes the table's write lock for
//! the whole read-modify-write, which is what makes the worker-set mutators
//! atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::store::{ResultStore, TestStore};
use crate::types::{AggregatedResult, RawResult, TestRecord, TestStatus};

/// In-memory implementation of both store traits
#[derive(Default)]
pub struct MemoryStore {
    tests: RwLock<HashMap<String, TestRecord>>,
    raw_results: RwLock<HashMap<(String, String), RawResult>>,
    aggregates: RwLock<HashMap<String, AggregatedResult>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(test_id: &str) -> OrchestratorError {
        OrchestratorError::NotFound(format!("test {test_id}"))
    }
}

#[async_trait]
impl TestStore for MemoryStore {
    async fn save(&self, test: TestRecord) -> OrchestratorResult<()> {
        let mut tests = self.tests.write();
        if tests.contains_key(&test.test_id) {
            return Err(OrchestratorError::FailedPrecondition(format!(
                "test {} already exists",
                test.test_id
            )));
        }
        tests.insert(test.test_id.clone(), test);
        Ok(())
    }

    async fn get(&self, test_id: &str) -> OrchestratorResult<TestRecord> {
        self.tests
            .read()
            .get(test_id)
            .cloned()
            .ok_or_else(|| Self::not_found(test_id))
    }

    async fn update_status(&self, test_id: &str, status: TestStatus) -> OrchestratorResult<()> {
        let mut tests = self.tests.write();
        let test = tests.get_mut(test_id).ok_or_else(|| Self::not_found(test_id))?;
        test.status = status;
        Ok(())
    }

    async fn list_paginated(
        &self,
        limit: u32,
        offset: u64,
        requester: Option<&str>,
    ) -> OrchestratorResult<(Vec<TestRecord>, u64)> {
        let tests = self.tests.read();
        let mut matching: Vec<TestRecord> = tests
            .values()
            .filter(|t| requester.map_or(true, |r| t.requester == r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.test_id.cmp(&b.test_id))
        });

        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn list_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        requester: Option<&str>,
    ) -> OrchestratorResult<Vec<TestRecord>> {
        let tests = self.tests.read();
        let mut matching: Vec<TestRecord> = tests
            .values()
            .filter(|t| t.created_at >= start && t.created_at < end)
            .filter(|t| requester.map_or(true, |r| t.requester == r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matching)
    }

    async fn list_by_status(&self, status: TestStatus) -> OrchestratorResult<Vec<TestRecord>> {
        let tests = self.tests.read();
        let mut matching: Vec<TestRecord> = tests
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matching)
    }

    async fn add_assigned(&self, test_id: &str, worker_id: &str) -> OrchestratorResult<()> {
        let mut tests = self.tests.write();
        let test = tests.get_mut(test_id).ok_or_else(|| Self::not_found(test_id))?;
        test.assigned_workers.insert(worker_id.to_string());
        Ok(())
    }

    async fn add_completed(&self, test_id: &str, worker_id: &str) -> OrchestratorResult<()> {
        let mut tests = self.tests.write();
        let test = tests.get_mut(test_id).ok_or_else(|| Self::not_found(test_id))?;
        if !test.failed_workers.contains(worker_id) {
            test.completed_workers.insert(worker_id.to_string());
        }
        Ok(())
    }

    async fn add_failed(&self, test_id: &str, worker_id: &str) -> OrchestratorResult<()> {
        let mut tests = self.tests.write();
        let test = tests.get_mut(test_id).ok_or_else(|| Self::not_found(test_id))?;
        if !test.completed_workers.contains(worker_id) {
            test.failed_workers.insert(worker_id.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn upsert_raw(&self, raw: RawResult) -> OrchestratorResult<()> {
        let key = (raw.test_id.clone(), raw.worker_id.clone());
        self.raw_results.write().insert(key, raw);
        Ok(())
    }

    async fn list_raw_for_test(&self, test_id: &str) -> OrchestratorResult<Vec<RawResult>> {
        let results = self.raw_results.read();
        let mut matching: Vec<RawResult> = results
            .values()
            .filter(|r| r.test_id == test_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(matching)
    }

    async fn upsert_aggregate(&self, aggregate: AggregatedResult) -> OrchestratorResult<()> {
        self.aggregates
            .write()
            .insert(aggregate.test_id.clone(), aggregate);
        Ok(())
    }

    async fn get_aggregate(
        &self,
        test_id: &str,
    ) -> OrchestratorResult<Option<AggregatedResult>> {
        Ok(self.aggregates.read().get(test_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RateDistribution;
    use std::collections::{BTreeMap, BTreeSet};

    fn sample_test(test_id: &str) -> TestRecord {
        TestRecord {
            test_id: test_id.to_string(),
            name: "smoke".to_string(),
            requester: "alice".to_string(),
            duration: "5s".to_string(),
            rate_per_second: 100,
            targets_base64: String::new(),
            attack_options_json: "{}".to_string(),
            worker_count: 2,
            distribution: RateDistribution::Shared,
            rate_weights: None,
            status: TestStatus::Pending,
            assigned_workers: BTreeSet::new(),
            completed_workers: BTreeSet::new(),
            failed_workers: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    fn sample_raw(test_id: &str, worker_id: &str, total: u64) -> RawResult {
        RawResult {
            test_id: test_id.to_string(),
            worker_id: worker_id.to_string(),
            metrics_json: serde_json::json!({}),
            total_requests: total,
            completed_requests: total,
            duration_ms: 5000,
            success_rate: 1.0,
            avg_latency_ms: 10.0,
            p95_latency_ms: 20.0,
            status_codes: BTreeMap::new(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_rejects_duplicates() {
        let store = MemoryStore::new();
        store.save(sample_test("t-1")).await.unwrap();
        assert!(store.save(sample_test("t-1")).await.is_err());
    }

    #[tokio::test]
    async fn test_completion_sets_stay_disjoint() {
        let store = MemoryStore::new();
        store.save(sample_test("t-1")).await.unwrap();
        store.add_assigned("t-1", "w-1").await.unwrap();

        store.add_failed("t-1", "w-1").await.unwrap();
        // A later success signal for an already-failed worker is ignored
        store.add_completed("t-1", "w-1").await.unwrap();

        let test = store.get("t-1").await.unwrap();
        assert!(test.failed_workers.contains("w-1"));
        assert!(!test.completed_workers.contains("w-1"));
    }

    #[tokio::test]
    async fn test_add_completed_is_idempotent() {
        let store = MemoryStore::new();
        store.save(sample_test("t-1")).await.unwrap();
        store.add_assigned("t-1", "w-1").await.unwrap();

        for _ in 0..3 {
            store.add_completed("t-1", "w-1").await.unwrap();
        }
        let test = store.get("t-1").await.unwrap();
        assert_eq!(test.completed_workers.len(), 1);
    }

    #[tokio::test]
    async fn test_pagination() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.save(sample_test(&format!("t-{i}"))).await.unwrap();
        }

        let (page, total) = store.list_paginated(2, 0, None).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);

        let (page, _) = store.list_paginated(2, 4, None).await.unwrap();
        assert_eq!(page.len(), 1);

        let (page, total) = store.list_paginated(10, 0, Some("nobody")).await.unwrap();
        assert_eq!(total, 0);
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn test_list_in_range() {
        let store = MemoryStore::new();
        let mut early = sample_test("t-early");
        early.created_at = Utc::now() - chrono::Duration::hours(2);
        let mut late = sample_test("t-late");
        late.created_at = Utc::now();
        store.save(early).await.unwrap();
        store.save(late).await.unwrap();

        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now() + chrono::Duration::hours(1);
        let in_range = store.list_in_range(start, end, None).await.unwrap();
        assert_eq!(in_range.len(), 1);
        assert_eq!(in_range[0].test_id, "t-late");

        let in_range = store
            .list_in_range(start, end, Some("nobody"))
            .await
            .unwrap();
        assert!(in_range.is_empty());
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let store = MemoryStore::new();
        store.save(sample_test("t-1")).await.unwrap();
        store.save(sample_test("t-2")).await.unwrap();
        store
            .update_status("t-2", TestStatus::Running)
            .await
            .unwrap();

        let running = store.list_by_status(TestStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].test_id, "t-2");
    }

    #[tokio::test]
    async fn test_raw_result_upsert_overwrites() {
        let store = MemoryStore::new();
        store.upsert_raw(sample_raw("t-1", "w-1", 100)).await.unwrap();
        store.upsert_raw(sample_raw("t-1", "w-1", 200)).await.unwrap();
        store.upsert_raw(sample_raw("t-1", "w-2", 300)).await.unwrap();
        store.upsert_raw(sample_raw("t-2", "w-1", 999)).await.unwrap();

        let results = store.list_raw_for_test("t-1").await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].worker_id, "w-1");
        assert_eq!(results[0].total_requests, 200);
    }

    #[tokio::test]
    async fn test_aggregate_round_trip() {
        let store = MemoryStore::new();
        assert!(store.get_aggregate("t-1").await.unwrap().is_none());

        let agg = AggregatedResult {
            test_id: "t-1".to_string(),
            total_requests: 1000,
            successful_requests: 990,
            failed_requests: 10,
            avg_latency_ms: 12.0,
            p95_latency_ms: 30.0,
            duration_ms: 5000,
            status_codes: BTreeMap::new(),
            overall_status: "completed".to_string(),
            worker_count: 2,
            completed_at: Utc::now(),
        };
        store.upsert_aggregate(agg.clone()).await.unwrap();
        store.upsert_aggregate(agg.clone()).await.unwrap();

        let stored = store.get_aggregate("t-1").await.unwrap().unwrap();
        assert_eq!(stored, agg);
    }
}
