// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Lifecycle coordinator: owns the test state machine.
//!
//! ```text
//! PENDING ──(dispatch any worker)────────────────────► RUNNING
//! RUNNING ──(every assigned worker completed)────────► COMPLETED
//! RUNNING ──(every assigned worker failed)───────────► FAILED
//! RUNNING ──(all finished, both sets non-empty)──────► PARTIALLY_FAILED
//! PENDING ──(no workers could be assigned)───────────► FAILED
//! ```
//!
//! Transitions out of RUNNING happen only when the finished worker count
//! reaches the frozen assigned count; duplicate terminal signals for a
//! worker are absorbed by the store's idempotent set mutators. Once a test
//! has been accepted, errors are translated into state transitions instead
//! of propagating back to the submitter.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{LifecycleConfig, SchedulerConfig};
use crate::dispatch::WorkerDispatcher;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::protocol::TestAssignment;
use crate::registry::FleetRegistry;
use crate::scheduler::{self, SchedulerPolicy};
use crate::store::TestStore;
use crate::types::{
    RateDistribution, TestId, TestRecord, TestStatus, WorkerState,
};

/// Terminal-signal sink implemented by the coordinator and consumed by the
/// worker protocol endpoint. One-way seam that keeps the endpoint from
/// depending on the coordinator type.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    /// A worker reported a terminal signal for a test
    async fn handle_worker_completion(
        &self,
        test_id: &str,
        worker_id: &str,
        failed: bool,
    ) -> OrchestratorResult<()>;
}

/// Aggregation trigger implemented by the aggregator and consumed here on
/// finalization (and by the manual API trigger)
#[async_trait]
pub trait Aggregation: Send + Sync {
    /// Compute and persist the aggregate for a test
    async fn aggregate(&self, test_id: &str) -> OrchestratorResult<()>;
}

/// A validated submission, ready for scheduling
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Display name
    pub name: String,
    /// Requester id
    pub requester: String,
    /// Attack duration, forwarded verbatim
    pub duration: String,
    /// Requested total rate
    pub rate_per_second: u64,
    /// Target list blob
    pub targets_base64: String,
    /// Attack options blob
    pub attack_options_json: String,
    /// Desired parallelism; 0 is coerced to the configured default
    pub worker_count: u32,
    /// Rate-distribution policy
    pub distribution: RateDistribution,
    /// Weights for the weighted policy
    pub rate_weights: Option<Vec<f64>>,
}

/// The lifecycle coordinator
pub struct LifecycleCoordinator {
    registry: Arc<FleetRegistry>,
    tests: Arc<dyn TestStore>,
    dispatcher: Arc<dyn WorkerDispatcher>,
    aggregation: Arc<dyn Aggregation>,
    lifecycle: LifecycleConfig,
    scheduler: SchedulerConfig,
    /// Single-flight guard so overlapping ticks never run
    tick_guard: Mutex<()>,
}

impl LifecycleCoordinator {
    /// Wire up a coordinator
    pub fn new(
        registry: Arc<FleetRegistry>,
        tests: Arc<dyn TestStore>,
        dispatcher: Arc<dyn WorkerDispatcher>,
        aggregation: Arc<dyn Aggregation>,
        lifecycle: LifecycleConfig,
        scheduler: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            tests,
            dispatcher,
            aggregation,
            lifecycle,
            scheduler,
            tick_guard: Mutex::new(()),
        }
    }

    /// Submit a test: validate, persist, schedule, dispatch.
    ///
    /// Returns the assigned test id. Once the row is persisted the terminal
    /// status is the authoritative outcome; dispatch failures after that
    /// point become state, not errors.
    pub async fn submit(&self, request: SubmitRequest) -> OrchestratorResult<TestId> {
        let worker_count = if request.worker_count == 0 {
            self.scheduler.default_worker_count
        } else {
            request.worker_count
        };

        if request.duration.trim().is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "duration must be non-empty".to_string(),
            ));
        }
        if let Some(ref weights) = request.rate_weights {
            // An empty vector means "no weights" and falls back to the even
            // split inside the scheduler
            if request.distribution == RateDistribution::Weighted
                && !weights.is_empty()
                && weights.len() != worker_count as usize
            {
                return Err(OrchestratorError::InvalidArgument(format!(
                    "weights vector has {} entries for {} workers",
                    weights.len(),
                    worker_count
                )));
            }
        }

        let test_id = Uuid::new_v4().to_string();
        let record = TestRecord {
            test_id: test_id.clone(),
            name: request.name.clone(),
            requester: request.requester.clone(),
            duration: request.duration.clone(),
            rate_per_second: request.rate_per_second,
            targets_base64: request.targets_base64.clone(),
            attack_options_json: request.attack_options_json.clone(),
            worker_count,
            distribution: request.distribution,
            rate_weights: request.rate_weights.clone(),
            status: TestStatus::Pending,
            assigned_workers: Default::default(),
            completed_workers: Default::default(),
            failed_workers: Default::default(),
            created_at: Utc::now(),
        };
        self.tests.save(record).await?;

        let available = self.registry.list_available();
        if available.is_empty() {
            warn!(%test_id, "no workers available; failing submission");
            self.tests.update_status(&test_id, TestStatus::Failed).await?;
            return Ok(test_id);
        }

        let selected = available.len().min(worker_count as usize);
        let weights = request
            .rate_weights
            .as_deref()
            .map(|w| &w[..w.len().min(selected)]);
        let plan = match scheduler::plan(
            &available,
            worker_count,
            request.rate_per_second,
            request.distribution,
            weights,
            SchedulerPolicy {
                reject_when_short: self.scheduler.reject_when_short,
            },
        ) {
            Ok(plan) => plan,
            Err(err) => {
                self.tests.update_status(&test_id, TestStatus::Failed).await?;
                return Err(err);
            }
        };

        info!(
            %test_id,
            workers = plan.len(),
            rate = request.rate_per_second,
            distribution = %request.distribution,
            "dispatching test"
        );

        let mut dispatched = false;
        for assignment in &plan {
            self.tests.add_assigned(&test_id, &assignment.worker_id).await?;

            let payload = TestAssignment {
                test_id: test_id.clone(),
                duration: request.duration.clone(),
                rate_per_second: assignment.rate_per_second,
                targets_base64: request.targets_base64.clone(),
                attack_options_json: request.attack_options_json.clone(),
            };

            match self.dispatcher.assign(&assignment.address, &payload).await {
                Ok(()) => {
                    if !dispatched {
                        self.tests.update_status(&test_id, TestStatus::Running).await?;
                        dispatched = true;
                    }
                    let _ = self.registry.update_status(
                        &assignment.worker_id,
                        WorkerState::Busy,
                        Some(test_id.clone()),
                        "assignment accepted",
                        0,
                        0,
                    );
                }
                Err(err) => {
                    warn!(
                        %test_id,
                        worker_id = %assignment.worker_id,
                        %err,
                        "assignment dispatch failed"
                    );
                    self.tests.add_failed(&test_id, &assignment.worker_id).await?;
                }
            }
        }

        if !dispatched {
            self.finalize(&test_id).await?;
        }

        Ok(test_id)
    }

    /// Compute and write the terminal status, then trigger aggregation.
    /// Idempotent: already-terminal tests are left alone.
    pub async fn finalize(&self, test_id: &str) -> OrchestratorResult<()> {
        let test = self.tests.get(test_id).await?;
        if test.status.is_terminal() {
            debug!(%test_id, "finalize on terminal test ignored");
            return Ok(());
        }

        let terminal = test.derive_terminal().ok_or_else(|| {
            OrchestratorError::FailedPrecondition(format!(
                "test {test_id} still has outstanding workers"
            ))
        })?;
        self.finalize_with(&test, terminal).await
    }

    async fn finalize_with(
        &self,
        test: &TestRecord,
        terminal: TestStatus,
    ) -> OrchestratorResult<()> {
        self.tests.update_status(&test.test_id, terminal).await?;
        info!(
            test_id = %test.test_id,
            status = %terminal,
            completed = test.completed_workers.len(),
            failed = test.failed_workers.len(),
            assigned = test.assigned_workers.len(),
            "test finalized"
        );

        // Aggregation failure is recoverable: unacked bus deliveries come
        // back and re-trigger it.
        if let Err(err) = self.aggregation.aggregate(&test.test_id).await {
            warn!(test_id = %test.test_id, %err, "aggregation trigger failed");
        }
        Ok(())
    }

    /// Cancel a pending or running test: every unfinished assigned worker
    /// moves to the failed set, still-busy workers get a best-effort abort,
    /// and the test lands on FAILED.
    pub async fn cancel(&self, test_id: &str) -> OrchestratorResult<()> {
        let test = self.tests.get(test_id).await?;
        if test.status.is_terminal() {
            return Err(OrchestratorError::FailedPrecondition(format!(
                "test {test_id} already {}",
                test.status
            )));
        }

        for worker_id in &test.assigned_workers {
            if test.completed_workers.contains(worker_id)
                || test.failed_workers.contains(worker_id)
            {
                continue;
            }
            self.tests.add_failed(test_id, worker_id).await?;

            if let Some(record) = self.registry.get(worker_id) {
                let busy_on_this = record.current_test_id.as_deref() == Some(test_id)
                    && matches!(record.state, WorkerState::Busy | WorkerState::Finishing);
                if busy_on_this {
                    if let Err(err) = self.dispatcher.cancel(&record.address, test_id).await {
                        warn!(%test_id, %worker_id, %err, "cancel dispatch failed");
                    }
                }
            }
        }

        let test = self.tests.get(test_id).await?;
        self.finalize_with(&test, TestStatus::Failed).await
    }

    /// Periodic sweep: lapse silent workers onto their tests' failed sets
    /// and fail running tests that have gone stale without progress.
    pub async fn tick(&self) -> OrchestratorResult<()> {
        let _guard = match self.tick_guard.try_lock() {
            Ok(guard) => guard,
            // A previous tick is still in flight
            Err(_) => return Ok(()),
        };

        // Workers whose stream lapsed while busy are failures on their tests
        let lapsed = self
            .registry
            .sweep_silent(self.lifecycle.worker_offline_timeout_secs);
        for (worker_id, test_id) in lapsed {
            warn!(%worker_id, %test_id, "worker lapsed while busy");
            if let Err(err) = self
                .handle_worker_completion(&test_id, &worker_id, true)
                .await
            {
                error!(%test_id, %worker_id, %err, "failed to record lapsed worker");
            }
        }

        // Stale running tests: no progress on any assigned worker
        let stale_secs = self.lifecycle.stale_test_timeout_secs;
        let running = self.tests.list_by_status(TestStatus::Running).await?;
        let now = Utc::now();
        for test in running {
            let age = now.signed_duration_since(test.created_at).num_seconds();
            if age < stale_secs as i64 {
                continue;
            }

            let has_fresh_progress = test.assigned_workers.iter().any(|worker_id| {
                self.registry.get(worker_id).is_some_and(|record| {
                    record.current_test_id.as_deref() == Some(test.test_id.as_str())
                        && !record.is_silent(stale_secs)
                })
            });
            if has_fresh_progress {
                continue;
            }

            warn!(test_id = %test.test_id, age_secs = age, "sweeping stale test");
            for worker_id in &test.assigned_workers {
                if test.completed_workers.contains(worker_id)
                    || test.failed_workers.contains(worker_id)
                {
                    continue;
                }
                self.tests.add_failed(&test.test_id, worker_id).await?;
            }
            if let Err(err) = self.finalize(&test.test_id).await {
                error!(test_id = %test.test_id, %err, "stale finalize failed");
            }
        }

        Ok(())
    }

    /// Spawn the background tick loop
    pub fn spawn_tick_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.lifecycle.tick_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.tick().await {
                    error!(%err, "lifecycle tick failed");
                }
            }
        })
    }
}

#[async_trait]
impl CompletionHandler for LifecycleCoordinator {
    async fn handle_worker_completion(
        &self,
        test_id: &str,
        worker_id: &str,
        failed: bool,
    ) -> OrchestratorResult<()> {
        if failed {
            self.tests.add_failed(test_id, worker_id).await?;
        } else {
            self.tests.add_completed(test_id, worker_id).await?;
        }

        let test = self.tests.get(test_id).await?;
        if test.status.is_terminal() {
            return Ok(());
        }
        if test.all_workers_finished() {
            self.finalize(test_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashSet;

    /// Scripted dispatcher: records calls, fails listed addresses
    #[derive(Default)]
    struct FakeDispatcher {
        assigned: SyncMutex<Vec<(String, TestAssignment)>>,
        cancelled: SyncMutex<Vec<(String, String)>>,
        failing: SyncMutex<HashSet<String>>,
    }

    impl FakeDispatcher {
        fn fail_address(&self, address: &str) {
            self.failing.lock().insert(address.to_string());
        }

        fn assignments(&self) -> Vec<(String, TestAssignment)> {
            self.assigned.lock().clone()
        }
    }

    #[async_trait]
    impl WorkerDispatcher for FakeDispatcher {
        async fn assign(
            &self,
            address: &str,
            assignment: &TestAssignment,
        ) -> OrchestratorResult<()> {
            if self.failing.lock().contains(address) {
                return Err(OrchestratorError::Transient("connection refused".into()));
            }
            self.assigned
                .lock()
                .push((address.to_string(), assignment.clone()));
            Ok(())
        }

        async fn cancel(&self, address: &str, test_id: &str) -> OrchestratorResult<()> {
            self.cancelled
                .lock()
                .push((address.to_string(), test_id.to_string()));
            Ok(())
        }
    }

    /// Records aggregation triggers
    #[derive(Default)]
    struct RecordingAggregation {
        triggered: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl Aggregation for RecordingAggregation {
        async fn aggregate(&self, test_id: &str) -> OrchestratorResult<()> {
            self.triggered.lock().push(test_id.to_string());
            Ok(())
        }
    }

    struct Harness {
        registry: Arc<FleetRegistry>,
        store: Arc<MemoryStore>,
        dispatcher: Arc<FakeDispatcher>,
        aggregation: Arc<RecordingAggregation>,
        coordinator: Arc<LifecycleCoordinator>,
    }

    fn harness_with(lifecycle: LifecycleConfig) -> Harness {
        let registry = Arc::new(FleetRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(FakeDispatcher::default());
        let aggregation = Arc::new(RecordingAggregation::default());
        let coordinator = Arc::new(LifecycleCoordinator::new(
            registry.clone(),
            store.clone(),
            dispatcher.clone(),
            aggregation.clone(),
            lifecycle,
            SchedulerConfig::default(),
        ));
        Harness {
            registry,
            store,
            dispatcher,
            aggregation,
            coordinator,
        }
    }

    fn harness() -> Harness {
        harness_with(LifecycleConfig::default())
    }

    fn request(rate: u64, worker_count: u32) -> SubmitRequest {
        SubmitRequest {
            name: "smoke".to_string(),
            requester: "alice".to_string(),
            duration: "5s".to_string(),
            rate_per_second: rate,
            targets_base64: "R0VUIGh0dHA=".to_string(),
            attack_options_json: "{}".to_string(),
            worker_count,
            distribution: RateDistribution::Shared,
            rate_weights: None,
        }
    }

    #[tokio::test]
    async fn test_submit_dispatches_and_runs() {
        let h = harness();
        h.registry.register("w-1", "w1:7071");
        h.registry.register("w-2", "w2:7071");

        let test_id = h.coordinator.submit(request(200, 2)).await.unwrap();

        let test = h.store.get(&test_id).await.unwrap();
        assert_eq!(test.status, TestStatus::Running);
        assert_eq!(test.assigned_workers.len(), 2);

        let assignments = h.dispatcher.assignments();
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[0].1.rate_per_second, 100);
        assert_eq!(assignments[1].1.rate_per_second, 100);

        // Workers flipped busy on the submitted test
        let w1 = h.registry.get("w-1").unwrap();
        assert_eq!(w1.state, WorkerState::Busy);
        assert_eq!(w1.current_test_id.as_deref(), Some(test_id.as_str()));
    }

    #[tokio::test]
    async fn test_submit_with_empty_fleet_persists_failed_row() {
        let h = harness();
        let test_id = h.coordinator.submit(request(100, 2)).await.unwrap();

        let test = h.store.get(&test_id).await.unwrap();
        assert_eq!(test.status, TestStatus::Failed);
        assert!(test.assigned_workers.is_empty());
        assert!(h.dispatcher.assignments().is_empty());
    }

    #[tokio::test]
    async fn test_submit_coerces_zero_worker_count() {
        let h = harness();
        h.registry.register("w-1", "w1:7071");

        let test_id = h.coordinator.submit(request(50, 0)).await.unwrap();
        let test = h.store.get(&test_id).await.unwrap();
        assert_eq!(test.worker_count, 1);
        assert_eq!(test.assigned_workers.len(), 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_weight_mismatch() {
        let h = harness();
        h.registry.register("w-1", "w1:7071");

        let mut req = request(100, 2);
        req.distribution = RateDistribution::Weighted;
        req.rate_weights = Some(vec![1.0, 2.0, 3.0]);
        let err = h.coordinator.submit(req).await.unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[tokio::test]
    async fn test_partial_dispatch_failure_continues() {
        let h = harness();
        h.registry.register("w-1", "w1:7071");
        h.registry.register("w-2", "w2:7071");
        h.dispatcher.fail_address("w2:7071");

        let test_id = h.coordinator.submit(request(100, 2)).await.unwrap();
        let test = h.store.get(&test_id).await.unwrap();

        assert_eq!(test.status, TestStatus::Running);
        assert_eq!(test.assigned_workers.len(), 2);
        assert!(test.failed_workers.contains("w-2"));

        // The surviving worker finishing lands the test on partially failed
        h.coordinator
            .handle_worker_completion(&test_id, "w-1", false)
            .await
            .unwrap();
        let test = h.store.get(&test_id).await.unwrap();
        assert_eq!(test.status, TestStatus::PartiallyFailed);
    }

    #[tokio::test]
    async fn test_all_dispatch_failures_finalize_failed() {
        let h = harness();
        h.registry.register("w-1", "w1:7071");
        h.registry.register("w-2", "w2:7071");
        h.dispatcher.fail_address("w1:7071");
        h.dispatcher.fail_address("w2:7071");

        let test_id = h.coordinator.submit(request(100, 2)).await.unwrap();
        let test = h.store.get(&test_id).await.unwrap();
        assert_eq!(test.status, TestStatus::Failed);
        assert_eq!(h.aggregation.triggered.lock().clone(), vec![test_id]);
    }

    #[tokio::test]
    async fn test_completion_path_to_completed() {
        let h = harness();
        h.registry.register("w-1", "w1:7071");
        h.registry.register("w-2", "w2:7071");

        let test_id = h.coordinator.submit(request(200, 2)).await.unwrap();

        h.coordinator
            .handle_worker_completion(&test_id, "w-1", false)
            .await
            .unwrap();
        assert_eq!(
            h.store.get(&test_id).await.unwrap().status,
            TestStatus::Running
        );

        h.coordinator
            .handle_worker_completion(&test_id, "w-2", false)
            .await
            .unwrap();
        let test = h.store.get(&test_id).await.unwrap();
        assert_eq!(test.status, TestStatus::Completed);
        assert_eq!(h.aggregation.triggered.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_completion_signals_are_idempotent() {
        let h = harness();
        h.registry.register("w-1", "w1:7071");
        h.registry.register("w-2", "w2:7071");

        let test_id = h.coordinator.submit(request(200, 2)).await.unwrap();

        for _ in 0..3 {
            h.coordinator
                .handle_worker_completion(&test_id, "w-1", false)
                .await
                .unwrap();
        }
        let test = h.store.get(&test_id).await.unwrap();
        assert_eq!(test.status, TestStatus::Running);
        assert_eq!(test.completed_workers.len(), 1);

        h.coordinator
            .handle_worker_completion(&test_id, "w-2", false)
            .await
            .unwrap();
        // A late duplicate after finalization is swallowed
        h.coordinator
            .handle_worker_completion(&test_id, "w-2", false)
            .await
            .unwrap();
        let test = h.store.get(&test_id).await.unwrap();
        assert_eq!(test.status, TestStatus::Completed);
        assert_eq!(h.aggregation.triggered.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_all_workers_error_finalizes_failed() {
        let h = harness();
        h.registry.register("w-1", "w1:7071");
        h.registry.register("w-2", "w2:7071");

        let test_id = h.coordinator.submit(request(200, 2)).await.unwrap();
        h.coordinator
            .handle_worker_completion(&test_id, "w-1", true)
            .await
            .unwrap();
        h.coordinator
            .handle_worker_completion(&test_id, "w-2", true)
            .await
            .unwrap();

        let test = h.store.get(&test_id).await.unwrap();
        assert_eq!(test.status, TestStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_running_test() {
        let h = harness();
        h.registry.register("w-1", "w1:7071");
        h.registry.register("w-2", "w2:7071");

        let test_id = h.coordinator.submit(request(200, 2)).await.unwrap();
        h.coordinator
            .handle_worker_completion(&test_id, "w-1", false)
            .await
            .unwrap();

        h.coordinator.cancel(&test_id).await.unwrap();

        let test = h.store.get(&test_id).await.unwrap();
        assert_eq!(test.status, TestStatus::Failed);
        assert!(test.completed_workers.contains("w-1"));
        assert!(test.failed_workers.contains("w-2"));

        // Only the still-busy worker received the abort
        let cancelled = h.dispatcher.cancelled.lock().clone();
        assert_eq!(cancelled, vec![("w2:7071".to_string(), test_id.clone())]);

        // Cancelling again is a precondition failure
        assert!(h.coordinator.cancel(&test_id).await.is_err());
    }

    #[tokio::test]
    async fn test_tick_fails_lapsed_workers() {
        let h = harness_with(LifecycleConfig {
            stale_test_timeout_secs: 3600,
            worker_offline_timeout_secs: 0,
            tick_interval_secs: 10,
        });
        h.registry.register("w-1", "w1:7071");

        let test_id = h.coordinator.submit(request(100, 1)).await.unwrap();
        assert_eq!(
            h.store.get(&test_id).await.unwrap().status,
            TestStatus::Running
        );

        // Zero offline timeout: the worker lapses on the first sweep
        h.coordinator.tick().await.unwrap();

        let test = h.store.get(&test_id).await.unwrap();
        assert_eq!(test.status, TestStatus::Failed);
        assert!(test.failed_workers.contains("w-1"));
        assert_eq!(
            h.registry.get("w-1").unwrap().state,
            WorkerState::Offline
        );
    }

    #[tokio::test]
    async fn test_tick_sweeps_stale_test_without_progress() {
        let h = harness_with(LifecycleConfig {
            stale_test_timeout_secs: 0,
            worker_offline_timeout_secs: 3600,
            tick_interval_secs: 10,
        });
        h.registry.register("w-1", "w1:7071");

        let test_id = h.coordinator.submit(request(100, 1)).await.unwrap();
        // The worker went silent but its stream has not lapsed; the stale
        // sweep still fails the test because no progress arrived in time.
        h.registry.mark_offline("w-1");

        h.coordinator.tick().await.unwrap();
        let test = h.store.get(&test_id).await.unwrap();
        assert_eq!(test.status, TestStatus::Failed);
    }

    #[tokio::test]
    async fn test_finalize_on_terminal_test_is_noop() {
        let h = harness();
        h.registry.register("w-1", "w1:7071");
        let test_id = h.coordinator.submit(request(100, 1)).await.unwrap();
        h.coordinator
            .handle_worker_completion(&test_id, "w-1", false)
            .await
            .unwrap();

        h.coordinator.finalize(&test_id).await.unwrap();
        h.coordinator.finalize(&test_id).await.unwrap();
        assert_eq!(h.aggregation.triggered.lock().len(), 1);
        assert_eq!(
            h.store.get(&test_id).await.unwrap().status,
            TestStatus::Completed
        );
    }
}
