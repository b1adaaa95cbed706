// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Fleet registry: the live mapping of worker id to worker record.
//!
//! The registry is the only in-memory shared mutable table in the master.
//! Registrations are re-established by workers reconnecting after a master
//! restart, so nothing here needs to be durable.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{TestId, WorkerId, WorkerRecord, WorkerState};

/// Live fleet state, keyed by worker id
#[derive(Default)]
pub struct FleetRegistry {
    workers: DashMap<WorkerId, WorkerRecord>,
}

impl FleetRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            workers: DashMap::new(),
        }
    }

    /// Register a worker, or refresh an existing registration in place.
    ///
    /// Re-registration keeps the original registration time (the scheduler's
    /// selection order is stable across reconnects) and resets the worker to
    /// ready.
    pub fn register(&self, worker_id: impl Into<WorkerId>, address: impl Into<String>) {
        let worker_id = worker_id.into();
        let address = address.into();
        match self.workers.get_mut(&worker_id) {
            Some(mut existing) => {
                existing.address = address;
                existing.state = WorkerState::Ready;
                existing.current_test_id = None;
                existing.progress_message.clear();
                existing.completed_requests = 0;
                existing.total_requests = 0;
                existing.last_seen = Utc::now();
            }
            None => {
                let record = WorkerRecord::new(worker_id.clone(), address);
                self.workers.insert(worker_id, record);
            }
        }
    }

    /// Apply a status update from the worker's stream.
    ///
    /// Every accepted update refreshes the last-seen timestamp.
    #[allow(clippy::too_many_arguments)]
    pub fn update_status(
        &self,
        worker_id: &str,
        state: WorkerState,
        current_test_id: Option<TestId>,
        progress_message: &str,
        completed_requests: u64,
        total_requests: u64,
    ) -> OrchestratorResult<()> {
        let mut record = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("worker {worker_id}")))?;

        record.state = state;
        record.current_test_id = current_test_id;
        record.progress_message = progress_message.to_string();
        record.completed_requests = completed_requests;
        record.total_requests = total_requests;
        record.last_seen = Utc::now();
        Ok(())
    }

    /// Get a worker record by id
    pub fn get(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.workers.get(worker_id).map(|w| w.clone())
    }

    /// Workers eligible for assignment, in registration order then by id.
    ///
    /// This ordering is the scheduler's implementation-stable selection
    /// order.
    pub fn list_available(&self) -> Vec<WorkerRecord> {
        let mut available: Vec<WorkerRecord> = self
            .workers
            .iter()
            .filter(|w| w.is_available())
            .map(|w| w.value().clone())
            .collect();
        available.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        available
    }

    /// All known workers, unordered
    pub fn list_all(&self) -> Vec<WorkerRecord> {
        self.workers.iter().map(|w| w.value().clone()).collect()
    }

    /// Mark a worker offline and clear its assignment
    pub fn mark_offline(&self, worker_id: &str) {
        if let Some(mut record) = self.workers.get_mut(worker_id) {
            record.state = WorkerState::Offline;
            record.current_test_id = None;
            record.last_seen = Utc::now();
        }
    }

    /// Mark workers silent beyond `timeout_seconds` as offline.
    ///
    /// Returns the (worker, test) pairs that were busy or finishing when
    /// they lapsed, so the lifecycle coordinator can fail them on their
    /// tests.
    pub fn sweep_silent(&self, timeout_seconds: u64) -> Vec<(WorkerId, TestId)> {
        let mut lapsed = Vec::new();
        for mut entry in self.workers.iter_mut() {
            if entry.state == WorkerState::Offline || !entry.is_silent(timeout_seconds) {
                continue;
            }
            if let Some(test_id) = entry.current_test_id.take() {
                if matches!(entry.state, WorkerState::Busy | WorkerState::Finishing) {
                    lapsed.push((entry.worker_id.clone(), test_id));
                }
            }
            entry.state = WorkerState::Offline;
        }
        lapsed
    }

    /// Snapshot counts and per-worker summaries for the dashboard
    pub fn snapshot(&self) -> FleetSnapshot {
        let workers = self.list_all();
        let available = workers.iter().filter(|w| w.is_available()).count();
        let busy = workers
            .iter()
            .filter(|w| matches!(w.state, WorkerState::Busy | WorkerState::Finishing))
            .count();

        let mut summaries: Vec<WorkerSummary> = workers
            .into_iter()
            .map(|w| WorkerSummary {
                worker_id: w.worker_id,
                address: w.address,
                state: w.state.to_string(),
                current_test_id: w.current_test_id,
                progress_message: w.progress_message,
                completed_requests: w.completed_requests,
                total_requests: w.total_requests,
                last_seen: w.last_seen,
            })
            .collect();
        summaries.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        FleetSnapshot {
            total_workers: summaries.len(),
            available_workers: available,
            busy_workers: busy,
            workers: summaries,
        }
    }
}

/// Point-in-time view of the fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSnapshot {
    /// Total registered workers
    pub total_workers: usize,
    /// Workers ready for assignment
    pub available_workers: usize,
    /// Workers currently busy or finishing
    pub busy_workers: usize,
    /// Per-worker summaries
    pub workers: Vec<WorkerSummary>,
}

/// Per-worker summary for the dashboard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    /// Worker ID
    pub worker_id: WorkerId,
    /// Dispatch address
    pub address: String,
    /// State as a display string
    pub state: String,
    /// Current assignment, if any
    pub current_test_id: Option<TestId>,
    /// Last progress message
    pub progress_message: String,
    /// Requests completed for the current test
    pub completed_requests: u64,
    /// Requests planned for the current test
    pub total_requests: u64,
    /// Last update time
    pub last_seen: chrono::DateTime<Utc>,
}
