// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Aggregator: consumes raw per-worker results from the bus and computes
//! per-test aggregates.
//!
//! The consume loop commits a delivery only after the raw result has been
//! persisted, so a crash in between redelivers the message and the keyed
//! upsert absorbs the duplicate. Malformed payloads and results that fail
//! the assignment guard are logged and committed away; redelivering them
//! forever would wedge the partition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::bus::ResultBus;
use crate::coordinator::Aggregation;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::protocol::RawResultMessage;
use crate::store::{ResultStore, TestStore};
use crate::types::{AggregatedResult, RawResult, TestRecord};

/// Initial backoff after a transient consume failure
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
/// Backoff ceiling
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// The result aggregator
pub struct Aggregator {
    tests: Arc<dyn TestStore>,
    results: Arc<dyn ResultStore>,
}

impl Aggregator {
    /// Wire up an aggregator
    pub fn new(tests: Arc<dyn TestStore>, results: Arc<dyn ResultStore>) -> Self {
        Self { tests, results }
    }

    /// Consume the result topic as a single consumer group. Runs until the
    /// bus reports end-of-stream. Transient failures back off and leave the
    /// offset uncommitted so the broker redelivers.
    pub async fn run(&self, bus: Arc<dyn ResultBus>, group: &str) -> OrchestratorResult<()> {
        info!(group, "aggregator consuming result topic");
        let mut consumer = bus.subscribe(group).await?;
        let mut delay = RETRY_BASE_DELAY;

        loop {
            let delivery = match consumer.next().await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    info!("result topic closed; aggregator stopping");
                    return Ok(());
                }
                Err(err) => {
                    warn!(%err, "bus fetch failed; backing off");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_MAX_DELAY);
                    continue;
                }
            };

            match self.process_payload(&delivery.payload).await {
                Ok(()) => {
                    consumer.ack(&delivery).await?;
                    delay = RETRY_BASE_DELAY;
                }
                Err(err) if err.is_transient() => {
                    // Leave uncommitted: the broker redelivers after the
                    // backoff and the keyed upsert keeps it idempotent
                    warn!(%err, key = %delivery.key, "transient failure; delivery stays pending");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_MAX_DELAY);
                }
                Err(err) => {
                    error!(%err, key = %delivery.key, "dropping poison delivery");
                    consumer.ack(&delivery).await?;
                }
            }
        }
    }

    /// Handle one raw-result payload: validate, persist, and aggregate when
    /// the owning test is already terminal.
    pub async fn process_payload(&self, payload: &[u8]) -> OrchestratorResult<()> {
        let message: RawResultMessage = serde_json::from_slice(payload)?;
        let test_id = message.test_id.clone();
        let worker_id = message.worker_id.clone();

        let test = self.tests.get(&test_id).await?;
        if !test.assigned_workers.contains(&worker_id) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "worker {worker_id} is not assigned to test {test_id}"
            )));
        }

        self.results.upsert_raw(message.into_raw_result()).await?;
        debug!(%test_id, %worker_id, "raw result persisted");

        if test.status.is_terminal()
            && self.results.get_aggregate(&test_id).await?.is_none()
        {
            self.aggregate(&test_id).await?;
        }
        Ok(())
    }

    /// Deterministic aggregation over a fixed raw-result set.
    ///
    /// For the same test record and raw results this always produces the
    /// same row, which is what makes redelivery and manual re-triggering
    /// safe.
    pub fn compute(test: &TestRecord, raws: &[RawResult]) -> AggregatedResult {
        let total_requests: u64 = raws.iter().map(|r| r.total_requests).sum();
        let successful_requests: u64 = raws
            .iter()
            .map(|r| (r.total_requests as f64 * r.success_rate).round() as u64)
            .sum();
        let successful_requests = successful_requests.min(total_requests);

        let (avg_latency_ms, p95_latency_ms) = if total_requests == 0 {
            (0.0, 0.0)
        } else {
            let weighted_avg: f64 = raws
                .iter()
                .map(|r| r.avg_latency_ms * r.total_requests as f64)
                .sum::<f64>()
                / total_requests as f64;
            let weighted_p95: f64 = raws
                .iter()
                .map(|r| r.p95_latency_ms * r.total_requests as f64)
                .sum::<f64>()
                / total_requests as f64;
            (weighted_avg, weighted_p95)
        };

        let duration_ms = raws.iter().map(|r| r.duration_ms).max().unwrap_or(0);

        let mut status_codes: BTreeMap<String, u64> = BTreeMap::new();
        for raw in raws {
            for (code, count) in &raw.status_codes {
                *status_codes.entry(code.clone()).or_insert(0) += count;
            }
        }

        // Stamped from the inputs, not the wall clock, so recomputation
        // yields an identical row
        let completed_at: DateTime<Utc> = raws
            .iter()
            .map(|r| r.received_at)
            .max()
            .unwrap_or(test.created_at);

        AggregatedResult {
            test_id: test.test_id.clone(),
            total_requests,
            successful_requests,
            failed_requests: total_requests - successful_requests,
            avg_latency_ms,
            p95_latency_ms,
            duration_ms,
            status_codes,
            overall_status: test.status.to_string(),
            worker_count: raws.len(),
            completed_at,
        }
    }
}

#[async_trait]
impl Aggregation for Aggregator {
    async fn aggregate(&self, test_id: &str) -> OrchestratorResult<()> {
        let test = self.tests.get(test_id).await?;
        let raws = self.results.list_raw_for_test(test_id).await?;

        let aggregate = Self::compute(&test, &raws);
        info!(
            %test_id,
            total = aggregate.total_requests,
            workers = aggregate.worker_count,
            status = %aggregate.overall_status,
            "aggregate computed"
        );
        self.results.upsert_aggregate(aggregate).await
    }
}
