// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Assignment dispatch toward workers.
//!
//! The master acts as an HTTP client against each worker's own surface:
//! `POST /v1/assign` hands over a test assignment (acceptance is
//! synchronous, execution is asynchronous on the worker) and
//! `POST /v1/cancel` is the best-effort abort.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::protocol::{AssignResponse, CancelRequest, TestAssignment};

/// Outbound RPC seam toward workers. Injected into the lifecycle
/// coordinator so tests can script worker behavior.
#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    /// Hand an assignment to the worker at `address`. An `Ok` means the
    /// worker accepted; a declined assignment surfaces as an error.
    async fn assign(&self, address: &str, assignment: &TestAssignment)
        -> OrchestratorResult<()>;

    /// Best-effort cancellation; failures are logged by the caller, never
    /// retried.
    async fn cancel(&self, address: &str, test_id: &str) -> OrchestratorResult<()>;
}

/// HTTP dispatcher used in production
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    /// Build a dispatcher with a bounded per-call timeout
    pub fn new(timeout: Duration) -> OrchestratorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestratorError::Fatal(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WorkerDispatcher for HttpDispatcher {
    async fn assign(
        &self,
        address: &str,
        assignment: &TestAssignment,
    ) -> OrchestratorResult<()> {
        let url = format!("http://{address}/v1/assign");
        debug!(%url, test_id = %assignment.test_id, "dispatching assignment");

        let response = self.client.post(&url).json(assignment).send().await?;
        if !response.status().is_success() {
            return Err(OrchestratorError::Transient(format!(
                "worker at {address} answered {}",
                response.status()
            )));
        }

        let body: AssignResponse = response.json().await?;
        if !body.accepted {
            return Err(OrchestratorError::FailedPrecondition(format!(
                "worker at {address} declined: {}",
                body.message
            )));
        }
        Ok(())
    }

    async fn cancel(&self, address: &str, test_id: &str) -> OrchestratorResult<()> {
        let url = format!("http://{address}/v1/cancel");
        let request = CancelRequest {
            test_id: test_id.to_string(),
        };
        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(OrchestratorError::Transient(format!(
                "worker at {address} answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}
