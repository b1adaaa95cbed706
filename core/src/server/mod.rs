// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker protocol endpoint.
//!
//! Serves two routes to workers: `POST /v1/workers/register` and the
//! `GET /v1/workers/stream` WebSocket carrying `WorkerStatus` /
//! `WorkerStatusAck` frames. The first message on a stream binds its
//! identity; any later frame naming a different worker terminates the
//! stream. However a stream ends - EOF, transport error, cancellation - the
//! bound worker is marked offline.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::coordinator::CompletionHandler;
use crate::protocol::{
    RegisterRequest, RegisterResponse, StatusKind, WorkerStatus, WorkerStatusAck,
};
use crate::registry::FleetRegistry;
use crate::types::{WorkerId, WorkerState};

/// Shared state behind the worker routes
pub struct WorkerEndpoint {
    registry: Arc<FleetRegistry>,
    completion: Arc<dyn CompletionHandler>,
}

impl WorkerEndpoint {
    /// Wire up the endpoint
    pub fn new(registry: Arc<FleetRegistry>, completion: Arc<dyn CompletionHandler>) -> Self {
        Self {
            registry,
            completion,
        }
    }

    /// Build the axum router served on the worker listen address
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/v1/workers/register", post(register_worker))
            .route("/v1/workers/stream", get(stream_worker_status))
            .with_state(self)
    }
}

/// Registration handler. Re-registering an existing worker succeeds and
/// refreshes its record in place.
async fn register_worker(
    State(endpoint): State<Arc<WorkerEndpoint>>,
    Json(request): Json<RegisterRequest>,
) -> Json<RegisterResponse> {
    if request.worker_id.trim().is_empty() || request.address.trim().is_empty() {
        return Json(RegisterResponse {
            success: false,
            message: "worker_id and address must be non-empty".to_string(),
        });
    }

    endpoint
        .registry
        .register(&request.worker_id, &request.address);
    info!(worker_id = %request.worker_id, address = %request.address, "worker registered");

    Json(RegisterResponse {
        success: true,
        message: format!("worker {} registered", request.worker_id),
    })
}

/// WebSocket upgrade for the status stream
async fn stream_worker_status(
    ws: WebSocketUpgrade,
    State(endpoint): State<Arc<WorkerEndpoint>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, endpoint))
}

async fn handle_stream(socket: WebSocket, endpoint: Arc<WorkerEndpoint>) {
    let (mut sender, mut receiver) = socket.split();

    // All writes into the stream go through this channel; the send task is
    // the only writer on the socket
    let (ack_tx, mut ack_rx) = mpsc::channel::<WorkerStatusAck>(32);

    let mut send_task = tokio::spawn(async move {
        while let Some(ack) = ack_rx.recv().await {
            let text = match serde_json::to_string(&ack) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%err, "failed to serialize ack");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut session = StreamSession::new(endpoint.registry.clone(), endpoint.completion.clone());
    // The binding survives the receive task so teardown can name the worker
    // no matter which side of the stream gave out first
    let bound_handle = session.bound_handle();
    let mut recv_task = {
        let ack_tx = ack_tx.clone();
        tokio::spawn(async move {
            while let Some(Ok(message)) = receiver.next().await {
                match message {
                    Message::Text(text) => {
                        let status: WorkerStatus = match serde_json::from_str(&text) {
                            Ok(status) => status,
                            Err(err) => {
                                let _ = ack_tx
                                    .send(WorkerStatusAck::rejected(format!(
                                        "malformed status message: {err}"
                                    )))
                                    .await;
                                continue;
                            }
                        };

                        let (ack, terminate) = session.apply(status).await;
                        let _ = ack_tx.send(ack).await;
                        if terminate {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    // Pings are answered by axum; binary frames are not part
                    // of the protocol
                    Message::Binary(_) => {
                        let _ = ack_tx
                            .send(WorkerStatusAck::rejected("binary frames not supported"))
                            .await;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        })
    };

    // Either side ending tears the stream down
    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => recv_task.abort(),
    }

    let bound = bound_handle.lock().take();
    if let Some(worker_id) = bound {
        info!(%worker_id, "status stream closed; marking worker offline");
        endpoint.registry.mark_offline(&worker_id);
    } else {
        debug!("status stream closed before binding an identity");
    }
}

/// Per-stream protocol state: identity binding, registry updates, and
/// terminal-signal forwarding. Factored out of the socket plumbing so the
/// protocol rules are testable on their own.
pub struct StreamSession {
    registry: Arc<FleetRegistry>,
    completion: Arc<dyn CompletionHandler>,
    bound: Arc<parking_lot::Mutex<Option<WorkerId>>>,
}

impl StreamSession {
    /// New unbound session
    pub fn new(registry: Arc<FleetRegistry>, completion: Arc<dyn CompletionHandler>) -> Self {
        Self {
            registry,
            completion,
            bound: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// The worker this stream is bound to, once the first message arrived
    pub fn bound_worker(&self) -> Option<WorkerId> {
        self.bound.lock().clone()
    }

    /// Shared handle onto the binding, read at stream teardown
    pub fn bound_handle(&self) -> Arc<parking_lot::Mutex<Option<WorkerId>>> {
        self.bound.clone()
    }

    /// Apply one status message. Returns the ack to push back and whether
    /// the stream must terminate.
    pub async fn apply(&mut self, status: WorkerStatus) -> (WorkerStatusAck, bool) {
        {
            let mut bound = self.bound.lock();
            match bound.as_deref() {
                None => *bound = Some(status.worker_id.clone()),
                Some(existing) if existing != status.worker_id => {
                    warn!(
                        bound = %existing,
                        claimed = %status.worker_id,
                        "worker id mismatch on status stream"
                    );
                    return (
                        WorkerStatusAck::rejected(format!(
                            "stream is bound to worker {existing}, not {}",
                            status.worker_id
                        )),
                        true,
                    );
                }
                Some(_) => {}
            }
        }

        let state = match status.status {
            StatusKind::Ready => WorkerState::Ready,
            StatusKind::Busy => WorkerState::Busy,
            StatusKind::Finishing => WorkerState::Finishing,
            StatusKind::Error => WorkerState::Error,
        };
        let current_test_id = if status.test_id.is_empty() {
            None
        } else {
            Some(status.test_id.clone())
        };

        if let Err(err) = self.registry.update_status(
            &status.worker_id,
            state,
            current_test_id,
            &status.message,
            status.completed_requests,
            status.total_requests,
        ) {
            return (
                WorkerStatusAck::rejected(format!("status rejected: {err}")),
                false,
            );
        }

        if status.status.is_terminal() && !status.test_id.is_empty() {
            let failed = status.status == StatusKind::Error;
            if let Err(err) = self
                .completion
                .handle_worker_completion(&status.test_id, &status.worker_id, failed)
                .await
            {
                warn!(
                    test_id = %status.test_id,
                    worker_id = %status.worker_id,
                    %err,
                    "completion handling failed"
                );
                return (
                    WorkerStatusAck::rejected(format!("completion handling failed: {err}")),
                    false,
                );
            }
        }

        (WorkerStatusAck::accepted(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorResult;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingCompletion {
        calls: Mutex<Vec<(String, String, bool)>>,
    }

    #[async_trait]
    impl CompletionHandler for RecordingCompletion {
        async fn handle_worker_completion(
            &self,
            test_id: &str,
            worker_id: &str,
            failed: bool,
        ) -> OrchestratorResult<()> {
            self.calls
                .lock()
                .push((test_id.to_string(), worker_id.to_string(), failed));
            Ok(())
        }
    }

    fn status(worker_id: &str, kind: StatusKind, test_id: &str) -> WorkerStatus {
        WorkerStatus {
            worker_id: worker_id.to_string(),
            status: kind,
            message: String::new(),
            test_id: test_id.to_string(),
            total_requests: 100,
            completed_requests: 50,
            duration_ms: 2500,
        }
    }

    fn session() -> (Arc<FleetRegistry>, Arc<RecordingCompletion>, StreamSession) {
        let registry = Arc::new(FleetRegistry::new());
        let completion = Arc::new(RecordingCompletion::default());
        let session = StreamSession::new(registry.clone(), completion.clone());
        (registry, completion, session)
    }

    #[tokio::test]
    async fn test_first_message_binds_identity() {
        let (registry, _, mut session) = session();
        registry.register("w-1", "a:1");

        let (ack, terminate) = session.apply(status("w-1", StatusKind::Ready, "")).await;
        assert!(ack.accepted);
        assert!(!terminate);
        assert_eq!(session.bound_worker().as_deref(), Some("w-1"));
    }

    #[tokio::test]
    async fn test_impersonation_terminates_stream() {
        let (registry, completion, mut session) = session();
        registry.register("w-a", "a:1");
        registry.register("w-b", "b:1");

        let (ack, _) = session.apply(status("w-a", StatusKind::Ready, "")).await;
        assert!(ack.accepted);

        let (ack, terminate) = session.apply(status("w-b", StatusKind::Ready, "")).await;
        assert!(!ack.accepted);
        assert!(terminate);
        assert!(completion.calls.lock().is_empty());

        // The impostor's record is untouched by the rejected frame
        assert_eq!(registry.get("w-b").unwrap().state, WorkerState::Ready);
    }

    #[tokio::test]
    async fn test_busy_updates_registry_progress() {
        let (registry, completion, mut session) = session();
        registry.register("w-1", "a:1");

        let (ack, _) = session.apply(status("w-1", StatusKind::Busy, "t-9")).await;
        assert!(ack.accepted);

        let record = registry.get("w-1").unwrap();
        assert_eq!(record.state, WorkerState::Busy);
        assert_eq!(record.current_test_id.as_deref(), Some("t-9"));
        assert_eq!(record.completed_requests, 50);
        assert_eq!(record.total_requests, 100);
        assert!(completion.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_finishing_forwards_completion() {
        let (registry, completion, mut session) = session();
        registry.register("w-1", "a:1");

        let (ack, terminate) = session
            .apply(status("w-1", StatusKind::Finishing, "t-9"))
            .await;
        assert!(ack.accepted);
        assert!(!terminate);
        assert_eq!(
            completion.calls.lock().clone(),
            vec![("t-9".to_string(), "w-1".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_error_forwards_failed_completion() {
        let (registry, completion, mut session) = session();
        registry.register("w-1", "a:1");

        session.apply(status("w-1", StatusKind::Error, "t-9")).await;
        assert_eq!(
            completion.calls.lock().clone(),
            vec![("t-9".to_string(), "w-1".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_unregistered_worker_is_rejected_without_terminating() {
        let (_, completion, mut session) = session();

        let (ack, terminate) = session.apply(status("ghost", StatusKind::Ready, "")).await;
        assert!(!ack.accepted);
        assert!(!terminate);
        assert!(completion.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_idle_heartbeat_with_empty_test_id_skips_completion() {
        let (registry, completion, mut session) = session();
        registry.register("w-1", "a:1");

        // A finishing frame without a test id updates state but triggers
        // nothing
        session.apply(status("w-1", StatusKind::Finishing, "")).await;
        assert!(completion.calls.lock().is_empty());
    }
}
