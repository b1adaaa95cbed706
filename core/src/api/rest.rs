// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Submission and read surface.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::*;
use crate::coordinator::{Aggregation, LifecycleCoordinator, SubmitRequest};
use crate::registry::FleetRegistry;
use crate::store::{ResultStore, TestStore};
use crate::types::{RateDistribution, TestStatus};

/// Shared state behind the submission routes
pub struct ApiState {
    /// Lifecycle coordinator for submit/cancel
    pub coordinator: Arc<LifecycleCoordinator>,
    /// Fleet registry for the dashboard
    pub registry: Arc<FleetRegistry>,
    /// Test store for reads
    pub tests: Arc<dyn TestStore>,
    /// Result store for reads
    pub results: Arc<dyn ResultStore>,
    /// Manual aggregation trigger
    pub aggregation: Arc<dyn Aggregation>,
}

/// Build the axum router served on the HTTP listen address
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/tests", post(submit_test).get(list_tests))
        .route("/v1/tests/:id", get(get_test))
        .route("/v1/tests/:id/results", get(get_raw_results))
        .route(
            "/v1/tests/:id/aggregate",
            get(get_aggregate).post(trigger_aggregate),
        )
        .route("/v1/tests/:id/cancel", post(cancel_test))
        .route("/v1/dashboard", get(dashboard))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: crate::VERSION.to_string(),
    })
}

async fn submit_test(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SubmitTestRequest>,
) -> ApiResult<Json<SubmitTestResponse>> {
    let distribution = RateDistribution::parse(&request.rate_distribution).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "unknown rate_distribution {:?}",
            request.rate_distribution
        ))
    })?;

    let test_id = state
        .coordinator
        .submit(SubmitRequest {
            name: request.name,
            requester: request.requester,
            duration: request.duration,
            rate_per_second: request.rate_per_second,
            targets_base64: request.targets_base64,
            attack_options_json: request.attack_options_json,
            worker_count: request.worker_count,
            distribution,
            rate_weights: request.rate_weights,
        })
        .await?;

    Ok(Json(SubmitTestResponse { test_id }))
}

async fn list_tests(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<PaginationParams>,
) -> ApiResult<Json<TestListResponse>> {
    let page = params.page.max(1);
    let limit = params.limit.clamp(1, 200);
    let offset = (page - 1) * limit as u64;

    let (tests, total) = state.tests.list_paginated(limit, offset, None).await?;
    let total_pages = total.div_ceil(limit as u64);

    Ok(Json(TestListResponse {
        tests,
        total,
        page,
        limit,
        total_pages,
    }))
}

async fn get_test(
    State(state): State<Arc<ApiState>>,
    Path(test_id): Path<String>,
) -> ApiResult<Json<crate::types::TestRecord>> {
    Ok(Json(state.tests.get(&test_id).await?))
}

async fn get_raw_results(
    State(state): State<Arc<ApiState>>,
    Path(test_id): Path<String>,
) -> ApiResult<Json<RawResultsResponse>> {
    // 404 for unknown tests rather than an empty list
    state.tests.get(&test_id).await?;
    let results = state.results.list_raw_for_test(&test_id).await?;
    Ok(Json(RawResultsResponse { test_id, results }))
}

async fn get_aggregate(
    State(state): State<Arc<ApiState>>,
    Path(test_id): Path<String>,
) -> ApiResult<Json<AggregateResponse>> {
    state.tests.get(&test_id).await?;
    let aggregate = state
        .results
        .get_aggregate(&test_id)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!("no aggregate for test {test_id} yet"))
        })?;
    Ok(Json(AggregateResponse { aggregate }))
}

async fn trigger_aggregate(
    State(state): State<Arc<ApiState>>,
    Path(test_id): Path<String>,
) -> ApiResult<Json<AggregateResponse>> {
    let test = state.tests.get(&test_id).await?;
    if !test.status.is_terminal() {
        return Err(ApiError::PreconditionFailed(format!(
            "test {test_id} is {}; aggregation runs on terminal tests",
            test.status
        )));
    }

    state.aggregation.aggregate(&test_id).await?;
    let aggregate = state
        .results
        .get_aggregate(&test_id)
        .await?
        .ok_or_else(|| ApiError::InternalError("aggregate missing after trigger".into()))?;
    Ok(Json(AggregateResponse { aggregate }))
}

async fn cancel_test(
    State(state): State<Arc<ApiState>>,
    Path(test_id): Path<String>,
) -> ApiResult<Json<crate::types::TestRecord>> {
    state.coordinator.cancel(&test_id).await?;
    Ok(Json(state.tests.get(&test_id).await?))
}

async fn dashboard(State(state): State<Arc<ApiState>>) -> ApiResult<Json<DashboardResponse>> {
    let snapshot = state.registry.snapshot();
    let mut active = state.tests.list_by_status(TestStatus::Running).await?;
    active.extend(state.tests.list_by_status(TestStatus::Pending).await?);
    active.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    Ok(Json(DashboardResponse {
        total_workers: snapshot.total_workers,
        available_workers: snapshot.available_workers,
        busy_workers: snapshot.busy_workers,
        active_tests: active,
        worker_summaries: snapshot.workers,
    }))
}
