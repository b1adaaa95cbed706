// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! PostgreSQL store backend.
//!
//! Worker-set mutators are single guarded UPDATE statements, so each
//! read-modify-write is atomic against concurrent callers without an
//! explicit transaction. Raw results and aggregates use
//! `INSERT ... ON CONFLICT DO UPDATE` upserts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::info;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::store::{ResultStore, TestStore};
use crate::types::{
    AggregatedResult, RateDistribution, RawResult, TestRecord, TestStatus,
};

/// PostgreSQL implementation of both store traits
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run migrations
    pub async fn connect(url: &str) -> OrchestratorResult<Self> {
        info!("connecting to postgres store");
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|e| OrchestratorError::Transient(format!("store connect: {e}")))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| OrchestratorError::Fatal(format!("migrations: {e}")))?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests against a provisioned database)
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn not_found(test_id: &str) -> OrchestratorError {
        OrchestratorError::NotFound(format!("test {test_id}"))
    }
}

#[derive(FromRow)]
struct TestRow {
    test_id: String,
    name: String,
    requester: String,
    duration: String,
    rate_per_second: i64,
    targets_base64: String,
    attack_options_json: String,
    worker_count: i32,
    distribution: String,
    rate_weights: Option<serde_json::Value>,
    status: String,
    assigned_workers: Vec<String>,
    completed_workers: Vec<String>,
    failed_workers: Vec<String>,
    created_at: DateTime<Utc>,
}

impl TestRow {
    fn into_record(self) -> OrchestratorResult<TestRecord> {
        let distribution = RateDistribution::parse(&self.distribution).ok_or_else(|| {
            OrchestratorError::Fatal(format!("unknown stored distribution {}", self.distribution))
        })?;
        let status = parse_status(&self.status)?;
        let rate_weights = match self.rate_weights {
            Some(v) => serde_json::from_value(v)
                .map_err(|e| OrchestratorError::Fatal(format!("stored weights: {e}")))?,
            None => None,
        };
        Ok(TestRecord {
            test_id: self.test_id,
            name: self.name,
            requester: self.requester,
            duration: self.duration,
            rate_per_second: self.rate_per_second as u64,
            targets_base64: self.targets_base64,
            attack_options_json: self.attack_options_json,
            worker_count: self.worker_count as u32,
            distribution,
            rate_weights,
            status,
            assigned_workers: self.assigned_workers.into_iter().collect(),
            completed_workers: self.completed_workers.into_iter().collect(),
            failed_workers: self.failed_workers.into_iter().collect(),
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct RawResultRow {
    test_id: String,
    worker_id: String,
    metrics_json: serde_json::Value,
    total_requests: i64,
    completed_requests: i64,
    duration_ms: i64,
    success_rate: f64,
    avg_latency_ms: f64,
    p95_latency_ms: f64,
    status_codes: serde_json::Value,
    received_at: DateTime<Utc>,
}

impl RawResultRow {
    fn into_raw(self) -> OrchestratorResult<RawResult> {
        let status_codes: BTreeMap<String, u64> = serde_json::from_value(self.status_codes)
            .map_err(|e| OrchestratorError::Fatal(format!("stored histogram: {e}")))?;
        Ok(RawResult {
            test_id: self.test_id,
            worker_id: self.worker_id,
            metrics_json: self.metrics_json,
            total_requests: self.total_requests as u64,
            completed_requests: self.completed_requests as u64,
            duration_ms: self.duration_ms as u64,
            success_rate: self.success_rate,
            avg_latency_ms: self.avg_latency_ms,
            p95_latency_ms: self.p95_latency_ms,
            status_codes,
            received_at: self.received_at,
        })
    }
}

#[derive(FromRow)]
struct AggregateRow {
    test_id: String,
    total_requests: i64,
    successful_requests: i64,
    failed_requests: i64,
    avg_latency_ms: f64,
    p95_latency_ms: f64,
    duration_ms: i64,
    status_codes: serde_json::Value,
    overall_status: String,
    worker_count: i32,
    completed_at: DateTime<Utc>,
}

impl AggregateRow {
    fn into_aggregate(self) -> OrchestratorResult<AggregatedResult> {
        let status_codes: BTreeMap<String, u64> = serde_json::from_value(self.status_codes)
            .map_err(|e| OrchestratorError::Fatal(format!("stored histogram: {e}")))?;
        Ok(AggregatedResult {
            test_id: self.test_id,
            total_requests: self.total_requests as u64,
            successful_requests: self.successful_requests as u64,
            failed_requests: self.failed_requests as u64,
            avg_latency_ms: self.avg_latency_ms,
            p95_latency_ms: self.p95_latency_ms,
            duration_ms: self.duration_ms as u64,
            status_codes,
            overall_status: self.overall_status,
            worker_count: self.worker_count as usize,
            completed_at: self.completed_at,
        })
    }
}

fn parse_status(s: &str) -> OrchestratorResult<TestStatus> {
    match s {
        "pending" => Ok(TestStatus::Pending),
        "running" => Ok(TestStatus::Running),
        "completed" => Ok(TestStatus::Completed),
        "partially_failed" => Ok(TestStatus::PartiallyFailed),
        "failed" => Ok(TestStatus::Failed),
        other => Err(OrchestratorError::Fatal(format!(
            "unknown stored status {other}"
        ))),
    }
}

fn set_to_vec(set: &BTreeSet<String>) -> Vec<String> {
    set.iter().cloned().collect()
}

#[async_trait]
impl TestStore for PostgresStore {
    async fn save(&self, test: TestRecord) -> OrchestratorResult<()> {
        let weights = test
            .rate_weights
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO tests (
                test_id, name, requester, duration, rate_per_second,
                targets_base64, attack_options_json, worker_count,
                distribution, rate_weights, status,
                assigned_workers, completed_workers, failed_workers, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(&test.test_id)
        .bind(&test.name)
        .bind(&test.requester)
        .bind(&test.duration)
        .bind(test.rate_per_second as i64)
        .bind(&test.targets_base64)
        .bind(&test.attack_options_json)
        .bind(test.worker_count as i32)
        .bind(test.distribution.to_string())
        .bind(weights)
        .bind(test.status.to_string())
        .bind(set_to_vec(&test.assigned_workers))
        .bind(set_to_vec(&test.completed_workers))
        .bind(set_to_vec(&test.failed_workers))
        .bind(test.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, test_id: &str) -> OrchestratorResult<TestRecord> {
        let row = sqlx::query_as::<_, TestRow>("SELECT * FROM tests WHERE test_id = $1")
            .bind(test_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Self::not_found(test_id))?;
        row.into_record()
    }

    async fn update_status(&self, test_id: &str, status: TestStatus) -> OrchestratorResult<()> {
        let result = sqlx::query("UPDATE tests SET status = $2 WHERE test_id = $1")
            .bind(test_id)
            .bind(status.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Self::not_found(test_id));
        }
        Ok(())
    }

    async fn list_paginated(
        &self,
        limit: u32,
        offset: u64,
        requester: Option<&str>,
    ) -> OrchestratorResult<(Vec<TestRecord>, u64)> {
        let total: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM tests WHERE ($1::text IS NULL OR requester = $1)",
        )
        .bind(requester)
        .fetch_one(&self.pool)
        .await?
        .try_get("n")
        .map_err(OrchestratorError::from)?;

        let rows = sqlx::query_as::<_, TestRow>(
            r#"
            SELECT * FROM tests
            WHERE ($1::text IS NULL OR requester = $1)
            ORDER BY created_at DESC, test_id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(requester)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let tests = rows
            .into_iter()
            .map(TestRow::into_record)
            .collect::<OrchestratorResult<Vec<_>>>()?;
        Ok((tests, total as u64))
    }

    async fn list_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        requester: Option<&str>,
    ) -> OrchestratorResult<Vec<TestRecord>> {
        let rows = sqlx::query_as::<_, TestRow>(
            r#"
            SELECT * FROM tests
            WHERE created_at >= $1 AND created_at < $2
              AND ($3::text IS NULL OR requester = $3)
            ORDER BY created_at ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(requester)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TestRow::into_record).collect()
    }

    async fn list_by_status(&self, status: TestStatus) -> OrchestratorResult<Vec<TestRecord>> {
        let rows = sqlx::query_as::<_, TestRow>(
            "SELECT * FROM tests WHERE status = $1 ORDER BY created_at ASC",
        )
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TestRow::into_record).collect()
    }

    async fn add_assigned(&self, test_id: &str, worker_id: &str) -> OrchestratorResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tests
            SET assigned_workers = array_append(assigned_workers, $2)
            WHERE test_id = $1 AND NOT ($2 = ANY(assigned_workers))
            "#,
        )
        .bind(test_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        // Zero rows either means idempotent no-op or unknown test
        if result.rows_affected() == 0 {
            self.get(test_id).await?;
        }
        Ok(())
    }

    async fn add_completed(&self, test_id: &str, worker_id: &str) -> OrchestratorResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tests
            SET completed_workers = array_append(completed_workers, $2)
            WHERE test_id = $1
              AND NOT ($2 = ANY(completed_workers))
              AND NOT ($2 = ANY(failed_workers))
            "#,
        )
        .bind(test_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.get(test_id).await?;
        }
        Ok(())
    }

    async fn add_failed(&self, test_id: &str, worker_id: &str) -> OrchestratorResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tests
            SET failed_workers = array_append(failed_workers, $2)
            WHERE test_id = $1
              AND NOT ($2 = ANY(failed_workers))
              AND NOT ($2 = ANY(completed_workers))
            "#,
        )
        .bind(test_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.get(test_id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for PostgresStore {
    async fn upsert_raw(&self, raw: RawResult) -> OrchestratorResult<()> {
        let status_codes = serde_json::to_value(&raw.status_codes)?;
        sqlx::query(
            r#"
            INSERT INTO raw_results (
                test_id, worker_id, metrics_json, total_requests,
                completed_requests, duration_ms, success_rate,
                avg_latency_ms, p95_latency_ms, status_codes, received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (test_id, worker_id) DO UPDATE SET
                metrics_json = EXCLUDED.metrics_json,
                total_requests = EXCLUDED.total_requests,
                completed_requests = EXCLUDED.completed_requests,
                duration_ms = EXCLUDED.duration_ms,
                success_rate = EXCLUDED.success_rate,
                avg_latency_ms = EXCLUDED.avg_latency_ms,
                p95_latency_ms = EXCLUDED.p95_latency_ms,
                status_codes = EXCLUDED.status_codes,
                received_at = EXCLUDED.received_at
            "#,
        )
        .bind(&raw.test_id)
        .bind(&raw.worker_id)
        .bind(&raw.metrics_json)
        .bind(raw.total_requests as i64)
        .bind(raw.completed_requests as i64)
        .bind(raw.duration_ms as i64)
        .bind(raw.success_rate)
        .bind(raw.avg_latency_ms)
        .bind(raw.p95_latency_ms)
        .bind(status_codes)
        .bind(raw.received_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_raw_for_test(&self, test_id: &str) -> OrchestratorResult<Vec<RawResult>> {
        let rows = sqlx::query_as::<_, RawResultRow>(
            "SELECT * FROM raw_results WHERE test_id = $1 ORDER BY worker_id ASC",
        )
        .bind(test_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RawResultRow::into_raw).collect()
    }

    async fn upsert_aggregate(&self, aggregate: AggregatedResult) -> OrchestratorResult<()> {
        let status_codes = serde_json::to_value(&aggregate.status_codes)?;
        sqlx::query(
            r#"
            INSERT INTO aggregated_results (
                test_id, total_requests, successful_requests, failed_requests,
                avg_latency_ms, p95_latency_ms, duration_ms, status_codes,
                overall_status, worker_count, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (test_id) DO UPDATE SET
                total_requests = EXCLUDED.total_requests,
                successful_requests = EXCLUDED.successful_requests,
                failed_requests = EXCLUDED.failed_requests,
                avg_latency_ms = EXCLUDED.avg_latency_ms,
                p95_latency_ms = EXCLUDED.p95_latency_ms,
                duration_ms = EXCLUDED.duration_ms,
                status_codes = EXCLUDED.status_codes,
                overall_status = EXCLUDED.overall_status,
                worker_count = EXCLUDED.worker_count,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(&aggregate.test_id)
        .bind(aggregate.total_requests as i64)
        .bind(aggregate.successful_requests as i64)
        .bind(aggregate.failed_requests as i64)
        .bind(aggregate.avg_latency_ms)
        .bind(aggregate.p95_latency_ms)
        .bind(aggregate.duration_ms as i64)
        .bind(status_codes)
        .bind(&aggregate.overall_status)
        .bind(aggregate.worker_count as i32)
        .bind(aggregate.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_aggregate(
        &self,
        test_id: &str,
    ) -> OrchestratorResult<Option<AggregatedResult>> {
        let row = sqlx::query_as::<_, AggregateRow>(
            "SELECT * FROM aggregated_results WHERE test_id = $1",
        )
        .bind(test_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AggregateRow::into_aggregate).transpose()
    }
}
