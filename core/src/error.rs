// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Orchestrator error types.

use thiserror::Error;

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Orchestrator errors
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    /// Malformed submission, unknown distribution, weights mismatch,
    /// worker-id mismatch on a status stream
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown test or worker id
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation valid but the system is not in a state to serve it
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Store/bus/transport unavailable; safe to retry at the boundary
    #[error("transient: {0}")]
    Transient(String),

    /// Unrecoverable invariant violation
    #[error("fatal: {0}")]
    Fatal(String),
}

impl OrchestratorError {
    /// Whether retrying at the boundary where this arose may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the caller passed something malformed
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArgument(format!("malformed payload: {err}"))
    }
}

impl From<redis::RedisError> for OrchestratorError {
    fn from(err: redis::RedisError) -> Self {
        Self::Transient(format!("bus error: {err}"))
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transient(format!("dispatch transport error: {err}"))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) => {
                // 23505 = unique violation: a key collision, not a
                // retryable store outage
                if db_err.code().as_deref() == Some("23505") {
                    Self::FailedPrecondition(format!("duplicate key: {}", db_err.message()))
                } else {
                    Self::Transient(format!("store error: {db_err}"))
                }
            }
            other => Self::Transient(format!("store error: {other}")),
        }
    }
}
