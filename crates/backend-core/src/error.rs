use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SessionState;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Bad credentials or an expired/revoked token.
    Auth,
    /// Timeout, refused connection, DNS failure, or upstream 5xx.
    Network,
    /// The target already exists or the caller is already a member.
    Conflict,
    /// A protocol-level step failed after the gateway confirmed the operation.
    DegradedSync,
    /// Rate-limited by a remote service.
    RateLimited,
    /// Local persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload shared by every crate in the workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct BackendError {
    /// High-level error category.
    pub category: BackendErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP status when the failure came from an HTTP response.
    pub http_status: Option<u16>,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl BackendError {
    /// Construct a new backend error.
    pub fn new(
        category: BackendErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            http_status: None,
            retry_after_ms: None,
        }
    }

    /// Build an error from an HTTP status and server-supplied message.
    pub fn from_http_status(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::new(classify_http_status(status), code, message);
        err.http_status = Some(status);
        err
    }

    /// Build a transport-level failure (no HTTP status involved).
    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(BackendErrorCategory::Network, code, message)
    }

    /// Build the error returned when a bounded call runs out of time.
    pub fn timeout(operation: &str, limit: Duration) -> Self {
        Self::transport(
            "timeout",
            format!("{operation} did not complete within {} ms", limit.as_millis()),
        )
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Re-tag a secondary-step failure as degraded sync, keeping the original detail.
    pub fn into_degraded(self, operation: &str) -> Self {
        Self {
            category: BackendErrorCategory::DegradedSync,
            code: "degraded_sync".to_owned(),
            message: format!("{operation}: {} ({})", self.message, self.code),
            http_status: self.http_status,
            retry_after_ms: self.retry_after_ms,
        }
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: SessionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            BackendErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while session is in state {current:?}"),
        )
    }

    /// Network and rate-limit failures may succeed when retried later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            BackendErrorCategory::Network | BackendErrorCategory::RateLimited
        )
    }

    pub fn is_auth(&self) -> bool {
        self.category == BackendErrorCategory::Auth
    }

    pub fn is_conflict(&self) -> bool {
        self.category == BackendErrorCategory::Conflict
    }
}

/// Map HTTP status codes to backend error categories.
pub fn classify_http_status(status: u16) -> BackendErrorCategory {
    match status {
        401 | 403 => BackendErrorCategory::Auth,
        409 => BackendErrorCategory::Conflict,
        408 | 429 => BackendErrorCategory::RateLimited,
        400..=499 => BackendErrorCategory::Config,
        500..=599 => BackendErrorCategory::Network,
        _ => BackendErrorCategory::Internal,
    }
}
