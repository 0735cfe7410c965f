use crate::domain::{IllegalTransition, ProcessStatus};
use crate::engine::{PricingError, SettlementError};
use crate::gateway::GatewayError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy shared by every core operation.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad caller input, rejected before any state change.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Business invariant violated (e.g. duplicate open process).
    #[error("conflict: {0}")]
    Conflict(String),
    /// Conditional update found a different status than expected.
    #[error("concurrency conflict on process {process_id}: expected {expected}, found {actual}")]
    ConcurrencyConflict {
        process_id: i64,
        expected: ProcessStatus,
        actual: ProcessStatus,
    },
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("external failure: {0}")]
    TransientExternal(#[from] GatewayError),
    /// Settlement input lacks metering, price or tariff coverage.
    #[error("data incomplete: {0}")]
    DataIncomplete(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

impl CoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::ConcurrencyConflict { .. } | CoreError::Db(_) => true,
            CoreError::TransientExternal(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<SettlementError> for CoreError {
    fn from(err: SettlementError) -> Self {
        CoreError::DataIncomplete(err.to_string())
    }
}

impl From<PricingError> for CoreError {
    fn from(err: PricingError) -> Self {
        CoreError::DataIncomplete(err.to_string())
    }
}

impl From<IllegalTransition> for CoreError {
    fn from(err: IllegalTransition) -> Self {
        CoreError::Validation(err.to_string())
    }
}

/// Errors surfaced by the HTTP probe endpoints.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Internal server error: {0}")]
    Internal(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Unavailable(err.to_string())
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Db(e) => AppError::Unavailable(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_conflict_names_both_statuses() {
        let err = CoreError::ConcurrencyConflict {
            process_id: 7,
            expected: ProcessStatus::Acknowledged,
            actual: ProcessStatus::Sent,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected acknowledged"));
        assert!(msg.contains("found sent"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_business_errors_are_not_retryable() {
        assert!(!CoreError::Validation("x".into()).is_retryable());
        assert!(!CoreError::Conflict("x".into()).is_retryable());
        assert!(!CoreError::DataIncomplete("x".into()).is_retryable());
        assert!(!CoreError::TransientExternal(GatewayError::Unauthorized).is_retryable());
        assert!(CoreError::TransientExternal(GatewayError::Timeout).is_retryable());
    }

    #[test]
    fn test_unavailable_maps_to_503() {
        let response = AppError::Unavailable("db down".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
