//! Market hub gateway abstraction: inbound queues and outbound requests.

use crate::domain::{InboundMessage, MeteringPointId, ProcessType, QueueName};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod http;
pub mod mock;
pub mod retrying;

pub use http::HttpHubGateway;
pub use mock::MockGateway;
pub use retrying::RetryingGateway;

/// Gateway to the market hub.
///
/// Implementations report raw failures; retry policy lives in
/// [`RetryingGateway`].
#[async_trait]
pub trait HubGateway: Send + Sync + fmt::Debug {
    /// Look at the head of `queue` without removing it.
    async fn peek(&self, queue: QueueName) -> Result<Option<InboundMessage>, GatewayError>;

    /// Remove a message previously returned by `peek`.
    async fn dequeue(&self, queue: QueueName, message_id: &str) -> Result<(), GatewayError>;

    /// Submit a request to the hub.
    async fn send(&self, request: &OutboundRequest) -> Result<SendReceipt, GatewayError>;

    /// Re-acquire credentials after an authorization failure.
    async fn refresh_credentials(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestAction {
    Initiate,
    Cancel,
}

/// Outbound market request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub action: RequestAction,
    pub process_type: ProcessType,
    pub metering_point_id: MeteringPointId,
    pub effective_date: NaiveDate,
    /// Correlation id of the request being cancelled.
    pub original_correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub correlation_id: String,
    pub accepted: bool,
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Hub is overloaded or temporarily failing (429, 5xx).
    #[error("hub busy (status {status})")]
    Busy { status: u16 },
    #[error("hub call timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },
    #[error("parse error: {0}")]
    Parse(String),
}

impl GatewayError {
    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Busy { .. } | GatewayError::Timeout | GatewayError::Network(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_display() {
        let err = GatewayError::Network("connection reset".to_string());
        assert_eq!(err.to_string(), "network error: connection reset");

        let err = GatewayError::Http {
            status: 400,
            message: "bad payload".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP error 400: bad payload");

        assert_eq!(GatewayError::Busy { status: 503 }.to_string(), "hub busy (status 503)");
    }

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::Busy { status: 429 }.is_transient());
        assert!(GatewayError::Timeout.is_transient());
        assert!(GatewayError::Network("x".into()).is_transient());
        assert!(!GatewayError::Unauthorized.is_transient());
        assert!(!GatewayError::Parse("x".into()).is_transient());
        assert!(!GatewayError::Http {
            status: 404,
            message: "x".into()
        }
        .is_transient());
    }
}
