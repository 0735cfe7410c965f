//! Retry, timeout and re-authentication policy around a hub gateway.

use super::{GatewayError, HubGateway, OutboundRequest, SendReceipt};
use crate::config::GatewayConfig;
use crate::domain::{InboundMessage, QueueName};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Wraps a gateway with bounded exponential backoff.
///
/// - Transient errors are retried until `max_attempts` calls have been made.
/// - `Unauthorized` triggers one credential refresh and a single further call.
/// - Every call is bounded by `call_timeout`.
/// - Once the budget is spent the last error is returned as is.
#[derive(Debug, Clone)]
pub struct RetryingGateway {
    inner: Arc<dyn HubGateway>,
    config: GatewayConfig,
}

impl RetryingGateway {
    pub fn new(inner: Arc<dyn HubGateway>, config: GatewayConfig) -> Self {
        Self { inner, config }
    }

    async fn call<T, F, Fut>(&self, label: &'static str, mut op: F) -> Result<T, GatewayError>
    where
        T: Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, GatewayError>> + Send,
    {
        match self.call_with_backoff(label, &mut op).await {
            Err(GatewayError::Unauthorized) => {
                warn!(call = label, "Hub rejected credentials, refreshing once");
                self.inner.refresh_credentials().await?;
                timed(self.config.call_timeout, op()).await
            }
            other => other,
        }
    }

    async fn call_with_backoff<T, F, Fut>(
        &self,
        label: &'static str,
        op: &mut F,
    ) -> Result<T, GatewayError>
    where
        T: Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, GatewayError>> + Send,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_backoff)
            .with_max_elapsed_time(None)
            .build();
        let attempts = AtomicU32::new(0);
        let max_attempts = self.config.max_attempts;
        let call_timeout = self.config.call_timeout;

        retry(policy, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let fut = op();
            async move {
                match timed(call_timeout, fut).await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_transient() && attempt < max_attempts => {
                        debug!(call = label, attempt, error = %e, "Transient hub error, backing off");
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => {
                        if e.is_transient() {
                            warn!(call = label, attempt, error = %e, "Hub retry budget exhausted");
                        }
                        Err(backoff::Error::permanent(e))
                    }
                }
            }
        })
        .await
    }
}

async fn timed<T, Fut>(limit: Duration, fut: Fut) -> Result<T, GatewayError>
where
    Fut: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout),
    }
}

#[async_trait]
impl HubGateway for RetryingGateway {
    async fn peek(&self, queue: QueueName) -> Result<Option<InboundMessage>, GatewayError> {
        self.call("peek", || self.inner.peek(queue)).await
    }

    async fn dequeue(&self, queue: QueueName, message_id: &str) -> Result<(), GatewayError> {
        self.call("dequeue", || self.inner.dequeue(queue, message_id))
            .await
    }

    async fn send(&self, request: &OutboundRequest) -> Result<SendReceipt, GatewayError> {
        self.call("send", || self.inner.send(request)).await
    }

    async fn refresh_credentials(&self) -> Result<(), GatewayError> {
        self.inner.refresh_credentials().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;

    fn fast_config(max_attempts: u32) -> GatewayConfig {
        GatewayConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            call_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mock = Arc::new(MockGateway::new());
        mock.fail_next(GatewayError::Busy { status: 503 });
        mock.fail_next(GatewayError::Busy { status: 429 });
        let gateway = RetryingGateway::new(mock.clone(), fast_config(5));

        let result = gateway.peek(QueueName::Process).await;
        assert_eq!(result, Ok(None));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_last_error_unmodified() {
        let mock = Arc::new(MockGateway::new());
        for _ in 0..3 {
            mock.fail_next(GatewayError::Busy { status: 503 });
        }
        let gateway = RetryingGateway::new(mock.clone(), fast_config(3));

        let result = gateway.peek(QueueName::Process).await;
        assert_eq!(result, Err(GatewayError::Busy { status: 503 }));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let mock = Arc::new(MockGateway::new());
        let err = GatewayError::Http {
            status: 400,
            message: "bad".to_string(),
        };
        mock.fail_next(err.clone());
        let gateway = RetryingGateway::new(mock.clone(), fast_config(5));

        assert_eq!(gateway.peek(QueueName::Process).await, Err(err));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_once_and_retries_once() {
        let mock = Arc::new(MockGateway::new());
        mock.fail_next(GatewayError::Unauthorized);
        let gateway = RetryingGateway::new(mock.clone(), fast_config(5));

        assert_eq!(gateway.peek(QueueName::Process).await, Ok(None));
        assert_eq!(mock.refresh_count(), 1);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_repeated_unauthorized_surfaces_after_single_refresh() {
        let mock = Arc::new(MockGateway::new());
        mock.fail_next(GatewayError::Unauthorized);
        mock.fail_next(GatewayError::Unauthorized);
        let gateway = RetryingGateway::new(mock.clone(), fast_config(5));

        assert_eq!(
            gateway.peek(QueueName::Process).await,
            Err(GatewayError::Unauthorized)
        );
        assert_eq!(mock.refresh_count(), 1);
        assert_eq!(mock.call_count(), 2);
    }
}
