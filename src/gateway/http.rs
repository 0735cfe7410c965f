//! JSON-over-HTTP adapter for the market hub.

use super::{GatewayError, HubGateway, OutboundRequest, SendReceipt};
use crate::domain::{InboundMessage, QueueName};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Hub gateway speaking a small JSON API with bearer-token auth.
///
/// The token is read from `token_file` at construction and again on every
/// credential refresh, so an external process can rotate it.
#[derive(Debug)]
pub struct HttpHubGateway {
    client: Client,
    base_url: String,
    token_file: Option<String>,
    token: RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct PeekedMessage {
    id: String,
    #[serde(rename = "type")]
    message_type: String,
    payload: serde_json::Value,
}

impl HttpHubGateway {
    pub fn new(base_url: String, token_file: Option<String>) -> Result<Self, GatewayError> {
        let token = match &token_file {
            Some(path) => Some(read_token(path)?),
            None => None,
        };
        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token_file,
            token: RwLock::new(token),
        })
    }

    async fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.token.read().await.as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<Response, GatewayError> {
        let response = self
            .authorized(builder)
            .await
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response).await
    }
}

fn read_token(path: &str) -> Result<String, GatewayError> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| GatewayError::Network(format!("cannot read token file {}: {}", path, e)))
}

fn map_reqwest_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Network(e.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(GatewayError::Unauthorized);
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(GatewayError::Busy {
            status: status.as_u16(),
        });
    }
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(GatewayError::Http {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response)
}

#[async_trait]
impl HubGateway for HttpHubGateway {
    async fn peek(&self, queue: QueueName) -> Result<Option<InboundMessage>, GatewayError> {
        let url = format!("{}/queues/{}/peek", self.base_url, queue);
        debug!(queue = %queue, "Peeking hub queue");

        let response = self.execute(self.client.get(&url)).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let peeked = response
            .json::<PeekedMessage>()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))?;

        // Payload stays raw text; parsing belongs to the ingestion pipeline.
        let payload = match peeked.payload {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };

        Ok(Some(InboundMessage {
            id: peeked.id,
            queue,
            message_type: peeked.message_type,
            payload,
        }))
    }

    async fn dequeue(&self, queue: QueueName, message_id: &str) -> Result<(), GatewayError> {
        let url = format!("{}/queues/{}/messages/{}", self.base_url, queue, message_id);
        debug!(queue = %queue, message_id, "Dequeuing hub message");
        self.execute(self.client.delete(&url)).await?;
        Ok(())
    }

    async fn send(&self, request: &OutboundRequest) -> Result<SendReceipt, GatewayError> {
        let url = format!("{}/requests", self.base_url);
        debug!(
            process_type = %request.process_type,
            metering_point_id = %request.metering_point_id,
            "Sending hub request"
        );
        let response = self.execute(self.client.post(&url).json(request)).await?;
        response
            .json::<SendReceipt>()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))
    }

    async fn refresh_credentials(&self) -> Result<(), GatewayError> {
        let Some(path) = &self.token_file else {
            return Err(GatewayError::Unauthorized);
        };
        let token = read_token(path)?;
        *self.token.write().await = Some(token);
        info!("Hub credentials refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_refresh_rereads_token_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("token");
        std::fs::write(&path, "first\n").unwrap();
        let path_str = path.to_string_lossy().to_string();

        let gateway =
            HttpHubGateway::new("http://localhost:1/".to_string(), Some(path_str)).unwrap();
        assert_eq!(gateway.token.read().await.as_deref(), Some("first"));
        assert_eq!(gateway.base_url, "http://localhost:1");

        std::fs::write(&path, "second").unwrap();
        gateway.refresh_credentials().await.unwrap();
        assert_eq!(gateway.token.read().await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_refresh_without_token_file_is_unauthorized() {
        let gateway = HttpHubGateway::new("http://localhost:1".to_string(), None).unwrap();
        assert_eq!(
            gateway.refresh_credentials().await,
            Err(GatewayError::Unauthorized)
        );
    }
}
