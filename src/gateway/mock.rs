//! In-memory hub gateway for tests and local runs.

use super::{GatewayError, HubGateway, OutboundRequest, SendReceipt};
use crate::domain::{InboundMessage, QueueName};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// Mock gateway backed by in-memory queues.
///
/// Failures can be scripted per call; each scripted error is consumed by
/// exactly one call, in order, before the mock resumes normal behavior.
#[derive(Debug, Default)]
pub struct MockGateway {
    queues: Mutex<HashMap<QueueName, VecDeque<InboundMessage>>>,
    sent: Mutex<Vec<OutboundRequest>>,
    rejections: Mutex<VecDeque<String>>,
    failures: Mutex<VecDeque<GatewayError>>,
    calls: AtomicU32,
    refreshes: AtomicU32,
    next_correlation: AtomicU64,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the tail of its queue.
    pub fn push_message(&self, message: InboundMessage) {
        let mut queues = lock(&self.queues);
        queues.entry(message.queue).or_default().push_back(message);
    }

    /// Convenience for building and pushing a message.
    pub fn push(&self, queue: QueueName, id: &str, message_type: &str, payload: &str) {
        self.push_message(InboundMessage {
            id: id.to_string(),
            queue,
            message_type: message_type.to_string(),
            payload: payload.to_string(),
        });
    }

    /// Make the next `send` synchronously reject with `reason`.
    pub fn reject_next_send(&self, reason: &str) {
        lock(&self.rejections).push_back(reason.to_string());
    }

    /// Make the next call (of any kind) fail with `error`.
    pub fn fail_next(&self, error: GatewayError) {
        lock(&self.failures).push_back(error);
    }

    pub fn queue_len(&self, queue: QueueName) -> usize {
        lock(&self.queues).get(&queue).map_or(0, |q| q.len())
    }

    pub fn sent_requests(&self) -> Vec<OutboundRequest> {
        lock(&self.sent).clone()
    }

    /// Total calls made, including failed ones.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn begin_call(&self) -> Result<(), GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.failures).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl HubGateway for MockGateway {
    async fn peek(&self, queue: QueueName) -> Result<Option<InboundMessage>, GatewayError> {
        self.begin_call()?;
        Ok(lock(&self.queues)
            .get(&queue)
            .and_then(|q| q.front().cloned()))
    }

    async fn dequeue(&self, queue: QueueName, message_id: &str) -> Result<(), GatewayError> {
        self.begin_call()?;
        let mut queues = lock(&self.queues);
        if let Some(q) = queues.get_mut(&queue) {
            if let Some(pos) = q.iter().position(|m| m.id == message_id) {
                q.remove(pos);
            }
        }
        Ok(())
    }

    async fn send(&self, request: &OutboundRequest) -> Result<SendReceipt, GatewayError> {
        self.begin_call()?;
        lock(&self.sent).push(request.clone());
        let n = self.next_correlation.fetch_add(1, Ordering::SeqCst) + 1;
        let correlation_id = format!("corr-{}", n);
        match lock(&self.rejections).pop_front() {
            Some(reason) => Ok(SendReceipt {
                correlation_id,
                accepted: false,
                rejection_reason: Some(reason),
            }),
            None => Ok(SendReceipt {
                correlation_id,
                accepted: true,
                rejection_reason: None,
            }),
        }
    }

    async fn refresh_credentials(&self) -> Result<(), GatewayError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
