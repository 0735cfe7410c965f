//! Inbound message pipeline.
//!
//! One poll handles at most one message, in this order: dedup against the
//! processed ledger, parse, dispatch, record processed, dequeue. The handler's
//! writes commit before the id is recorded, and the id is recorded before the
//! message leaves the queue, so an interrupted poll can only cause a
//! redelivery, never a lost effect.

use crate::db::Repository;
use crate::domain::{parse_message, InboundMessage, QueueName, TimeMs};
use crate::error::CoreError;
use crate::gateway::HubGateway;
use crate::orchestration::handlers::{HandlerError, HandlerRegistry};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The queue was empty.
    Empty,
    /// Already processed; removed from the queue without dispatch.
    Skipped { message_id: String },
    Processed { message_id: String },
    /// Quarantined and removed from the queue.
    DeadLettered { message_id: String, reason: String },
    /// Handler failed transiently; the message stays queued.
    Retry { message_id: String, error: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub processed: usize,
    pub skipped: usize,
    pub dead_lettered: usize,
    pub retries: usize,
}

impl PollSummary {
    fn record(&mut self, outcome: &PollOutcome) {
        match outcome {
            PollOutcome::Empty => {}
            PollOutcome::Skipped { .. } => self.skipped += 1,
            PollOutcome::Processed { .. } => self.processed += 1,
            PollOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            PollOutcome::Retry { .. } => self.retries += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.processed + self.skipped + self.dead_lettered + self.retries
    }
}

#[derive(Debug, Clone)]
pub struct IngestionPipeline {
    repo: Arc<Repository>,
    gateway: Arc<dyn HubGateway>,
    handlers: HandlerRegistry,
}

impl IngestionPipeline {
    pub fn new(
        repo: Arc<Repository>,
        gateway: Arc<dyn HubGateway>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            repo,
            gateway,
            handlers,
        }
    }

    /// Handle at most one message from `queue`.
    pub async fn poll_queue(&self, queue: QueueName, now: TimeMs) -> Result<PollOutcome, CoreError> {
        let Some(message) = self.gateway.peek(queue).await? else {
            return Ok(PollOutcome::Empty);
        };

        if let Some(recorded) = self.repo.processed_digest(&message.id).await? {
            if recorded != message.payload_digest() {
                warn!(
                    message_id = %message.id,
                    queue = %queue,
                    "redelivered message differs from the processed payload"
                );
            }
            self.gateway.dequeue(queue, &message.id).await?;
            debug!(message_id = %message.id, queue = %queue, "duplicate message skipped");
            return Ok(PollOutcome::Skipped {
                message_id: message.id,
            });
        }

        let parsed = match parse_message(&message) {
            Ok(parsed) => parsed,
            Err(e) => return self.dead_letter(message, e.to_string(), now).await,
        };

        let kind = parsed.kind();
        let Some(handler) = self.handlers.get(queue, kind) else {
            let reason = format!("no handler for {} on queue {}", kind, queue);
            return self.dead_letter(message, reason, now).await;
        };

        match handler.handle(&message, &parsed, now).await {
            Ok(()) => {
                self.repo.record_processed(&message, now).await?;
                self.gateway.dequeue(queue, &message.id).await?;
                info!(message_id = %message.id, queue = %queue, kind = %kind, "message processed");
                Ok(PollOutcome::Processed {
                    message_id: message.id,
                })
            }
            Err(HandlerError::Permanent(reason)) => self.dead_letter(message, reason, now).await,
            Err(HandlerError::Retryable(reason)) => {
                error!(
                    message_id = %message.id,
                    queue = %queue,
                    kind = %kind,
                    error = %reason,
                    "handler failed, message left for retry"
                );
                Ok(PollOutcome::Retry {
                    message_id: message.id,
                    error: reason,
                })
            }
        }
    }

    /// Poll `queue` until it is empty, a message must be retried, or `max`
    /// messages were handled.
    pub async fn poll_until_empty(
        &self,
        queue: QueueName,
        max: usize,
        now: TimeMs,
    ) -> Result<PollSummary, CoreError> {
        let mut summary = PollSummary::default();
        while summary.total() < max {
            let outcome = self.poll_queue(queue, now).await?;
            summary.record(&outcome);
            if matches!(outcome, PollOutcome::Empty | PollOutcome::Retry { .. }) {
                break;
            }
        }
        Ok(summary)
    }

    async fn dead_letter(
        &self,
        message: InboundMessage,
        reason: String,
        now: TimeMs,
    ) -> Result<PollOutcome, CoreError> {
        self.repo.insert_dead_letter(&message, &reason, now).await?;
        self.gateway.dequeue(message.queue, &message.id).await?;
        warn!(
            message_id = %message.id,
            queue = %message.queue,
            message_type = %message.message_type,
            reason = %reason,
            "message dead-lettered"
        );
        Ok(PollOutcome::DeadLettered {
            message_id: message.id,
            reason,
        })
    }
}
