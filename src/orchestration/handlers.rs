//! Message handlers, dispatched by (queue, message kind).
//!
//! Handlers run before the message id is recorded as processed, so each one
//! must tolerate seeing the same business event twice: process handlers treat
//! "already in the target status" as done, metering and market data are
//! upserts.

use crate::db::Repository;
use crate::domain::{
    next_status, AckOutcome, EventSource, InboundMessage, MessageKind, MeteringSample,
    OverrideAction, ParsedMessage, ProcessRequest, QueueName, SpotPrice, TariffVersion, TimeMs,
    TransitionEvent,
};
use crate::error::CoreError;
use crate::market::MarketRules;
use crate::orchestration::lifecycle::ProcessService;
use async_trait::async_trait;
use chrono_tz::Tz;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Retrying cannot help; the message is dead-lettered.
    #[error("{0}")]
    Permanent(String),
    /// The message stays queued for the next poll.
    #[error("{0}")]
    Retryable(String),
}

impl From<CoreError> for HandlerError {
    fn from(err: CoreError) -> Self {
        if err.is_retryable() {
            HandlerError::Retryable(err.to_string())
        } else {
            HandlerError::Permanent(err.to_string())
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync + fmt::Debug {
    async fn handle(
        &self,
        message: &InboundMessage,
        parsed: &ParsedMessage,
        now: TimeMs,
    ) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(QueueName, MessageKind), Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        queue: QueueName,
        kind: MessageKind,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.handlers.insert((queue, kind), handler);
        self
    }

    pub fn get(&self, queue: QueueName, kind: MessageKind) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(&(queue, kind)).cloned()
    }

    /// Handlers for every queue the hub delivers on.
    pub fn standard(
        processes: ProcessService,
        repo: Arc<Repository>,
        rules: MarketRules,
        tz: Tz,
    ) -> Self {
        let processes = Arc::new(processes);
        Self::new()
            .register(
                QueueName::Process,
                MessageKind::ProcessAcknowledgement,
                Arc::new(AcknowledgementHandler {
                    processes: processes.clone(),
                }),
            )
            .register(
                QueueName::Process,
                MessageKind::MarketOverride,
                Arc::new(MarketOverrideHandler { processes }),
            )
            .register(
                QueueName::Metering,
                MessageKind::MeteringData,
                Arc::new(MeteringHandler {
                    repo: repo.clone(),
                    rules,
                    tz,
                }),
            )
            .register(
                QueueName::MarketData,
                MessageKind::PriceUpdate,
                Arc::new(PriceHandler { repo: repo.clone() }),
            )
            .register(
                QueueName::MarketData,
                MessageKind::TariffUpdate,
                Arc::new(TariffHandler { repo }),
            )
    }
}

/// Advances a process on a hub acknowledgement, rejection, confirmation or
/// cancel acknowledgement.
#[derive(Debug)]
pub struct AcknowledgementHandler {
    processes: Arc<ProcessService>,
}

#[async_trait]
impl MessageHandler for AcknowledgementHandler {
    async fn handle(
        &self,
        message: &InboundMessage,
        parsed: &ParsedMessage,
        now: TimeMs,
    ) -> Result<(), HandlerError> {
        let ParsedMessage::Acknowledgement(ack) = parsed else {
            return Err(unexpected(parsed, message));
        };
        let process = find_process(&self.processes, &ack.correlation_id).await?;
        let event = match ack.outcome {
            AckOutcome::Acknowledged => TransitionEvent::Acknowledge,
            AckOutcome::Rejected => TransitionEvent::Reject,
            AckOutcome::Confirmed => TransitionEvent::Confirm,
            AckOutcome::CancelAcknowledged => TransitionEvent::AcknowledgeCancel,
        };
        let payload = json!({
            "message_id": message.id,
            "correlation_id": ack.correlation_id,
            "reason": ack.reason,
        });
        advance(&self.processes, &process, event, payload, now).await
    }
}

/// Completes or auto-cancels a process on a market override notice.
#[derive(Debug)]
pub struct MarketOverrideHandler {
    processes: Arc<ProcessService>,
}

#[async_trait]
impl MessageHandler for MarketOverrideHandler {
    async fn handle(
        &self,
        message: &InboundMessage,
        parsed: &ParsedMessage,
        now: TimeMs,
    ) -> Result<(), HandlerError> {
        let ParsedMessage::Override(notice) = parsed else {
            return Err(unexpected(parsed, message));
        };
        let process = find_process(&self.processes, &notice.correlation_id).await?;
        let event = match notice.action {
            OverrideAction::Effectuated => TransitionEvent::Complete,
            OverrideAction::AutoCancelled => TransitionEvent::AutoCancel,
        };
        let payload = json!({
            "message_id": message.id,
            "correlation_id": notice.correlation_id,
            "reason": notice.reason,
        });
        advance(&self.processes, &process, event, payload, now).await
    }
}

/// Stores a metering batch as an upsert keyed by (point, timestamp).
#[derive(Debug)]
pub struct MeteringHandler {
    repo: Arc<Repository>,
    rules: MarketRules,
    tz: Tz,
}

#[async_trait]
impl MessageHandler for MeteringHandler {
    async fn handle(
        &self,
        message: &InboundMessage,
        parsed: &ParsedMessage,
        now: TimeMs,
    ) -> Result<(), HandlerError> {
        let ParsedMessage::Metering(batch) = parsed else {
            return Err(unexpected(parsed, message));
        };
        let Some(first) = batch.observations.first() else {
            return Err(HandlerError::Permanent("empty metering batch".to_string()));
        };
        let reading_date = first.timestamp.to_datetime().with_timezone(&self.tz).date_naive();

        let check = self
            .rules
            .can_receive_metering(&batch.metering_point_id, reading_date)
            .await?;
        if !check.valid {
            return Err(HandlerError::Permanent(check.reason.unwrap_or_default()));
        }

        let samples: Vec<MeteringSample> = batch
            .observations
            .iter()
            .map(|o| MeteringSample {
                metering_point_id: batch.metering_point_id.clone(),
                timestamp: o.timestamp,
                resolution: batch.resolution,
                quantity: o.quantity,
                quality_code: o.quality_code,
                source_message_id: message.id.clone(),
            })
            .collect();

        let outcome = self
            .repo
            .upsert_samples(&samples, now)
            .await
            .map_err(CoreError::from)?;
        info!(
            message_id = %message.id,
            metering_point = %batch.metering_point_id,
            inserted = outcome.inserted,
            revised = outcome.revised,
            unchanged = outcome.unchanged,
            "metering batch stored"
        );
        Ok(())
    }
}

#[derive(Debug)]
pub struct PriceHandler {
    repo: Arc<Repository>,
}

#[async_trait]
impl MessageHandler for PriceHandler {
    async fn handle(
        &self,
        message: &InboundMessage,
        parsed: &ParsedMessage,
        _now: TimeMs,
    ) -> Result<(), HandlerError> {
        let ParsedMessage::Prices(update) = parsed else {
            return Err(unexpected(parsed, message));
        };
        let prices: Vec<SpotPrice> = update
            .points
            .iter()
            .map(|(timestamp, price)| SpotPrice {
                price_area: update.price_area.clone(),
                timestamp: *timestamp,
                resolution: update.resolution,
                price: *price,
            })
            .collect();
        let stored = self
            .repo
            .upsert_spot_prices(&prices)
            .await
            .map_err(CoreError::from)?;
        debug!(message_id = %message.id, price_area = %update.price_area, stored, "spot prices stored");
        Ok(())
    }
}

#[derive(Debug)]
pub struct TariffHandler {
    repo: Arc<Repository>,
}

#[async_trait]
impl MessageHandler for TariffHandler {
    async fn handle(
        &self,
        message: &InboundMessage,
        parsed: &ParsedMessage,
        _now: TimeMs,
    ) -> Result<(), HandlerError> {
        let ParsedMessage::Tariff(update) = parsed else {
            return Err(unexpected(parsed, message));
        };
        let version = TariffVersion {
            scope: update.scope.clone(),
            charge_type: update.charge_type,
            valid_from: update.valid_from,
            valid_to: update.valid_to,
            rates: update.rates.clone(),
        };
        self.repo
            .upsert_tariff_version(&version)
            .await
            .map_err(CoreError::from)?;
        info!(
            message_id = %message.id,
            scope = %version.scope,
            charge_type = %version.charge_type,
            valid_from = %version.valid_from,
            "tariff version stored"
        );
        Ok(())
    }
}

async fn find_process(
    processes: &ProcessService,
    correlation_id: &str,
) -> Result<ProcessRequest, HandlerError> {
    processes
        .find_by_correlation(correlation_id)
        .await?
        .ok_or_else(|| HandlerError::Permanent(format!("unknown correlation id {}", correlation_id)))
}

/// Apply `event` unless the process already reached its target status.
async fn advance(
    processes: &ProcessService,
    process: &ProcessRequest,
    event: TransitionEvent,
    payload: serde_json::Value,
    now: TimeMs,
) -> Result<(), HandlerError> {
    if process.status == event.target() {
        debug!(process_id = process.id, status = %process.status, "event already applied");
        return Ok(());
    }
    next_status(process.status, event)
        .map_err(|illegal| HandlerError::Permanent(format!("process {}: {}", process.id, illegal)))?;
    processes
        .transition(process.id, process.status, event, payload, EventSource::Hub, now)
        .await?;
    Ok(())
}

fn unexpected(parsed: &ParsedMessage, message: &InboundMessage) -> HandlerError {
    HandlerError::Permanent(format!(
        "handler cannot process {} payload of message {}",
        parsed.kind(),
        message.id
    ))
}
