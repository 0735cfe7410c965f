//! Inbound hub messages: envelope, declared kinds, and typed payloads.
//!
//! Parsing is strict. Anything that does not deserialize, names an unknown
//! enum value, or carries an unparseable number is reported as a
//! [`MessageParseError`] and ends up dead-lettered by the ingestion pipeline.

use crate::domain::{
    ChargeType, Decimal, MeteringPointId, PriceArea, QualityCode, Resolution, TimeMs,
};
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Inbound queue names exposed by the hub gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Process,
    Metering,
    MarketData,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Process, QueueName::Metering, QueueName::MarketData];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Process => "process",
            QueueName::Metering => "metering",
            QueueName::MarketData => "market_data",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message as peeked from a queue, payload still raw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub queue: QueueName,
    pub message_type: String,
    pub payload: String,
}

impl InboundMessage {
    /// SHA-256 of the raw payload, hex encoded.
    pub fn payload_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.payload.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Declared message types the pipeline knows how to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ProcessAcknowledgement,
    MarketOverride,
    MeteringData,
    PriceUpdate,
    TariffUpdate,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::ProcessAcknowledgement => "process_acknowledgement",
            MessageKind::MarketOverride => "market_override",
            MessageKind::MeteringData => "metering_data",
            MessageKind::PriceUpdate => "price_update",
            MessageKind::TariffUpdate => "tariff_update",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = MessageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process_acknowledgement" => Ok(MessageKind::ProcessAcknowledgement),
            "market_override" => Ok(MessageKind::MarketOverride),
            "metering_data" => Ok(MessageKind::MeteringData),
            "price_update" => Ok(MessageKind::PriceUpdate),
            "tariff_update" => Ok(MessageKind::TariffUpdate),
            other => Err(MessageParseError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageParseError {
    #[error("unknown message type {0}")]
    UnknownType(String),
    #[error("invalid json: {0}")]
    Json(String),
    #[error("invalid field {field}: {reason}")]
    Field { field: &'static str, reason: String },
}

impl MessageParseError {
    fn field(field: &'static str, reason: impl fmt::Display) -> Self {
        MessageParseError::Field {
            field,
            reason: reason.to_string(),
        }
    }
}

/// Hub answer to a request we sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    Acknowledged,
    Rejected,
    Confirmed,
    CancelAcknowledged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessAcknowledgement {
    pub correlation_id: String,
    pub outcome: AckOutcome,
    pub reason: Option<String>,
}

/// Hub-initiated change to a request awaiting effectuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    Effectuated,
    AutoCancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketOverride {
    pub correlation_id: String,
    pub action: OverrideAction,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeteringObservation {
    pub timestamp: TimeMs,
    pub quantity: Decimal,
    pub quality_code: QualityCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeteringBatch {
    pub metering_point_id: MeteringPointId,
    pub resolution: Resolution,
    pub observations: Vec<MeteringObservation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceUpdate {
    pub price_area: PriceArea,
    pub resolution: Resolution,
    pub points: Vec<(TimeMs, Decimal)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TariffUpdate {
    pub scope: String,
    pub charge_type: ChargeType,
    pub valid_from: NaiveDate,
    pub valid_to: Option<NaiveDate>,
    pub rates: Vec<Decimal>,
}

/// Payload parsed according to its declared kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedMessage {
    Acknowledgement(ProcessAcknowledgement),
    Override(MarketOverride),
    Metering(MeteringBatch),
    Prices(PriceUpdate),
    Tariff(TariffUpdate),
}

impl ParsedMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ParsedMessage::Acknowledgement(_) => MessageKind::ProcessAcknowledgement,
            ParsedMessage::Override(_) => MessageKind::MarketOverride,
            ParsedMessage::Metering(_) => MessageKind::MeteringData,
            ParsedMessage::Prices(_) => MessageKind::PriceUpdate,
            ParsedMessage::Tariff(_) => MessageKind::TariffUpdate,
        }
    }
}

// Wire shapes. Numbers travel as strings to stay lossless.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AckWire {
    correlation_id: String,
    outcome: AckOutcome,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OverrideWire {
    correlation_id: String,
    action: OverrideAction,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObservationWire {
    timestamp: String,
    quantity: String,
    #[serde(default)]
    quality: Option<QualityCode>,
}

#[derive(Debug, Deserialize)]
struct MeteringWire {
    metering_point_id: String,
    resolution: Resolution,
    observations: Vec<ObservationWire>,
}

#[derive(Debug, Deserialize)]
struct PricePointWire {
    timestamp: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct PriceWire {
    price_area: String,
    resolution: Resolution,
    points: Vec<PricePointWire>,
}

#[derive(Debug, Deserialize)]
struct TariffWire {
    scope: String,
    charge_type: ChargeType,
    valid_from: String,
    #[serde(default)]
    valid_to: Option<String>,
    rates: Vec<String>,
}

/// Parse `message.payload` according to `message.message_type`.
pub fn parse_message(message: &InboundMessage) -> Result<ParsedMessage, MessageParseError> {
    let kind = MessageKind::from_str(&message.message_type)?;
    let payload = message.payload.as_str();

    match kind {
        MessageKind::ProcessAcknowledgement => {
            let wire: AckWire = from_json(payload)?;
            if wire.correlation_id.trim().is_empty() {
                return Err(MessageParseError::field("correlation_id", "empty"));
            }
            Ok(ParsedMessage::Acknowledgement(ProcessAcknowledgement {
                correlation_id: wire.correlation_id,
                outcome: wire.outcome,
                reason: wire.reason,
            }))
        }
        MessageKind::MarketOverride => {
            let wire: OverrideWire = from_json(payload)?;
            if wire.correlation_id.trim().is_empty() {
                return Err(MessageParseError::field("correlation_id", "empty"));
            }
            Ok(ParsedMessage::Override(MarketOverride {
                correlation_id: wire.correlation_id,
                action: wire.action,
                reason: wire.reason,
            }))
        }
        MessageKind::MeteringData => {
            let wire: MeteringWire = from_json(payload)?;
            let metering_point_id = MeteringPointId::from_str(&wire.metering_point_id)
                .map_err(|e| MessageParseError::field("metering_point_id", e))?;
            if wire.observations.is_empty() {
                return Err(MessageParseError::field("observations", "empty"));
            }
            let mut observations = Vec::with_capacity(wire.observations.len());
            for obs in wire.observations {
                let timestamp = parse_timestamp(&obs.timestamp)?;
                if timestamp.as_ms() % (wire.resolution.minutes() * 60_000) != 0 {
                    return Err(MessageParseError::field(
                        "timestamp",
                        format!("{} is not aligned to {}", obs.timestamp, wire.resolution),
                    ));
                }
                let quantity = parse_decimal("quantity", &obs.quantity)?;
                if quantity.is_negative() {
                    return Err(MessageParseError::field("quantity", "negative"));
                }
                observations.push(MeteringObservation {
                    timestamp,
                    quantity,
                    quality_code: obs.quality.unwrap_or(QualityCode::Measured),
                });
            }
            Ok(ParsedMessage::Metering(MeteringBatch {
                metering_point_id,
                resolution: wire.resolution,
                observations,
            }))
        }
        MessageKind::PriceUpdate => {
            let wire: PriceWire = from_json(payload)?;
            if wire.price_area.trim().is_empty() {
                return Err(MessageParseError::field("price_area", "empty"));
            }
            let mut points = Vec::with_capacity(wire.points.len());
            for point in wire.points {
                points.push((
                    parse_timestamp(&point.timestamp)?,
                    parse_decimal("price", &point.price)?,
                ));
            }
            Ok(ParsedMessage::Prices(PriceUpdate {
                price_area: PriceArea::new(wire.price_area),
                resolution: wire.resolution,
                points,
            }))
        }
        MessageKind::TariffUpdate => {
            let wire: TariffWire = from_json(payload)?;
            let valid_from = NaiveDate::parse_from_str(&wire.valid_from, "%Y-%m-%d")
                .map_err(|e| MessageParseError::field("valid_from", e))?;
            let valid_to = wire
                .valid_to
                .as_deref()
                .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
                .transpose()
                .map_err(|e| MessageParseError::field("valid_to", e))?;
            if valid_to.is_some_and(|to| to <= valid_from) {
                return Err(MessageParseError::field("valid_to", "not after valid_from"));
            }
            if wire.rates.len() != 1 && wire.rates.len() != 24 {
                return Err(MessageParseError::field(
                    "rates",
                    format!("expected 1 or 24 rates, got {}", wire.rates.len()),
                ));
            }
            let rates = wire
                .rates
                .iter()
                .map(|r| parse_decimal("rates", r))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ParsedMessage::Tariff(TariffUpdate {
                scope: wire.scope,
                charge_type: wire.charge_type,
                valid_from,
                valid_to,
                rates,
            }))
        }
    }
}

fn from_json<'a, T: Deserialize<'a>>(payload: &'a str) -> Result<T, MessageParseError> {
    serde_json::from_str(payload).map_err(|e| MessageParseError::Json(e.to_string()))
}

fn parse_timestamp(s: &str) -> Result<TimeMs, MessageParseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| TimeMs::new(dt.timestamp_millis()))
        .map_err(|e| MessageParseError::field("timestamp", e))
}

fn parse_decimal(field: &'static str, s: &str) -> Result<Decimal, MessageParseError> {
    Decimal::from_str_canonical(s).map_err(|e| MessageParseError::field(field, e))
}
