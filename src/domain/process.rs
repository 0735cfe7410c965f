//! Market process request types and the pure lifecycle transition table.

use crate::domain::{MeteringPointId, TimeMs};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of market request sent to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    Switch,
    MoveIn,
    MoveOut,
    EndOfSupply,
}

impl ProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessType::Switch => "switch",
            ProcessType::MoveIn => "move_in",
            ProcessType::MoveOut => "move_out",
            ProcessType::EndOfSupply => "end_of_supply",
        }
    }

    /// Switch and move-in make us supplier of record on completion.
    pub fn starts_supply(&self) -> bool {
        matches!(self, ProcessType::Switch | ProcessType::MoveIn)
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "switch" => Ok(ProcessType::Switch),
            "move_in" => Ok(ProcessType::MoveIn),
            "move_out" => Ok(ProcessType::MoveOut),
            "end_of_supply" => Ok(ProcessType::EndOfSupply),
            other => Err(format!("unknown process type {}", other)),
        }
    }
}

/// Lifecycle status of a process request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Pending,
    Sent,
    Acknowledged,
    EffectuationPending,
    Completed,
    Rejected,
    CancellationPending,
    Cancelled,
    OffboardingStarted,
    FinalSettled,
}

impl ProcessStatus {
    pub const ALL: [ProcessStatus; 10] = [
        ProcessStatus::Pending,
        ProcessStatus::Sent,
        ProcessStatus::Acknowledged,
        ProcessStatus::EffectuationPending,
        ProcessStatus::Completed,
        ProcessStatus::Rejected,
        ProcessStatus::CancellationPending,
        ProcessStatus::Cancelled,
        ProcessStatus::OffboardingStarted,
        ProcessStatus::FinalSettled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Pending => "pending",
            ProcessStatus::Sent => "sent",
            ProcessStatus::Acknowledged => "acknowledged",
            ProcessStatus::EffectuationPending => "effectuation_pending",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Rejected => "rejected",
            ProcessStatus::CancellationPending => "cancellation_pending",
            ProcessStatus::Cancelled => "cancelled",
            ProcessStatus::OffboardingStarted => "offboarding_started",
            ProcessStatus::FinalSettled => "final_settled",
        }
    }

    /// Terminal for the purpose of the one-open-process-per-point rule.
    ///
    /// `Completed` is terminal even though offboarding can later leave it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed
                | ProcessStatus::Rejected
                | ProcessStatus::Cancelled
                | ProcessStatus::FinalSettled
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProcessStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown process status {}", s))
    }
}

/// Named transitions of the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionEvent {
    Send,
    Acknowledge,
    Reject,
    Confirm,
    Complete,
    RequestCancel,
    AcknowledgeCancel,
    AutoCancel,
    StartOffboarding,
    FinalSettle,
}

impl TransitionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionEvent::Send => "sent",
            TransitionEvent::Acknowledge => "acknowledged",
            TransitionEvent::Reject => "rejected",
            TransitionEvent::Confirm => "confirmed",
            TransitionEvent::Complete => "completed",
            TransitionEvent::RequestCancel => "cancel_requested",
            TransitionEvent::AcknowledgeCancel => "cancel_acknowledged",
            TransitionEvent::AutoCancel => "auto_cancelled",
            TransitionEvent::StartOffboarding => "offboarding_started",
            TransitionEvent::FinalSettle => "final_settled",
        }
    }

    /// The single status this event is legal from, when there is only one.
    ///
    /// `Reject` is legal from both `Sent` and `Acknowledged`, so callers must
    /// name the status they observed.
    pub fn canonical_source(&self) -> Option<ProcessStatus> {
        match self {
            TransitionEvent::Send => Some(ProcessStatus::Pending),
            TransitionEvent::Acknowledge => Some(ProcessStatus::Sent),
            TransitionEvent::Reject => None,
            TransitionEvent::Confirm => Some(ProcessStatus::Acknowledged),
            TransitionEvent::Complete => Some(ProcessStatus::EffectuationPending),
            TransitionEvent::RequestCancel => Some(ProcessStatus::EffectuationPending),
            TransitionEvent::AcknowledgeCancel => Some(ProcessStatus::CancellationPending),
            TransitionEvent::AutoCancel => Some(ProcessStatus::EffectuationPending),
            TransitionEvent::StartOffboarding => Some(ProcessStatus::Completed),
            TransitionEvent::FinalSettle => Some(ProcessStatus::OffboardingStarted),
        }
    }
}

impl TransitionEvent {
    /// Status a process is in after this event.
    pub fn target(&self) -> ProcessStatus {
        match self {
            TransitionEvent::Send => ProcessStatus::Sent,
            TransitionEvent::Acknowledge => ProcessStatus::Acknowledged,
            TransitionEvent::Reject => ProcessStatus::Rejected,
            TransitionEvent::Confirm => ProcessStatus::EffectuationPending,
            TransitionEvent::Complete => ProcessStatus::Completed,
            TransitionEvent::RequestCancel => ProcessStatus::CancellationPending,
            TransitionEvent::AcknowledgeCancel | TransitionEvent::AutoCancel => {
                ProcessStatus::Cancelled
            }
            TransitionEvent::StartOffboarding => ProcessStatus::OffboardingStarted,
            TransitionEvent::FinalSettle => ProcessStatus::FinalSettled,
        }
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Illegal (status, event) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transition {event} is not allowed from status {from}")]
pub struct IllegalTransition {
    pub from: ProcessStatus,
    pub event: TransitionEvent,
}

/// Pure lifecycle table: `(current, event) -> next`.
pub fn next_status(
    current: ProcessStatus,
    event: TransitionEvent,
) -> Result<ProcessStatus, IllegalTransition> {
    use ProcessStatus as S;
    use TransitionEvent as E;

    let next = match (current, event) {
        (S::Pending, E::Send) => S::Sent,
        (S::Sent, E::Acknowledge) => S::Acknowledged,
        (S::Sent, E::Reject) | (S::Acknowledged, E::Reject) => S::Rejected,
        (S::Acknowledged, E::Confirm) => S::EffectuationPending,
        (S::EffectuationPending, E::Complete) => S::Completed,
        (S::EffectuationPending, E::RequestCancel) => S::CancellationPending,
        (S::EffectuationPending, E::AutoCancel) => S::Cancelled,
        (S::CancellationPending, E::AcknowledgeCancel) => S::Cancelled,
        (S::Completed, E::StartOffboarding) => S::OffboardingStarted,
        (S::OffboardingStarted, E::FinalSettle) => S::FinalSettled,
        (from, event) => return Err(IllegalTransition { from, event }),
    };
    Ok(next)
}

/// Who caused a process event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Operator,
    Hub,
    Scheduler,
    System,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Operator => "operator",
            EventSource::Hub => "hub",
            EventSource::Scheduler => "scheduler",
            EventSource::System => "system",
        }
    }
}

impl FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operator" => Ok(EventSource::Operator),
            "hub" => Ok(EventSource::Hub),
            "scheduler" => Ok(EventSource::Scheduler),
            "system" => Ok(EventSource::System),
            other => Err(format!("unknown event source {}", other)),
        }
    }
}

/// A single market request tracked from creation to a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub id: i64,
    pub process_type: ProcessType,
    pub metering_point_id: MeteringPointId,
    pub status: ProcessStatus,
    pub effective_date: NaiveDate,
    pub external_correlation_id: Option<String>,
    pub cancel_correlation_id: Option<String>,
    pub created_at: TimeMs,
    pub updated_at: TimeMs,
}

/// Append-only timeline entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub id: i64,
    pub process_request_id: i64,
    pub occurred_at: TimeMs,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub source: EventSource,
}

/// Input for creating a process request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProcessRequest {
    pub process_type: ProcessType,
    pub metering_point_id: MeteringPointId,
    pub effective_date: NaiveDate,
}
