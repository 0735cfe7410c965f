//! Process lifecycle service.
//!
//! Every transition names the status it expects the process to be in. The
//! store applies it with a conditional update, so a stale caller gets
//! `ConcurrencyConflict` instead of silently overwriting a newer status.

use crate::db::{Repository, StatusChange, TransitionEffect};
use crate::domain::{
    next_status, EventSource, NewProcessRequest, ProcessEvent, ProcessRequest, ProcessStatus,
    TimeMs, TransitionEvent,
};
use crate::error::CoreError;
use crate::gateway::{HubGateway, OutboundRequest, RequestAction};
use crate::market::MarketRules;
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ProcessService {
    repo: Arc<Repository>,
    gateway: Arc<dyn HubGateway>,
    rules: MarketRules,
    send_lease: Duration,
}

/// Result of one auto-effectuation tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectuationSummary {
    pub completed: usize,
    pub conflicts: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct Extras<'a> {
    external_correlation_id: Option<&'a str>,
    cancel_correlation_id: Option<&'a str>,
    effect: Option<TransitionEffect>,
}

impl ProcessService {
    pub fn new(
        repo: Arc<Repository>,
        gateway: Arc<dyn HubGateway>,
        rules: MarketRules,
        send_lease: Duration,
    ) -> Self {
        Self {
            repo,
            gateway,
            rules,
            send_lease,
        }
    }

    /// Create a pending process after the market rules allow it.
    ///
    /// # Errors
    /// - `Conflict` if the point already has a non-terminal process
    /// - `Validation` if the market rules reject the request
    pub async fn create(
        &self,
        request: &NewProcessRequest,
        today: NaiveDate,
        now: TimeMs,
    ) -> Result<ProcessRequest, CoreError> {
        if let Some(open) = self
            .repo
            .open_process_for_point(&request.metering_point_id)
            .await?
        {
            return Err(CoreError::Conflict(format!(
                "metering point {} already has open process {} ({})",
                request.metering_point_id, open.id, open.status
            )));
        }

        let check = if request.process_type.starts_supply() {
            self.rules
                .can_change_supplier(&request.metering_point_id, today)
                .await?
        } else {
            self.rules
                .can_end_supply(&request.metering_point_id, today)
                .await?
        };
        check.into_result()?;

        let process = self
            .repo
            .insert_process(request, EventSource::Operator, now)
            .await?;
        info!(
            process_id = process.id,
            process_type = %process.process_type,
            metering_point = %process.metering_point_id,
            effective_date = %process.effective_date,
            "process created"
        );
        Ok(process)
    }

    /// Send a pending request to the hub.
    ///
    /// The row is claimed before the hub call, so only one caller sends a
    /// given process. A claim older than the lease may be taken over.
    /// A synchronous refusal is recorded as `sent` followed by `rejected`.
    ///
    /// # Errors
    /// - `ConcurrencyConflict` if the process is no longer pending
    /// - `Conflict` if another caller is sending it right now
    pub async fn send_request(
        &self,
        process_id: i64,
        now: TimeMs,
    ) -> Result<ProcessRequest, CoreError> {
        let process = self.require(process_id).await?;
        if process.status != ProcessStatus::Pending {
            return Err(CoreError::ConcurrencyConflict {
                process_id,
                expected: ProcessStatus::Pending,
                actual: process.status,
            });
        }

        if !self
            .repo
            .claim_send(process_id, now.minus(self.send_lease), now)
            .await?
        {
            let current = self.require(process_id).await?;
            if current.status != ProcessStatus::Pending {
                return Err(CoreError::ConcurrencyConflict {
                    process_id,
                    expected: ProcessStatus::Pending,
                    actual: current.status,
                });
            }
            return Err(CoreError::Conflict(format!(
                "process {} is already being sent",
                process_id
            )));
        }

        let sent = self
            .gateway
            .send(&OutboundRequest {
                action: RequestAction::Initiate,
                process_type: process.process_type,
                metering_point_id: process.metering_point_id.clone(),
                effective_date: process.effective_date,
                original_correlation_id: None,
            })
            .await;
        let receipt = match sent {
            Ok(receipt) => receipt,
            Err(e) => {
                self.repo.release_send_claim(process_id).await?;
                return Err(e.into());
            }
        };

        let sent = self
            .apply(
                &process,
                ProcessStatus::Pending,
                TransitionEvent::Send,
                json!({ "correlation_id": receipt.correlation_id }),
                EventSource::System,
                now,
                Extras {
                    external_correlation_id: Some(&receipt.correlation_id),
                    ..Extras::default()
                },
            )
            .await?;

        if receipt.accepted {
            return Ok(sent);
        }
        let reason = receipt
            .rejection_reason
            .unwrap_or_else(|| "rejected by hub".to_string());
        self.reject(process_id, ProcessStatus::Sent, &reason, EventSource::Hub, now)
            .await
    }

    /// Apply `event` to a process expected to be in `expected`.
    ///
    /// Completion opens or closes supply depending on the process type;
    /// final settlement terminates the contract.
    pub async fn transition(
        &self,
        process_id: i64,
        expected: ProcessStatus,
        event: TransitionEvent,
        payload: Value,
        source: EventSource,
        now: TimeMs,
    ) -> Result<ProcessRequest, CoreError> {
        let process = self.require(process_id).await?;
        self.apply(
            &process,
            expected,
            event,
            payload,
            source,
            now,
            Extras::default(),
        )
        .await
    }

    pub async fn acknowledge(
        &self,
        process_id: i64,
        source: EventSource,
        now: TimeMs,
    ) -> Result<ProcessRequest, CoreError> {
        self.transition(
            process_id,
            ProcessStatus::Sent,
            TransitionEvent::Acknowledge,
            json!({}),
            source,
            now,
        )
        .await
    }

    pub async fn reject(
        &self,
        process_id: i64,
        expected: ProcessStatus,
        reason: &str,
        source: EventSource,
        now: TimeMs,
    ) -> Result<ProcessRequest, CoreError> {
        self.transition(
            process_id,
            expected,
            TransitionEvent::Reject,
            json!({ "reason": reason }),
            source,
            now,
        )
        .await
    }

    pub async fn confirm(
        &self,
        process_id: i64,
        source: EventSource,
        now: TimeMs,
    ) -> Result<ProcessRequest, CoreError> {
        self.transition(
            process_id,
            ProcessStatus::Acknowledged,
            TransitionEvent::Confirm,
            json!({}),
            source,
            now,
        )
        .await
    }

    pub async fn complete(
        &self,
        process_id: i64,
        source: EventSource,
        now: TimeMs,
    ) -> Result<ProcessRequest, CoreError> {
        self.transition(
            process_id,
            ProcessStatus::EffectuationPending,
            TransitionEvent::Complete,
            json!({}),
            source,
            now,
        )
        .await
    }

    /// Ask the hub to cancel a process awaiting effectuation.
    ///
    /// The hub's later cancel acknowledgement matches on the stored
    /// cancellation correlation id.
    pub async fn request_cancel(
        &self,
        process_id: i64,
        reason: &str,
        now: TimeMs,
    ) -> Result<ProcessRequest, CoreError> {
        let process = self.require(process_id).await?;
        if process.status != ProcessStatus::EffectuationPending {
            return Err(CoreError::ConcurrencyConflict {
                process_id,
                expected: ProcessStatus::EffectuationPending,
                actual: process.status,
            });
        }

        let receipt = self
            .gateway
            .send(&OutboundRequest {
                action: RequestAction::Cancel,
                process_type: process.process_type,
                metering_point_id: process.metering_point_id.clone(),
                effective_date: process.effective_date,
                original_correlation_id: process.external_correlation_id.clone(),
            })
            .await?;
        if !receipt.accepted {
            return Err(CoreError::Validation(format!(
                "hub refused cancellation of process {}: {}",
                process_id,
                receipt.rejection_reason.as_deref().unwrap_or("no reason given")
            )));
        }

        self.apply(
            &process,
            ProcessStatus::EffectuationPending,
            TransitionEvent::RequestCancel,
            json!({ "reason": reason, "cancel_correlation_id": receipt.correlation_id }),
            EventSource::Operator,
            now,
            Extras {
                cancel_correlation_id: Some(&receipt.correlation_id),
                ..Extras::default()
            },
        )
        .await
    }

    pub async fn acknowledge_cancel(
        &self,
        process_id: i64,
        source: EventSource,
        now: TimeMs,
    ) -> Result<ProcessRequest, CoreError> {
        self.transition(
            process_id,
            ProcessStatus::CancellationPending,
            TransitionEvent::AcknowledgeCancel,
            json!({}),
            source,
            now,
        )
        .await
    }

    /// Market-side cancellation, bypassing `cancellation_pending`.
    pub async fn auto_cancel(
        &self,
        process_id: i64,
        reason: &str,
        now: TimeMs,
    ) -> Result<ProcessRequest, CoreError> {
        self.transition(
            process_id,
            ProcessStatus::EffectuationPending,
            TransitionEvent::AutoCancel,
            json!({ "reason": reason }),
            EventSource::Hub,
            now,
        )
        .await
    }

    /// Begin offboarding a completed process; supply ends on `supply_end`.
    pub async fn start_offboarding(
        &self,
        process_id: i64,
        supply_end: NaiveDate,
        today: NaiveDate,
        now: TimeMs,
    ) -> Result<ProcessRequest, CoreError> {
        let process = self.require(process_id).await?;
        self.rules
            .can_offboard(&process.metering_point_id, today)
            .await?
            .into_result()?;

        let supply = self
            .repo
            .active_supply_period(&process.metering_point_id, today)
            .await?
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "metering point {} has no active supply period",
                    process.metering_point_id
                ))
            })?;
        if supply_end <= supply.start_date {
            return Err(CoreError::Validation(format!(
                "supply end {} is not after supply start {}",
                supply_end, supply.start_date
            )));
        }

        self.apply(
            &process,
            ProcessStatus::Completed,
            TransitionEvent::StartOffboarding,
            json!({ "supply_end": supply_end.to_string() }),
            EventSource::Operator,
            now,
            Extras {
                effect: Some(TransitionEffect::CloseSupply {
                    end_date: supply_end,
                }),
                ..Extras::default()
            },
        )
        .await
    }

    /// Close offboarding once the final period up to supply end is settled.
    pub async fn finalize_offboarding(
        &self,
        process_id: i64,
        now: TimeMs,
    ) -> Result<ProcessRequest, CoreError> {
        let process = self.require(process_id).await?;
        let supply_end = self
            .repo
            .latest_supply_period(&process.metering_point_id)
            .await?
            .and_then(|s| s.end_date)
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "metering point {} has no ended supply period",
                    process.metering_point_id
                ))
            })?;

        let final_run = self
            .repo
            .completed_run_ending_on(&process.metering_point_id, supply_end)
            .await?
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "final settlement up to {} is not completed for {}",
                    supply_end, process.metering_point_id
                ))
            })?;

        self.apply(
            &process,
            ProcessStatus::OffboardingStarted,
            TransitionEvent::FinalSettle,
            json!({ "settlement_run_id": final_run.id, "supply_end": supply_end.to_string() }),
            EventSource::System,
            now,
            Extras::default(),
        )
        .await
    }

    /// Complete every process whose effective date has arrived.
    ///
    /// Rows that moved on since they were selected are skipped; a late or
    /// repeated tick completes exactly the processes still waiting. A process
    /// that fails is counted and the tick moves on to the next one.
    pub async fn run_effectuation_tick(
        &self,
        today: NaiveDate,
        now: TimeMs,
    ) -> Result<EffectuationSummary, CoreError> {
        let mut summary = EffectuationSummary::default();
        for process in self.repo.due_effectuations(today).await? {
            let result = self
                .apply(
                    &process,
                    ProcessStatus::EffectuationPending,
                    TransitionEvent::Complete,
                    json!({ "effective_date": process.effective_date.to_string() }),
                    EventSource::Scheduler,
                    now,
                    Extras::default(),
                )
                .await;
            match result {
                Ok(_) => summary.completed += 1,
                Err(CoreError::ConcurrencyConflict {
                    process_id, actual, ..
                }) => {
                    debug!(process_id, actual = %actual, "effectuation skipped, process moved on");
                    summary.conflicts += 1;
                }
                Err(e) => {
                    error!(process_id = process.id, error = %e, "effectuation failed");
                    summary.failed += 1;
                }
            }
        }
        if summary.completed > 0 || summary.failed > 0 {
            info!(
                completed = summary.completed,
                conflicts = summary.conflicts,
                failed = summary.failed,
                "effectuation tick"
            );
        }
        Ok(summary)
    }

    pub async fn get(&self, process_id: i64) -> Result<Option<ProcessRequest>, CoreError> {
        Ok(self.repo.get_process(process_id).await?)
    }

    pub async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<ProcessRequest>, CoreError> {
        Ok(self.repo.find_process_by_correlation(correlation_id).await?)
    }

    /// Event timeline, oldest first.
    pub async fn timeline(&self, process_id: i64) -> Result<Vec<ProcessEvent>, CoreError> {
        self.require(process_id).await?;
        Ok(self.repo.process_events(process_id).await?)
    }

    async fn require(&self, process_id: i64) -> Result<ProcessRequest, CoreError> {
        self.repo
            .get_process(process_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("process {}", process_id)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        process: &ProcessRequest,
        expected: ProcessStatus,
        event: TransitionEvent,
        payload: Value,
        source: EventSource,
        now: TimeMs,
        extras: Extras<'_>,
    ) -> Result<ProcessRequest, CoreError> {
        let next = next_status(expected, event)?;
        let effect = extras
            .effect
            .unwrap_or_else(|| default_effect(event, process));

        let change = StatusChange {
            process_id: process.id,
            expected,
            next,
            event_type: event.as_str(),
            payload,
            source,
            now,
            external_correlation_id: extras.external_correlation_id,
            cancel_correlation_id: extras.cancel_correlation_id,
            effect,
        };

        match self.repo.apply_status_change(&change).await {
            Ok(updated) => {
                info!(
                    process_id = updated.id,
                    from = %expected,
                    to = %next,
                    source = source.as_str(),
                    "process transition"
                );
                Ok(updated)
            }
            Err(e @ CoreError::ConcurrencyConflict { .. }) => Err(e),
            Err(e) => {
                warn!(process_id = process.id, event = %event, error = %e, "transition failed");
                Err(e)
            }
        }
    }
}

fn default_effect(event: TransitionEvent, process: &ProcessRequest) -> TransitionEffect {
    match event {
        TransitionEvent::Complete if process.process_type.starts_supply() => {
            TransitionEffect::OpenSupply {
                start_date: process.effective_date,
            }
        }
        TransitionEvent::Complete => TransitionEffect::CloseSupply {
            end_date: process.effective_date,
        },
        TransitionEvent::FinalSettle => TransitionEffect::TerminateContract,
        _ => TransitionEffect::None,
    }
}
