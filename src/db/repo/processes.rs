//! Process request and event timeline operations for the repository.
//!
//! Status changes go through [`Repository::apply_status_change`], a
//! conditional update on the expected prior status that appends the matching
//! event in the same transaction.

use crate::domain::{
    format_date, EventSource, MeteringPointId, NewProcessRequest, ProcessEvent, ProcessRequest,
    ProcessStatus, TimeMs,
};
use crate::error::CoreError;
use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use super::{get_parsed, is_unique_violation, Repository};

/// Side effect committed atomically with a status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionEffect {
    None,
    OpenSupply { start_date: NaiveDate },
    CloseSupply { end_date: NaiveDate },
    TerminateContract,
}

/// A conditional status update plus the event describing it.
#[derive(Debug, Clone)]
pub struct StatusChange<'a> {
    pub process_id: i64,
    pub expected: ProcessStatus,
    pub next: ProcessStatus,
    pub event_type: &'a str,
    pub payload: serde_json::Value,
    pub source: EventSource,
    pub now: TimeMs,
    pub external_correlation_id: Option<&'a str>,
    pub cancel_correlation_id: Option<&'a str>,
    pub effect: TransitionEffect,
}

const PROCESS_SELECT: &str = r#"
    SELECT id, process_type, metering_point_id, status, effective_date,
           external_correlation_id, cancel_correlation_id, created_at, updated_at
    FROM process_requests
"#;

impl Repository {
    /// Insert a pending process and its `created` event.
    ///
    /// # Errors
    /// `Conflict` if the metering point already has a non-terminal process.
    pub async fn insert_process(
        &self,
        request: &NewProcessRequest,
        source: EventSource,
        now: TimeMs,
    ) -> Result<ProcessRequest, CoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO process_requests
            (process_type, metering_point_id, status, effective_date, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(request.process_type.as_str())
        .bind(request.metering_point_id.as_str())
        .bind(ProcessStatus::Pending.as_str())
        .bind(format_date(request.effective_date))
        .bind(now.as_ms())
        .bind(now.as_ms())
        .execute(&mut *tx)
        .await;

        let process_id = match inserted {
            Ok(done) => done.last_insert_rowid(),
            Err(e) if is_unique_violation(&e) => {
                return Err(CoreError::Conflict(format!(
                    "metering point {} already has an open process",
                    request.metering_point_id
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let payload = serde_json::json!({
            "process_type": request.process_type.as_str(),
            "effective_date": format_date(request.effective_date),
        });
        append_event_tx(&mut tx, process_id, "created", &payload, source, now).await?;

        let process = fetch_process_tx(&mut tx, process_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("process {}", process_id)))?;
        tx.commit().await?;
        Ok(process)
    }

    /// Apply a conditional status change.
    ///
    /// # Errors
    /// - `ConcurrencyConflict` when the stored status is not `expected`
    /// - `NotFound` when the process does not exist
    /// - `Conflict` when the new status would leave two open processes on a point
    pub async fn apply_status_change(
        &self,
        change: &StatusChange<'_>,
    ) -> Result<ProcessRequest, CoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE process_requests
            SET status = ?,
                updated_at = ?,
                external_correlation_id = COALESCE(?, external_correlation_id),
                cancel_correlation_id = COALESCE(?, cancel_correlation_id)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(change.next.as_str())
        .bind(change.now.as_ms())
        .bind(change.external_correlation_id)
        .bind(change.cancel_correlation_id)
        .bind(change.process_id)
        .bind(change.expected.as_str())
        .execute(&mut *tx)
        .await;
        let updated = match updated {
            Ok(done) => done,
            Err(e) if is_unique_violation(&e) => {
                return Err(CoreError::Conflict(format!(
                    "process {} cannot become {}: its metering point already has an open process",
                    change.process_id, change.next
                )))
            }
            Err(e) => return Err(e.into()),
        };

        if updated.rows_affected() == 0 {
            let current = fetch_process_tx(&mut tx, change.process_id).await?;
            tx.rollback().await?;
            return Err(match current {
                Some(process) => CoreError::ConcurrencyConflict {
                    process_id: change.process_id,
                    expected: change.expected,
                    actual: process.status,
                },
                None => CoreError::NotFound(format!("process {}", change.process_id)),
            });
        }

        append_event_tx(
            &mut tx,
            change.process_id,
            change.event_type,
            &change.payload,
            change.source,
            change.now,
        )
        .await?;

        let process = fetch_process_tx(&mut tx, change.process_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("process {}", change.process_id)))?;

        match &change.effect {
            TransitionEffect::None => {}
            TransitionEffect::OpenSupply { start_date } => {
                Self::open_supply_period_tx(
                    &mut tx,
                    &process.metering_point_id,
                    *start_date,
                    change.now,
                )
                .await?;
            }
            TransitionEffect::CloseSupply { end_date } => {
                Self::close_supply_period_tx(&mut tx, &process.metering_point_id, *end_date)
                    .await?;
            }
            TransitionEffect::TerminateContract => {
                Self::terminate_contract_tx(&mut tx, &process.metering_point_id).await?;
            }
        }

        tx.commit().await?;
        Ok(process)
    }

    /// Claim a pending process for sending to the hub.
    ///
    /// Returns `false` when the process is no longer pending or another caller
    /// holds a claim taken at or after `stale_before`.
    pub async fn claim_send(
        &self,
        process_id: i64,
        stale_before: TimeMs,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let claimed = sqlx::query(
            r#"
            UPDATE process_requests
            SET send_claimed_at = ?
            WHERE id = ? AND status = 'pending'
              AND (send_claimed_at IS NULL OR send_claimed_at < ?)
            "#,
        )
        .bind(now.as_ms())
        .bind(process_id)
        .bind(stale_before.as_ms())
        .execute(&self.pool)
        .await?;
        Ok(claimed.rows_affected() == 1)
    }

    /// Drop a send claim after the hub call failed.
    pub async fn release_send_claim(&self, process_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE process_requests SET send_claimed_at = NULL WHERE id = ? AND status = 'pending'",
        )
        .bind(process_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_process(&self, process_id: i64) -> Result<Option<ProcessRequest>, sqlx::Error> {
        let row = sqlx::query(&format!("{} WHERE id = ?", PROCESS_SELECT))
            .bind(process_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(process_from_row).transpose()
    }

    /// Process whose outbound request or cancellation carries `correlation_id`.
    pub async fn find_process_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<ProcessRequest>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "{} WHERE external_correlation_id = ? OR cancel_correlation_id = ? ORDER BY id DESC LIMIT 1",
            PROCESS_SELECT
        ))
        .bind(correlation_id)
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(process_from_row).transpose()
    }

    /// The non-terminal process of a metering point, if any.
    pub async fn open_process_for_point(
        &self,
        id: &MeteringPointId,
    ) -> Result<Option<ProcessRequest>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "{} WHERE metering_point_id = ? AND status NOT IN ('completed', 'rejected', 'cancelled', 'final_settled')",
            PROCESS_SELECT
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(process_from_row).transpose()
    }

    /// Latest process of a point in `status`.
    pub async fn latest_process_with_status(
        &self,
        id: &MeteringPointId,
        status: ProcessStatus,
    ) -> Result<Option<ProcessRequest>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "{} WHERE metering_point_id = ? AND status = ? ORDER BY id DESC LIMIT 1",
            PROCESS_SELECT
        ))
        .bind(id.as_str())
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(process_from_row).transpose()
    }

    /// `effectuation_pending` processes whose effective date is on or before `today`.
    pub async fn due_effectuations(
        &self,
        today: NaiveDate,
    ) -> Result<Vec<ProcessRequest>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "{} WHERE status = ? AND effective_date <= ? ORDER BY effective_date ASC, id ASC",
            PROCESS_SELECT
        ))
        .bind(ProcessStatus::EffectuationPending.as_str())
        .bind(format_date(today))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(process_from_row).collect()
    }

    /// Number of non-terminal processes per metering point, for invariant checks.
    pub async fn max_open_processes_per_point(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(n), 0) AS max_open FROM (
                SELECT COUNT(*) AS n FROM process_requests
                WHERE status NOT IN ('completed', 'rejected', 'cancelled', 'final_settled')
                GROUP BY metering_point_id
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        row.try_get("max_open")
    }

    /// Event timeline of a process, oldest first.
    pub async fn process_events(&self, process_id: i64) -> Result<Vec<ProcessEvent>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, process_request_id, occurred_at, event_type, payload, source
            FROM process_events
            WHERE process_request_id = ?
            ORDER BY occurred_at ASC, id ASC
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let payload: String = row.try_get("payload")?;
                Ok(ProcessEvent {
                    id: row.try_get("id")?,
                    process_request_id: row.try_get("process_request_id")?,
                    occurred_at: TimeMs::new(row.try_get("occurred_at")?),
                    event_type: row.try_get("event_type")?,
                    payload: serde_json::from_str(&payload)
                        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
                    source: get_parsed(row, "source")?,
                })
            })
            .collect()
    }
}

/// Append an event; `occurred_at` never goes below the process's last event.
async fn append_event_tx(
    tx: &mut Transaction<'_, Sqlite>,
    process_id: i64,
    event_type: &str,
    payload: &serde_json::Value,
    source: EventSource,
    now: TimeMs,
) -> Result<(), sqlx::Error> {
    let last: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(occurred_at) FROM process_events WHERE process_request_id = ?",
    )
    .bind(process_id)
    .fetch_one(&mut **tx)
    .await?;
    let occurred_at = last.map_or(now.as_ms(), |last| last.max(now.as_ms()));

    sqlx::query(
        r#"
        INSERT INTO process_events (process_request_id, occurred_at, event_type, payload, source)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(process_id)
    .bind(occurred_at)
    .bind(event_type)
    .bind(payload.to_string())
    .bind(source.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn fetch_process_tx(
    tx: &mut Transaction<'_, Sqlite>,
    process_id: i64,
) -> Result<Option<ProcessRequest>, sqlx::Error> {
    let row = sqlx::query(&format!("{} WHERE id = ?", PROCESS_SELECT))
        .bind(process_id)
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(process_from_row).transpose()
}

fn process_from_row(row: &SqliteRow) -> Result<ProcessRequest, sqlx::Error> {
    Ok(ProcessRequest {
        id: row.try_get("id")?,
        process_type: get_parsed(row, "process_type")?,
        metering_point_id: MeteringPointId::new(row.try_get::<String, _>("metering_point_id")?),
        status: get_parsed(row, "status")?,
        effective_date: get_parsed(row, "effective_date")?,
        external_correlation_id: row.try_get("external_correlation_id")?,
        cancel_correlation_id: row.try_get("cancel_correlation_id")?,
        created_at: TimeMs::new(row.try_get("created_at")?),
        updated_at: TimeMs::new(row.try_get("updated_at")?),
    })
}
