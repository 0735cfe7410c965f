//! Billing period, settlement run and correction operations for the repository.

use crate::domain::{
    format_date, BillingPeriod, ChargeType, CorrectionBatch, CorrectionLine, Decimal, GridArea,
    MeteringPointId, RunStatus, SettlementLine, SettlementRun, TimeMs, TriggerType,
};
use crate::error::CoreError;
use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use super::{get_parsed, get_parsed_opt, is_unique_violation, Repository};

const RUN_SELECT: &str = r#"
    SELECT id, metering_point_id, billing_period_id, period_start, period_end, grid_area,
           version, status, revision_watermark, subtotal, vat, total, error,
           started_at, completed_at
    FROM settlement_runs
"#;

/// Settlement totals recorded when a run completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTotals {
    pub subtotal: Decimal,
    pub vat: Decimal,
    pub total: Decimal,
}

impl Repository {
    // =========================================================================
    // Settlement runs
    // =========================================================================

    /// Fail runs of a key still `running` since before `stale_before`.
    ///
    /// Returns the ids of the runs marked failed.
    pub async fn fail_stale_settlement_runs(
        &self,
        id: &MeteringPointId,
        period: BillingPeriod,
        grid_area: &GridArea,
        stale_before: TimeMs,
        now: TimeMs,
    ) -> Result<Vec<i64>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let stale: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM settlement_runs
            WHERE metering_point_id = ? AND period_start = ? AND period_end = ? AND grid_area = ?
              AND status = 'running' AND started_at < ?
            ORDER BY id ASC
            "#,
        )
        .bind(id.as_str())
        .bind(format_date(period.start))
        .bind(format_date(period.end))
        .bind(grid_area.as_str())
        .bind(stale_before.as_ms())
        .fetch_all(&mut *tx)
        .await?;

        for run_id in &stale {
            sqlx::query(
                r#"
                UPDATE settlement_runs
                SET status = 'failed', error = ?, completed_at = ?
                WHERE id = ? AND status = 'running'
                "#,
            )
            .bind("abandoned: run outlived its in-flight lease")
            .bind(now.as_ms())
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(stale)
    }

    /// Start the next version of a run for (point, period, grid area).
    ///
    /// # Errors
    /// `Conflict` if a running or completed run already holds the key.
    pub async fn begin_settlement_run(
        &self,
        id: &MeteringPointId,
        period: BillingPeriod,
        grid_area: &GridArea,
        now: TimeMs,
    ) -> Result<SettlementRun, CoreError> {
        let mut tx = self.pool.begin().await?;
        let billing_period_id = billing_period_id_tx(&mut tx, id, period).await?;

        let version: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(version), 0) + 1 FROM settlement_runs
            WHERE metering_point_id = ? AND period_start = ? AND period_end = ? AND grid_area = ?
            "#,
        )
        .bind(id.as_str())
        .bind(format_date(period.start))
        .bind(format_date(period.end))
        .bind(grid_area.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO settlement_runs
            (metering_point_id, billing_period_id, period_start, period_end, grid_area,
             version, status, revision_watermark, started_at)
            VALUES (?, ?, ?, ?, ?, ?, 'running', 0, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(billing_period_id)
        .bind(format_date(period.start))
        .bind(format_date(period.end))
        .bind(grid_area.as_str())
        .bind(version)
        .bind(now.as_ms())
        .execute(&mut *tx)
        .await;

        let run_id = match inserted {
            Ok(done) => done.last_insert_rowid(),
            Err(e) if is_unique_violation(&e) => {
                return Err(CoreError::Conflict(format!(
                    "settlement for {} {} in {} is already running or completed",
                    id, period, grid_area
                )))
            }
            Err(e) => return Err(e.into()),
        };
        tx.commit().await?;

        Ok(SettlementRun {
            id: run_id,
            metering_point_id: id.clone(),
            billing_period_id,
            period,
            grid_area: grid_area.clone(),
            version,
            status: RunStatus::Running,
            revision_watermark: 0,
            subtotal: None,
            vat: None,
            total: None,
            error: None,
            started_at: now,
            completed_at: None,
        })
    }

    /// Mark a running run completed and store its lines.
    pub async fn complete_settlement_run(
        &self,
        run_id: i64,
        revision_watermark: i64,
        lines: &[SettlementLine],
        totals: RunTotals,
        now: TimeMs,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE settlement_runs
            SET status = 'completed', revision_watermark = ?, subtotal = ?, vat = ?, total = ?,
                completed_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(revision_watermark)
        .bind(totals.subtotal.to_canonical_string())
        .bind(totals.vat.to_canonical_string())
        .bind(totals.total.to_canonical_string())
        .bind(now.as_ms())
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(CoreError::Conflict(format!(
                "settlement run {} is no longer running",
                run_id
            )));
        }

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO settlement_lines (run_id, charge_type, total_kwh, amount, vat_amount)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind(line.charge_type.as_str())
            .bind(line.total_kwh.to_canonical_string())
            .bind(line.amount.to_canonical_string())
            .bind(line.vat_amount.to_canonical_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Record a failed run; the error text stays for audit.
    pub async fn fail_settlement_run(
        &self,
        run_id: i64,
        error: &str,
        now: TimeMs,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE settlement_runs
            SET status = 'failed', error = ?, completed_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(error)
        .bind(now.as_ms())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_settlement_run(&self, run_id: i64) -> Result<Option<SettlementRun>, sqlx::Error> {
        let row = sqlx::query(&format!("{} WHERE id = ?", RUN_SELECT))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// The completed run for a key, if any.
    pub async fn completed_settlement_run(
        &self,
        id: &MeteringPointId,
        period: BillingPeriod,
        grid_area: &GridArea,
    ) -> Result<Option<SettlementRun>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "{} WHERE metering_point_id = ? AND period_start = ? AND period_end = ? AND grid_area = ? AND status = 'completed'",
            RUN_SELECT
        ))
        .bind(id.as_str())
        .bind(format_date(period.start))
        .bind(format_date(period.end))
        .bind(grid_area.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// All runs of a key, oldest version first.
    pub async fn settlement_runs_for(
        &self,
        id: &MeteringPointId,
        period: BillingPeriod,
    ) -> Result<Vec<SettlementRun>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "{} WHERE metering_point_id = ? AND period_start = ? AND period_end = ? ORDER BY version ASC",
            RUN_SELECT
        ))
        .bind(id.as_str())
        .bind(format_date(period.start))
        .bind(format_date(period.end))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn completed_settlement_runs(&self) -> Result<Vec<SettlementRun>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "{} WHERE status = 'completed' ORDER BY id ASC",
            RUN_SELECT
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Completed run whose period ends exactly on `end_date`.
    pub async fn completed_run_ending_on(
        &self,
        id: &MeteringPointId,
        end_date: NaiveDate,
    ) -> Result<Option<SettlementRun>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "{} WHERE metering_point_id = ? AND period_end = ? AND status = 'completed' ORDER BY id DESC LIMIT 1",
            RUN_SELECT
        ))
        .bind(id.as_str())
        .bind(format_date(end_date))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// Most recent completed run ending on or before `date`.
    pub async fn latest_completed_run_before(
        &self,
        id: &MeteringPointId,
        date: NaiveDate,
    ) -> Result<Option<SettlementRun>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "{} WHERE metering_point_id = ? AND period_end <= ? AND status = 'completed' ORDER BY period_end DESC, id DESC LIMIT 1",
            RUN_SELECT
        ))
        .bind(id.as_str())
        .bind(format_date(date))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    pub async fn settlement_lines(&self, run_id: i64) -> Result<Vec<SettlementLine>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, charge_type, total_kwh, amount, vat_amount
            FROM settlement_lines
            WHERE run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut lines = rows
            .iter()
            .map(|row| {
                Ok(SettlementLine {
                    run_id: row.try_get("run_id")?,
                    charge_type: get_parsed(row, "charge_type")?,
                    total_kwh: get_parsed(row, "total_kwh")?,
                    amount: get_parsed(row, "amount")?,
                    vat_amount: get_parsed(row, "vat_amount")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        lines.sort_by_key(|l: &SettlementLine| l.charge_type);
        Ok(lines)
    }

    // =========================================================================
    // Corrections
    // =========================================================================

    /// Store a correction batch and its lines.
    ///
    /// Returns `None` if a batch with the same watermark already exists for
    /// the run.
    pub async fn insert_correction_batch(
        &self,
        original_run_id: i64,
        trigger_type: TriggerType,
        revision_watermark: i64,
        lines: &[CorrectionLine],
        now: TimeMs,
    ) -> Result<Option<CorrectionBatch>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO correction_batches (original_run_id, trigger_type, revision_watermark, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(original_run_id)
        .bind(trigger_type.as_str())
        .bind(revision_watermark)
        .bind(now.as_ms())
        .execute(&mut *tx)
        .await;

        let batch_id = match inserted {
            Ok(done) => done.last_insert_rowid(),
            Err(e) if is_unique_violation(&e) => return Ok(None),
            Err(e) => return Err(e),
        };

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO correction_lines (batch_id, charge_type, delta_kwh, delta_amount, delta_vat)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(batch_id)
            .bind(line.charge_type.as_str())
            .bind(line.delta_kwh.to_canonical_string())
            .bind(line.delta_amount.to_canonical_string())
            .bind(line.delta_vat.to_canonical_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(CorrectionBatch {
            id: batch_id,
            original_run_id,
            trigger_type,
            revision_watermark,
            created_at: now,
        }))
    }

    /// Highest revision watermark already folded into a correction of `run_id`.
    pub async fn last_correction_watermark(&self, run_id: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COALESCE(MAX(revision_watermark), 0) FROM correction_batches WHERE original_run_id = ?",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn correction_batches(&self, run_id: i64) -> Result<Vec<CorrectionBatch>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, original_run_id, trigger_type, revision_watermark, created_at
            FROM correction_batches
            WHERE original_run_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CorrectionBatch {
                    id: row.try_get("id")?,
                    original_run_id: row.try_get("original_run_id")?,
                    trigger_type: get_parsed(row, "trigger_type")?,
                    revision_watermark: row.try_get("revision_watermark")?,
                    created_at: TimeMs::new(row.try_get("created_at")?),
                })
            })
            .collect()
    }

    pub async fn correction_lines(&self, batch_id: i64) -> Result<Vec<CorrectionLine>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT batch_id, charge_type, delta_kwh, delta_amount, delta_vat
            FROM correction_lines
            WHERE batch_id = ?
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        let mut lines = rows
            .iter()
            .map(|row| {
                Ok(CorrectionLine {
                    batch_id: row.try_get("batch_id")?,
                    charge_type: get_parsed::<ChargeType>(row, "charge_type")?,
                    delta_kwh: get_parsed(row, "delta_kwh")?,
                    delta_amount: get_parsed(row, "delta_amount")?,
                    delta_vat: get_parsed(row, "delta_vat")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        lines.sort_by_key(|l: &CorrectionLine| l.charge_type);
        Ok(lines)
    }
}

async fn billing_period_id_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &MeteringPointId,
    period: BillingPeriod,
) -> Result<i64, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO billing_periods (metering_point_id, period_start, period_end)
        VALUES (?, ?, ?)
        ON CONFLICT(metering_point_id, period_start, period_end) DO NOTHING
        "#,
    )
    .bind(id.as_str())
    .bind(format_date(period.start))
    .bind(format_date(period.end))
    .execute(&mut **tx)
    .await?;

    sqlx::query_scalar(
        "SELECT id FROM billing_periods WHERE metering_point_id = ? AND period_start = ? AND period_end = ?",
    )
    .bind(id.as_str())
    .bind(format_date(period.start))
    .bind(format_date(period.end))
    .fetch_one(&mut **tx)
    .await
}

fn run_from_row(row: &SqliteRow) -> Result<SettlementRun, sqlx::Error> {
    let start: NaiveDate = get_parsed(row, "period_start")?;
    let end: NaiveDate = get_parsed(row, "period_end")?;
    let period = BillingPeriod::new(start, end).ok_or_else(|| {
        sqlx::Error::Decode(format!("empty billing period {} - {}", start, end).into())
    })?;

    Ok(SettlementRun {
        id: row.try_get("id")?,
        metering_point_id: MeteringPointId::new(row.try_get::<String, _>("metering_point_id")?),
        billing_period_id: row.try_get("billing_period_id")?,
        period,
        grid_area: GridArea::new(row.try_get::<String, _>("grid_area")?),
        version: row.try_get("version")?,
        status: get_parsed(row, "status")?,
        revision_watermark: row.try_get("revision_watermark")?,
        subtotal: get_parsed_opt(row, "subtotal")?,
        vat: get_parsed_opt(row, "vat")?,
        total: get_parsed_opt(row, "total")?,
        error: row.try_get("error")?,
        started_at: TimeMs::new(row.try_get("started_at")?),
        completed_at: row
            .try_get::<Option<i64>, _>("completed_at")?
            .map(TimeMs::new),
    })
}
