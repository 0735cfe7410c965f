//! Correction batches for settled periods whose metering was revised later.

use crate::db::Repository;
use crate::domain::{CorrectionBatch, RunStatus, SettlementRun, TimeMs, TriggerType};
use crate::engine::compute_correction;
use crate::error::CoreError;
use crate::orchestration::settlement::SettlementService;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CorrectionService {
    repo: Arc<Repository>,
    settlement: SettlementService,
}

impl CorrectionService {
    pub fn new(repo: Arc<Repository>, settlement: SettlementService) -> Self {
        Self { repo, settlement }
    }

    /// Fold every revision after the run's watermark (or the last correction's)
    /// into one correction batch.
    ///
    /// Returns `None` when there is nothing new to correct or a batch with the
    /// same watermark already exists.
    pub async fn correct_run(
        &self,
        run_id: i64,
        trigger: TriggerType,
        now: TimeMs,
    ) -> Result<Option<CorrectionBatch>, CoreError> {
        let run = self
            .repo
            .get_settlement_run(run_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("settlement run {}", run_id)))?;
        if run.status != RunStatus::Completed {
            return Err(CoreError::Validation(format!(
                "settlement run {} is {}, only completed runs can be corrected",
                run_id,
                run.status.as_str()
            )));
        }

        let after = self.folded_watermark(&run).await?;
        let tz = self.settlement.tz();
        let (revisions, samples) = self
            .repo
            .revision_snapshot(
                &run.metering_point_id,
                run.period.start_instant(tz),
                run.period.end_instant(tz),
                after,
            )
            .await?;
        if revisions.is_empty() {
            debug!(run_id, "no revisions to correct");
            return Ok(None);
        }

        let point = self
            .repo
            .get_metering_point(&run.metering_point_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("metering point {}", run.metering_point_id)))?;
        let contract = self
            .repo
            .latest_contract(&run.metering_point_id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("contract for {}", run.metering_point_id))
            })?;
        let rates = self.settlement.rate_book(&point, &contract, run.period).await?;

        let Some(result) =
            compute_correction(&revisions, &samples, &rates, self.settlement.vat_rate())?
        else {
            return Ok(None);
        };

        let batch = self
            .repo
            .insert_correction_batch(
                run.id,
                trigger,
                result.revision_watermark,
                &result.to_correction_lines(0),
                now,
            )
            .await?;
        match &batch {
            Some(b) => info!(
                run_id,
                batch_id = b.id,
                trigger = trigger.as_str(),
                revised_intervals = result.revised_intervals,
                net_amount = %result.net_amount(),
                watermark = result.revision_watermark,
                "correction batch stored"
            ),
            None => debug!(run_id, watermark = result.revision_watermark, "correction already stored"),
        }
        Ok(batch)
    }

    /// Correct every completed run that has revisions past its watermark.
    pub async fn run_auto_correction_scan(&self, now: TimeMs) -> Result<usize, CoreError> {
        let tz = self.settlement.tz();
        let mut created = 0;
        for run in self.repo.completed_settlement_runs().await? {
            let after = self.folded_watermark(&run).await?;
            let latest = self
                .repo
                .latest_revision_id_in_range(
                    &run.metering_point_id,
                    run.period.start_instant(tz),
                    run.period.end_instant(tz),
                )
                .await?;
            if latest <= after {
                continue;
            }
            match self.correct_run(run.id, TriggerType::Auto, now).await {
                Ok(Some(_)) => created += 1,
                Ok(None) => {}
                Err(e) => warn!(run_id = run.id, error = %e, "auto correction failed"),
            }
        }
        Ok(created)
    }

    async fn folded_watermark(&self, run: &SettlementRun) -> Result<i64, CoreError> {
        let corrected = self.repo.last_correction_watermark(run.id).await?;
        Ok(run.revision_watermark.max(corrected))
    }
}
