//! Settlement service: loads a period's inputs, runs the engine and stores a
//! versioned run.

use crate::db::{Repository, RunTotals};
use crate::domain::{
    BillingPeriod, ChargeType, Contract, Decimal, MeteringPoint, MeteringPointId, SettlementRun,
    TimeMs, NATIONAL_SCOPE,
};
use crate::engine::{settle, RateBook, SettlementInput, SettlementResult};
use crate::error::CoreError;
use crate::market::MarketRules;
use chrono::NaiveDate;
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SettlementService {
    repo: Arc<Repository>,
    rules: MarketRules,
    tz: Tz,
    vat_rate: Decimal,
    run_lease: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettlementTickSummary {
    pub settled: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SettlementService {
    pub fn new(
        repo: Arc<Repository>,
        rules: MarketRules,
        tz: Tz,
        vat_rate: Decimal,
        run_lease: Duration,
    ) -> Self {
        Self {
            repo,
            rules,
            tz,
            vat_rate,
            run_lease,
        }
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn vat_rate(&self) -> Decimal {
        self.vat_rate
    }

    /// Settle one closed period of a metering point.
    ///
    /// Returns the existing run if the key is already settled. A failed
    /// computation is persisted as a failed run before the error is returned.
    /// A run left `running` longer than the lease is marked failed so the
    /// next version can start.
    ///
    /// # Errors
    /// - `NotFound` for an unknown metering point
    /// - `Validation` when the market rules forbid settlement
    /// - `Conflict` when another run for the key is in progress
    /// - `DataIncomplete` when metering, price or tariff coverage is missing
    pub async fn settle_period(
        &self,
        id: &MeteringPointId,
        period: BillingPeriod,
        now: TimeMs,
    ) -> Result<SettlementRun, CoreError> {
        let point = self
            .repo
            .get_metering_point(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("metering point {}", id)))?;

        if let Some(run) = self
            .repo
            .completed_settlement_run(id, period, &point.grid_area)
            .await?
        {
            debug!(run_id = run.id, metering_point = %id, period = %period, "already settled");
            return Ok(run);
        }

        self.rules
            .can_run_settlement(id, period)
            .await?
            .into_result()?;
        let contract = self
            .repo
            .active_contract(id)
            .await?
            .ok_or_else(|| CoreError::Validation(format!("{} has no active contract", id)))?;

        let abandoned = self
            .repo
            .fail_stale_settlement_runs(
                id,
                period,
                &point.grid_area,
                now.minus(self.run_lease),
                now,
            )
            .await?;
        for run_id in abandoned {
            warn!(
                run_id,
                metering_point = %id,
                period = %period,
                "abandoned settlement run marked failed"
            );
        }

        let run = self
            .repo
            .begin_settlement_run(id, period, &point.grid_area, now)
            .await?;

        let (result, watermark) = match self.compute(&point, &contract, period).await {
            Ok(computed) => computed,
            Err(e) => {
                self.repo
                    .fail_settlement_run(run.id, &e.to_string(), now)
                    .await?;
                warn!(
                    run_id = run.id,
                    version = run.version,
                    metering_point = %id,
                    period = %period,
                    error = %e,
                    "settlement run failed"
                );
                return Err(e);
            }
        };

        self.repo
            .complete_settlement_run(
                run.id,
                watermark,
                &result.to_settlement_lines(run.id),
                RunTotals {
                    subtotal: result.subtotal,
                    vat: result.vat,
                    total: result.total,
                },
                now,
            )
            .await?;
        info!(
            run_id = run.id,
            version = run.version,
            metering_point = %id,
            period = %period,
            total_kwh = %result.total_kwh,
            total = %result.total,
            "settlement run completed"
        );

        self.repo
            .get_settlement_run(run.id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("settlement run {}", run.id)))
    }

    async fn compute(
        &self,
        point: &MeteringPoint,
        contract: &Contract,
        period: BillingPeriod,
    ) -> Result<(SettlementResult, i64), CoreError> {
        let (samples, watermark) = self
            .repo
            .metering_snapshot(&point.id, period.start_instant(self.tz), period.end_instant(self.tz))
            .await?;
        let rates = self.rate_book(point, contract, period).await?;
        let grid_subscription = self
            .repo
            .tariff_schedule(point.grid_area.as_str(), ChargeType::GridSubscription)
            .await?
            .version_on(period.start)
            .and_then(|v| v.rate_for_hour(0));

        let result = settle(&SettlementInput {
            period,
            samples: &samples,
            rates: &rates,
            grid_subscription_monthly: grid_subscription,
            supplier_subscription_monthly: contract.supplier_subscription_monthly,
            vat_rate: self.vat_rate,
        })?;
        Ok((result, watermark))
    }

    /// Prices and tariffs for one point and period.
    pub async fn rate_book(
        &self,
        point: &MeteringPoint,
        contract: &Contract,
        period: BillingPeriod,
    ) -> Result<RateBook, CoreError> {
        let prices = self
            .repo
            .spot_prices_in_range(
                &point.price_area,
                period.start_instant(self.tz),
                period.end_instant(self.tz),
            )
            .await?;
        let grid = self
            .repo
            .tariff_schedule(point.grid_area.as_str(), ChargeType::GridTariff)
            .await?;
        let system = self
            .repo
            .tariff_schedule(NATIONAL_SCOPE, ChargeType::SystemTariff)
            .await?;
        let transmission = self
            .repo
            .tariff_schedule(NATIONAL_SCOPE, ChargeType::TransmissionTariff)
            .await?;
        let tax = self
            .repo
            .tariff_schedule(NATIONAL_SCOPE, ChargeType::ElectricityTax)
            .await?;

        Ok(RateBook::new(
            self.tz,
            contract.margin_per_kwh,
            contract.supplement_per_kwh,
            &prices,
        )
        .with_tariffs(grid, system, transmission, tax))
    }

    /// Settle every closed, unsettled period of every active contract.
    ///
    /// A period is due on its exclusive end date.
    pub async fn run_settlement_tick(
        &self,
        today: NaiveDate,
        now: TimeMs,
    ) -> Result<SettlementTickSummary, CoreError> {
        let mut summary = SettlementTickSummary::default();

        for (contract, supply) in self.repo.supply_periods_for_active_contracts().await? {
            let id = &contract.metering_point_id;
            let Some(point) = self.repo.get_metering_point(id).await? else {
                continue;
            };
            let periods = BillingPeriod::sequence(
                contract.billing_frequency,
                supply.start_date,
                supply.end_date,
                today,
            );
            for period in periods.into_iter().filter(|p| p.is_closed_on(today)) {
                if self
                    .repo
                    .completed_settlement_run(id, period, &point.grid_area)
                    .await?
                    .is_some()
                {
                    continue;
                }
                match self.settle_period(id, period, now).await {
                    Ok(_) => summary.settled += 1,
                    Err(CoreError::Validation(reason)) => {
                        debug!(metering_point = %id, period = %period, reason = %reason, "settlement not eligible");
                        summary.skipped += 1;
                    }
                    Err(CoreError::Conflict(reason)) => {
                        debug!(metering_point = %id, period = %period, reason = %reason, "settlement in progress elsewhere");
                        summary.skipped += 1;
                    }
                    Err(CoreError::DataIncomplete(_)) => summary.failed += 1,
                    Err(e) => {
                        error!(metering_point = %id, period = %period, error = %e, "settlement failed");
                        summary.failed += 1;
                    }
                }
            }
        }

        if summary.settled > 0 || summary.failed > 0 {
            info!(
                settled = summary.settled,
                failed = summary.failed,
                skipped = summary.skipped,
                "settlement tick"
            );
        }
        Ok(summary)
    }
}
