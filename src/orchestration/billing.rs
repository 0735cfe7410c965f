//! Billing reconciler: applies the billing policy to stored settlements and
//! prepayments and writes the resulting invoices.

use crate::db::{NewInvoice, Repository};
use crate::domain::{
    BillingPeriod, Contract, Decimal, Invoice, InvoiceType, MeteringPointId, PaymentModel,
    SupplyPeriod, TimeMs,
};
use crate::engine::{
    decide, estimate_prepayment, BillingContext, BillingDecision, EstimateBasis, NextPeriod,
};
use crate::error::CoreError;
use crate::market::MarketRules;
use chrono::{Days, NaiveDate};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct BillingReconciler {
    repo: Arc<Repository>,
    rules: MarketRules,
    vat_rate: Decimal,
    fallback_price_per_kwh: Decimal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BillingTickSummary {
    pub issued: usize,
    pub awaiting_settlement: usize,
    pub failed: usize,
}

impl BillingReconciler {
    pub fn new(
        repo: Arc<Repository>,
        rules: MarketRules,
        vat_rate: Decimal,
        fallback_price_per_kwh: Decimal,
    ) -> Self {
        Self {
            repo,
            rules,
            vat_rate,
            fallback_price_per_kwh,
        }
    }

    /// Issue whatever invoice `period` needs on `today`.
    ///
    /// Returns `None` when nothing is due, the period still awaits
    /// settlement, or a live invoice of the same type already exists.
    pub async fn reconcile_period(
        &self,
        contract: &Contract,
        supply: &SupplyPeriod,
        period: BillingPeriod,
        today: NaiveDate,
        now: TimeMs,
    ) -> Result<Option<Invoice>, CoreError> {
        let id = &contract.metering_point_id;
        let closed = period.is_closed_on(today);
        let invoice_type = if closed {
            InvoiceType::Settlement
        } else {
            InvoiceType::AcontoPrepayment
        };
        if !closed && contract.payment_model == PaymentModel::Direct {
            return Ok(None);
        }

        if let Some(existing) = self
            .repo
            .live_invoice(contract.id, period, invoice_type)
            .await?
        {
            debug!(
                invoice_id = existing.id,
                metering_point = %id,
                period = %period,
                invoice_type = %invoice_type,
                "invoice already issued"
            );
            return Ok(None);
        }

        let aconto_allowed = contract.payment_model == PaymentModel::Aconto
            && self.rules.can_bill_aconto(id, today).await?.valid;
        if !closed && !aconto_allowed {
            debug!(metering_point = %id, period = %period, "aconto billing not allowed");
            return Ok(None);
        }

        let run = if closed {
            match self.repo.get_metering_point(id).await? {
                Some(point) => {
                    self.repo
                        .completed_settlement_run(id, period, &point.grid_area)
                        .await?
                }
                None => None,
            }
        } else {
            None
        };
        let settlement_lines = match &run {
            Some(run) => Some(self.repo.settlement_lines(run.id).await?),
            None => None,
        };

        let recorded_prepayment = self
            .repo
            .aconto_payment(id, period)
            .await?
            .map(|p| p.amount);
        let prepayment_estimate = if closed {
            Decimal::zero()
        } else {
            self.estimate(contract, period).await?
        };
        let next_period = if closed && aconto_allowed {
            self.next_period(contract, supply, period).await?
        } else {
            None
        };

        let decision = decide(&BillingContext {
            payment_model: contract.payment_model,
            period,
            today,
            settlement: settlement_lines.as_deref(),
            recorded_prepayment,
            prepayment_estimate,
            next_period,
            vat_rate: self.vat_rate,
        });

        let (invoice_type, lines) = match decision {
            BillingDecision::Nothing => return Ok(None),
            BillingDecision::AwaitSettlement => {
                debug!(metering_point = %id, period = %period, "period awaits settlement");
                return Ok(None);
            }
            BillingDecision::Issue {
                invoice_type,
                lines,
            } => (invoice_type, lines),
        };

        let new_invoice = NewInvoice {
            contract_id: contract.id,
            metering_point_id: id.clone(),
            invoice_type,
            period,
            settlement_run_id: run.as_ref().map(|r| r.id),
            lines,
        };
        let invoice = self.repo.insert_invoice(&new_invoice, now).await?;
        match &invoice {
            Some(invoice) => info!(
                invoice_id = invoice.id,
                metering_point = %id,
                period = %period,
                invoice_type = %invoice_type,
                total_ex_vat = %invoice.total_ex_vat,
                total_incl_vat = %invoice.total_incl_vat,
                "invoice issued"
            ),
            None => debug!(metering_point = %id, period = %period, "invoice issued concurrently"),
        }
        Ok(invoice)
    }

    /// Prepayment estimate for `period`.
    pub async fn estimate(
        &self,
        contract: &Contract,
        period: BillingPeriod,
    ) -> Result<Decimal, CoreError> {
        let previous = self
            .repo
            .latest_completed_run_before(&contract.metering_point_id, period.start)
            .await?;
        let basis = match previous.and_then(|run| run.subtotal.map(|s| (run.period, s))) {
            Some((period, subtotal)) => EstimateBasis::PreviousSettlement { period, subtotal },
            None => EstimateBasis::Contract {
                estimated_annual_kwh: contract.estimated_annual_kwh,
                fallback_price_per_kwh: self.fallback_price_per_kwh,
            },
        };
        Ok(estimate_prepayment(period, basis))
    }

    async fn next_period(
        &self,
        contract: &Contract,
        supply: &SupplyPeriod,
        period: BillingPeriod,
    ) -> Result<Option<NextPeriod>, CoreError> {
        let Some(next) = BillingPeriod::containing(
            period.end,
            contract.billing_frequency,
            supply.start_date,
            supply.end_date,
        ) else {
            return Ok(None);
        };
        let prepayment_recorded = self
            .repo
            .aconto_payment(&contract.metering_point_id, next)
            .await?
            .is_some();
        let estimate = self.estimate(contract, next).await?;
        Ok(Some(NextPeriod {
            period: next,
            prepayment_recorded,
            estimate,
        }))
    }

    /// Reconcile every period of every active contract that has started by
    /// `today`.
    pub async fn run_billing_tick(
        &self,
        today: NaiveDate,
        now: TimeMs,
    ) -> Result<BillingTickSummary, CoreError> {
        let mut summary = BillingTickSummary::default();
        let until = today.checked_add_days(Days::new(1)).unwrap_or(today);

        for (contract, supply) in self.repo.supply_periods_for_active_contracts().await? {
            let periods = BillingPeriod::sequence(
                contract.billing_frequency,
                supply.start_date,
                supply.end_date,
                until,
            );
            for period in periods {
                match self
                    .reconcile_period(&contract, &supply, period, today, now)
                    .await
                {
                    Ok(Some(_)) => summary.issued += 1,
                    Ok(None) => {
                        if period.is_closed_on(today)
                            && self
                                .repo
                                .live_invoice(contract.id, period, InvoiceType::Settlement)
                                .await?
                                .is_none()
                        {
                            summary.awaiting_settlement += 1;
                        }
                    }
                    Err(e) => {
                        error!(
                            contract_id = contract.id,
                            period = %period,
                            error = %e,
                            "billing reconciliation failed"
                        );
                        summary.failed += 1;
                    }
                }
            }
        }

        if summary.issued > 0 || summary.failed > 0 {
            info!(
                issued = summary.issued,
                awaiting_settlement = summary.awaiting_settlement,
                failed = summary.failed,
                "billing tick"
            );
        }
        Ok(summary)
    }

    pub async fn cancel_invoice(&self, invoice_id: i64) -> Result<bool, CoreError> {
        let cancelled = self.repo.cancel_invoice(invoice_id).await?;
        if cancelled {
            info!(invoice_id, "invoice cancelled");
        }
        Ok(cancelled)
    }

    pub async fn mark_aconto_paid(
        &self,
        id: &MeteringPointId,
        period: BillingPeriod,
        paid_at: TimeMs,
    ) -> Result<bool, CoreError> {
        Ok(self.repo.mark_aconto_paid(id, period, paid_at).await?)
    }
}
