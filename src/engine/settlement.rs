//! Settlement of one closed billing period.
//!
//! Consumption charges are summed unrounded per charge type over the period and
//! rounded once per line. Subscriptions are pro-rated by calendar-month
//! coverage. VAT is applied to the subtotal.

use crate::domain::{
    BillingPeriod, ChargeType, Decimal, MeteringSample, Resolution, SettlementLine, TimeMs,
};
use crate::engine::pricing::{charge_sample, PricingError, RateBook, SampleCharges};
use chrono_tz::Tz;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettlementError {
    #[error("no metering data in {period}")]
    NoMeteringData { period: BillingPeriod },
    #[error("metering data mixes {first} and {other} resolutions")]
    MixedResolution { first: Resolution, other: Resolution },
    #[error("{missing} of {expected} metering intervals missing, first at {first_missing}")]
    IncompleteMetering {
        expected: usize,
        missing: usize,
        first_missing: TimeMs,
    },
    #[error("{charge_type} subscription rate missing for {period}")]
    MissingSubscription {
        charge_type: ChargeType,
        period: BillingPeriod,
    },
    #[error(transparent)]
    Pricing(#[from] PricingError),
}

/// Everything needed to settle one period.
#[derive(Debug, Clone)]
pub struct SettlementInput<'a> {
    pub period: BillingPeriod,
    pub samples: &'a [MeteringSample],
    pub rates: &'a RateBook,
    pub grid_subscription_monthly: Option<Decimal>,
    pub supplier_subscription_monthly: Decimal,
    pub vat_rate: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputedLine {
    pub charge_type: ChargeType,
    pub total_kwh: Decimal,
    pub amount: Decimal,
    pub vat_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementResult {
    pub lines: Vec<ComputedLine>,
    pub total_kwh: Decimal,
    pub subtotal: Decimal,
    pub vat: Decimal,
    pub total: Decimal,
}

impl SettlementResult {
    pub fn line(&self, charge_type: ChargeType) -> Option<&ComputedLine> {
        self.lines.iter().find(|l| l.charge_type == charge_type)
    }

    pub fn to_settlement_lines(&self, run_id: i64) -> Vec<SettlementLine> {
        self.lines
            .iter()
            .map(|l| SettlementLine {
                run_id,
                charge_type: l.charge_type,
                total_kwh: l.total_kwh,
                amount: l.amount,
                vat_amount: l.vat_amount,
            })
            .collect()
    }
}

/// Interval start instants a complete series must contain, from local
/// midnight at `period.start` up to local midnight at `period.end`.
pub fn expected_timestamps(period: BillingPeriod, tz: Tz, resolution: Resolution) -> Vec<TimeMs> {
    let end = period.end_instant(tz);
    let mut cursor = period.start_instant(tz);
    let mut timestamps = Vec::new();
    while cursor < end {
        timestamps.push(cursor);
        cursor = cursor.plus_minutes(resolution.minutes());
    }
    timestamps
}

/// Check that `samples` cover every expected interval of the period.
pub fn check_completeness(
    period: BillingPeriod,
    tz: Tz,
    samples: &[MeteringSample],
) -> Result<Resolution, SettlementError> {
    let first = samples
        .first()
        .ok_or(SettlementError::NoMeteringData { period })?;
    let resolution = first.resolution;
    if let Some(other) = samples.iter().find(|s| s.resolution != resolution) {
        return Err(SettlementError::MixedResolution {
            first: resolution,
            other: other.resolution,
        });
    }

    let present: HashSet<i64> = samples.iter().map(|s| s.timestamp.as_ms()).collect();
    let expected = expected_timestamps(period, tz, resolution);
    let missing: Vec<TimeMs> = expected
        .iter()
        .filter(|ts| !present.contains(&ts.as_ms()))
        .copied()
        .collect();

    match missing.first() {
        Some(first_missing) => Err(SettlementError::IncompleteMetering {
            expected: expected.len(),
            missing: missing.len(),
            first_missing: *first_missing,
        }),
        None => Ok(resolution),
    }
}

/// Monthly amount pro-rated over the period, rounded.
pub fn prorated_subscription(monthly: Decimal, period: BillingPeriod) -> Decimal {
    (monthly * period.month_fraction()).round_money()
}

/// Settle one period.
///
/// # Errors
/// Incomplete metering, a missing price or a missing tariff fails the whole
/// period; nothing is zero-filled.
pub fn settle(input: &SettlementInput<'_>) -> Result<SettlementResult, SettlementError> {
    check_completeness(input.period, input.rates.tz, input.samples)?;

    let mut sums = SampleCharges::default();
    let mut total_kwh = Decimal::zero();
    for sample in input.samples {
        sums += charge_sample(sample.timestamp, sample.quantity, input.rates)?;
        total_kwh += sample.quantity;
    }

    let grid_monthly = input
        .grid_subscription_monthly
        .ok_or(SettlementError::MissingSubscription {
            charge_type: ChargeType::GridSubscription,
            period: input.period,
        })?;

    let mut lines: Vec<ComputedLine> = sums
        .iter()
        .map(|(charge_type, amount)| {
            line(charge_type, total_kwh, amount.round_money(), input.vat_rate)
        })
        .collect();
    lines.push(line(
        ChargeType::GridSubscription,
        Decimal::zero(),
        prorated_subscription(grid_monthly, input.period),
        input.vat_rate,
    ));
    lines.push(line(
        ChargeType::SupplierSubscription,
        Decimal::zero(),
        prorated_subscription(input.supplier_subscription_monthly, input.period),
        input.vat_rate,
    ));

    let subtotal: Decimal = lines.iter().map(|l| l.amount).sum();
    let vat = (subtotal * input.vat_rate).round_money();

    Ok(SettlementResult {
        lines,
        total_kwh,
        subtotal,
        vat,
        total: subtotal + vat,
    })
}

fn line(
    charge_type: ChargeType,
    total_kwh: Decimal,
    amount: Decimal,
    vat_rate: Decimal,
) -> ComputedLine {
    ComputedLine {
        charge_type,
        total_kwh,
        amount,
        vat_amount: (amount * vat_rate).round_money(),
    }
}
