//! Aconto prepayment estimate.

use crate::domain::{BillingPeriod, Decimal};

const DAYS_PER_YEAR: i64 = 365;

/// Basis for estimating a prepayment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateBasis {
    /// Subtotal of the latest settled period before the one being estimated.
    PreviousSettlement {
        period: BillingPeriod,
        subtotal: Decimal,
    },
    /// No settlement history yet.
    Contract {
        estimated_annual_kwh: Decimal,
        fallback_price_per_kwh: Decimal,
    },
}

/// Estimated ex-VAT cost of `period`, rounded to money.
pub fn estimate_prepayment(period: BillingPeriod, basis: EstimateBasis) -> Decimal {
    let days = Decimal::from_i64(period.days());
    let estimate = match basis {
        EstimateBasis::PreviousSettlement {
            period: previous,
            subtotal,
        } => subtotal / Decimal::from_i64(previous.days().max(1)) * days,
        EstimateBasis::Contract {
            estimated_annual_kwh,
            fallback_price_per_kwh,
        } => {
            estimated_annual_kwh * days / Decimal::from_i64(DAYS_PER_YEAR) * fallback_price_per_kwh
        }
    };
    estimate.round_money()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn period(start: (i32, u32, u32), end: (i32, u32, u32)) -> BillingPeriod {
        BillingPeriod::new(
            NaiveDate::from_ymd_opt(start.0, start.1, start.2).unwrap(),
            NaiveDate::from_ymd_opt(end.0, end.1, end.2).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_estimate_scales_previous_daily_cost() {
        let previous = period((2025, 1, 1), (2025, 2, 1));
        let next = period((2025, 2, 1), (2025, 3, 1));
        let estimate = estimate_prepayment(
            next,
            EstimateBasis::PreviousSettlement {
                period: previous,
                subtotal: d("310.00"),
            },
        );
        assert_eq!(estimate, d("280.00"));
    }

    #[test]
    fn test_fallback_uses_annual_consumption() {
        let january = period((2025, 1, 1), (2025, 2, 1));
        let estimate = estimate_prepayment(
            january,
            EstimateBasis::Contract {
                estimated_annual_kwh: d("3650"),
                fallback_price_per_kwh: d("2.5"),
            },
        );
        assert_eq!(estimate, d("775.00"));
    }
}
