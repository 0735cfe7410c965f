//! Billing policy: which invoice a period needs, given its payment model and
//! what has already been recorded.
//!
//! The policy keeps one invariant per period: the ex-VAT lines tagged with a
//! period across all live invoices sum to the settled subtotal. A prepayment
//! line for `P` is always matched by a deduction line for `P` on the
//! settlement invoice of `P`.

use crate::domain::{
    BillingPeriod, ChargeType, Decimal, InvoiceLine, InvoiceLineType, InvoiceType, PaymentModel,
    SettlementLine,
};
use chrono::NaiveDate;

/// Prepayment state of the period following the one being reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextPeriod {
    pub period: BillingPeriod,
    pub prepayment_recorded: bool,
    pub estimate: Decimal,
}

#[derive(Debug, Clone)]
pub struct BillingContext<'a> {
    pub payment_model: PaymentModel,
    pub period: BillingPeriod,
    pub today: NaiveDate,
    /// Lines of the completed settlement run for `period`, if any.
    pub settlement: Option<&'a [SettlementLine]>,
    /// Prepayment already recorded for `period`.
    pub recorded_prepayment: Option<Decimal>,
    /// Estimate used when `period` itself needs a prepayment.
    pub prepayment_estimate: Decimal,
    pub next_period: Option<NextPeriod>,
    pub vat_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingDecision {
    /// Nothing to invoice for this period right now.
    Nothing,
    /// The period is closed but has no completed settlement yet.
    AwaitSettlement,
    Issue {
        invoice_type: InvoiceType,
        lines: Vec<InvoiceLine>,
    },
}

pub fn decide(ctx: &BillingContext<'_>) -> BillingDecision {
    let closed = ctx.period.is_closed_on(ctx.today);

    match (ctx.payment_model, closed) {
        (PaymentModel::Direct, false) => BillingDecision::Nothing,
        (PaymentModel::Aconto, false) => match ctx.recorded_prepayment {
            Some(_) => BillingDecision::Nothing,
            None => BillingDecision::Issue {
                invoice_type: InvoiceType::AcontoPrepayment,
                lines: vec![prepayment_line(
                    ctx.period,
                    ctx.prepayment_estimate,
                    ctx.vat_rate,
                )],
            },
        },
        (_, true) => {
            let Some(settlement) = ctx.settlement else {
                return BillingDecision::AwaitSettlement;
            };
            let mut lines = settlement_lines(ctx.period, settlement, ctx.vat_rate);
            if ctx.payment_model == PaymentModel::Aconto {
                if let Some(recorded) = ctx.recorded_prepayment {
                    lines.push(InvoiceLine::new(
                        InvoiceLineType::AcontoDeduction,
                        "aconto deduction",
                        ctx.period,
                        -recorded,
                        ctx.vat_rate,
                    ));
                }
                if let Some(next) = ctx.next_period {
                    if !next.prepayment_recorded && !next.period.is_closed_on(ctx.today) {
                        lines.push(prepayment_line(next.period, next.estimate, ctx.vat_rate));
                    }
                }
            }
            BillingDecision::Issue {
                invoice_type: InvoiceType::Settlement,
                lines,
            }
        }
    }
}

fn settlement_lines(
    period: BillingPeriod,
    settlement: &[SettlementLine],
    vat_rate: Decimal,
) -> Vec<InvoiceLine> {
    let mut sorted: Vec<&SettlementLine> = settlement.iter().collect();
    sorted.sort_by_key(|l| l.charge_type);
    sorted
        .into_iter()
        .map(|l| {
            InvoiceLine::new(
                l.charge_type.into(),
                describe(l.charge_type, l.total_kwh),
                period,
                l.amount,
                vat_rate,
            )
        })
        .collect()
}

fn describe(charge_type: ChargeType, total_kwh: Decimal) -> String {
    let label = charge_type.as_str().replace('_', " ");
    if charge_type.is_subscription() {
        label
    } else {
        format!("{} ({} kWh)", label, total_kwh.to_canonical_string())
    }
}

fn prepayment_line(period: BillingPeriod, estimate: Decimal, vat_rate: Decimal) -> InvoiceLine {
    InvoiceLine::new(
        InvoiceLineType::AcontoPrepayment,
        format!("aconto prepayment {}", period),
        period,
        estimate,
        vat_rate,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn date(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn january() -> BillingPeriod {
        BillingPeriod::new(date(2025, 1, 1), date(2025, 2, 1)).unwrap()
    }

    fn february() -> BillingPeriod {
        BillingPeriod::new(date(2025, 2, 1), date(2025, 3, 1)).unwrap()
    }

    fn run_lines() -> Vec<SettlementLine> {
        vec![
            SettlementLine {
                run_id: 1,
                charge_type: ChargeType::GridTariff,
                total_kwh: d("100"),
                amount: d("20.00"),
                vat_amount: d("5.00"),
            },
            SettlementLine {
                run_id: 1,
                charge_type: ChargeType::Energy,
                total_kwh: d("100"),
                amount: d("110.00"),
                vat_amount: d("27.50"),
            },
        ]
    }

    fn ctx<'a>(
        model: PaymentModel,
        today: NaiveDate,
        settlement: Option<&'a [SettlementLine]>,
        recorded: Option<Decimal>,
    ) -> BillingContext<'a> {
        BillingContext {
            payment_model: model,
            period: january(),
            today,
            settlement,
            recorded_prepayment: recorded,
            prepayment_estimate: d("150.00"),
            next_period: Some(NextPeriod {
                period: february(),
                prepayment_recorded: false,
                estimate: d("140.00"),
            }),
            vat_rate: d("0.25"),
        }
    }

    fn lines_of(decision: BillingDecision) -> (InvoiceType, Vec<InvoiceLine>) {
        match decision {
            BillingDecision::Issue {
                invoice_type,
                lines,
            } => (invoice_type, lines),
            other => panic!("expected an invoice, got {:?}", other),
        }
    }

    #[test]
    fn test_direct_open_period_waits() {
        let c = ctx(PaymentModel::Direct, date(2025, 1, 15), None, None);
        assert_eq!(decide(&c), BillingDecision::Nothing);
    }

    #[test]
    fn test_closed_period_without_run_awaits_settlement() {
        let c = ctx(PaymentModel::Direct, date(2025, 2, 1), None, None);
        assert_eq!(decide(&c), BillingDecision::AwaitSettlement);
    }

    #[test]
    fn test_direct_settlement_has_no_aconto_lines() {
        let lines = run_lines();
        let c = ctx(PaymentModel::Direct, date(2025, 2, 1), Some(&lines), None);
        let (invoice_type, lines) = lines_of(decide(&c));

        assert_eq!(invoice_type, InvoiceType::Settlement);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_type, InvoiceLineType::Energy);
        assert_eq!(lines[0].amount_incl_vat, d("137.50"));
        assert!(lines.iter().all(|l| l.period == january()));
    }

    #[test]
    fn test_aconto_open_period_gets_prepayment() {
        let c = ctx(PaymentModel::Aconto, date(2025, 1, 10), None, None);
        let (invoice_type, lines) = lines_of(decide(&c));

        assert_eq!(invoice_type, InvoiceType::AcontoPrepayment);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line_type, InvoiceLineType::AcontoPrepayment);
        assert_eq!(lines[0].amount_ex_vat, d("150.00"));
    }

    #[test]
    fn test_aconto_open_period_with_recorded_prepayment_is_noop() {
        let c = ctx(PaymentModel::Aconto, date(2025, 1, 10), None, Some(d("150")));
        assert_eq!(decide(&c), BillingDecision::Nothing);
    }

    #[test]
    fn test_aconto_settlement_deducts_and_seeds_next() {
        let lines = run_lines();
        let c = ctx(
            PaymentModel::Aconto,
            date(2025, 2, 1),
            Some(&lines),
            Some(d("150.00")),
        );
        let (invoice_type, lines) = lines_of(decide(&c));
        assert_eq!(invoice_type, InvoiceType::Settlement);

        let deduction = lines
            .iter()
            .find(|l| l.line_type == InvoiceLineType::AcontoDeduction)
            .unwrap();
        assert_eq!(deduction.amount_ex_vat, d("-150.00"));

        let seed = lines
            .iter()
            .find(|l| l.line_type == InvoiceLineType::AcontoPrepayment)
            .unwrap();
        assert_eq!(seed.period, february());
        assert_eq!(seed.amount_ex_vat, d("140.00"));

        // settlement + deduction + the earlier prepayment = settled subtotal
        let january_net: Decimal = lines
            .iter()
            .filter(|l| l.period == january())
            .map(|l| l.amount_ex_vat)
            .sum::<Decimal>()
            + d("150.00");
        assert_eq!(january_net, d("130.00"));
    }

    #[test]
    fn test_retroactive_activation_settles_directly() {
        let lines = run_lines();
        let mut c = ctx(PaymentModel::Aconto, date(2025, 3, 5), Some(&lines), None);
        c.next_period = Some(NextPeriod {
            period: february(),
            prepayment_recorded: false,
            estimate: d("140.00"),
        });
        let (invoice_type, lines) = lines_of(decide(&c));

        assert_eq!(invoice_type, InvoiceType::Settlement);
        assert!(lines.iter().all(|l| !matches!(
            l.line_type,
            InvoiceLineType::AcontoDeduction | InvoiceLineType::AcontoPrepayment
        )));
    }

    #[test]
    fn test_next_period_already_prepaid_is_not_seeded_again() {
        let lines = run_lines();
        let mut c = ctx(
            PaymentModel::Aconto,
            date(2025, 2, 1),
            Some(&lines),
            Some(d("150.00")),
        );
        c.next_period = Some(NextPeriod {
            period: february(),
            prepayment_recorded: true,
            estimate: d("140.00"),
        });
        let (_, lines) = lines_of(decide(&c));
        assert!(lines
            .iter()
            .all(|l| l.line_type != InvoiceLineType::AcontoPrepayment));
    }
}
