//! Invoices issued by the billing tick for direct and aconto contracts.

mod support;

use hubsettle::domain::{
    BillingFrequency, BillingPeriod, Contract, Decimal, InvoiceLine, InvoiceLineType,
    InvoiceStatus, InvoiceType, PaymentModel,
};
use support::*;

fn february() -> BillingPeriod {
    period(date(2025, 2, 1), date(2025, 3, 1))
}

fn sum_ex_vat(lines: &[InvoiceLine]) -> Decimal {
    lines.iter().map(|l| l.amount_ex_vat).sum()
}

fn is_aconto(line: &InvoiceLine) -> bool {
    matches!(
        line.line_type,
        InvoiceLineType::AcontoPrepayment | InvoiceLineType::AcontoDeduction
    )
}

async fn settle_january(env: &TestEnv) {
    seed_period_data(&env.repo, january(), "1.5").await;
    env.services
        .settlement
        .settle_period(&point_id(), january(), now())
        .await
        .unwrap();
}

async fn supplied(env: &TestEnv, model: PaymentModel) -> Contract {
    seed_supplied_point(&env.repo, date(2025, 1, 1), model, BillingFrequency::Monthly).await
}

#[tokio::test]
async fn test_direct_contract_is_invoiced_once_per_settled_period() {
    let env = setup().await;
    let contract = supplied(&env, PaymentModel::Direct).await;
    settle_january(&env).await;
    let billing = &env.services.billing;

    let mid_month = billing.run_billing_tick(date(2025, 1, 20), now()).await.unwrap();
    assert_eq!(mid_month.issued, 0);

    let summary = billing.run_billing_tick(date(2025, 2, 1), now()).await.unwrap();
    assert_eq!(summary.issued, 1);
    assert_eq!(summary.failed, 0);

    let invoice = env
        .repo
        .live_invoice(contract.id, january(), InvoiceType::Settlement)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Draft);
    assert_eq!(invoice.total_ex_vat, d("2295.84"));
    assert_eq!(invoice.total_incl_vat, d("2869.80"));
    assert!(invoice.settlement_run_id.is_some());

    let lines = env.repo.invoice_lines(invoice.id).await.unwrap();
    assert_eq!(lines.len(), 7);
    assert!(!lines.iter().any(is_aconto));

    let again = billing.run_billing_tick(date(2025, 2, 1), now()).await.unwrap();
    assert_eq!(again.issued, 0);
    assert_eq!(
        env.repo.invoices_for_contract(contract.id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_closed_period_without_settlement_waits() {
    let env = setup().await;
    let contract = supplied(&env, PaymentModel::Direct).await;

    let summary = env
        .services
        .billing
        .run_billing_tick(date(2025, 2, 1), now())
        .await
        .unwrap();
    assert_eq!(summary.issued, 0);
    assert_eq!(summary.awaiting_settlement, 1);
    assert!(env
        .repo
        .invoices_for_contract(contract.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_aconto_prepayment_is_deducted_and_period_nets_to_settlement() {
    let env = setup().await;
    let contract = supplied(&env, PaymentModel::Aconto).await;
    let billing = &env.services.billing;

    let estimate = billing.estimate(&contract, january()).await.unwrap();
    let opening = billing.run_billing_tick(date(2025, 1, 10), now()).await.unwrap();
    assert_eq!(opening.issued, 1);

    let prepayment = env
        .repo
        .live_invoice(contract.id, january(), InvoiceType::AcontoPrepayment)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(prepayment.total_ex_vat, estimate);
    let payment = env
        .repo
        .aconto_payment(&point_id(), january())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.amount, estimate);
    assert_eq!(payment.invoice_id, Some(prepayment.id));

    assert!(billing
        .mark_aconto_paid(&point_id(), january(), now())
        .await
        .unwrap());
    assert!(!billing
        .mark_aconto_paid(&point_id(), january(), now())
        .await
        .unwrap());

    settle_january(&env).await;
    let closing = billing.run_billing_tick(date(2025, 2, 1), now()).await.unwrap();
    assert_eq!(closing.issued, 1);

    let settlement = env
        .repo
        .live_invoice(contract.id, january(), InvoiceType::Settlement)
        .await
        .unwrap()
        .unwrap();
    let lines = env.repo.invoice_lines(settlement.id).await.unwrap();
    let deduction = lines
        .iter()
        .find(|l| l.line_type == InvoiceLineType::AcontoDeduction)
        .unwrap();
    assert_eq!(deduction.amount_ex_vat, -estimate);
    assert_eq!(deduction.period, january());

    let next_estimate = billing.estimate(&contract, february()).await.unwrap();
    let seed = lines
        .iter()
        .find(|l| l.line_type == InvoiceLineType::AcontoPrepayment)
        .unwrap();
    assert_eq!(seed.period, february());
    assert_eq!(seed.amount_ex_vat, next_estimate);
    assert!(env
        .repo
        .aconto_payment(&point_id(), february())
        .await
        .unwrap()
        .is_some());

    let january_lines = env
        .repo
        .live_lines_for_period(contract.id, january())
        .await
        .unwrap();
    assert_eq!(sum_ex_vat(&january_lines), d("2295.84"));

    // February's prepayment already rides on January's invoice
    let rerun = billing.run_billing_tick(date(2025, 2, 1), now()).await.unwrap();
    assert_eq!(rerun.issued, 0);
    assert!(env
        .repo
        .live_invoice(contract.id, february(), InvoiceType::AcontoPrepayment)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_first_tick_after_late_activation_skips_closed_prepayments() {
    let env = setup().await;
    let contract = supplied(&env, PaymentModel::Aconto).await;
    settle_january(&env).await;

    let summary = env
        .services
        .billing
        .run_billing_tick(date(2025, 3, 5), now())
        .await
        .unwrap();
    // January settled, February awaiting settlement, March prepaid
    assert_eq!(summary.issued, 2);
    assert_eq!(summary.awaiting_settlement, 1);

    let january_invoice = env
        .repo
        .live_invoice(contract.id, january(), InvoiceType::Settlement)
        .await
        .unwrap()
        .unwrap();
    let lines = env.repo.invoice_lines(january_invoice.id).await.unwrap();
    assert!(!lines.iter().any(is_aconto));
    assert_eq!(january_invoice.total_ex_vat, d("2295.84"));

    assert!(env
        .repo
        .aconto_payment(&point_id(), february())
        .await
        .unwrap()
        .is_none());
    let march = period(date(2025, 3, 1), date(2025, 4, 1));
    assert!(env
        .repo
        .live_invoice(contract.id, march, InvoiceType::AcontoPrepayment)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_cancelled_invoice_can_be_reissued() {
    let env = setup().await;
    let contract = supplied(&env, PaymentModel::Direct).await;
    settle_january(&env).await;
    let billing = &env.services.billing;

    billing.run_billing_tick(date(2025, 2, 1), now()).await.unwrap();
    let first = env
        .repo
        .live_invoice(contract.id, january(), InvoiceType::Settlement)
        .await
        .unwrap()
        .unwrap();

    assert!(billing.cancel_invoice(first.id).await.unwrap());
    assert!(!billing.cancel_invoice(first.id).await.unwrap());
    let cancelled = env.repo.get_invoice(first.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, InvoiceStatus::Cancelled);

    let reissue = billing.run_billing_tick(date(2025, 2, 1), now()).await.unwrap();
    assert_eq!(reissue.issued, 1);
    let second = env
        .repo
        .live_invoice(contract.id, january(), InvoiceType::Settlement)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(second.total_ex_vat, first.total_ex_vat);

    let january_lines = env
        .repo
        .live_lines_for_period(contract.id, january())
        .await
        .unwrap();
    assert_eq!(sum_ex_vat(&january_lines), d("2295.84"));
}
