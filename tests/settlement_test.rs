//! Settlement runs against a real store: exact amounts, versioning, failures
//! and the weekly due-date boundary.

mod support;

use hubsettle::domain::{
    BillingFrequency, ChargeType, ContractStatus, EventSource, GridArea, NewProcessRequest,
    PaymentModel, PriceArea, ProcessStatus, ProcessType, Resolution, RunStatus, SpotPrice,
};
use hubsettle::CoreError;
use support::*;

#[tokio::test]
async fn test_full_month_settlement_matches_closed_form() {
    let env = setup().await;
    seed_supplied_point(&env.repo, date(2025, 1, 1), PaymentModel::Direct, BillingFrequency::Monthly)
        .await;
    seed_period_data(&env.repo, january(), "1.5").await;

    let run = env
        .services
        .settlement
        .settle_period(&point_id(), january(), now())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.version, 1);

    // 744 h × 1.5 kWh = 1116 kWh
    let lines = env.repo.settlement_lines(run.id).await.unwrap();
    let amount = |ct: ChargeType| lines.iter().find(|l| l.charge_type == ct).unwrap().amount;
    assert_eq!(lines.len(), 7);
    assert_eq!(amount(ChargeType::Energy), d("1116.00"));
    assert_eq!(amount(ChargeType::GridTariff), d("223.20"));
    assert_eq!(amount(ChargeType::SystemTariff), d("55.80"));
    assert_eq!(amount(ChargeType::TransmissionTariff), d("44.64"));
    assert_eq!(amount(ChargeType::ElectricityTax), d("781.20"));
    assert_eq!(amount(ChargeType::GridSubscription), d("50.00"));
    assert_eq!(amount(ChargeType::SupplierSubscription), d("25.00"));

    let energy = lines
        .iter()
        .find(|l| l.charge_type == ChargeType::Energy)
        .unwrap();
    assert_eq!(energy.total_kwh, d("1116"));

    assert_eq!(run.subtotal, Some(d("2295.84")));
    assert_eq!(run.vat, Some(d("573.96")));
    assert_eq!(run.total, Some(d("2869.80")));
}

#[tokio::test]
async fn test_settling_a_settled_period_returns_the_existing_run() {
    let env = setup().await;
    seed_supplied_point(&env.repo, date(2025, 1, 1), PaymentModel::Direct, BillingFrequency::Monthly)
        .await;
    seed_period_data(&env.repo, january(), "1").await;

    let first = env
        .services
        .settlement
        .settle_period(&point_id(), january(), now())
        .await
        .unwrap();
    let second = env
        .services
        .settlement
        .settle_period(&point_id(), january(), now())
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    let runs = env
        .repo
        .settlement_runs_for(&point_id(), january())
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn test_missing_price_fails_closed_and_next_attempt_is_a_new_version() {
    let env = setup().await;
    seed_supplied_point(&env.repo, date(2025, 1, 1), PaymentModel::Direct, BillingFrequency::Monthly)
        .await;
    seed_tariffs(&env.repo).await;
    seed_metering(&env.repo, january(), "1").await;

    // every hour priced except the last one
    let all_hours = hours(january());
    let (last, priced) = all_hours.split_last().unwrap();
    let prices: Vec<SpotPrice> = priced
        .iter()
        .map(|&timestamp| SpotPrice {
            price_area: PriceArea::new(PRICE_AREA),
            timestamp,
            resolution: Resolution::Hourly,
            price: d("0.90"),
        })
        .collect();
    env.repo.upsert_spot_prices(&prices).await.unwrap();

    let err = env
        .services
        .settlement
        .settle_period(&point_id(), january(), now())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DataIncomplete(_)), "got {:?}", err);

    let runs = env
        .repo
        .settlement_runs_for(&point_id(), january())
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0].error.is_some());

    env.repo
        .upsert_spot_prices(&[SpotPrice {
            price_area: PriceArea::new(PRICE_AREA),
            timestamp: *last,
            resolution: Resolution::Hourly,
            price: d("0.90"),
        }])
        .await
        .unwrap();

    let run = env
        .services
        .settlement
        .settle_period(&point_id(), january(), now())
        .await
        .unwrap();
    assert_eq!(run.version, 2);
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_run_abandoned_mid_flight_is_failed_after_its_lease() {
    let env = setup().await;
    seed_supplied_point(&env.repo, date(2025, 1, 1), PaymentModel::Direct, BillingFrequency::Monthly)
        .await;
    seed_period_data(&env.repo, january(), "1.5").await;

    // a worker died between starting and finishing this run
    let orphan = env
        .repo
        .begin_settlement_run(&point_id(), january(), &GridArea::new(GRID_AREA), now())
        .await
        .unwrap();

    let settlement = &env.services.settlement;
    let within_lease = now().plus_minutes(5);
    let err = settlement
        .settle_period(&point_id(), january(), within_lease)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)), "got {:?}", err);

    let after_lease = now().plus_minutes(16);
    let run = settlement
        .settle_period(&point_id(), january(), after_lease)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.version, 2);
    assert_eq!(run.subtotal, Some(d("2295.84")));

    let abandoned = env
        .repo
        .get_settlement_run(orphan.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(abandoned.status, RunStatus::Failed);
    assert!(abandoned.error.unwrap().contains("lease"));
}

#[tokio::test]
async fn test_missing_hour_of_metering_is_data_incomplete() {
    let env = setup().await;
    seed_supplied_point(&env.repo, date(2025, 1, 1), PaymentModel::Direct, BillingFrequency::Monthly)
        .await;
    seed_tariffs(&env.repo).await;
    seed_spot_prices(&env.repo, january(), "0.90").await;

    let all_hours = hours(january());
    env.repo
        .upsert_samples(&samples_at(&all_hours[1..], "1", "seed"), now())
        .await
        .unwrap();

    let err = env
        .services
        .settlement
        .settle_period(&point_id(), january(), now())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DataIncomplete(_)));
}

#[tokio::test]
async fn test_settlement_without_metering_is_rejected_by_market_rules() {
    let env = setup().await;
    seed_supplied_point(&env.repo, date(2025, 1, 1), PaymentModel::Direct, BillingFrequency::Monthly)
        .await;
    seed_tariffs(&env.repo).await;

    let err = env
        .services
        .settlement
        .settle_period(&point_id(), january(), now())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
    assert!(env
        .repo
        .settlement_runs_for(&point_id(), january())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_weekly_period_is_due_on_its_exclusive_end_date() {
    let env = setup().await;
    // 2025-01-01 is a Wednesday; the first weekly period ends Monday 2025-01-06
    seed_supplied_point(&env.repo, date(2025, 1, 1), PaymentModel::Direct, BillingFrequency::Weekly)
        .await;
    let first_week = period(date(2025, 1, 1), date(2025, 1, 6));
    seed_period_data(&env.repo, first_week, "1").await;

    let before = env
        .services
        .settlement
        .run_settlement_tick(date(2025, 1, 5), now())
        .await
        .unwrap();
    assert_eq!(before.settled, 0);

    let on_boundary = env
        .services
        .settlement
        .run_settlement_tick(date(2025, 1, 6), now())
        .await
        .unwrap();
    assert_eq!(on_boundary.settled, 1);

    let run = env
        .repo
        .completed_settlement_run(&point_id(), first_week, &GridArea::new(GRID_AREA))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.period.end, date(2025, 1, 6));
    // 5 of 31 January days
    let lines = env.repo.settlement_lines(run.id).await.unwrap();
    let grid_sub = lines
        .iter()
        .find(|l| l.charge_type == ChargeType::GridSubscription)
        .unwrap();
    assert_eq!(grid_sub.amount, d("8.06"));

    let again = env
        .services
        .settlement
        .run_settlement_tick(date(2025, 1, 6), now())
        .await
        .unwrap();
    assert_eq!(again.settled, 0);
}

#[tokio::test]
async fn test_offboarding_finalizes_only_after_final_settlement() {
    let env = setup().await;
    add_point(&env.repo, true).await;
    let processes = &env.services.processes;

    let process = processes
        .create(
            &NewProcessRequest {
                process_type: ProcessType::Switch,
                metering_point_id: point_id(),
                effective_date: date(2025, 1, 1),
            },
            date(2024, 12, 1),
            now(),
        )
        .await
        .unwrap();
    processes.send_request(process.id, now()).await.unwrap();
    processes
        .acknowledge(process.id, EventSource::Hub, now())
        .await
        .unwrap();
    processes
        .confirm(process.id, EventSource::Hub, now())
        .await
        .unwrap();
    processes
        .run_effectuation_tick(date(2025, 1, 1), now())
        .await
        .unwrap();
    add_contract(&env.repo, PaymentModel::Direct, BillingFrequency::Weekly).await;

    let offboarding = processes
        .start_offboarding(process.id, date(2025, 1, 6), date(2025, 1, 3), now())
        .await
        .unwrap();
    assert_eq!(offboarding.status, ProcessStatus::OffboardingStarted);

    let err = processes
        .finalize_offboarding(process.id, now())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));

    let final_week = period(date(2025, 1, 1), date(2025, 1, 6));
    seed_period_data(&env.repo, final_week, "1").await;
    env.services
        .settlement
        .settle_period(&point_id(), final_week, now())
        .await
        .unwrap();

    let settled = processes
        .finalize_offboarding(process.id, now())
        .await
        .unwrap();
    assert_eq!(settled.status, ProcessStatus::FinalSettled);
    assert!(env.repo.active_contract(&point_id()).await.unwrap().is_none());
    let contract = env.repo.latest_contract(&point_id()).await.unwrap().unwrap();
    assert_eq!(contract.status, ContractStatus::Terminated);
}
