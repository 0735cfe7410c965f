//! Shared fixtures: a temp SQLite store, a mock hub and a seeded portfolio.
#![allow(dead_code)]

use chrono::NaiveDate;
use chrono_tz::Tz;
use hubsettle::config::Config;
use hubsettle::db::init_db;
use hubsettle::domain::{
    local_midnight, BillingFrequency, BillingPeriod, ChargeType, Contract, Decimal, GridArea,
    MeteringPoint, MeteringPointId, MeteringSample, NewContract, PaymentModel, PriceArea,
    QualityCode, Resolution, SpotPrice, TariffVersion, TimeMs, NATIONAL_SCOPE,
};
use hubsettle::{HubGateway, MockGateway, Repository, Services};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tempfile::TempDir;

pub const POINT: &str = "571313100000000001";
pub const GRID_AREA: &str = "344";
pub const PRICE_AREA: &str = "DK1";
pub const HOUR_MS: i64 = 3_600_000;

pub struct TestEnv {
    pub repo: Arc<Repository>,
    pub hub: Arc<MockGateway>,
    pub services: Services,
    pub config: Config,
    _temp_dir: TempDir,
}

pub async fn setup() -> TestEnv {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    let repo = Arc::new(Repository::new(pool));

    let env: HashMap<String, String> = [
        ("DATABASE_PATH", db_path.as_str()),
        ("HUB_API_URL", "http://hub.invalid"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let config = Config::from_env_map(env).unwrap();

    let hub = Arc::new(MockGateway::new());
    let gateway: Arc<dyn HubGateway> = hub.clone();
    let services = Services::build(repo.clone(), gateway, &config);

    TestEnv {
        repo,
        hub,
        services,
        config,
        _temp_dir: temp_dir,
    }
}

pub fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn date(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

pub fn tz() -> Tz {
    "Europe/Copenhagen".parse().unwrap()
}

pub fn point_id() -> MeteringPointId {
    MeteringPointId::new(POINT)
}

pub fn period(start: NaiveDate, end: NaiveDate) -> BillingPeriod {
    BillingPeriod::new(start, end).unwrap()
}

pub fn january() -> BillingPeriod {
    period(date(2025, 1, 1), date(2025, 2, 1))
}

pub fn now() -> TimeMs {
    TimeMs::new(1_736_000_000_000)
}

pub async fn add_point(repo: &Repository, activated: bool) {
    repo.upsert_metering_point(&MeteringPoint {
        id: point_id(),
        grid_area: GridArea::new(GRID_AREA),
        price_area: PriceArea::new(PRICE_AREA),
        activated,
    })
    .await
    .unwrap();
}

pub async fn add_contract(
    repo: &Repository,
    payment_model: PaymentModel,
    billing_frequency: BillingFrequency,
) -> Contract {
    repo.insert_contract(&NewContract {
        metering_point_id: point_id(),
        payment_model,
        billing_frequency,
        margin_per_kwh: d("0.10"),
        supplement_per_kwh: None,
        supplier_subscription_monthly: d("25"),
        estimated_annual_kwh: d("4000"),
    })
    .await
    .unwrap()
}

/// Activated point, supply from `supply_start` and an active contract.
pub async fn seed_supplied_point(
    repo: &Repository,
    supply_start: NaiveDate,
    payment_model: PaymentModel,
    billing_frequency: BillingFrequency,
) -> Contract {
    add_point(repo, true).await;
    repo.open_supply_period(&point_id(), supply_start, now())
        .await
        .unwrap();
    add_contract(repo, payment_model, billing_frequency).await
}

/// Grid tariff 0.20, system 0.05, transmission 0.04, tax 0.70, grid
/// subscription 50 per month, all valid from 2024-01-01.
pub async fn seed_tariffs(repo: &Repository) {
    let valid_from = date(2024, 1, 1);
    let versions = [
        (GRID_AREA, ChargeType::GridTariff, vec![d("0.20"); 24]),
        (NATIONAL_SCOPE, ChargeType::SystemTariff, vec![d("0.05")]),
        (NATIONAL_SCOPE, ChargeType::TransmissionTariff, vec![d("0.04")]),
        (NATIONAL_SCOPE, ChargeType::ElectricityTax, vec![d("0.70")]),
        (GRID_AREA, ChargeType::GridSubscription, vec![d("50")]),
    ];
    for (scope, charge_type, rates) in versions {
        repo.upsert_tariff_version(&TariffVersion {
            scope: scope.to_string(),
            charge_type,
            valid_from,
            valid_to: None,
            rates,
        })
        .await
        .unwrap();
    }
}

/// Hourly timestamps of `[start, end)` in the market time zone.
pub fn hours(p: BillingPeriod) -> Vec<TimeMs> {
    let from = local_midnight(p.start, tz()).as_ms();
    let to = local_midnight(p.end, tz()).as_ms();
    (from..to).step_by(HOUR_MS as usize).map(TimeMs::new).collect()
}

pub async fn seed_spot_prices(repo: &Repository, p: BillingPeriod, price: &str) {
    let prices: Vec<SpotPrice> = hours(p)
        .into_iter()
        .map(|timestamp| SpotPrice {
            price_area: PriceArea::new(PRICE_AREA),
            timestamp,
            resolution: Resolution::Hourly,
            price: d(price),
        })
        .collect();
    repo.upsert_spot_prices(&prices).await.unwrap();
}

pub fn samples_at(timestamps: &[TimeMs], quantity: &str, source: &str) -> Vec<MeteringSample> {
    timestamps
        .iter()
        .map(|&timestamp| MeteringSample {
            metering_point_id: point_id(),
            timestamp,
            resolution: Resolution::Hourly,
            quantity: d(quantity),
            quality_code: QualityCode::Measured,
            source_message_id: source.to_string(),
        })
        .collect()
}

pub async fn seed_metering(repo: &Repository, p: BillingPeriod, quantity: &str) {
    repo.upsert_samples(&samples_at(&hours(p), quantity, "seed"), now())
        .await
        .unwrap();
}

/// Prices, tariffs and constant consumption for `p`.
pub async fn seed_period_data(repo: &Repository, p: BillingPeriod, quantity: &str) {
    seed_tariffs(repo).await;
    seed_spot_prices(repo, p, "0.90").await;
    seed_metering(repo, p, quantity).await;
}
