//! Per-sample charge formula shared by settlement and correction.
//!
//! Amounts produced here are never rounded; callers sum them per charge type
//! and round once with [`Decimal::round_money`].

use crate::domain::{ChargeType, Decimal, SpotPrice, TariffSchedule, TimeMs};
use chrono::{NaiveDate, Timelike};
use chrono_tz::Tz;
use std::collections::HashMap;
use thiserror::Error;

const HOUR_MS: i64 = 3_600_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PricingError {
    #[error("no spot price for {timestamp}")]
    MissingSpotPrice { timestamp: TimeMs },
    #[error("no {charge_type} rate valid on {date} hour {hour}")]
    MissingTariff {
        charge_type: ChargeType,
        date: NaiveDate,
        hour: u32,
    },
}

/// Prices and tariffs needed to price consumption at one metering point.
#[derive(Debug, Clone)]
pub struct RateBook {
    pub tz: Tz,
    pub margin_per_kwh: Decimal,
    pub supplement_per_kwh: Decimal,
    spot: HashMap<i64, Decimal>,
    pub grid_tariff: TariffSchedule,
    pub system_tariff: TariffSchedule,
    pub transmission_tariff: TariffSchedule,
    pub electricity_tax: TariffSchedule,
}

impl RateBook {
    pub fn new(
        tz: Tz,
        margin_per_kwh: Decimal,
        supplement_per_kwh: Option<Decimal>,
        spot_prices: &[SpotPrice],
    ) -> Self {
        Self {
            tz,
            margin_per_kwh,
            supplement_per_kwh: supplement_per_kwh.unwrap_or_default(),
            spot: spot_prices
                .iter()
                .map(|p| (p.timestamp.as_ms(), p.price))
                .collect(),
            grid_tariff: TariffSchedule::default(),
            system_tariff: TariffSchedule::default(),
            transmission_tariff: TariffSchedule::default(),
            electricity_tax: TariffSchedule::default(),
        }
    }

    pub fn with_tariffs(
        mut self,
        grid: TariffSchedule,
        system: TariffSchedule,
        transmission: TariffSchedule,
        tax: TariffSchedule,
    ) -> Self {
        self.grid_tariff = grid;
        self.system_tariff = system;
        self.transmission_tariff = transmission;
        self.electricity_tax = tax;
        self
    }

    /// Spot price for the interval starting at `timestamp`.
    ///
    /// Sub-hourly samples fall back to the hourly price covering them.
    pub fn spot_price(&self, timestamp: TimeMs) -> Option<Decimal> {
        let ms = timestamp.as_ms();
        self.spot
            .get(&ms)
            .or_else(|| self.spot.get(&(ms - ms.rem_euclid(HOUR_MS))))
            .copied()
    }

    fn schedule(&self, charge_type: ChargeType) -> Option<&TariffSchedule> {
        match charge_type {
            ChargeType::GridTariff => Some(&self.grid_tariff),
            ChargeType::SystemTariff => Some(&self.system_tariff),
            ChargeType::TransmissionTariff => Some(&self.transmission_tariff),
            ChargeType::ElectricityTax => Some(&self.electricity_tax),
            _ => None,
        }
    }

    fn tariff_rate(
        &self,
        charge_type: ChargeType,
        date: NaiveDate,
        hour: u32,
    ) -> Result<Decimal, PricingError> {
        self.schedule(charge_type)
            .and_then(|s| s.rate_at(date, hour))
            .ok_or(PricingError::MissingTariff {
                charge_type,
                date,
                hour,
            })
    }
}

/// Consumption charges for one sample, one amount per consumption charge type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleCharges {
    pub energy: Decimal,
    pub grid_tariff: Decimal,
    pub system_tariff: Decimal,
    pub transmission_tariff: Decimal,
    pub electricity_tax: Decimal,
}

impl SampleCharges {
    pub fn amount(&self, charge_type: ChargeType) -> Decimal {
        match charge_type {
            ChargeType::Energy => self.energy,
            ChargeType::GridTariff => self.grid_tariff,
            ChargeType::SystemTariff => self.system_tariff,
            ChargeType::TransmissionTariff => self.transmission_tariff,
            ChargeType::ElectricityTax => self.electricity_tax,
            ChargeType::GridSubscription | ChargeType::SupplierSubscription => Decimal::zero(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChargeType, Decimal)> + '_ {
        ChargeType::CONSUMPTION
            .into_iter()
            .map(move |charge_type| (charge_type, self.amount(charge_type)))
    }
}

impl std::ops::AddAssign for SampleCharges {
    fn add_assign(&mut self, rhs: Self) {
        self.energy += rhs.energy;
        self.grid_tariff += rhs.grid_tariff;
        self.system_tariff += rhs.system_tariff;
        self.transmission_tariff += rhs.transmission_tariff;
        self.electricity_tax += rhs.electricity_tax;
    }
}

/// Price `quantity` kWh consumed in the interval starting at `timestamp`.
///
/// Tariffs are looked up by the local date and hour of the interval start.
pub fn charge_sample(
    timestamp: TimeMs,
    quantity: Decimal,
    rates: &RateBook,
) -> Result<SampleCharges, PricingError> {
    let local = timestamp.to_datetime().with_timezone(&rates.tz);
    let date = local.date_naive();
    let hour = local.hour();

    let spot = rates
        .spot_price(timestamp)
        .ok_or(PricingError::MissingSpotPrice { timestamp })?;

    Ok(SampleCharges {
        energy: quantity * (spot + rates.margin_per_kwh + rates.supplement_per_kwh),
        grid_tariff: quantity * rates.tariff_rate(ChargeType::GridTariff, date, hour)?,
        system_tariff: quantity * rates.tariff_rate(ChargeType::SystemTariff, date, hour)?,
        transmission_tariff: quantity
            * rates.tariff_rate(ChargeType::TransmissionTariff, date, hour)?,
        electricity_tax: quantity * rates.tariff_rate(ChargeType::ElectricityTax, date, hour)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{local_midnight, PriceArea, Resolution, TariffVersion, NATIONAL_SCOPE};
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn tz() -> Tz {
        "Europe/Copenhagen".parse().unwrap()
    }

    fn flat(charge_type: ChargeType, rate: &str) -> TariffSchedule {
        TariffSchedule::new(vec![TariffVersion {
            scope: NATIONAL_SCOPE.to_string(),
            charge_type,
            valid_from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            valid_to: None,
            rates: vec![d(rate)],
        }])
    }

    fn hourly_grid() -> TariffSchedule {
        let rates = (0..24)
            .map(|h| if (17..21).contains(&h) { d("0.60") } else { d("0.20") })
            .collect();
        TariffSchedule::new(vec![TariffVersion {
            scope: "344".to_string(),
            charge_type: ChargeType::GridTariff,
            valid_from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            valid_to: None,
            rates,
        }])
    }

    fn book(prices: &[SpotPrice]) -> RateBook {
        RateBook::new(tz(), d("0.10"), Some(d("0.05")), prices).with_tariffs(
            hourly_grid(),
            flat(ChargeType::SystemTariff, "0.07"),
            flat(ChargeType::TransmissionTariff, "0.05"),
            flat(ChargeType::ElectricityTax, "0.76"),
        )
    }

    fn price(ts: TimeMs, value: &str) -> SpotPrice {
        SpotPrice {
            price_area: PriceArea::new("DK1"),
            timestamp: ts,
            resolution: Resolution::Hourly,
            price: d(value),
        }
    }

    #[test]
    fn test_charge_sample_applies_every_rate() {
        let start = local_midnight(NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(), tz());
        let rates = book(&[price(start, "1.00")]);

        let charges = charge_sample(start, d("2"), &rates).unwrap();

        assert_eq!(charges.energy, d("2.30"));
        assert_eq!(charges.grid_tariff, d("0.40"));
        assert_eq!(charges.system_tariff, d("0.14"));
        assert_eq!(charges.transmission_tariff, d("0.10"));
        assert_eq!(charges.electricity_tax, d("1.52"));
    }

    #[test]
    fn test_grid_rate_uses_local_hour() {
        let midnight = local_midnight(NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(), tz());
        let five_pm = midnight.plus_minutes(17 * 60);
        let rates = book(&[price(five_pm, "1.00")]);

        let charges = charge_sample(five_pm, d("1"), &rates).unwrap();

        assert_eq!(charges.grid_tariff, d("0.60"));
    }

    #[test]
    fn test_quarter_hour_sample_uses_hourly_price() {
        let start = local_midnight(NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(), tz());
        let rates = book(&[price(start, "0.80")]);

        let charges = charge_sample(start.plus_minutes(45), d("1"), &rates).unwrap();

        assert_eq!(charges.energy, d("0.95"));
    }

    #[test]
    fn test_missing_price_is_an_error() {
        let start = local_midnight(NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(), tz());
        let rates = book(&[]);

        let err = charge_sample(start, d("1"), &rates).unwrap_err();
        assert_eq!(err, PricingError::MissingSpotPrice { timestamp: start });
    }

    #[test]
    fn test_missing_tariff_is_an_error() {
        let start = local_midnight(NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(), tz());
        let rates = RateBook::new(tz(), d("0"), None, &[price(start, "1")]);

        let err = charge_sample(start, d("1"), &rates).unwrap_err();
        assert!(matches!(
            err,
            PricingError::MissingTariff {
                charge_type: ChargeType::GridTariff,
                ..
            }
        ));
    }
}
