//! Spot prices and regulated tariff versions.

use crate::domain::{ChargeType, Decimal, PriceArea, Resolution, TimeMs};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Scope used for tariffs that apply nationally rather than per grid area.
pub const NATIONAL_SCOPE: &str = "national";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotPrice {
    pub price_area: PriceArea,
    pub timestamp: TimeMs,
    pub resolution: Resolution,
    /// Per kWh.
    pub price: Decimal,
}

/// One validity window of a tariff.
///
/// `rates` holds 24 hour-of-day rates for time-differentiated tariffs or a
/// single flat rate. Subscriptions store one monthly amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TariffVersion {
    pub scope: String,
    pub charge_type: ChargeType,
    pub valid_from: NaiveDate,
    /// Exclusive.
    pub valid_to: Option<NaiveDate>,
    pub rates: Vec<Decimal>,
}

impl TariffVersion {
    pub fn is_valid_on(&self, date: NaiveDate) -> bool {
        self.valid_from <= date && self.valid_to.map_or(true, |to| date < to)
    }

    /// Rate for a local hour of day, or `None` if the table has a shape other
    /// than 1 or 24 entries.
    pub fn rate_for_hour(&self, hour: u32) -> Option<Decimal> {
        match self.rates.len() {
            1 => self.rates.first().copied(),
            24 => self.rates.get(hour as usize).copied(),
            _ => None,
        }
    }
}

/// All versions of one (scope, charge type) tariff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TariffSchedule {
    versions: Vec<TariffVersion>,
}

impl TariffSchedule {
    pub fn new(mut versions: Vec<TariffVersion>) -> Self {
        versions.sort_by_key(|v| v.valid_from);
        Self { versions }
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Latest version valid on `date`.
    pub fn version_on(&self, date: NaiveDate) -> Option<&TariffVersion> {
        self.versions.iter().rev().find(|v| v.is_valid_on(date))
    }

    pub fn rate_at(&self, date: NaiveDate, hour: u32) -> Option<Decimal> {
        self.version_on(date).and_then(|v| v.rate_for_hour(hour))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn version(from: NaiveDate, to: Option<NaiveDate>, rates: &[&str]) -> TariffVersion {
        TariffVersion {
            scope: "344".to_string(),
            charge_type: ChargeType::GridTariff,
            valid_from: from,
            valid_to: to,
            rates: rates.iter().map(|r| Decimal::from_str(r).unwrap()).collect(),
        }
    }

    #[test]
    fn test_flat_rate_applies_to_every_hour() {
        let v = version(date(2025, 1, 1), None, &["0.14"]);
        assert_eq!(v.rate_for_hour(0), v.rate_for_hour(23));
    }

    #[test]
    fn test_hourly_table_is_indexed_by_hour() {
        let rates: Vec<String> = (0..24).map(|h| format!("0.{:02}", h)).collect();
        let refs: Vec<&str> = rates.iter().map(|s| s.as_str()).collect();
        let v = version(date(2025, 1, 1), None, &refs);
        assert_eq!(v.rate_for_hour(17), Some(Decimal::from_str("0.17").unwrap()));
        assert_eq!(v.rate_for_hour(24), None);
    }

    #[test]
    fn test_malformed_table_has_no_rate() {
        let v = version(date(2025, 1, 1), None, &["0.1", "0.2"]);
        assert_eq!(v.rate_for_hour(0), None);
    }

    #[test]
    fn test_schedule_picks_version_valid_on_date() {
        let schedule = TariffSchedule::new(vec![
            version(date(2025, 4, 1), None, &["0.30"]),
            version(date(2025, 1, 1), Some(date(2025, 4, 1)), &["0.20"]),
        ]);
        assert_eq!(
            schedule.rate_at(date(2025, 3, 31), 12),
            Some(Decimal::from_str("0.20").unwrap())
        );
        assert_eq!(
            schedule.rate_at(date(2025, 4, 1), 12),
            Some(Decimal::from_str("0.30").unwrap())
        );
        assert_eq!(schedule.rate_at(date(2024, 12, 31), 12), None);
    }
}
