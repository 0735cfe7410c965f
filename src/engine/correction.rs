//! Correction deltas for revised metering data on a settled period.
//!
//! For each revised interval the originally billed quantity is the
//! `previous_quantity` of the earliest revision after the run's watermark; the
//! revised quantity is the current sample. Both are priced with
//! [`charge_sample`], so a revision that changes nothing yields zero deltas.

use crate::domain::{
    ChargeType, CorrectionLine, Decimal, MeteringRevision, MeteringSample, TimeMs,
};
use crate::engine::pricing::{charge_sample, PricingError, RateBook, SampleCharges};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeDelta {
    pub charge_type: ChargeType,
    pub delta_kwh: Decimal,
    pub delta_amount: Decimal,
    pub delta_vat: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionResult {
    pub deltas: Vec<ChargeDelta>,
    /// Highest revision id folded into these deltas.
    pub revision_watermark: i64,
    /// Number of distinct revised intervals.
    pub revised_intervals: usize,
}

impl CorrectionResult {
    pub fn delta(&self, charge_type: ChargeType) -> Option<&ChargeDelta> {
        self.deltas.iter().find(|d| d.charge_type == charge_type)
    }

    pub fn net_amount(&self) -> Decimal {
        self.deltas.iter().map(|d| d.delta_amount).sum()
    }

    pub fn to_correction_lines(&self, batch_id: i64) -> Vec<CorrectionLine> {
        self.deltas
            .iter()
            .map(|d| CorrectionLine {
                batch_id,
                charge_type: d.charge_type,
                delta_kwh: d.delta_kwh,
                delta_amount: d.delta_amount,
                delta_vat: d.delta_vat,
            })
            .collect()
    }
}

/// Compute per-charge-type deltas for `revisions`.
///
/// Returns `Ok(None)` when there are no revisions to fold.
pub fn compute_correction(
    revisions: &[MeteringRevision],
    current: &[MeteringSample],
    rates: &RateBook,
    vat_rate: Decimal,
) -> Result<Option<CorrectionResult>, PricingError> {
    let Some(revision_watermark) = revisions.iter().map(|r| r.id).max() else {
        return Ok(None);
    };

    let current_by_ts: HashMap<i64, Decimal> = current
        .iter()
        .map(|s| (s.timestamp.as_ms(), s.quantity))
        .collect();

    // (original, revised) per interval; BTreeMap keeps pricing order stable
    let mut intervals: BTreeMap<i64, (Decimal, Decimal)> = BTreeMap::new();
    let mut ordered: Vec<&MeteringRevision> = revisions.iter().collect();
    ordered.sort_by_key(|r| r.id);
    for revision in ordered {
        let ts = revision.timestamp.as_ms();
        let revised = current_by_ts
            .get(&ts)
            .copied()
            .unwrap_or(revision.new_quantity);
        intervals
            .entry(ts)
            .and_modify(|entry| entry.1 = revised)
            .or_insert((revision.previous_quantity, revised));
    }

    let mut original_sum = SampleCharges::default();
    let mut revised_sum = SampleCharges::default();
    let mut delta_kwh = Decimal::zero();
    for (ts, (original, revised)) in &intervals {
        let timestamp = TimeMs::new(*ts);
        original_sum += charge_sample(timestamp, *original, rates)?;
        revised_sum += charge_sample(timestamp, *revised, rates)?;
        delta_kwh += *revised - *original;
    }

    let deltas = ChargeType::CONSUMPTION
        .into_iter()
        .map(|charge_type| {
            let delta_amount =
                (revised_sum.amount(charge_type) - original_sum.amount(charge_type)).round_money();
            ChargeDelta {
                charge_type,
                delta_kwh,
                delta_amount,
                delta_vat: (delta_amount * vat_rate).round_money(),
            }
        })
        .collect();

    Ok(Some(CorrectionResult {
        deltas,
        revision_watermark,
        revised_intervals: intervals.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        local_midnight, MeteringPointId, PriceArea, QualityCode, Resolution, SpotPrice,
        TariffSchedule, TariffVersion, NATIONAL_SCOPE,
    };
    use chrono::NaiveDate;
    use chrono_tz::Tz;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn tz() -> Tz {
        "Europe/Copenhagen".parse().unwrap()
    }

    fn start() -> TimeMs {
        local_midnight(NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(), tz())
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

    fn rates() -> RateBook {
        let prices: Vec<SpotPrice> = (0..24)
            .map(|h| SpotPrice {
                price_area: PriceArea::new("DK1"),
                timestamp: start().plus_minutes(h * 60),
                resolution: Resolution::Hourly,
                price: d("1.00"),
            })
            .collect();
        RateBook::new(tz(), d("0.10"), None, &prices).with_tariffs(
            flat(ChargeType::GridTariff, "0.20"),
            flat(ChargeType::SystemTariff, "0.07"),
            flat(ChargeType::TransmissionTariff, "0.05"),
            flat(ChargeType::ElectricityTax, "0.76"),
        )
    }

    fn revision(id: i64, hour: i64, previous: &str, new: &str) -> MeteringRevision {
        MeteringRevision {
            id,
            metering_point_id: MeteringPointId::new("571313180400000001"),
            timestamp: start().plus_minutes(hour * 60),
            previous_quantity: d(previous),
            new_quantity: d(new),
            previous_source: "m1".to_string(),
            new_source: format!("m{}", id + 1),
            revised_at: TimeMs::new(0),
        }
    }

    fn sample(hour: i64, quantity: &str) -> MeteringSample {
        MeteringSample {
            metering_point_id: MeteringPointId::new("571313180400000001"),
            timestamp: start().plus_minutes(hour * 60),
            resolution: Resolution::Hourly,
            quantity: d(quantity),
            quality_code: QualityCode::Measured,
            source_message_id: "m2".to_string(),
        }
    }

    #[test]
    fn test_no_revisions_no_correction() {
        assert_eq!(compute_correction(&[], &[], &rates(), d("0.25")), Ok(None));
    }

    #[test]
    fn test_increase_yields_positive_deltas() {
        let revisions = vec![revision(7, 3, "1.0", "3.0")];
        let current = vec![sample(3, "3.0")];

        let result = compute_correction(&revisions, &current, &rates(), d("0.25"))
            .unwrap()
            .unwrap();

        let energy = result.delta(ChargeType::Energy).unwrap();
        assert_eq!(energy.delta_kwh, d("2"));
        assert_eq!(energy.delta_amount, d("2.20"));
        assert_eq!(energy.delta_vat, d("0.55"));
        assert_eq!(
            result.delta(ChargeType::GridTariff).unwrap().delta_amount,
            d("0.40")
        );
        assert_eq!(result.revision_watermark, 7);
        assert_eq!(result.revised_intervals, 1);
    }

    #[test]
    fn test_decrease_yields_negative_deltas() {
        let revisions = vec![revision(1, 0, "2.0", "0.5")];
        let current = vec![sample(0, "0.5")];

        let result = compute_correction(&revisions, &current, &rates(), d("0.25"))
            .unwrap()
            .unwrap();

        assert_eq!(
            result.delta(ChargeType::Energy).unwrap().delta_amount,
            d("-1.65")
        );
        assert!(result.net_amount().is_negative());
    }

    #[test]
    fn test_chained_revisions_compare_against_first_original() {
        let revisions = vec![revision(2, 5, "1.0", "1.5"), revision(4, 5, "1.5", "2.0")];
        let current = vec![sample(5, "2.0")];

        let result = compute_correction(&revisions, &current, &rates(), d("0.25"))
            .unwrap()
            .unwrap();

        assert_eq!(result.delta(ChargeType::Energy).unwrap().delta_kwh, d("1.0"));
        assert_eq!(result.revision_watermark, 4);
        assert_eq!(result.revised_intervals, 1);
    }

    #[test]
    fn test_revision_back_to_original_nets_zero() {
        let revisions = vec![revision(1, 2, "1.0", "4.0"), revision(2, 2, "4.0", "1.0")];
        let current = vec![sample(2, "1.0")];

        let result = compute_correction(&revisions, &current, &rates(), d("0.25"))
            .unwrap()
            .unwrap();

        assert!(result.deltas.iter().all(|d| d.delta_amount.is_zero()));
        assert!(result.deltas.iter().all(|d| d.delta_vat.is_zero()));
    }
}
