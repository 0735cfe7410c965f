//! Billing periods: half-open local-date intervals `[start, end)`.

use crate::domain::primitives::local_midnight;
use crate::domain::{Decimal, TimeMs};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingFrequency {
    Weekly,
    Monthly,
    Quarterly,
}

impl BillingFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingFrequency::Weekly => "weekly",
            BillingFrequency::Monthly => "monthly",
            BillingFrequency::Quarterly => "quarterly",
        }
    }

    /// First boundary strictly after `date`.
    ///
    /// Weekly periods end on a Monday, monthly on the 1st, quarterly on the
    /// 1st of January/April/July/October.
    pub fn next_boundary(&self, date: NaiveDate) -> NaiveDate {
        match self {
            BillingFrequency::Weekly => {
                let days_from_monday = date.weekday().num_days_from_monday() as i64;
                date + Duration::days(7 - days_from_monday)
            }
            BillingFrequency::Monthly => first_of_next_month(date),
            BillingFrequency::Quarterly => {
                let quarter_start_month = ((date.month0() / 3) * 3) + 1;
                let mut boundary = first_of_month(date.year(), quarter_start_month);
                for _ in 0..3 {
                    boundary = first_of_next_month(boundary);
                }
                boundary
            }
        }
    }
}

impl fmt::Display for BillingFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingFrequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weekly" => Ok(BillingFrequency::Weekly),
            "monthly" => Ok(BillingFrequency::Monthly),
            "quarterly" => Ok(BillingFrequency::Quarterly),
            other => Err(format!("unknown billing frequency {}", other)),
        }
    }
}

/// Half-open interval of local calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: NaiveDate,
    /// Exclusive.
    pub end: NaiveDate,
}

impl BillingPeriod {
    /// Returns `None` unless `start < end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start < end).then_some(BillingPeriod { start, end })
    }

    /// The period of `frequency` that contains `date`, clamped to start no
    /// earlier than `supply_start` and to end no later than `supply_end`.
    pub fn containing(
        date: NaiveDate,
        frequency: BillingFrequency,
        supply_start: NaiveDate,
        supply_end: Option<NaiveDate>,
    ) -> Option<Self> {
        let natural_end = frequency.next_boundary(date);
        let natural_start = previous_boundary(frequency, date);
        let start = natural_start.max(supply_start);
        let end = match supply_end {
            Some(limit) => natural_end.min(limit),
            None => natural_end,
        };
        BillingPeriod::new(start, end)
    }

    /// All periods of a supply, in order, whose start is before `until`.
    pub fn sequence(
        frequency: BillingFrequency,
        supply_start: NaiveDate,
        supply_end: Option<NaiveDate>,
        until: NaiveDate,
    ) -> Vec<BillingPeriod> {
        let mut periods = Vec::new();
        let mut cursor = supply_start;
        while cursor < until {
            match BillingPeriod::containing(cursor, frequency, supply_start, supply_end) {
                Some(period) => {
                    cursor = period.end;
                    periods.push(period);
                }
                None => break,
            }
        }
        periods
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    /// A period is due for settlement once `today` reaches its exclusive end.
    pub fn is_closed_on(&self, today: NaiveDate) -> bool {
        today >= self.end
    }

    pub fn start_instant(&self, tz: Tz) -> TimeMs {
        local_midnight(self.start, tz)
    }

    pub fn end_instant(&self, tz: Tz) -> TimeMs {
        local_midnight(self.end, tz)
    }

    /// Fraction of calendar months covered, summed month by month.
    ///
    /// A full calendar month yields exactly 1.
    pub fn month_fraction(&self) -> Decimal {
        let mut total = Decimal::zero();
        let mut cursor = self.start;
        while cursor < self.end {
            let month_end = first_of_next_month(cursor);
            let segment_end = month_end.min(self.end);
            let covered = (segment_end - cursor).num_days();
            let month_days = days_in_month(cursor);
            total += Decimal::from_i64(covered) / Decimal::from_i64(month_days);
            cursor = segment_end;
        }
        total
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

fn previous_boundary(frequency: BillingFrequency, date: NaiveDate) -> NaiveDate {
    match frequency {
        BillingFrequency::Weekly => week_start(date),
        BillingFrequency::Monthly => first_of_month(date.year(), date.month()),
        BillingFrequency::Quarterly => {
            let quarter_start_month = ((date.month0() / 3) * 3) + 1;
            first_of_month(date.year(), quarter_start_month)
        }
    }
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
}

fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    if date.month() == 12 {
        first_of_month(date.year() + 1, 1)
    } else {
        first_of_month(date.year(), date.month() + 1)
    }
}

fn days_in_month(date: NaiveDate) -> i64 {
    let start = first_of_month(date.year(), date.month());
    (first_of_next_month(date) - start).num_days()
}

/// Monday on or before `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    let mut cursor = date;
    while cursor.weekday() != Weekday::Mon {
        cursor -= Duration::days(1);
    }
    cursor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_weekly_period_from_wednesday_effective_date_ends_next_monday() {
        // 2025-01-01 is a Wednesday.
        let period = BillingPeriod::containing(
            date(2025, 1, 1),
            BillingFrequency::Weekly,
            date(2025, 1, 1),
            None,
        )
        .unwrap();
        assert_eq!(period.start, date(2025, 1, 1));
        assert_eq!(period.end, date(2025, 1, 6));
        assert_eq!(period.end.weekday(), Weekday::Mon);
        assert!(!period.is_closed_on(date(2025, 1, 5)));
        assert!(period.is_closed_on(date(2025, 1, 6)));
    }

    #[test]
    fn test_monthly_and_quarterly_boundaries() {
        assert_eq!(
            BillingFrequency::Monthly.next_boundary(date(2024, 12, 15)),
            date(2025, 1, 1)
        );
        assert_eq!(
            BillingFrequency::Quarterly.next_boundary(date(2025, 2, 10)),
            date(2025, 4, 1)
        );
        assert_eq!(
            BillingFrequency::Quarterly.next_boundary(date(2025, 11, 30)),
            date(2026, 1, 1)
        );
        assert_eq!(
            BillingFrequency::Weekly.next_boundary(date(2025, 1, 6)),
            date(2025, 1, 13)
        );
    }

    #[test]
    fn test_sequence_clamps_to_supply_end() {
        let periods = BillingPeriod::sequence(
            BillingFrequency::Monthly,
            date(2025, 1, 15),
            Some(date(2025, 3, 10)),
            date(2025, 12, 31),
        );
        assert_eq!(
            periods,
            vec![
                BillingPeriod::new(date(2025, 1, 15), date(2025, 2, 1)).unwrap(),
                BillingPeriod::new(date(2025, 2, 1), date(2025, 3, 1)).unwrap(),
                BillingPeriod::new(date(2025, 3, 1), date(2025, 3, 10)).unwrap(),
            ]
        );
    }

    #[test]
    fn test_month_fraction_full_month_is_one() {
        let january = BillingPeriod::new(date(2025, 1, 1), date(2025, 2, 1)).unwrap();
        assert_eq!(january.month_fraction(), Decimal::one());
        let february = BillingPeriod::new(date(2024, 2, 1), date(2024, 3, 1)).unwrap();
        assert_eq!(february.month_fraction(), Decimal::one());
    }

    #[test]
    fn test_month_fraction_spanning_two_months() {
        // 2 days of January (31) and 5 days of February (28).
        let period = BillingPeriod::new(date(2025, 1, 30), date(2025, 2, 6)).unwrap();
        let expected = Decimal::from_i64(2) / Decimal::from_i64(31)
            + Decimal::from_i64(5) / Decimal::from_i64(28);
        assert_eq!(period.month_fraction(), expected);
    }

    #[test]
    fn test_empty_period_is_rejected() {
        assert!(BillingPeriod::new(date(2025, 1, 1), date(2025, 1, 1)).is_none());
    }

    #[test]
    fn test_week_start() {
        assert_eq!(week_start(date(2025, 1, 1)), date(2024, 12, 30));
        assert_eq!(week_start(date(2025, 1, 6)), date(2025, 1, 6));
    }
}
