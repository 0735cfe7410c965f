//! Domain primitives: TimeMs, MeteringPointId, GridArea, PriceArea, Resolution.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Time in milliseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeMs(pub i64);

impl TimeMs {
    pub fn new(ms: i64) -> Self {
        TimeMs(ms)
    }

    pub fn now() -> Self {
        TimeMs(Utc::now().timestamp_millis())
    }

    pub fn as_ms(&self) -> i64 {
        self.0
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        TimeMs(dt.timestamp_millis())
    }

    /// Convert to a UTC datetime. Out-of-range values clamp to the epoch.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0)
            .single()
            .unwrap_or_default()
    }

    pub fn plus_minutes(&self, minutes: i64) -> Self {
        TimeMs(self.0 + minutes * 60_000)
    }

    /// The instant `duration` earlier, saturating at the epoch range.
    pub fn minus(&self, duration: std::time::Duration) -> Self {
        let ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        TimeMs(self.0.saturating_sub(ms))
    }
}

impl fmt::Display for TimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

/// Identifier of a physical metering point (GSRN, 18 digits in the Danish market).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeteringPointId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid metering point id: {0}")]
pub struct MeteringPointIdError(pub String);

impl MeteringPointId {
    pub fn new(id: impl Into<String>) -> Self {
        MeteringPointId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MeteringPointId {
    type Err = MeteringPointIdError;

    /// Accepts 18 ASCII digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() == 18 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Ok(MeteringPointId(trimmed.to_string()))
        } else {
            Err(MeteringPointIdError(s.to_string()))
        }
    }
}

impl fmt::Display for MeteringPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Grid area code of the distribution operator, e.g. "344".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GridArea(pub String);

impl GridArea {
    pub fn new(code: impl Into<String>) -> Self {
        GridArea(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GridArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Spot price area, e.g. "DK1" or "DK2".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceArea(pub String);

impl PriceArea {
    pub fn new(code: impl Into<String>) -> Self {
        PriceArea(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PriceArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Time resolution of a metering or price series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "PT1H")]
    Hourly,
    #[serde(rename = "PT15M")]
    QuarterHourly,
}

impl Resolution {
    pub fn minutes(&self) -> i64 {
        match self {
            Resolution::Hourly => 60,
            Resolution::QuarterHourly => 15,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Hourly => "PT1H",
            Resolution::QuarterHourly => "PT15M",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PT1H" => Ok(Resolution::Hourly),
            "PT15M" => Ok(Resolution::QuarterHourly),
            other => Err(format!("unknown resolution {}", other)),
        }
    }
}

/// Store format for calendar dates.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_date(s: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
}

/// UTC instant of local midnight starting `date` in `tz`.
///
/// Midnight never falls in a DST gap for the zones this crate is used with,
/// but an ambiguous or missing midnight resolves to the earliest valid instant.
pub fn local_midnight(date: NaiveDate, tz: Tz) -> TimeMs {
    let naive = date.and_time(NaiveTime::MIN);
    let local = tz
        .from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| tz.from_utc_datetime(&naive));
    TimeMs::from_datetime(local.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metering_point_id_requires_18_digits() {
        assert!(MeteringPointId::from_str("571313180400000001").is_ok());
        assert!(MeteringPointId::from_str("57131318040000000").is_err());
        assert!(MeteringPointId::from_str("57131318040000000x").is_err());
    }

    #[test]
    fn test_resolution_roundtrip_names() {
        assert_eq!(Resolution::from_str("PT1H").unwrap(), Resolution::Hourly);
        assert_eq!(Resolution::QuarterHourly.as_str(), "PT15M");
        assert_eq!(Resolution::QuarterHourly.minutes(), 15);
        assert!(Resolution::from_str("P1D").is_err());
    }

    #[test]
    fn test_local_midnight_copenhagen_winter_and_summer() {
        let tz: Tz = "Europe/Copenhagen".parse().unwrap();
        let winter = local_midnight(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(), tz);
        assert_eq!(winter.to_datetime().to_rfc3339(), "2024-12-31T23:00:00+00:00");
        let summer = local_midnight(NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(), tz);
        assert_eq!(summer.to_datetime().to_rfc3339(), "2025-06-30T22:00:00+00:00");
    }

    #[test]
    fn test_date_format_roundtrip() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        assert_eq!(format_date(date), "2025-03-09");
        assert_eq!(parse_date("2025-03-09").unwrap(), date);
    }

    #[test]
    fn test_minus_saturates() {
        let t = TimeMs::new(10_000);
        assert_eq!(t.minus(std::time::Duration::from_secs(4)), TimeMs::new(6_000));
        assert_eq!(
            TimeMs::new(i64::MIN + 1).minus(std::time::Duration::from_secs(1)),
            TimeMs::new(i64::MIN)
        );
    }
}
