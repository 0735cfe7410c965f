//! Interval metering samples and their revision trail.

use crate::domain::{Decimal, MeteringPointId, Resolution, TimeMs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Quality flag reported with each metered quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityCode {
    Measured,
    Estimated,
    Calculated,
    Revised,
}

impl QualityCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityCode::Measured => "measured",
            QualityCode::Estimated => "estimated",
            QualityCode::Calculated => "calculated",
            QualityCode::Revised => "revised",
        }
    }
}

impl fmt::Display for QualityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "measured" => Ok(QualityCode::Measured),
            "estimated" => Ok(QualityCode::Estimated),
            "calculated" => Ok(QualityCode::Calculated),
            "revised" => Ok(QualityCode::Revised),
            other => Err(format!("unknown quality code {}", other)),
        }
    }
}

/// One metered interval, keyed by (metering point, interval start).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeteringSample {
    pub metering_point_id: MeteringPointId,
    /// Start of the interval (UTC).
    pub timestamp: TimeMs,
    pub resolution: Resolution,
    /// Consumption in kWh.
    pub quantity: Decimal,
    pub quality_code: QualityCode,
    pub source_message_id: String,
}

/// Written only when an upsert actually changes the stored quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeteringRevision {
    pub id: i64,
    pub metering_point_id: MeteringPointId,
    pub timestamp: TimeMs,
    pub previous_quantity: Decimal,
    pub new_quantity: Decimal,
    pub previous_source: String,
    pub new_source: String,
    pub revised_at: TimeMs,
}

/// Result of storing a batch of samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: usize,
    /// Rows whose quantity changed; one revision row each.
    pub revised: usize,
    pub unchanged: usize,
}

impl UpsertOutcome {
    pub fn total(&self) -> usize {
        self.inserted + self.revised + self.unchanged
    }
}
