//! Settlement runs, their charge lines, and correction batches.

use crate::domain::{BillingPeriod, Decimal, GridArea, MeteringPointId, TimeMs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One line per charge type on a settlement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeType {
    Energy,
    GridTariff,
    SystemTariff,
    TransmissionTariff,
    ElectricityTax,
    GridSubscription,
    SupplierSubscription,
}

impl ChargeType {
    pub const ALL: [ChargeType; 7] = [
        ChargeType::Energy,
        ChargeType::GridTariff,
        ChargeType::SystemTariff,
        ChargeType::TransmissionTariff,
        ChargeType::ElectricityTax,
        ChargeType::GridSubscription,
        ChargeType::SupplierSubscription,
    ];

    /// Charges computed per metered kWh (everything except subscriptions).
    pub const CONSUMPTION: [ChargeType; 5] = [
        ChargeType::Energy,
        ChargeType::GridTariff,
        ChargeType::SystemTariff,
        ChargeType::TransmissionTariff,
        ChargeType::ElectricityTax,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeType::Energy => "energy",
            ChargeType::GridTariff => "grid_tariff",
            ChargeType::SystemTariff => "system_tariff",
            ChargeType::TransmissionTariff => "transmission_tariff",
            ChargeType::ElectricityTax => "electricity_tax",
            ChargeType::GridSubscription => "grid_subscription",
            ChargeType::SupplierSubscription => "supplier_subscription",
        }
    }

    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            ChargeType::GridSubscription | ChargeType::SupplierSubscription
        )
    }
}

impl fmt::Display for ChargeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChargeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChargeType::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown charge type {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status {}", other)),
        }
    }
}

/// One attempt to settle a (metering point, period, grid area) key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRun {
    pub id: i64,
    pub metering_point_id: MeteringPointId,
    pub billing_period_id: i64,
    pub period: BillingPeriod,
    pub grid_area: GridArea,
    pub version: i64,
    pub status: RunStatus,
    /// Highest metering revision id visible when the input was read.
    pub revision_watermark: i64,
    pub subtotal: Option<Decimal>,
    pub vat: Option<Decimal>,
    pub total: Option<Decimal>,
    pub error: Option<String>,
    pub started_at: TimeMs,
    pub completed_at: Option<TimeMs>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementLine {
    pub run_id: i64,
    pub charge_type: ChargeType,
    pub total_kwh: Decimal,
    pub amount: Decimal,
    pub vat_amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Auto,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Auto => "auto",
        }
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerType::Manual),
            "auto" => Ok(TriggerType::Auto),
            other => Err(format!("unknown trigger type {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionBatch {
    pub id: i64,
    pub original_run_id: i64,
    pub trigger_type: TriggerType,
    /// Highest revision id folded into this batch.
    pub revision_watermark: i64,
    pub created_at: TimeMs,
}

/// Signed delta (revised minus originally billed) for one charge type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionLine {
    pub batch_id: i64,
    pub charge_type: ChargeType,
    pub delta_kwh: Decimal,
    pub delta_amount: Decimal,
    pub delta_vat: Decimal,
}
