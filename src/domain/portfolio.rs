//! Portfolio master data: metering points, supply periods, contracts.

use crate::domain::{
    BillingFrequency, Decimal, GridArea, MeteringPointId, PaymentModel, PriceArea, TimeMs,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeteringPoint {
    pub id: MeteringPointId,
    pub grid_area: GridArea,
    pub price_area: PriceArea,
    pub activated: bool,
}

/// Interval during which we are supplier of record for a metering point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyPeriod {
    pub id: i64,
    pub metering_point_id: MeteringPointId,
    pub start_date: NaiveDate,
    /// Exclusive; `None` while supply continues.
    pub end_date: Option<NaiveDate>,
    pub activated_at: TimeMs,
}

impl SupplyPeriod {
    /// Active on `today` if started and not yet ended.
    pub fn is_active_on(&self, today: NaiveDate) -> bool {
        match self.end_date {
            Some(end) => today < end,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Active,
    Terminated,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractStatus::Active => "active",
            ContractStatus::Terminated => "terminated",
        }
    }
}

impl FromStr for ContractStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ContractStatus::Active),
            "terminated" => Ok(ContractStatus::Terminated),
            other => Err(format!("unknown contract status {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub id: i64,
    pub metering_point_id: MeteringPointId,
    pub payment_model: PaymentModel,
    pub billing_frequency: BillingFrequency,
    pub margin_per_kwh: Decimal,
    pub supplement_per_kwh: Option<Decimal>,
    pub supplier_subscription_monthly: Decimal,
    pub estimated_annual_kwh: Decimal,
    pub status: ContractStatus,
}

/// Contract fields supplied at signup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContract {
    pub metering_point_id: MeteringPointId,
    pub payment_model: PaymentModel,
    pub billing_frequency: BillingFrequency,
    pub margin_per_kwh: Decimal,
    pub supplement_per_kwh: Option<Decimal>,
    pub supplier_subscription_monthly: Decimal,
    pub estimated_annual_kwh: Decimal,
}
