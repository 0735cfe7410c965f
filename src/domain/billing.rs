//! Invoices, invoice lines and aconto prepayments.

use crate::domain::{BillingPeriod, ChargeType, Decimal, MeteringPointId, TimeMs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentModel {
    /// Billed after the period closes.
    Direct,
    /// Prepaid estimate, reconciled at period close.
    Aconto,
}

impl PaymentModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentModel::Direct => "direct",
            PaymentModel::Aconto => "aconto",
        }
    }
}

impl FromStr for PaymentModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(PaymentModel::Direct),
            "aconto" => Ok(PaymentModel::Aconto),
            other => Err(format!("unknown payment model {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
    AcontoPrepayment,
    Settlement,
}

impl InvoiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceType::AcontoPrepayment => "aconto_prepayment",
            InvoiceType::Settlement => "settlement",
        }
    }
}

impl fmt::Display for InvoiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aconto_prepayment" => Ok(InvoiceType::AcontoPrepayment),
            "settlement" => Ok(InvoiceType::Settlement),
            other => Err(format!("unknown invoice type {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Cancelled,
    Credited,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
            InvoiceStatus::Credited => "credited",
        }
    }
}

impl FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(InvoiceStatus::Draft),
            "sent" => Ok(InvoiceStatus::Sent),
            "paid" => Ok(InvoiceStatus::Paid),
            "cancelled" => Ok(InvoiceStatus::Cancelled),
            "credited" => Ok(InvoiceStatus::Credited),
            other => Err(format!("unknown invoice status {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceLineType {
    Energy,
    GridTariff,
    SystemTariff,
    TransmissionTariff,
    ElectricityTax,
    GridSubscription,
    SupplierSubscription,
    AcontoDeduction,
    AcontoPrepayment,
}

impl InvoiceLineType {
    pub const ALL: [InvoiceLineType; 9] = [
        InvoiceLineType::Energy,
        InvoiceLineType::GridTariff,
        InvoiceLineType::SystemTariff,
        InvoiceLineType::TransmissionTariff,
        InvoiceLineType::ElectricityTax,
        InvoiceLineType::GridSubscription,
        InvoiceLineType::SupplierSubscription,
        InvoiceLineType::AcontoDeduction,
        InvoiceLineType::AcontoPrepayment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceLineType::Energy => "energy",
            InvoiceLineType::GridTariff => "grid_tariff",
            InvoiceLineType::SystemTariff => "system_tariff",
            InvoiceLineType::TransmissionTariff => "transmission_tariff",
            InvoiceLineType::ElectricityTax => "electricity_tax",
            InvoiceLineType::GridSubscription => "grid_subscription",
            InvoiceLineType::SupplierSubscription => "supplier_subscription",
            InvoiceLineType::AcontoDeduction => "aconto_deduction",
            InvoiceLineType::AcontoPrepayment => "aconto_prepayment",
        }
    }
}

impl From<ChargeType> for InvoiceLineType {
    fn from(charge: ChargeType) -> Self {
        match charge {
            ChargeType::Energy => InvoiceLineType::Energy,
            ChargeType::GridTariff => InvoiceLineType::GridTariff,
            ChargeType::SystemTariff => InvoiceLineType::SystemTariff,
            ChargeType::TransmissionTariff => InvoiceLineType::TransmissionTariff,
            ChargeType::ElectricityTax => InvoiceLineType::ElectricityTax,
            ChargeType::GridSubscription => InvoiceLineType::GridSubscription,
            ChargeType::SupplierSubscription => InvoiceLineType::SupplierSubscription,
        }
    }
}

impl FromStr for InvoiceLineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InvoiceLineType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown invoice line type {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: i64,
    pub contract_id: i64,
    pub invoice_type: InvoiceType,
    pub status: InvoiceStatus,
    pub period: BillingPeriod,
    pub settlement_run_id: Option<i64>,
    pub total_ex_vat: Decimal,
    pub total_incl_vat: Decimal,
    pub created_at: TimeMs,
}

/// Lines carry the period they account for, which is not always the
/// invoice's own period (a settlement invoice seeds the next prepayment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub line_type: InvoiceLineType,
    pub description: String,
    pub period: BillingPeriod,
    pub amount_ex_vat: Decimal,
    pub amount_incl_vat: Decimal,
}

impl InvoiceLine {
    pub fn new(
        line_type: InvoiceLineType,
        description: impl Into<String>,
        period: BillingPeriod,
        amount_ex_vat: Decimal,
        vat_rate: Decimal,
    ) -> Self {
        let amount_ex_vat = amount_ex_vat.round_money();
        Self {
            line_type,
            description: description.into(),
            period,
            amount_ex_vat,
            amount_incl_vat: with_vat(amount_ex_vat, vat_rate),
        }
    }
}

/// `amount + round(amount × vat_rate)`.
pub fn with_vat(amount_ex_vat: Decimal, vat_rate: Decimal) -> Decimal {
    amount_ex_vat + (amount_ex_vat * vat_rate).round_money()
}

/// A recorded prepayment for one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcontoPayment {
    pub id: i64,
    pub metering_point_id: MeteringPointId,
    pub period: BillingPeriod,
    /// Excluding VAT.
    pub amount: Decimal,
    pub invoice_id: Option<i64>,
    pub paid_at: Option<TimeMs>,
}
