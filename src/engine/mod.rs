//! Pure calculators: no I/O, no clock, no store.
//!
//! - `pricing` - per-sample charge formula shared by settlement and correction
//! - `settlement` - period settlement with completeness checks
//! - `correction` - deltas for revised metering on a settled period
//! - `aconto` - prepayment estimate
//! - `reconciliation` - billing policy per payment model

pub mod aconto;
pub mod correction;
pub mod pricing;
pub mod reconciliation;
pub mod settlement;

pub use aconto::{estimate_prepayment, EstimateBasis};
pub use correction::{compute_correction, ChargeDelta, CorrectionResult};
pub use pricing::{charge_sample, PricingError, RateBook, SampleCharges};
pub use reconciliation::{decide, BillingContext, BillingDecision, NextPeriod};
pub use settlement::{
    check_completeness, expected_timestamps, prorated_subscription, settle, ComputedLine,
    SettlementError, SettlementInput, SettlementResult,
};
