//! Market rules that gate lifecycle, metering, settlement and billing operations.

pub mod rules;

pub use rules::{MarketRules, RuleCheck};
