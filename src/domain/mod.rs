//! Domain types for the supplier back office.
//!
//! This module provides:
//! - Lossless money and quantity handling via the Decimal wrapper
//! - Primitives: TimeMs, MeteringPointId, GridArea, PriceArea, Resolution
//! - The process lifecycle state machine
//! - Metering, market data, settlement and billing records
//! - Inbound message parsing

pub mod billing;
pub mod decimal;
pub mod market_data;
pub mod message;
pub mod metering;
pub mod period;
pub mod portfolio;
pub mod primitives;
pub mod process;
pub mod settlement;

pub use billing::{
    with_vat, AcontoPayment, Invoice, InvoiceLine, InvoiceLineType, InvoiceStatus, InvoiceType,
    PaymentModel,
};
pub use decimal::Decimal;
pub use market_data::{SpotPrice, TariffSchedule, TariffVersion, NATIONAL_SCOPE};
pub use message::{
    parse_message, AckOutcome, InboundMessage, MarketOverride, MessageKind, MessageParseError,
    MeteringBatch, OverrideAction, ParsedMessage, PriceUpdate, ProcessAcknowledgement, QueueName,
    TariffUpdate,
};
pub use metering::{MeteringRevision, MeteringSample, QualityCode, UpsertOutcome};
pub use period::{BillingFrequency, BillingPeriod};
pub use portfolio::{Contract, ContractStatus, MeteringPoint, NewContract, SupplyPeriod};
pub use primitives::{
    format_date, local_midnight, parse_date, GridArea, MeteringPointId, MeteringPointIdError,
    PriceArea, Resolution, TimeMs,
};
pub use process::{
    next_status, EventSource, IllegalTransition, NewProcessRequest, ProcessEvent, ProcessRequest,
    ProcessStatus, ProcessType, TransitionEvent,
};
pub use settlement::{
    ChargeType, CorrectionBatch, CorrectionLine, RunStatus, SettlementLine, SettlementRun,
    TriggerType,
};
