//! Services that combine the store, the hub gateway and the pure engines.
//!
//! - `lifecycle` - process state machine operations
//! - `handlers` / `ingestion` - inbound message pipeline
//! - `settlement` / `correction` - settlement runs and correction batches
//! - `billing` - invoice reconciliation
//! - `workers` - interval loops driving all of the above

pub mod billing;
pub mod correction;
pub mod handlers;
pub mod ingestion;
pub mod lifecycle;
pub mod settlement;
pub mod workers;

pub use billing::{BillingReconciler, BillingTickSummary};
pub use correction::CorrectionService;
pub use handlers::{HandlerError, HandlerRegistry, MessageHandler};
pub use ingestion::{IngestionPipeline, PollOutcome, PollSummary};
pub use lifecycle::{EffectuationSummary, ProcessService};
pub use settlement::{SettlementService, SettlementTickSummary};
pub use workers::{local_today, spawn_workers};

use crate::config::Config;
use crate::db::Repository;
use crate::gateway::HubGateway;
use crate::market::MarketRules;
use chrono_tz::Tz;
use std::sync::Arc;

/// Every service wired against one repository and gateway.
#[derive(Debug, Clone)]
pub struct Services {
    pub rules: MarketRules,
    pub processes: ProcessService,
    pub ingestion: IngestionPipeline,
    pub settlement: SettlementService,
    pub corrections: CorrectionService,
    pub billing: BillingReconciler,
    pub tz: Tz,
}

impl Services {
    pub fn build(repo: Arc<Repository>, gateway: Arc<dyn HubGateway>, config: &Config) -> Self {
        let tz = config.market_timezone;
        let rules = MarketRules::new(repo.clone(), tz);
        let processes = ProcessService::new(
            repo.clone(),
            gateway.clone(),
            rules.clone(),
            config.in_flight_lease,
        );
        let handlers =
            HandlerRegistry::standard(processes.clone(), repo.clone(), rules.clone(), tz);
        let ingestion = IngestionPipeline::new(repo.clone(), gateway, handlers);
        let settlement = SettlementService::new(
            repo.clone(),
            rules.clone(),
            tz,
            config.vat_rate,
            config.in_flight_lease,
        );
        let corrections = CorrectionService::new(repo.clone(), settlement.clone());
        let billing = BillingReconciler::new(
            repo,
            rules.clone(),
            config.vat_rate,
            config.aconto_fallback_price_per_kwh,
        );

        Self {
            rules,
            processes,
            ingestion,
            settlement,
            corrections,
            billing,
            tz,
        }
    }
}
