//! Read-only market rule checks.
//!
//! Every check reads the store at call time; callers run it immediately before
//! the operation it gates.

use crate::db::Repository;
use crate::domain::{BillingPeriod, MeteringPointId, ProcessStatus};
use crate::error::CoreError;
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleCheck {
    pub valid: bool,
    pub reason: Option<String>,
}

impl RuleCheck {
    pub fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }

    /// `Validation` error carrying the reason when the check failed.
    pub fn into_result(self) -> Result<(), CoreError> {
        match self.reason {
            Some(reason) if !self.valid => Err(CoreError::Validation(reason)),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketRules {
    repo: Arc<Repository>,
    tz: Tz,
}

impl MarketRules {
    pub fn new(repo: Arc<Repository>, tz: Tz) -> Self {
        Self { repo, tz }
    }

    /// A supplier change (switch or move-in) needs a free point.
    pub async fn can_change_supplier(
        &self,
        id: &MeteringPointId,
        today: NaiveDate,
    ) -> Result<RuleCheck, CoreError> {
        if self.repo.get_metering_point(id).await?.is_none() {
            return Ok(RuleCheck::invalid(format!("unknown metering point {}", id)));
        }
        if let Some(supply) = self.repo.active_supply_period(id, today).await? {
            return Ok(RuleCheck::invalid(format!(
                "metering point {} is already supplied since {}",
                id, supply.start_date
            )));
        }
        if let Some(process) = self.repo.open_process_for_point(id).await? {
            return Ok(RuleCheck::invalid(format!(
                "metering point {} has open {} process {} ({})",
                id, process.process_type, process.id, process.status
            )));
        }
        Ok(RuleCheck::ok())
    }

    /// Ending supply (move-out or end of supply) needs an active supply and
    /// no other open process.
    pub async fn can_end_supply(
        &self,
        id: &MeteringPointId,
        today: NaiveDate,
    ) -> Result<RuleCheck, CoreError> {
        if self.repo.active_supply_period(id, today).await?.is_none() {
            return Ok(RuleCheck::invalid(format!(
                "metering point {} has no active supply period",
                id
            )));
        }
        if let Some(process) = self.repo.open_process_for_point(id).await? {
            return Ok(RuleCheck::invalid(format!(
                "metering point {} has open {} process {} ({})",
                id, process.process_type, process.id, process.status
            )));
        }
        Ok(RuleCheck::ok())
    }

    /// Metering data is accepted for activated points supplied on `reading_date`.
    pub async fn can_receive_metering(
        &self,
        id: &MeteringPointId,
        reading_date: NaiveDate,
    ) -> Result<RuleCheck, CoreError> {
        match self.repo.get_metering_point(id).await? {
            None => return Ok(RuleCheck::invalid(format!("unknown metering point {}", id))),
            Some(point) if !point.activated => {
                return Ok(RuleCheck::invalid(format!(
                    "metering point {} is not activated",
                    id
                )))
            }
            Some(_) => {}
        }
        if self.repo.active_supply_period(id, reading_date).await?.is_none() {
            return Ok(RuleCheck::invalid(format!(
                "metering point {} has no supply period on {}",
                id, reading_date
            )));
        }
        Ok(RuleCheck::ok())
    }

    /// Settlement needs an active contract and metering data not yet settled.
    pub async fn can_run_settlement(
        &self,
        id: &MeteringPointId,
        period: BillingPeriod,
    ) -> Result<RuleCheck, CoreError> {
        let Some(point) = self.repo.get_metering_point(id).await? else {
            return Ok(RuleCheck::invalid(format!("unknown metering point {}", id)));
        };
        if self.repo.active_contract(id).await?.is_none() {
            return Ok(RuleCheck::invalid(format!(
                "metering point {} has no active contract",
                id
            )));
        }
        let has_data = self
            .repo
            .has_samples_in_range(id, period.start_instant(self.tz), period.end_instant(self.tz))
            .await?;
        if !has_data {
            return Ok(RuleCheck::invalid(format!(
                "no metering data for {} in {}",
                id, period
            )));
        }
        if self
            .repo
            .completed_settlement_run(id, period, &point.grid_area)
            .await?
            .is_some()
        {
            return Ok(RuleCheck::invalid(format!(
                "{} is already settled for {}",
                period, id
            )));
        }
        Ok(RuleCheck::ok())
    }

    /// Offboarding needs an active supply, a completed process to leave and no
    /// other open process.
    pub async fn can_offboard(
        &self,
        id: &MeteringPointId,
        today: NaiveDate,
    ) -> Result<RuleCheck, CoreError> {
        if self.repo.active_supply_period(id, today).await?.is_none() {
            return Ok(RuleCheck::invalid(format!(
                "metering point {} has no active supply period",
                id
            )));
        }
        if self
            .repo
            .latest_process_with_status(id, ProcessStatus::Completed)
            .await?
            .is_none()
        {
            return Ok(RuleCheck::invalid(format!(
                "metering point {} has no completed process",
                id
            )));
        }
        if let Some(open) = self.repo.open_process_for_point(id).await? {
            return Ok(RuleCheck::invalid(format!(
                "metering point {} has an open {} process",
                id, open.process_type
            )));
        }
        Ok(RuleCheck::ok())
    }

    /// Aconto billing needs an active supply and an active contract.
    pub async fn can_bill_aconto(
        &self,
        id: &MeteringPointId,
        today: NaiveDate,
    ) -> Result<RuleCheck, CoreError> {
        if self.repo.active_supply_period(id, today).await?.is_none() {
            return Ok(RuleCheck::invalid(format!(
                "metering point {} has no active supply period",
                id
            )));
        }
        if self.repo.active_contract(id).await?.is_none() {
            return Ok(RuleCheck::invalid(format!(
                "metering point {} has no active contract",
                id
            )));
        }
        Ok(RuleCheck::ok())
    }
}
