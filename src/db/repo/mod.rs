//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by domain:
//! - `portfolio.rs` - Metering points, supply periods and contracts
//! - `processes.rs` - Process requests and their event timeline
//! - `messages.rs` - Processed-message ledger and dead letters
//! - `metering.rs` - Metering samples and revisions
//! - `market.rs` - Spot prices and tariff versions
//! - `settlement.rs` - Billing periods, settlement runs and corrections
//! - `billing.rs` - Invoices and aconto payments

mod billing;
mod market;
mod messages;
mod metering;
mod portfolio;
mod processes;
mod settlement;

pub use billing::NewInvoice;
pub use messages::DeadLetter;
pub use processes::{StatusChange, TransitionEffect};
pub use settlement::RunTotals;

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::fmt;
use std::str::FromStr;

/// Repository for database operations.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    /// Cheap round-trip used by the readiness probe.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        let _: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

/// Parse a TEXT column through `FromStr`, surfacing failures as decode errors.
pub(crate) fn decode<T>(raw: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    T::from_str(raw).map_err(|e| sqlx::Error::Decode(format!("{}: {:?}", e, raw).into()))
}

pub(crate) fn get_parsed<T>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw: String = row.try_get(column)?;
    decode(&raw)
}

pub(crate) fn get_parsed_opt<T>(row: &SqliteRow, column: &str) -> Result<Option<T>, sqlx::Error>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.as_deref().map(decode).transpose()
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}
