//! SQLite persistence.
//!
//! This module provides:
//! - Database initialization, pragmas and the idempotent schema
//! - The `Repository`, split by concern across `repo/`

pub mod migrations;
pub mod repo;

pub use migrations::init_db;
pub use repo::{DeadLetter, NewInvoice, Repository, RunTotals, StatusChange, TransitionEffect};
