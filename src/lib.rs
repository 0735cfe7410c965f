pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod market;
pub mod orchestration;

pub use config::Config;
pub use db::{init_db, Repository};
pub use domain::{Decimal, MeteringPointId, TimeMs};
pub use error::{AppError, CoreError};
pub use gateway::{HubGateway, MockGateway};
pub use orchestration::Services;
