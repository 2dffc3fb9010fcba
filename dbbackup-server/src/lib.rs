//! Backup orchestration for MySQL/MariaDB servers.
//!
//! Full dumps and binary-log incrementals run through a bounded worker pool
//! gated by host memory, with job and summary records kept in SQLite.

pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod models;
pub mod notify;
pub mod services;
pub mod state;
pub mod store;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use config::AppConfig;
pub use error::{EngineError, Result};
pub use services::engine::BackupEngine;
