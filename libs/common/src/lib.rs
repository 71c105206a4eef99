//! pumpsrv basic library
//!
//! Provides functions shared by all services:
//! - logging bootstrap (console + daily rolling file)
//! - shutdown signal handling
//! - logging configuration types

pub mod logging;
pub mod shutdown;

pub use logging::LoggingConfig;
