//! Flowkit Core Library
//!
//! This crate provides core domain models, error types, configuration, cron
//! scheduling math, input validation, and credit accounting shared across all
//! Flowkit components.

pub mod billing;
pub mod config;
pub mod constants;
pub mod cron;
pub mod error;
pub mod models;
pub mod step_error;
pub mod validation;

// Re-export commonly used types
pub use billing::{cost_credits, roll_billing_cycle, CycleRollover, ModelPricing};
pub use config::Config;
pub use cron::CronError;
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use step_error::{StepError, StepResultExt};
