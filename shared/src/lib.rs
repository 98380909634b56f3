//! Shared types and utilities for oa-metrics
//!
//! This crate contains the status codes, hardware record layouts, generation
//! enums and configuration used by the query engine and the diagnostic CLI.

pub mod config;
pub mod status;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::MetricsConfig;
pub use status::{Error, Result, StatusCode};
pub use types::{generation::*, report::*};
