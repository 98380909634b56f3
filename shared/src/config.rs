//! Policy configuration
//!
//! Defaults mirror the hardware-independent policy. An optional TOML file
//! and `OA_METRICS_*` environment variables override them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Error, ReportCollectingMode, Result};

/// Ticks of slack allowed between a trigger command and the report the
/// hardware writes for it.
pub const DEFAULT_TRIGGER_THRESHOLD_TICKS: u32 = 4000;

const MAX_TRIGGER_SEARCH_RECORDS: u32 = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Jitter window used when validating triggered reports
    pub trigger_threshold_ticks: u32,

    /// Extra records scanned past a post-tail marker for a triggered report
    pub trigger_search_records: u32,

    /// Allow queries on a root device spanning several sub-devices
    pub allow_implicit_scaling: bool,

    /// Refuse to run when the client supplies no sub-device data
    pub require_client_data: bool,

    /// Attach a user mmio configuration to every query
    pub user_counters_always_on: bool,

    /// Registers sampled by the always-on user configuration
    pub always_on_user_registers: Vec<u32>,

    /// Map the OA buffer during context creation
    pub oa_buffer_mapping_required: bool,

    /// Collection mode used where the generation leaves the choice to policy
    pub default_collecting_mode: ReportCollectingMode,

    /// Return empty reports without reading slot memory
    pub null_query: bool,

    /// perf_stream_paranoid sysctl consulted at initialization
    pub paranoid_path: PathBuf,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            trigger_threshold_ticks: DEFAULT_TRIGGER_THRESHOLD_TICKS,
            trigger_search_records: 8,
            allow_implicit_scaling: false,
            require_client_data: false,
            user_counters_always_on: false,
            always_on_user_registers: Vec::new(),
            oa_buffer_mapping_required: true,
            default_collecting_mode: ReportCollectingMode::ReportPerformanceCounters,
            null_query: false,
            paranoid_path: PathBuf::from("/proc/sys/dev/i915/perf_stream_paranoid"),
        }
    }
}

impl MetricsConfig {
    /// Load defaults, then `path` (if given and present), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let cfg: MetricsConfig = builder
            .add_source(config::Environment::with_prefix("OA_METRICS").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::failed(format!("failed to load configuration: {}", e)))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.trigger_threshold_ticks == 0 {
            return Err(Error::parameter("trigger threshold must be greater than 0"));
        }

        if self.trigger_search_records > MAX_TRIGGER_SEARCH_RECORDS {
            return Err(Error::parameter(format!(
                "trigger search too wide (max {} records)",
                MAX_TRIGGER_SEARCH_RECORDS
            )));
        }

        if self.always_on_user_registers.len() > crate::MAX_USER_REGISTERS {
            return Err(Error::parameter(format!(
                "too many always-on user registers (max {})",
                crate::MAX_USER_REGISTERS
            )));
        }

        Ok(())
    }
}
