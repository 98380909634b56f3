//! Kernel-facing collaborators
//!
//! [`IoControl`] is the narrow view of the DRM driver this library needs:
//! device identification, engine and memory-region enumeration, metric-set
//! loading and the OA stream. [`KernelInterface`] performs the one-time
//! initialization sequence on top of it.

pub mod memory;
pub mod tbs;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use oa_metrics_shared::{EngineClass, Error, Generation, MetricsConfig, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::generation::{traits_for, GenerationTraits};
use crate::sub_device::{SubDeviceClientData, SubDeviceTopology};
use memory::GpuMemory;
use tbs::StreamParams;

/// Clock a timestamp frequency is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampDomain {
    /// Timestamps written into OA reports
    Oa,
    /// Command streamer TIMESTAMP register
    CommandStreamer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EngineInfo {
    pub class: EngineClass,
    pub instance: u16,
    /// Tile or gt the engine lives on
    pub gt_id: u16,
}

impl fmt::Display for EngineInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{} (gt {})", self.class, self.instance, self.gt_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MemoryClass {
    System,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MemoryRegion {
    pub class: MemoryClass,
    pub instance: u16,
}

/// OA unit as reported by newer kernels, with the engines it observes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OaUnit {
    pub id: u32,
    pub gt_id: u16,
    pub engines: Vec<EngineInfo>,
}

pub trait IoControl: Send + Sync + fmt::Debug {
    /// PCI device id.
    fn chipset_id(&self) -> Result<u32>;

    fn gpu_timestamp_frequency(&self, domain: TimestampDomain) -> Result<u64>;

    fn query_engines(&self) -> Result<Vec<EngineInfo>>;

    fn query_memory_regions(&self) -> Result<Vec<MemoryRegion>>;

    /// Affinity between an engine and a memory region; 0 means co-located.
    fn query_distance(&self, engine: &EngineInfo, region: &MemoryRegion) -> Result<u32>;

    /// OA unit topology, `None` on kernels without the query.
    fn query_oa_units(&self) -> Result<Option<Vec<OaUnit>>> {
        Ok(None)
    }

    /// Kernel-level support for running queries on a non-zero sub-device.
    fn sub_device_supported(&self) -> bool;

    /// Register a metric set with the kernel, returning its kernel id.
    fn load_metric_set(&self, set_id: u32) -> Result<u64>;

    fn unload_metric_set(&self, kernel_id: u64) -> Result<()>;

    /// Open the OA stream and map its ring buffer.
    fn open_oa_stream(&self, params: &StreamParams) -> Result<Arc<dyn GpuMemory>>;

    fn close_oa_stream(&self) -> Result<()>;

    /// Debug override that turns every GetData into an empty success.
    fn null_query_override(&self) -> bool {
        false
    }
}

/// Initialized kernel state for one context.
#[derive(Debug)]
pub struct KernelInterface {
    io: Arc<dyn IoControl>,
    chipset_id: u32,
    traits: &'static dyn GenerationTraits,
    oa_frequency: u64,
    topology: SubDeviceTopology,
}

impl KernelInterface {
    /// Identify the device and bring up the sub-device topology.
    ///
    /// A disabled topology fails initialization.
    #[instrument(skip_all, fields(client = ?client))]
    pub fn initialize(
        io: Arc<dyn IoControl>,
        client: Option<SubDeviceClientData>,
        config: &MetricsConfig,
    ) -> Result<Self> {
        let chipset_id = io.chipset_id()?;
        let generation = Generation::from_chipset(chipset_id).ok_or(Error::UnknownGen(chipset_id))?;
        let traits = traits_for(generation);

        let oa_frequency = io.gpu_timestamp_frequency(TimestampDomain::Oa)?;
        if oa_frequency == 0 {
            return Err(Error::IoControl {
                request: "gpu_timestamp_frequency",
                reason: "zero frequency".into(),
            });
        }

        check_paranoid(&config.paranoid_path);

        let mut topology = SubDeviceTopology::new(client);
        topology.initialize(io.as_ref(), traits, config)?;
        if !topology.is_enabled() {
            return Err(Error::failed("sub-device topology is disabled"));
        }

        info!(
            chipset = %format!("{:#06x}", chipset_id),
            %generation,
            oa_frequency,
            engines = topology.engines().len(),
            "kernel interface initialized"
        );

        Ok(Self {
            io,
            chipset_id,
            traits,
            oa_frequency,
            topology,
        })
    }

    pub fn io(&self) -> &Arc<dyn IoControl> {
        &self.io
    }

    pub fn chipset_id(&self) -> u32 {
        self.chipset_id
    }

    pub fn generation(&self) -> Generation {
        self.traits.generation()
    }

    pub fn traits(&self) -> &'static dyn GenerationTraits {
        self.traits
    }

    /// OA timestamp frequency in Hz.
    pub fn oa_frequency(&self) -> u64 {
        self.oa_frequency
    }

    pub fn topology(&self) -> &SubDeviceTopology {
        &self.topology
    }

    pub fn null_query_override(&self) -> bool {
        self.io.null_query_override()
    }
}

/// Warn when unprivileged OA streams are not permitted. Never fails.
fn check_paranoid(path: &Path) {
    match std::fs::read_to_string(path) {
        Ok(value) if value.trim() == "0" => {}
        Ok(value) => {
            warn!(
                path = %path.display(),
                value = value.trim(),
                "perf stream paranoid mode is enabled, OA collection may require privileges"
            );
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unable to read perf stream paranoid mode");
        }
    }
}
