//! Sub-device and engine topology
//!
//! Discovers which engines belong to the sub-device a context was created
//! for and decides, once, whether OA collection is allowed at all. A
//! disabled topology is terminal for the context.

use std::collections::BTreeSet;

use oa_metrics_shared::{EngineClass, MetricsConfig, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::generation::GenerationTraits;
use crate::kernel::{EngineInfo, IoControl, MemoryClass, MemoryRegion, OaUnit};

/// Sub-device description supplied by the client driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SubDeviceClientData {
    pub is_sub_device: bool,
    pub sub_device_index: u32,
    pub sub_device_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TopologyState {
    Constructed,
    Enabled,
    Disabled,
}

/// Why a topology was accepted. Exactly one applies to an enabled topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcceptanceMode {
    /// Root device with a single sub-device
    RootSingle,
    /// Root device spanning several sub-devices, allowed by policy
    RootImplicitScaling,
    /// Sub-device 0
    FirstSubDevice,
    /// A later sub-device, with kernel or hardware support
    OtherSubDevice,
    /// No client data and policy does not require it
    NoClientData,
}

/// Inputs of the acceptance decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptanceInput {
    pub client: Option<SubDeviceClientData>,
    pub allow_implicit_scaling: bool,
    pub require_client_data: bool,
    /// Kernel support for non-zero sub-devices, or hardware that needs none
    pub sub_device_supported: bool,
}

/// Pick the acceptance mode, `None` when the combination is refused.
pub fn acceptance_mode(input: &AcceptanceInput) -> Option<AcceptanceMode> {
    let Some(client) = input.client else {
        return (!input.require_client_data).then_some(AcceptanceMode::NoClientData);
    };

    if !client.is_sub_device {
        if client.sub_device_count <= 1 {
            Some(AcceptanceMode::RootSingle)
        } else if input.allow_implicit_scaling {
            Some(AcceptanceMode::RootImplicitScaling)
        } else {
            None
        }
    } else if client.sub_device_index == 0 {
        Some(AcceptanceMode::FirstSubDevice)
    } else if input.sub_device_supported {
        Some(AcceptanceMode::OtherSubDevice)
    } else {
        None
    }
}

#[derive(Debug)]
pub struct SubDeviceTopology {
    client: Option<SubDeviceClientData>,
    state: TopologyState,
    mode: Option<AcceptanceMode>,
    engines: Vec<EngineInfo>,
    discovered_count: u32,
}

impl SubDeviceTopology {
    pub fn new(client: Option<SubDeviceClientData>) -> Self {
        Self {
            client,
            state: TopologyState::Constructed,
            mode: None,
            engines: Vec::new(),
            discovered_count: 0,
        }
    }

    pub fn state(&self) -> TopologyState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state == TopologyState::Enabled
    }

    pub fn acceptance_mode(&self) -> Option<AcceptanceMode> {
        self.mode
    }

    /// Query-capable engines of the selected sub-device.
    pub fn engines(&self) -> &[EngineInfo] {
        &self.engines
    }

    /// Engine the OA stream is opened on.
    pub fn primary_engine(&self) -> Option<EngineInfo> {
        self.engines.first().copied()
    }

    /// Sub-devices seen by the kernel queries.
    pub fn sub_device_count(&self) -> u32 {
        self.discovered_count
    }

    /// Index this context selects; the root device selects 0.
    pub fn sub_device_index(&self) -> u32 {
        match self.client {
            Some(client) if client.is_sub_device => client.sub_device_index,
            _ => 0,
        }
    }

    /// Enumerate engines and settle on `Enabled` or `Disabled`.
    ///
    /// Kernel query failures are returned; a refused topology is not an
    /// error here, callers check [`is_enabled`](Self::is_enabled).
    pub fn initialize(
        &mut self,
        io: &dyn IoControl,
        traits: &dyn GenerationTraits,
        config: &MetricsConfig,
    ) -> Result<()> {
        if self.state != TopologyState::Constructed {
            return Ok(());
        }

        let index = self.sub_device_index();
        let (engines, count) = match io.query_oa_units()? {
            Some(units) => engines_from_oa_units(&units, index),
            None => engines_from_distances(io, index)?,
        };
        self.engines = engines;
        self.discovered_count = count;

        if let Some(client) = self.client {
            if client.sub_device_count != 0 && client.sub_device_count != count {
                warn!(
                    client_count = client.sub_device_count,
                    kernel_count = count,
                    "sub-device count reported by the client differs from the kernel"
                );
            }
        }

        self.mode = acceptance_mode(&AcceptanceInput {
            client: self.client,
            allow_implicit_scaling: config.allow_implicit_scaling,
            require_client_data: config.require_client_data,
            sub_device_supported: io.sub_device_supported() || traits.sub_device_always_supported(),
        });

        if self.mode.is_some() && !self.engines.is_empty() {
            self.state = TopologyState::Enabled;
            info!(
                mode = ?self.mode,
                index,
                count,
                engines = self.engines.len(),
                "sub-device topology enabled"
            );
        } else {
            self.state = TopologyState::Disabled;
            error!(
                client = ?self.client,
                index,
                kernel_count = count,
                engines = ?self.engines,
                allow_implicit_scaling = config.allow_implicit_scaling,
                require_client_data = config.require_client_data,
                kernel_support = io.sub_device_supported(),
                hardware_support = traits.sub_device_always_supported(),
                "sub-device topology disabled"
            );
        }
        Ok(())
    }
}

/// Keep engines a query can run on; copy engines are expected and skipped.
fn collect_engine(engines: &mut Vec<EngineInfo>, engine: EngineInfo) {
    match engine.class {
        class if class.runs_queries() => engines.push(engine),
        EngineClass::Copy => {}
        _ => error!(%engine, "unexpected engine class at sub-device"),
    }
}

/// Newer kernels: one sub-device per gt id.
fn engines_from_oa_units(units: &[OaUnit], index: u32) -> (Vec<EngineInfo>, u32) {
    let gts: BTreeSet<u16> = units.iter().map(|u| u.gt_id).collect();
    let selected = gts.iter().nth(index as usize).copied();

    let mut engines = Vec::new();
    for unit in units.iter().filter(|u| Some(u.gt_id) == selected) {
        for engine in &unit.engines {
            collect_engine(&mut engines, *engine);
        }
    }

    debug!(units = units.len(), gts = gts.len(), ?selected, "oa unit topology");
    (engines, gts.len() as u32)
}

/// Regions to pair engines with: device-local memory when present.
fn preferred_regions(regions: Vec<MemoryRegion>) -> Vec<MemoryRegion> {
    let device: Vec<MemoryRegion> = regions
        .iter()
        .copied()
        .filter(|r| r.class == MemoryClass::Device)
        .collect();
    if device.is_empty() {
        regions
            .into_iter()
            .filter(|r| r.class == MemoryClass::System)
            .collect()
    } else {
        device
    }
}

/// Older kernels: an engine belongs to the sub-device of the memory region
/// it has zero distance to. The sub-device counter advances whenever the
/// region instance changes.
fn engines_from_distances(io: &dyn IoControl, index: u32) -> Result<(Vec<EngineInfo>, u32)> {
    let regions = preferred_regions(io.query_memory_regions()?);
    let all_engines = io.query_engines()?;

    let mut engines = Vec::new();
    let mut sub_device = 0u32;
    let mut last_instance = None;

    for region in &regions {
        if last_instance.is_some_and(|instance| instance != region.instance) {
            sub_device += 1;
        }
        last_instance = Some(region.instance);

        for engine in &all_engines {
            if io.query_distance(engine, region)? != 0 || sub_device != index {
                continue;
            }
            collect_engine(&mut engines, *engine);
        }
    }

    let count = if regions.is_empty() { 0 } else { sub_device + 1 };
    debug!(regions = regions.len(), engines = all_engines.len(), count, "distance topology");
    Ok((engines, count))
}
