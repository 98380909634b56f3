//! Per-device context
//!
//! Owns everything a query needs beyond its own slots: the generation
//! strategy, the initialized kernel interface, the OA stream and ring
//! buffer, and the currently active configurations.

use std::sync::Arc;

use oa_metrics_shared::{Error, Generation, MetricsConfig, Result};
use tracing::{info, instrument};

use crate::configuration::{OaConfiguration, UserConfiguration, UserRegister};
use crate::generation::GenerationTraits;
use crate::gpu::commands::GpuCommands;
use crate::kernel::memory::GpuMemoryAllocator;
use crate::kernel::tbs::{StreamParams, TbsStream};
use crate::kernel::{IoControl, KernelInterface};
use crate::oa_buffer::OaRingBuffer;
use crate::sub_device::SubDeviceClientData;

#[derive(Debug)]
pub struct Context {
    config: MetricsConfig,
    kernel: KernelInterface,
    tbs: TbsStream,
    oa_buffer: OaRingBuffer,
    allocator: Arc<dyn GpuMemoryAllocator>,
    active_oa: Option<OaConfiguration>,
    active_user: Option<UserConfiguration>,
}

impl Context {
    /// Initialize the kernel interface and map the OA buffer.
    #[instrument(skip_all, fields(client = ?client))]
    pub fn create(
        io: Arc<dyn IoControl>,
        allocator: Arc<dyn GpuMemoryAllocator>,
        client: Option<SubDeviceClientData>,
        config: MetricsConfig,
    ) -> Result<Self> {
        config.validate()?;

        let kernel = KernelInterface::initialize(io.clone(), client, &config)?;
        let traits = kernel.traits();

        let mut params = StreamParams::new(traits.report_format());
        params.engine = kernel.topology().primary_engine();
        let mut tbs = TbsStream::new(io, params);

        let mut oa_buffer = OaRingBuffer::new(traits, &config);
        oa_buffer.initialize(&mut tbs, config.oa_buffer_mapping_required)?;

        info!(
            generation = %traits.generation(),
            oa_buffer_mapped = oa_buffer.is_valid(),
            "context created"
        );

        Ok(Self {
            config,
            kernel,
            tbs,
            oa_buffer,
            allocator,
            active_oa: None,
            active_user: None,
        })
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn kernel(&self) -> &KernelInterface {
        &self.kernel
    }

    pub fn io(&self) -> &dyn IoControl {
        self.kernel.io().as_ref()
    }

    pub fn traits(&self) -> &'static dyn GenerationTraits {
        self.kernel.traits()
    }

    pub fn generation(&self) -> Generation {
        self.kernel.generation()
    }

    pub fn commands(&self) -> GpuCommands<'static> {
        GpuCommands::new(self.traits())
    }

    pub fn oa_buffer(&self) -> &OaRingBuffer {
        &self.oa_buffer
    }

    pub fn tbs(&self) -> &TbsStream {
        &self.tbs
    }

    pub fn allocator(&self) -> &Arc<dyn GpuMemoryAllocator> {
        &self.allocator
    }

    /// OA timestamp frequency in Hz.
    pub fn oa_frequency(&self) -> u64 {
        self.kernel.oa_frequency()
    }

    /// GetData returns empty reports without reading slot memory.
    pub fn null_query(&self) -> bool {
        self.config.null_query || self.kernel.null_query_override()
    }

    pub fn oa_configuration_active(&self) -> bool {
        self.active_oa.is_some()
    }

    /// Make `configuration` the metric set queries sample.
    ///
    /// The OA unit holds one metric set at a time; another active set must
    /// be deactivated first.
    pub fn activate_oa(&mut self, configuration: &OaConfiguration) -> Result<()> {
        match &self.active_oa {
            Some(active) if active == configuration => Ok(()),
            Some(active) => Err(Error::failed(format!(
                "metric set {} is already active",
                active.set_id
            ))),
            None => {
                info!(set_id = configuration.set_id, "OA configuration activated");
                self.active_oa = Some(*configuration);
                Ok(())
            }
        }
    }

    pub fn deactivate_oa(&mut self, configuration: &OaConfiguration) -> Result<()> {
        if self.active_oa.as_ref() != Some(configuration) {
            return Err(Error::parameter(format!(
                "metric set {} is not active",
                configuration.set_id
            )));
        }
        info!(set_id = configuration.set_id, "OA configuration deactivated");
        self.active_oa = None;
        Ok(())
    }

    pub fn activate_user(&mut self, configuration: &UserConfiguration) -> Result<()> {
        match &self.active_user {
            Some(active) if active == configuration => Ok(()),
            Some(_) => Err(Error::failed("a user configuration is already active")),
            None => {
                self.active_user = Some(configuration.clone());
                Ok(())
            }
        }
    }

    pub fn deactivate_user(&mut self, configuration: &UserConfiguration) -> Result<()> {
        if self.active_user.as_ref() != Some(configuration) {
            return Err(Error::parameter("user configuration is not active"));
        }
        self.active_user = None;
        Ok(())
    }

    pub fn is_active_oa(&self, configuration: &OaConfiguration) -> bool {
        self.active_oa.as_ref() == Some(configuration)
    }

    pub fn is_active_user(&self, configuration: &UserConfiguration) -> bool {
        self.active_user.as_ref() == Some(configuration)
    }

    /// Registers sampled by a query: its own configuration when it has one,
    /// otherwise the context's active user configuration.
    pub fn user_registers(&self, query_configuration: Option<&UserConfiguration>) -> Vec<UserRegister> {
        query_configuration
            .or(self.active_user.as_ref())
            .map(|c| c.registers().to_vec())
            .unwrap_or_default()
    }

    /// Always-on user configuration for new queries, if policy asks for one.
    pub fn always_on_user_configuration(&self) -> Result<Option<UserConfiguration>> {
        if !self.config.user_counters_always_on {
            return Ok(None);
        }
        UserConfiguration::from_offsets(&self.config.always_on_user_registers).map(Some)
    }
}
