//! Hardware counter queries over the GPU OA unit
//!
//! A query brackets GPU work with commands that sample performance counters
//! at begin and end. Depending on the hardware generation the counters land
//! directly in query memory (MI_REPORT_PERF_COUNT or register stores) or in
//! the OA ring buffer, where they are located and validated at readback.
//!
//! The crate is organized as:
//! - [`gpu`]: typed commands, command buffers and generation-aware emitters
//! - [`oa_buffer`]: the OA ring buffer model and triggered-report lookup
//! - [`sub_device`]: engine discovery and the sub-device policy gate
//! - [`query`]: the query state machine and report calculation
//! - [`ddi`]: handle-based entry points returning status codes

pub mod configuration;
pub mod context;
pub mod ddi;
pub mod generation;
pub mod gpu;
pub mod kernel;
pub mod oa_buffer;
pub mod query;
pub mod sub_device;

pub use configuration::{ConfigurationCreateData, UserConfiguration, UserRegister};
pub use context::Context;
pub use ddi::{CommandBufferData, Handle, MetricsLibrary};
pub use generation::{traits_for, GenerationTraits};
pub use kernel::memory::{GpuMemory, GpuMemoryAllocator, HostAllocator, HostMemory};
pub use kernel::IoControl;
pub use oa_buffer::OaRingBuffer;
pub use query::{CopyReportsData, HwCounterQuery, QueryWriteData};
pub use sub_device::{SubDeviceClientData, SubDeviceTopology};

pub use oa_metrics_shared as shared;
