//! Time-based sampling stream
//!
//! The kernel OA stream owns the ring buffer the OA unit writes into. Query
//! collection only needs the buffer mapped; periodic sampling itself is
//! driven by the kernel.

use std::sync::Arc;

use oa_metrics_shared::{Error, OaReportFormat, Result};
use tracing::{debug, info, warn};

use super::memory::GpuMemory;
use super::{EngineInfo, IoControl};

/// OA ring buffer size requested from the kernel.
pub const DEFAULT_OA_BUFFER_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub report_format: OaReportFormat,
    pub buffer_size: usize,
    /// Kernel metric set the stream is opened with
    pub metric_set: Option<u64>,
    /// Engine whose OA unit is sampled
    pub engine: Option<EngineInfo>,
}

impl StreamParams {
    pub fn new(report_format: OaReportFormat) -> Self {
        Self {
            report_format,
            buffer_size: DEFAULT_OA_BUFFER_SIZE,
            metric_set: None,
            engine: None,
        }
    }
}

#[derive(Debug)]
pub struct TbsStream {
    io: Arc<dyn IoControl>,
    params: StreamParams,
    buffer: Option<Arc<dyn GpuMemory>>,
}

impl TbsStream {
    pub fn new(io: Arc<dyn IoControl>, params: StreamParams) -> Self {
        Self {
            io,
            params,
            buffer: None,
        }
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn is_enabled(&self) -> bool {
        self.buffer.is_some()
    }

    /// Open the stream. A no-op when already open.
    pub fn enable(&mut self) -> Result<()> {
        if self.buffer.is_some() {
            return Ok(());
        }

        let buffer = self.io.open_oa_stream(&self.params)?;
        info!(
            size = buffer.size(),
            format = ?self.params.report_format,
            metric_set = ?self.params.metric_set,
            "OA stream opened"
        );
        self.buffer = Some(buffer);
        Ok(())
    }

    pub fn disable(&mut self) -> Result<()> {
        if self.buffer.take().is_some() {
            self.io.close_oa_stream()?;
            debug!("OA stream closed");
        }
        Ok(())
    }

    /// Ring buffer of the open stream, if any.
    pub fn oa_buffer(&self) -> Option<Arc<dyn GpuMemory>> {
        self.buffer.clone()
    }

    /// Ring buffer mapping, opening the stream first if needed.
    pub fn map_oa_buffer(&mut self) -> Result<Arc<dyn GpuMemory>> {
        self.enable()?;
        self.oa_buffer().ok_or(Error::NotInitialized("OA stream"))
    }
}

impl Drop for TbsStream {
    fn drop(&mut self) {
        if let Err(e) = self.disable() {
            warn!(error = %e, "failed to close OA stream");
        }
    }
}
