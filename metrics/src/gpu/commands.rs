//! Generation-aware command sequences used by queries
//!
//! Each helper appends one logical operation (store a register, trigger a
//! report, ...) to a command buffer. Which registers and flags are used
//! comes from the context's [`GenerationTraits`].

use std::mem::offset_of;

use oa_metrics_shared::{
    Error, OaReport40, OaReportFormat, OaReportHeader, ReportCollectingMode, Result,
};
use tracing::{debug, error};

use super::buffer::CommandBuffer;
use super::command::GpuCommand;
use super::registers::OA_TRIGGER_REPORT;
use crate::generation::GenerationTraits;

/// MI_REPORT_PERF_COUNT destinations must be 64-byte aligned.
pub const REPORT_PERF_COUNT_ALIGNMENT: u64 = 64;

#[derive(Debug, Clone, Copy)]
pub struct GpuCommands<'a> {
    traits: &'a dyn GenerationTraits,
}

impl<'a> GpuCommands<'a> {
    pub fn new(traits: &'a dyn GenerationTraits) -> Self {
        Self { traits }
    }

    pub fn traits(&self) -> &'a dyn GenerationTraits {
        self.traits
    }

    /// Drain the command streamer and flush caches.
    pub fn flush_command_streamer(&self, buffer: &mut dyn CommandBuffer) -> Result<()> {
        buffer.write(GpuCommand::PipeControl {
            flags: self.traits.flush_flags(),
        })
    }

    /// MI_NOOP carrying an identification number visible in hang dumps.
    pub fn write_identification(&self, buffer: &mut dyn CommandBuffer, id: u32) -> Result<()> {
        buffer.write(GpuCommand::Noop {
            identification: Some(id),
        })
    }

    pub fn store_register(
        &self,
        buffer: &mut dyn CommandBuffer,
        register: u32,
        address: u64,
    ) -> Result<()> {
        if address % 4 != 0 {
            return Err(Error::parameter(format!(
                "register store to unaligned address {:#x}",
                address
            )));
        }
        buffer.write(GpuCommand::StoreRegisterMemory { register, address })
    }

    /// Store a 64-bit register exposed as two consecutive dword registers.
    pub fn store_register64(
        &self,
        buffer: &mut dyn CommandBuffer,
        register: u32,
        address: u64,
    ) -> Result<()> {
        self.store_register(buffer, register, address)?;
        self.store_register(buffer, register + 4, address + 4)
    }

    pub fn load_register_immediate(
        &self,
        buffer: &mut dyn CommandBuffer,
        register: u32,
        value: u32,
    ) -> Result<()> {
        buffer.write(GpuCommand::LoadRegisterImmediate { register, value })
    }

    pub fn store_data(&self, buffer: &mut dyn CommandBuffer, address: u64, value: u32) -> Result<()> {
        buffer.write(GpuCommand::StoreDataImmediate {
            address,
            value: value as u64,
            qword: false,
        })
    }

    pub fn store_data64(&self, buffer: &mut dyn CommandBuffer, address: u64, value: u64) -> Result<()> {
        if address % 8 != 0 {
            return Err(Error::parameter(format!(
                "qword store to unaligned address {:#x}",
                address
            )));
        }
        buffer.write(GpuCommand::StoreDataImmediate {
            address,
            value,
            qword: true,
        })
    }

    /// MI_REPORT_PERF_COUNT into slot memory.
    pub fn report_perf_count(
        &self,
        buffer: &mut dyn CommandBuffer,
        address: u64,
        report_id: u32,
    ) -> Result<()> {
        if address % REPORT_PERF_COUNT_ALIGNMENT != 0 {
            return Err(Error::parameter(format!(
                "report destination {:#x} is not 64-byte aligned",
                address
            )));
        }
        buffer.write(GpuCommand::ReportPerfCount { address, report_id })
    }

    /// Store every OA counter register into an A32u40B8C8-shaped report at
    /// `address`.
    pub fn store_oa_counters(
        &self,
        buffer: &mut dyn CommandBuffer,
        address: u64,
        report_id: u32,
    ) -> Result<()> {
        let registers = self.traits.registers();
        let Some(counters) = registers.oa_counters else {
            error!(generation = %self.traits.generation(), "register store collection is unsupported");
            return Err(Error::NotSupported(format!(
                "register store collection on {}",
                self.traits.generation()
            )));
        };
        if self.traits.report_format() != OaReportFormat::A32u40B8C8 {
            return Err(Error::NotSupported("register store collection of wide reports".into()));
        }

        let header = address + offset_of!(OaReport40, header) as u64;
        self.store_data(buffer, header + offset_of!(OaReportHeader, report_id) as u64, report_id)?;
        self.store_register(
            buffer,
            registers.timestamp,
            header + offset_of!(OaReportHeader, timestamp) as u64,
        )?;
        self.store_register(
            buffer,
            registers.gpu_ticks,
            header + offset_of!(OaReportHeader, gpu_ticks) as u64,
        )?;

        let a_low = address + offset_of!(OaReport40, a_low) as u64;
        for i in 0..32u32 {
            self.store_register(buffer, counters.a_low + i * 4, a_low + i as u64 * 4)?;
        }
        let a_high = address + offset_of!(OaReport40, a_high) as u64;
        for i in 0..8u32 {
            self.store_register(buffer, counters.a_high + i * 4, a_high + i as u64 * 4)?;
        }
        let b = address + offset_of!(OaReport40, b) as u64;
        let c = address + offset_of!(OaReport40, c) as u64;
        for i in 0..8u32 {
            self.store_register(buffer, counters.b + i * 4, b + i as u64 * 4)?;
        }
        for i in 0..8u32 {
            self.store_register(buffer, counters.c + i * 4, c + i as u64 * 4)?;
        }
        Ok(())
    }

    /// Ask the OA unit to append a report to the ring buffer, sampling the
    /// tick counter just before so the report can be validated later.
    pub fn trigger_stream_report(
        &self,
        buffer: &mut dyn CommandBuffer,
        ticks_address: u64,
        report_id: Option<u32>,
    ) -> Result<()> {
        let registers = self.traits.registers();

        if let Some(id) = report_id {
            let Some(id_register) = registers.oa_trigger_report_id else {
                return Err(Error::NotSupported(format!(
                    "tagged report triggers on {}",
                    self.traits.generation()
                )));
            };
            self.load_register_immediate(buffer, id_register, id)?;
        }

        self.store_register(buffer, registers.gpu_ticks, ticks_address)?;
        self.load_register_immediate(buffer, registers.oa_trigger, OA_TRIGGER_REPORT)
    }

    /// Capture hardware counters the way `mode` prescribes.
    pub fn store_hw_counters(
        &self,
        buffer: &mut dyn CommandBuffer,
        mode: ReportCollectingMode,
        oa_address: u64,
        ticks_address: u64,
        report_id: u32,
    ) -> Result<()> {
        debug!(?mode, oa_address, report_id, "store hw counters");
        match mode {
            ReportCollectingMode::ReportPerformanceCounters => {
                self.report_perf_count(buffer, oa_address, report_id)
            }
            ReportCollectingMode::StoreRegisterMemoryOar => {
                self.store_oa_counters(buffer, oa_address, report_id)
            }
            ReportCollectingMode::TriggerOag => {
                self.trigger_stream_report(buffer, ticks_address, None)
            }
            ReportCollectingMode::TriggerOagExtended => {
                self.trigger_stream_report(buffer, ticks_address, Some(report_id))
            }
        }
    }

    /// Copy `bytes` of GPU memory one dword at a time.
    pub fn copy_memory(
        &self,
        buffer: &mut dyn CommandBuffer,
        source: u64,
        destination: u64,
        bytes: usize,
    ) -> Result<()> {
        if bytes % 4 != 0 || source % 4 != 0 || destination % 4 != 0 {
            return Err(Error::parameter(format!(
                "copy of {} bytes from {:#x} to {:#x} is not dword granular",
                bytes, source, destination
            )));
        }

        for offset in (0..bytes as u64).step_by(4) {
            buffer.write(GpuCommand::CopyMemory {
                source: source + offset,
                destination: destination + offset,
            })?;
        }
        Ok(())
    }
}
