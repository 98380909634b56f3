//! Per-generation strategy table
//!
//! Every hardware family is a unit struct implementing [`GenerationTraits`].
//! The trait defaults describe Gen9; newer families override only what
//! changed. The table for a context is picked once, from the chipset id,
//! when the context is created.

use std::fmt;

use oa_metrics_shared::{
    CommandBufferType, Generation, OaReportFormat, ReportCollectingMode,
};
use tracing::debug;

use crate::gpu::command::PipeControlFlags;
use crate::gpu::registers::{
    self, RegisterTable, RPSTAT_FREQUENCY_MASK, RPSTAT_FREQUENCY_SHIFT,
};

/// How raw tail offsets are aligned to record boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetRounding {
    /// Tails move in coarser steps than records; round to the stride.
    RecordAligned,
    /// Tails always sit on a record boundary.
    None,
}

/// What the OA tail register holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailEncoding {
    /// GPU address of the tail inside the buffer allocation.
    GpuAddress,
    /// Byte offset from the start of the buffer.
    RingOffset,
}

pub trait GenerationTraits: Send + Sync + fmt::Debug {
    fn generation(&self) -> Generation;

    fn registers(&self) -> &'static RegisterTable {
        &registers::GEN9_REGISTERS
    }

    fn report_format(&self) -> OaReportFormat {
        OaReportFormat::A32u40B8C8
    }

    fn offset_rounding(&self) -> OffsetRounding {
        OffsetRounding::RecordAligned
    }

    fn tail_encoding(&self) -> TailEncoding {
        TailEncoding::GpuAddress
    }

    /// Flags for the PIPE_CONTROL that drains the command streamer before
    /// counters are sampled.
    fn flush_flags(&self) -> PipeControlFlags {
        PipeControlFlags::COMMAND_STREAMER_STALL
            | PipeControlFlags::RENDER_TARGET_CACHE_FLUSH
            | PipeControlFlags::DC_FLUSH
            | PipeControlFlags::DEPTH_CACHE_FLUSH
    }

    fn supports_collecting_mode(&self, mode: ReportCollectingMode) -> bool {
        match mode {
            ReportCollectingMode::ReportPerformanceCounters
            | ReportCollectingMode::StoreRegisterMemoryOar
            | ReportCollectingMode::TriggerOag => true,
            ReportCollectingMode::TriggerOagExtended => {
                self.registers().oa_trigger_report_id.is_some()
            }
        }
    }

    /// Pick the collection mode for a slot about to begin.
    ///
    /// Older parts cannot run MI_REPORT_PERF_COUNT on the posh streamer and
    /// fall back to register stores there.
    fn collecting_mode(
        &self,
        policy: ReportCollectingMode,
        buffer: CommandBufferType,
    ) -> ReportCollectingMode {
        if buffer == CommandBufferType::Posh {
            return ReportCollectingMode::StoreRegisterMemoryOar;
        }
        if self.supports_collecting_mode(policy) {
            policy
        } else {
            ReportCollectingMode::ReportPerformanceCounters
        }
    }

    /// Core frequency in MHz from an RPSTAT sample.
    fn core_frequency_mhz(&self, rpstat: u32) -> u32 {
        ((rpstat >> RPSTAT_FREQUENCY_SHIFT) & RPSTAT_FREQUENCY_MASK) * 50 / 3
    }

    /// Non-zero sub-devices work without kernel sub-device support.
    fn sub_device_always_supported(&self) -> bool {
        false
    }
}

#[derive(Debug)]
pub struct Gen9Traits;

impl GenerationTraits for Gen9Traits {
    fn generation(&self) -> Generation {
        Generation::Gen9
    }
}

#[derive(Debug)]
pub struct Gen11Traits;

impl GenerationTraits for Gen11Traits {
    fn generation(&self) -> Generation {
        Generation::Gen11
    }
}

#[derive(Debug)]
pub struct Gen12Traits;

impl GenerationTraits for Gen12Traits {
    fn generation(&self) -> Generation {
        Generation::Gen12
    }

    fn registers(&self) -> &'static RegisterTable {
        &registers::GEN12_REGISTERS
    }

    fn flush_flags(&self) -> PipeControlFlags {
        Gen9Traits.flush_flags() | PipeControlFlags::TEXTURE_CACHE_INVALIDATE
    }

    fn collecting_mode(
        &self,
        policy: ReportCollectingMode,
        _buffer: CommandBufferType,
    ) -> ReportCollectingMode {
        if self.supports_collecting_mode(policy) {
            policy
        } else {
            ReportCollectingMode::StoreRegisterMemoryOar
        }
    }
}

/// Xe-HP and later read OA counters only through the ring buffer.
fn xe_collecting_mode(traits: &dyn GenerationTraits, policy: ReportCollectingMode) -> ReportCollectingMode {
    let mode = if traits.supports_collecting_mode(ReportCollectingMode::TriggerOagExtended) {
        ReportCollectingMode::TriggerOagExtended
    } else {
        ReportCollectingMode::TriggerOag
    };
    if policy != mode {
        debug!(generation = %traits.generation(), ?policy, ?mode, "collecting mode forced");
    }
    mode
}

#[derive(Debug)]
pub struct XeHpTraits;

impl GenerationTraits for XeHpTraits {
    fn generation(&self) -> Generation {
        Generation::XeHp
    }

    fn registers(&self) -> &'static RegisterTable {
        &registers::XE_HP_REGISTERS
    }

    fn flush_flags(&self) -> PipeControlFlags {
        Gen12Traits.flush_flags()
    }

    fn supports_collecting_mode(&self, mode: ReportCollectingMode) -> bool {
        mode == ReportCollectingMode::TriggerOag
    }

    fn collecting_mode(
        &self,
        policy: ReportCollectingMode,
        _buffer: CommandBufferType,
    ) -> ReportCollectingMode {
        xe_collecting_mode(self, policy)
    }
}

#[derive(Debug)]
pub struct XeHpgTraits;

impl GenerationTraits for XeHpgTraits {
    fn generation(&self) -> Generation {
        Generation::XeHpg
    }

    fn registers(&self) -> &'static RegisterTable {
        XeHpTraits.registers()
    }

    fn flush_flags(&self) -> PipeControlFlags {
        XeHpTraits.flush_flags()
    }

    fn supports_collecting_mode(&self, mode: ReportCollectingMode) -> bool {
        XeHpTraits.supports_collecting_mode(mode)
    }

    fn collecting_mode(
        &self,
        policy: ReportCollectingMode,
        _buffer: CommandBufferType,
    ) -> ReportCollectingMode {
        xe_collecting_mode(self, policy)
    }
}

#[derive(Debug)]
pub struct Xe2HpgTraits;

impl GenerationTraits for Xe2HpgTraits {
    fn generation(&self) -> Generation {
        Generation::Xe2Hpg
    }

    fn registers(&self) -> &'static RegisterTable {
        &registers::XE2_REGISTERS
    }

    fn report_format(&self) -> OaReportFormat {
        OaReportFormat::Pec64u64
    }

    fn offset_rounding(&self) -> OffsetRounding {
        OffsetRounding::None
    }

    fn tail_encoding(&self) -> TailEncoding {
        TailEncoding::RingOffset
    }

    fn flush_flags(&self) -> PipeControlFlags {
        XeHpTraits.flush_flags()
    }

    fn supports_collecting_mode(&self, mode: ReportCollectingMode) -> bool {
        mode.uses_ring_buffer()
    }

    fn collecting_mode(
        &self,
        policy: ReportCollectingMode,
        _buffer: CommandBufferType,
    ) -> ReportCollectingMode {
        xe_collecting_mode(self, policy)
    }

    fn sub_device_always_supported(&self) -> bool {
        true
    }
}

/// Strategy table for `generation`.
pub fn traits_for(generation: Generation) -> &'static dyn GenerationTraits {
    match generation {
        Generation::Gen9 => &Gen9Traits,
        Generation::Gen11 => &Gen11Traits,
        Generation::Gen12 => &Gen12Traits,
        Generation::XeHp => &XeHpTraits,
        Generation::XeHpg => &XeHpgTraits,
        Generation::Xe2Hpg => &Xe2HpgTraits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReportCollectingMode::*;

    #[test]
    fn test_table_matches_generation() {
        for generation in Generation::ALL {
            assert_eq!(traits_for(generation).generation(), generation);
        }
    }

    #[test]
    fn test_older_generations_use_srm_on_posh() {
        for generation in [Generation::Gen9, Generation::Gen11] {
            let traits = traits_for(generation);
            assert_eq!(
                traits.collecting_mode(ReportPerformanceCounters, CommandBufferType::Posh),
                StoreRegisterMemoryOar
            );
            assert_eq!(
                traits.collecting_mode(ReportPerformanceCounters, CommandBufferType::Render),
                ReportPerformanceCounters
            );
        }
    }

    #[test]
    fn test_gen12_follows_policy_on_every_streamer() {
        let traits = traits_for(Generation::Gen12);
        assert_eq!(
            traits.collecting_mode(ReportPerformanceCounters, CommandBufferType::Posh),
            ReportPerformanceCounters
        );
        assert_eq!(
            traits.collecting_mode(TriggerOagExtended, CommandBufferType::Render),
            StoreRegisterMemoryOar
        );
    }

    #[test]
    fn test_xe_class_always_triggers() {
        for policy in [ReportPerformanceCounters, StoreRegisterMemoryOar, TriggerOag] {
            for buffer in [CommandBufferType::Render, CommandBufferType::Posh] {
                assert_eq!(
                    traits_for(Generation::XeHpg).collecting_mode(policy, buffer),
                    TriggerOag
                );
                assert_eq!(
                    traits_for(Generation::Xe2Hpg).collecting_mode(policy, buffer),
                    TriggerOagExtended
                );
            }
        }
    }

    #[test]
    fn test_core_frequency() {
        // 60 units of 50/3 MHz
        assert_eq!(Gen9Traits.core_frequency_mhz(60 << 23), 1000);
    }
}
