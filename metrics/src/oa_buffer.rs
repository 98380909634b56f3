//! OA ring buffer model
//!
//! The OA unit appends fixed-size records to a circular buffer on its own.
//! Queries bracket their triggered reports with snapshots of the tail
//! register; at readback time those snapshots are turned into ring offsets
//! and the records between them are searched and validated.
//!
//! All offsets are byte offsets below the buffer size. A record that would
//! read past the end is reassembled from the two segments around the wrap.

use std::sync::Arc;

use oa_metrics_shared::{
    Error, MetricsConfig, OaReport, OaReportFormat, ReportGpu, ReportReason, Result,
    OA_REPORT_MAX_SIZE, REPORT_ID_MASK,
};
use tracing::{debug, info, warn};

use crate::generation::{GenerationTraits, OffsetRounding, TailEncoding};
use crate::kernel::memory::GpuMemory;
use crate::kernel::tbs::TbsStream;

/// Which end of a query a tail snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryBoundary {
    Begin,
    End,
}

/// Ring bookkeeping for one query slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OaBufferState {
    pub current_offset: u32,
    pub first_offset: u32,
    /// One past the last record in the window
    pub last_offset: u32,
    pub pre_begin_offset: u32,
    pub post_begin_offset: u32,
    pub pre_end_offset: u32,
    pub post_end_offset: u32,
    /// Copies of the located begin and end records
    pub reports: [Option<OaReport>; 2],
    pub configuration_valid: bool,
    pub context_valid: bool,
}

impl Default for OaBufferState {
    fn default() -> Self {
        Self {
            current_offset: 0,
            first_offset: 0,
            last_offset: 0,
            pre_begin_offset: 0,
            post_begin_offset: 0,
            pre_end_offset: 0,
            post_end_offset: 0,
            reports: [None, None],
            configuration_valid: false,
            context_valid: true,
        }
    }
}

impl OaBufferState {
    pub fn reset(&mut self, configuration_valid: bool) {
        *self = Self {
            configuration_valid,
            ..Self::default()
        };
    }

    pub fn report(&self, boundary: QueryBoundary) -> Option<&OaReport> {
        self.reports[boundary as usize].as_ref()
    }
}

/// Bytes between two ring offsets, walking forward from `begin`.
pub fn window_bytes(begin: u32, end: u32, size: u32) -> u32 {
    if end >= begin {
        end - begin
    } else {
        size - begin + end
    }
}

/// Whole records between two ring offsets.
pub fn window_records(begin: u32, end: u32, size: u32, stride: u32) -> u32 {
    if stride == 0 {
        return 0;
    }
    window_bytes(begin, end, size) / stride
}

/// Nearest record start at or below `offset`.
pub fn round_down_offset(offset: u32, stride: u32) -> u32 {
    offset - offset % stride
}

/// Nearest record boundary at or above `offset`, wrapped into the ring.
pub fn round_up_offset(offset: u32, stride: u32, size: u32) -> u32 {
    let rounded = offset.div_ceil(stride) * stride;
    if rounded >= size {
        rounded - size
    } else {
        rounded
    }
}

/// Whether a triggered report's tick value lies inside the query window,
/// widened by `threshold` on both sides.
///
/// When `end < begin` the 32-bit tick counter wrapped during the query and
/// the window covers both ends of the counter range.
pub fn validate_trigger_ticks(ticks: u32, begin: u32, end: u32, threshold: u32) -> bool {
    let low = begin.wrapping_sub(threshold);
    let high = end.wrapping_add(threshold);
    ticks.wrapping_sub(low) <= high.wrapping_sub(low)
}

/// What a triggered report must look like to belong to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMatch {
    /// Report id the trigger was tagged with, if any
    pub report_id: Option<u32>,
    pub ticks_begin: u32,
    pub ticks_end: u32,
}

#[derive(Debug)]
pub struct OaRingBuffer {
    traits: &'static dyn GenerationTraits,
    format: OaReportFormat,
    memory: Option<Arc<dyn GpuMemory>>,
    threshold_ticks: u32,
    search_records: u32,
}

impl OaRingBuffer {
    pub fn new(traits: &'static dyn GenerationTraits, config: &MetricsConfig) -> Self {
        Self {
            traits,
            format: traits.report_format(),
            memory: None,
            threshold_ticks: config.trigger_threshold_ticks,
            search_records: config.trigger_search_records,
        }
    }

    /// Ring over an existing mapping, e.g. a capture loaded from disk.
    pub fn with_memory(
        traits: &'static dyn GenerationTraits,
        config: &MetricsConfig,
        memory: Arc<dyn GpuMemory>,
    ) -> Self {
        Self {
            memory: Some(memory),
            ..Self::new(traits, config)
        }
    }

    /// Map the ring through the TBS stream.
    ///
    /// Succeeds without mapping when the policy does not require it.
    pub fn initialize(&mut self, tbs: &mut TbsStream, mapping_required: bool) -> Result<()> {
        if !mapping_required {
            debug!("OA buffer mapping not required");
            return Ok(());
        }

        let memory = match tbs.oa_buffer() {
            Some(memory) => memory,
            None => tbs.map_oa_buffer()?,
        };
        if memory.size() < self.format.size() {
            return Err(Error::failed(format!(
                "OA buffer of {} bytes cannot hold a {} byte record",
                memory.size(),
                self.format.size()
            )));
        }

        info!(
            size = memory.size(),
            address = memory.gpu_address(),
            format = ?self.format,
            "OA buffer mapped"
        );
        self.memory = Some(memory);
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.memory.is_some()
    }

    /// Capacity in bytes, 0 when unmapped.
    pub fn size(&self) -> u32 {
        self.memory.as_ref().map(|m| m.size() as u32).unwrap_or(0)
    }

    pub fn report_size(&self) -> u32 {
        self.format.size() as u32
    }

    pub fn format(&self) -> OaReportFormat {
        self.format
    }

    fn mapped(&self) -> Result<&Arc<dyn GpuMemory>> {
        self.memory
            .as_ref()
            .ok_or_else(|| Error::failed("OA buffer is not mapped"))
    }

    /// Records between the window offsets of `state`.
    pub fn find_oa_window(&self, state: &OaBufferState) -> Result<u32> {
        let size = self.mapped()?.size() as u32;
        Ok(window_records(
            state.first_offset,
            state.last_offset,
            size,
            self.report_size(),
        ))
    }

    /// Record at `offset`, reassembled when it straddles the wrap point.
    pub fn report(&self, offset: u32) -> Result<OaReport> {
        let memory = self.mapped()?;
        let size = memory.size();
        let stride = self.format.size();
        let offset = offset as usize;

        if offset >= size {
            return Err(Error::parameter(format!(
                "report offset {:#x} outside {} byte OA buffer",
                offset, size
            )));
        }

        let mut bytes = [0u8; OA_REPORT_MAX_SIZE];
        let record = &mut bytes[..stride];
        if offset + stride <= size {
            memory.read(offset, record)?;
        } else {
            let head = size - offset;
            memory.read(offset, &mut record[..head])?;
            memory.read(0, &mut record[head..])?;
        }

        OaReport::from_bytes(self.format, record)
            .ok_or_else(|| Error::failed("short OA record"))
    }

    /// Offset the record following `offset` starts at.
    pub fn next_offset(&self, offset: u32) -> Result<u32> {
        let size = self.mapped()?.size() as u32;
        Ok(((offset as u64 + self.report_size() as u64) % size as u64) as u32)
    }

    /// Ring offset held in a tail register snapshot.
    pub fn tail_offset(&self, raw_tail: u32) -> Result<u32> {
        let memory = self.mapped()?;
        let mask = self.traits.registers().oa_tail_mask;
        let tail = raw_tail & mask;

        let offset = match self.traits.tail_encoding() {
            TailEncoding::GpuAddress => tail.wrapping_sub(memory.gpu_address() as u32 & mask),
            TailEncoding::RingOffset => tail,
        };

        if offset as usize >= memory.size() {
            return Err(Error::failed(format!(
                "OA tail {:#x} outside {} byte buffer",
                raw_tail,
                memory.size()
            )));
        }
        Ok(offset)
    }

    fn raw_tails(report: &ReportGpu, boundary: QueryBoundary) -> (u32, u32) {
        match boundary {
            QueryBoundary::Begin => (report.oa_tail_pre_begin, report.oa_tail_post_begin),
            QueryBoundary::End => (report.oa_tail_pre_end, report.oa_tail_post_end),
        }
    }

    /// Record start at or before the tail captured ahead of the trigger.
    pub fn pre_report_offset(&self, report: &ReportGpu, boundary: QueryBoundary) -> Result<u32> {
        let offset = self.tail_offset(Self::raw_tails(report, boundary).0)?;
        Ok(match self.traits.offset_rounding() {
            OffsetRounding::RecordAligned => round_down_offset(offset, self.report_size()),
            OffsetRounding::None => offset,
        })
    }

    /// Record boundary at or after the tail captured behind the trigger.
    pub fn post_report_offset(&self, report: &ReportGpu, boundary: QueryBoundary) -> Result<u32> {
        let offset = self.tail_offset(Self::raw_tails(report, boundary).1)?;
        Ok(match self.traits.offset_rounding() {
            OffsetRounding::RecordAligned => {
                round_up_offset(offset, self.report_size(), self.size())
            }
            OffsetRounding::None => offset,
        })
    }

    /// Scan forward from `pre` for the record a query trigger produced.
    ///
    /// The hardware may land the record after the `post` snapshot, so the
    /// scan continues a configured number of records past it. Returns the
    /// first record with the trigger reason (and id, when tagged) together
    /// with its offset; ticks are validated by [`validate_report`](Self::validate_report).
    pub fn find_triggered_report(
        &self,
        pre: u32,
        post: u32,
        report_id: Option<u32>,
    ) -> Result<Option<(u32, OaReport)>> {
        let size = self.mapped()?.size() as u32;
        let records = window_records(pre, post, size, self.report_size()) + self.search_records.max(1);

        let mut offset = pre;
        for _ in 0..records {
            let report = self.report(offset)?;
            let id = report.report_id();
            let id_matches = report_id.map_or(true, |expected| {
                id.id() & REPORT_ID_MASK == expected & REPORT_ID_MASK
            });

            if report.reason().contains(ReportReason::QUERY_TRIGGER) && id_matches {
                return Ok(Some((offset, report)));
            }
            offset = self.next_offset(offset)?;
        }

        debug!(pre, post, records, ?report_id, "triggered report not found");
        Ok(None)
    }

    /// Tick window check for a located record.
    pub fn validate_report(&self, report: &OaReport, expected: &TriggerMatch) -> bool {
        let valid = validate_trigger_ticks(
            report.gpu_ticks() as u32,
            expected.ticks_begin,
            expected.ticks_end,
            self.threshold_ticks,
        );
        if !valid {
            warn!(
                ticks = report.gpu_ticks(),
                begin = expected.ticks_begin,
                end = expected.ticks_end,
                threshold = self.threshold_ticks,
                "triggered report outside the query tick window"
            );
        }
        valid
    }

    /// Locate, copy and validate the triggered record for one boundary.
    ///
    /// On failure the stored copy has its payload zeroed and `false` is
    /// returned; the slot reports the loss instead of failing the call.
    pub fn use_triggered_report(
        &self,
        state: &mut OaBufferState,
        report_gpu: &ReportGpu,
        boundary: QueryBoundary,
        expected: &TriggerMatch,
    ) -> Result<bool> {
        let pre = self.pre_report_offset(report_gpu, boundary)?;
        let post = self.post_report_offset(report_gpu, boundary)?;
        match boundary {
            QueryBoundary::Begin => {
                state.pre_begin_offset = pre;
                state.post_begin_offset = post;
                state.first_offset = pre;
            }
            QueryBoundary::End => {
                state.pre_end_offset = pre;
                state.post_end_offset = post;
                state.last_offset = post;
            }
        }

        let found = self.find_triggered_report(pre, post, expected.report_id)?;
        let (valid, mut report) = match found {
            Some((offset, report)) => {
                state.current_offset = offset;
                if !report.report_id().context_valid() {
                    debug!(offset, ?boundary, "triggered report written outside a valid context");
                    state.context_valid = false;
                }
                (self.validate_report(&report, expected), report)
            }
            None => (false, OaReport::zeroed(self.format)),
        };

        if !valid {
            report.clear_payload();
        }
        state.reports[boundary as usize] = Some(report);
        Ok(valid)
    }

    /// `count` records starting at `offset`, with their offsets.
    pub fn reports(&self, offset: u32, count: u32) -> Result<Vec<(u32, OaReport)>> {
        let mut offset = offset;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push((offset, self.report(offset)?));
            offset = self.next_offset(offset)?;
        }
        Ok(out)
    }

    /// Log `count` records starting at `offset`.
    pub fn print_reports(&self, offset: u32, count: u32) -> Result<()> {
        for (offset, report) in self.reports(offset, count)? {
            let id = report.report_id();
            debug!(
                offset = %format!("{:#08x}", offset),
                id = id.id(),
                reason = ?id.reason(),
                context_valid = id.context_valid(),
                context_id = report.context_id(),
                timestamp = report.timestamp(),
                ticks = report.gpu_ticks(),
                "oa report"
            );
        }
        Ok(())
    }

    /// Log every record between the begin and end tails of a slot.
    pub fn dump_reports(&self, report_gpu: &ReportGpu) -> Result<()> {
        let first = self.pre_report_offset(report_gpu, QueryBoundary::Begin)?;
        let last = self.post_report_offset(report_gpu, QueryBoundary::End)?;
        let count = window_records(first, last, self.size(), self.report_size());

        debug!(first, last, count, "dumping OA window");
        self.print_reports(first, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::traits_for;
    use crate::kernel::memory::HostMemory;
    use oa_metrics_shared::{Generation, ReportId};

    fn ring(generation: Generation, size: usize) -> (OaRingBuffer, HostMemory) {
        let memory = HostMemory::new(0x40_0000, size);
        let ring = OaRingBuffer::with_memory(
            traits_for(generation),
            &MetricsConfig::default(),
            Arc::new(memory.clone()),
        );
        (ring, memory)
    }

    #[test]
    fn test_window_wraps() {
        assert_eq!(window_records(64, 320, 1024, 64), 4);
        assert_eq!(window_records(960, 64, 1024, 64), 2);
        assert_eq!(window_records(128, 128, 1024, 64), 0);
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_down_offset(512, 256), 512);
        assert_eq!(round_up_offset(512, 256, 4096), 512);
        assert_eq!(round_down_offset(600, 256), 512);
        assert_eq!(round_up_offset(600, 256, 4096), 768);
        // Rounding up at the end wraps to the start
        assert_eq!(round_up_offset(4000, 256, 4096), 0);

        for offset in (0..=3840).step_by(64) {
            let down = round_down_offset(offset, 256);
            assert_eq!(round_up_offset(down, 256, 4096), down);
            assert!(round_up_offset(offset, 256, 4096) >= offset);
        }
    }

    #[test]
    fn test_trigger_ticks_normal_window() {
        assert!(validate_trigger_ticks(15000, 10000, 20000, 4000));
        assert!(validate_trigger_ticks(6000, 10000, 20000, 4000));
        assert!(validate_trigger_ticks(24000, 10000, 20000, 4000));
        assert!(!validate_trigger_ticks(5000, 10000, 20000, 4000));
        assert!(!validate_trigger_ticks(24001, 10000, 20000, 4000));

        // Counter wraps between the end sample and the record write
        assert!(validate_trigger_ticks(0x50, 0xFFFF_0000, 0xFFFF_FF00, 4000));
        assert!(!validate_trigger_ticks(0x1000, 0xFFFF_0000, 0xFFFF_FF00, 4000));
        // Window starting within the threshold of zero
        assert!(validate_trigger_ticks(0xFFFF_FF00, 100, 200, 4000));
    }

    #[test]
    fn test_trigger_ticks_wrapped_window() {
        assert!(validate_trigger_ticks(50, 0xFFFF_FFF0, 100, 4000));
        assert!(validate_trigger_ticks(0xFFFF_FFF5, 0xFFFF_FFF0, 100, 4000));
        assert!(!validate_trigger_ticks(0x8000_0000, 0xFFFF_FFF0, 100, 4000));
    }

    #[test]
    fn test_split_report_matches_unsplit() {
        // 576-byte records in a 2048-byte ring: the fourth record wraps
        let (ring, memory) = ring(Generation::Xe2Hpg, 2048);
        let mut report = OaReport::zeroed(OaReportFormat::Pec64u64);
        report.set_header(ReportId::new(9, ReportReason::QUERY_TRIGGER, true), 1, 2, 3);
        for i in 0..72 {
            report.set_counter(i, i as u64 * 1000 + 7);
        }

        let bytes = report.as_bytes();
        let split_at = 1900;
        let head = 2048 - split_at;
        memory.write(split_at, &bytes[..head]).unwrap();
        memory.write(0, &bytes[head..]).unwrap();

        let split = ring.report(split_at as u32).unwrap();
        assert_eq!(split.as_bytes(), bytes);
        assert_eq!(ring.next_offset(split_at as u32).unwrap(), (1900 + 576) % 2048);
    }

    #[test]
    fn test_unmapped_ring_fails() {
        let ring = OaRingBuffer::new(traits_for(Generation::Gen12), &MetricsConfig::default());
        assert!(!ring.is_valid());
        assert_eq!(ring.size(), 0);
        assert!(ring.report(0).is_err());
        assert!(ring.find_oa_window(&OaBufferState::default()).is_err());
    }

    #[test]
    fn test_tail_offset_from_gpu_address() {
        let (ring, _) = ring(Generation::Gen12, 4096);
        assert_eq!(ring.tail_offset(0x40_0200).unwrap(), 0x200);
        // Low bits below the tail granularity are ignored
        assert_eq!(ring.tail_offset(0x40_0207).unwrap(), 0x200);
        assert!(ring.tail_offset(0x40_2000).is_err());

        let mut gpu = ReportGpu::zeroed();
        gpu.oa_tail_pre_begin = 0x40_0140;
        gpu.oa_tail_post_begin = 0x40_0140;
        assert_eq!(ring.pre_report_offset(&gpu, QueryBoundary::Begin).unwrap(), 0x100);
        assert_eq!(ring.post_report_offset(&gpu, QueryBoundary::Begin).unwrap(), 0x200);
    }

    #[test]
    fn test_find_triggered_report_skips_timer_reports() {
        let (ring, memory) = ring(Generation::Gen12, 4096);
        let mut timer = OaReport::zeroed(OaReportFormat::A32u40B8C8);
        timer.set_header(ReportId::new(1, ReportReason::TIMER, true), 0, 0, 100);
        let mut trigger = OaReport::zeroed(OaReportFormat::A32u40B8C8);
        trigger.set_header(ReportId::new(2, ReportReason::QUERY_TRIGGER, true), 0, 0, 200);

        memory.write(256, timer.as_bytes()).unwrap();
        memory.write(512, trigger.as_bytes()).unwrap();

        let (offset, found) = ring.find_triggered_report(256, 512, None).unwrap().unwrap();
        assert_eq!(offset, 512);
        assert_eq!(found.gpu_ticks(), 200);

        // Tagged searches must also match the id
        assert!(ring.find_triggered_report(256, 512, Some(3)).unwrap().is_none());
    }
}
