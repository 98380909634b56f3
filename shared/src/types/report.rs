//! Hardware record layouts and the client-visible report
//!
//! `OaReport40`, `OaReport64` and `ReportGpu` are bit-exact with what the
//! hardware and the emitted command stream write; do not reorder fields.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::mem::{offset_of, size_of};

use crate::StatusCode;

/// Largest OA record across supported formats.
pub const OA_REPORT_MAX_SIZE: usize = 576;

/// Maximum number of registers in a user mmio configuration.
pub const MAX_USER_REGISTERS: usize = 16;

/// General purpose PERF_CNT counters captured per query.
pub const GP_COUNTER_COUNT: usize = 2;

/// Report ids embedded in commands wrap at 12 bits.
pub const REPORT_ID_MASK: u32 = 0xFFF;

bitflags! {
    /// Reason a report was written, from the report id bitfield.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReportReason: u32 {
        const TIMER = 1 << 0;
        const INTERNAL_TRIGGER_1 = 1 << 1;
        const INTERNAL_TRIGGER_2 = 1 << 2;
        const CONTEXT_SWITCH = 1 << 3;
        const GO_TRANSITION = 1 << 4;
        const CLOCK_RATIO_CHANGE = 1 << 5;
    }
}

impl ReportReason {
    /// Reason reported for records written through the OA trigger register.
    pub const QUERY_TRIGGER: ReportReason = ReportReason::INTERNAL_TRIGGER_2;
}

/// Report id dword: bits 0..=15 id, bit 16 context valid, bits 19..=25 reason.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct ReportId(pub u32);

impl ReportId {
    const ID_MASK: u32 = 0xFFFF;
    const CONTEXT_VALID: u32 = 1 << 16;
    const REASON_SHIFT: u32 = 19;
    const REASON_MASK: u32 = 0x7F;

    pub fn new(id: u32, reason: ReportReason, context_valid: bool) -> Self {
        let mut raw = id & Self::ID_MASK;
        raw |= (reason.bits() & Self::REASON_MASK) << Self::REASON_SHIFT;
        if context_valid {
            raw |= Self::CONTEXT_VALID;
        }
        Self(raw)
    }

    pub fn id(self) -> u32 {
        self.0 & Self::ID_MASK
    }

    pub fn reason(self) -> ReportReason {
        ReportReason::from_bits_truncate((self.0 >> Self::REASON_SHIFT) & Self::REASON_MASK)
    }

    pub fn context_valid(self) -> bool {
        self.0 & Self::CONTEXT_VALID != 0
    }
}

/// Header of the 256-byte record family.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct OaReportHeader {
    pub report_id: ReportId,
    pub timestamp: u32,
    pub context_id: u32,
    pub gpu_ticks: u32,
}

/// A32u40 + B8 + C8 record (Gen9 through Xe-HPG): 40-bit A counters split
/// into a low dword and a high byte.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct OaReport40 {
    pub header: OaReportHeader,
    pub a_low: [u32; 32],
    pub b: [u32; 8],
    pub c: [u32; 8],
    pub a_high: [u8; 32],
    pub reserved: [u32; 4],
}

/// Header of the wide record family.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct OaReportHeader64 {
    pub report_id: ReportId,
    pub reserved0: u32,
    pub timestamp: u64,
    pub context_id: u32,
    pub reserved1: u32,
    pub gpu_ticks: u64,
}

/// PEC64u64 record (Xe2): 64 wide performance event counters plus visa counters.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct OaReport64 {
    pub header: OaReportHeader64,
    pub pec: [u64; 64],
    pub visa: [u32; 8],
}

const _: () = assert!(size_of::<OaReport40>() == 256);
const _: () = assert!(size_of::<OaReport64>() == OA_REPORT_MAX_SIZE);

/// Record layout written into the OA buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OaReportFormat {
    A32u40B8C8,
    Pec64u64,
}

impl OaReportFormat {
    /// Record stride in bytes.
    pub const fn size(self) -> usize {
        match self {
            OaReportFormat::A32u40B8C8 => size_of::<OaReport40>(),
            OaReportFormat::Pec64u64 => size_of::<OaReport64>(),
        }
    }

    pub const fn counter_count(self) -> usize {
        match self {
            OaReportFormat::A32u40B8C8 => 32 + 8 + 8,
            OaReportFormat::Pec64u64 => 64 + 8,
        }
    }

    /// Width in bits of counter `index`.
    pub const fn counter_width(self, index: usize) -> u32 {
        match self {
            OaReportFormat::A32u40B8C8 if index < 32 => 40,
            OaReportFormat::A32u40B8C8 => 32,
            OaReportFormat::Pec64u64 if index < 64 => 64,
            OaReportFormat::Pec64u64 => 32,
        }
    }
}

/// A single OA record, decoded out of ring or slot memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OaReport {
    Split40(OaReport40),
    Pec64(OaReport64),
}

impl OaReport {
    /// All-zero record, used as a sentinel for lost reports.
    pub fn zeroed(format: OaReportFormat) -> Self {
        match format {
            OaReportFormat::A32u40B8C8 => OaReport::Split40(Zeroable::zeroed()),
            OaReportFormat::Pec64u64 => OaReport::Pec64(Zeroable::zeroed()),
        }
    }

    /// Decode a record; `bytes` must hold at least one full record.
    pub fn from_bytes(format: OaReportFormat, bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..format.size())?;
        Some(match format {
            OaReportFormat::A32u40B8C8 => OaReport::Split40(bytemuck::pod_read_unaligned(bytes)),
            OaReportFormat::Pec64u64 => OaReport::Pec64(bytemuck::pod_read_unaligned(bytes)),
        })
    }

    pub fn format(&self) -> OaReportFormat {
        match self {
            OaReport::Split40(_) => OaReportFormat::A32u40B8C8,
            OaReport::Pec64(_) => OaReportFormat::Pec64u64,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            OaReport::Split40(r) => bytemuck::bytes_of(r),
            OaReport::Pec64(r) => bytemuck::bytes_of(r),
        }
    }

    pub fn report_id(&self) -> ReportId {
        match self {
            OaReport::Split40(r) => r.header.report_id,
            OaReport::Pec64(r) => r.header.report_id,
        }
    }

    pub fn reason(&self) -> ReportReason {
        self.report_id().reason()
    }

    pub fn context_id(&self) -> u32 {
        match self {
            OaReport::Split40(r) => r.header.context_id,
            OaReport::Pec64(r) => r.header.context_id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            OaReport::Split40(r) => r.header.timestamp as u64,
            OaReport::Pec64(r) => r.header.timestamp,
        }
    }

    pub fn gpu_ticks(&self) -> u64 {
        match self {
            OaReport::Split40(r) => r.header.gpu_ticks as u64,
            OaReport::Pec64(r) => r.header.gpu_ticks,
        }
    }

    /// Width of the timestamp and tick header fields.
    pub fn header_width(&self) -> u32 {
        match self {
            OaReport::Split40(_) => 32,
            OaReport::Pec64(_) => 64,
        }
    }

    pub fn set_header(&mut self, report_id: ReportId, timestamp: u64, context_id: u32, gpu_ticks: u64) {
        match self {
            OaReport::Split40(r) => {
                r.header = OaReportHeader {
                    report_id,
                    timestamp: timestamp as u32,
                    context_id,
                    gpu_ticks: gpu_ticks as u32,
                }
            }
            OaReport::Pec64(r) => {
                r.header = OaReportHeader64 {
                    report_id,
                    timestamp,
                    context_id,
                    gpu_ticks,
                    ..Default::default()
                }
            }
        }
    }

    pub fn counter_count(&self) -> usize {
        self.format().counter_count()
    }

    pub fn counter(&self, index: usize) -> u64 {
        match self {
            OaReport::Split40(r) => match index {
                0..=31 => r.a_low[index] as u64 | (r.a_high[index] as u64) << 32,
                32..=39 => r.b[index - 32] as u64,
                40..=47 => r.c[index - 40] as u64,
                _ => 0,
            },
            OaReport::Pec64(r) => match index {
                0..=63 => r.pec[index],
                64..=71 => r.visa[index - 64] as u64,
                _ => 0,
            },
        }
    }

    /// Store `value` truncated to the counter's width.
    pub fn set_counter(&mut self, index: usize, value: u64) {
        match self {
            OaReport::Split40(r) => match index {
                0..=31 => {
                    r.a_low[index] = value as u32;
                    r.a_high[index] = (value >> 32) as u8;
                }
                32..=39 => r.b[index - 32] = value as u32,
                40..=47 => r.c[index - 40] = value as u32,
                _ => {}
            },
            OaReport::Pec64(r) => match index {
                0..=63 => r.pec[index] = value,
                64..=71 => r.visa[index - 64] = value as u32,
                _ => {}
            },
        }
    }

    pub fn counters(&self) -> Vec<u64> {
        (0..self.counter_count()).map(|i| self.counter(i)).collect()
    }

    /// Zero the counter payload, keeping the header.
    pub fn clear_payload(&mut self) {
        match self {
            OaReport::Split40(r) => {
                r.a_low = [0; 32];
                r.a_high = [0; 32];
                r.b = [0; 8];
                r.c = [0; 8];
            }
            OaReport::Pec64(r) => {
                r.pec = [0; 64];
                r.visa = [0; 8];
            }
        }
    }
}

/// Difference of two counter samples modulo the counter width.
pub fn counter_delta(begin: u64, end: u64, width: u32) -> u64 {
    let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
    end.wrapping_sub(begin) & mask
}

/// Per-slot memory written by the GPU between query begin and end.
///
/// Slot `n` of a query lives at `n * size_of::<ReportGpu>()` from the start
/// of the query allocation. The size is a multiple of 64 so every
/// `oa_begin`/`oa_end` stays aligned for MI_REPORT_PERF_COUNT.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ReportGpu {
    pub oa_begin: [u8; OA_REPORT_MAX_SIZE],
    pub oa_end: [u8; OA_REPORT_MAX_SIZE],
    pub user_begin: [u64; MAX_USER_REGISTERS],
    pub user_end: [u64; MAX_USER_REGISTERS],
    pub gp_begin: [u64; GP_COUNTER_COUNT],
    pub gp_end: [u64; GP_COUNTER_COUNT],
    pub core_frequency_begin: u32,
    pub core_frequency_end: u32,
    pub oa_tail_pre_begin: u32,
    pub oa_tail_post_begin: u32,
    pub oa_tail_pre_end: u32,
    pub oa_tail_post_end: u32,
    pub trigger_ticks_begin: u32,
    pub trigger_ticks_end: u32,
    pub oa_status: u32,
    pub end_tag: u32,
    pub marker_user: u64,
    pub marker_driver: u64,
    pub reserved: [u32; 10],
}

const _: () = assert!(size_of::<ReportGpu>() % 64 == 0);

/// Byte offsets of `ReportGpu` fields, used to address stores into slot memory.
pub mod report_gpu_offset {
    use super::*;

    pub const OA_BEGIN: usize = offset_of!(ReportGpu, oa_begin);
    pub const OA_END: usize = offset_of!(ReportGpu, oa_end);
    pub const USER_BEGIN: usize = offset_of!(ReportGpu, user_begin);
    pub const USER_END: usize = offset_of!(ReportGpu, user_end);
    pub const GP_BEGIN: usize = offset_of!(ReportGpu, gp_begin);
    pub const GP_END: usize = offset_of!(ReportGpu, gp_end);
    pub const CORE_FREQUENCY_BEGIN: usize = offset_of!(ReportGpu, core_frequency_begin);
    pub const CORE_FREQUENCY_END: usize = offset_of!(ReportGpu, core_frequency_end);
    pub const OA_TAIL_PRE_BEGIN: usize = offset_of!(ReportGpu, oa_tail_pre_begin);
    pub const OA_TAIL_POST_BEGIN: usize = offset_of!(ReportGpu, oa_tail_post_begin);
    pub const OA_TAIL_PRE_END: usize = offset_of!(ReportGpu, oa_tail_pre_end);
    pub const OA_TAIL_POST_END: usize = offset_of!(ReportGpu, oa_tail_post_end);
    pub const TRIGGER_TICKS_BEGIN: usize = offset_of!(ReportGpu, trigger_ticks_begin);
    pub const TRIGGER_TICKS_END: usize = offset_of!(ReportGpu, trigger_ticks_end);
    pub const OA_STATUS: usize = offset_of!(ReportGpu, oa_status);
    pub const END_TAG: usize = offset_of!(ReportGpu, end_tag);
    pub const MARKER_USER: usize = offset_of!(ReportGpu, marker_user);
    pub const MARKER_DRIVER: usize = offset_of!(ReportGpu, marker_driver);
}

impl ReportGpu {
    pub const SIZE: usize = size_of::<ReportGpu>();

    pub fn zeroed() -> Self {
        Zeroable::zeroed()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.get(..Self::SIZE).map(bytemuck::pod_read_unaligned)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn oa_begin_report(&self, format: OaReportFormat) -> Option<OaReport> {
        OaReport::from_bytes(format, &self.oa_begin)
    }

    pub fn oa_end_report(&self, format: OaReportFormat) -> Option<OaReport> {
        OaReport::from_bytes(format, &self.oa_end)
    }
}

bitflags! {
    /// Data-quality flags attached to a returned report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ReportFlags: u32 {
        const NOT_READY = 1 << 0;
        const LOST = 1 << 1;
        const INCONSISTENT = 1 << 2;
        const CONTEXT_SWITCH_LOST = 1 << 3;
        const WITHOUT_WORKLOAD = 1 << 4;
        const CONTEXT_MISMATCH = 1 << 5;
        const EMPTY_CONFIGURATION = 1 << 6;
    }
}

impl ReportFlags {
    /// Status of the most severe flag set, `Success` when clean.
    pub fn status(self) -> StatusCode {
        const ORDER: [(ReportFlags, StatusCode); 7] = [
            (ReportFlags::NOT_READY, StatusCode::ReportNotReady),
            (ReportFlags::LOST, StatusCode::ReportLost),
            (ReportFlags::CONTEXT_SWITCH_LOST, StatusCode::ReportContextSwitchLost),
            (ReportFlags::INCONSISTENT, StatusCode::ReportInconsistent),
            (ReportFlags::CONTEXT_MISMATCH, StatusCode::ContextMismatch),
            (ReportFlags::EMPTY_CONFIGURATION, StatusCode::ReportWithEmptyConfiguration),
            (ReportFlags::WITHOUT_WORKLOAD, StatusCode::ReportWithoutWorkload),
        ];

        ORDER
            .iter()
            .find(|(flag, _)| self.contains(*flag))
            .map(|(_, status)| *status)
            .unwrap_or(StatusCode::Success)
    }
}

/// Client-visible result of one query slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportApi {
    /// Elapsed time between the begin and end reports
    pub total_time_ns: u64,

    /// GPU clock ticks between the begin and end reports
    pub gpu_ticks: u64,

    /// Core frequency sampled at begin
    pub core_frequency_mhz: u32,

    /// Core frequency differed between begin and end
    pub core_frequency_changed: bool,

    pub context_id: u32,
    pub report_id: u32,

    /// OA records the ring buffer holds between the begin and end markers
    pub report_count: u32,

    /// Per-counter deltas in record order
    pub oa_counters: Vec<u64>,

    /// Deltas of the registers in the user mmio configuration
    pub user_counters: Vec<u64>,

    pub gp_counters: [u64; GP_COUNTER_COUNT],
    pub marker_user: u64,
    pub marker_driver: u64,
    pub flags: ReportFlags,
}
