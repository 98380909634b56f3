//! MMIO register offsets read and written by query commands

use oa_metrics_shared::GP_COUNTER_COUNT;

/// OA status: the ring wrapped over unread reports.
pub const OA_STATUS_BUFFER_OVERFLOW: u32 = 1 << 0;
/// OA status: the unit dropped a report.
pub const OA_STATUS_REPORT_LOST: u32 = 1 << 1;

/// Value written to the trigger register to request a ring report.
pub const OA_TRIGGER_REPORT: u32 = 1 << 0;

/// RPSTAT current-frequency field, in 50/3 MHz units.
pub const RPSTAT_FREQUENCY_SHIFT: u32 = 23;
pub const RPSTAT_FREQUENCY_MASK: u32 = 0x1FF;

/// Counter registers stored one by one in SRM collection mode. Each base
/// is followed by consecutive dword registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OaCounterRegisters {
    /// Low dwords of the 32 A counters
    pub a_low: u32,
    /// High bytes of the A counters, four per dword register
    pub a_high: u32,
    pub b: u32,
    pub c: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterTable {
    pub oa_tail: u32,
    pub oa_status: u32,
    pub oa_trigger: u32,
    /// Register whose value the hardware copies into triggered report ids
    pub oa_trigger_report_id: Option<u32>,
    pub gpu_ticks: u32,
    pub timestamp: u32,
    pub core_frequency: u32,
    /// PERF_CNT registers, each 64 bits wide as two dword registers
    pub perf_count: [u32; GP_COUNTER_COUNT],
    /// None where OA counters cannot be read with register stores
    pub oa_counters: Option<OaCounterRegisters>,
    /// Bits of the tail register that hold the tail position
    pub oa_tail_mask: u32,
}

pub const GEN9_REGISTERS: RegisterTable = RegisterTable {
    oa_tail: 0x2B14,
    oa_status: 0x2B08,
    oa_trigger: 0x2B10,
    oa_trigger_report_id: None,
    gpu_ticks: 0x2910,
    timestamp: 0x2358,
    core_frequency: 0xA01C,
    perf_count: [0x91B8, 0x91C0],
    oa_counters: Some(OaCounterRegisters {
        a_low: 0x2800,
        a_high: 0x2880,
        b: 0x2920,
        c: 0x2960,
    }),
    oa_tail_mask: 0xFFFF_FFC0,
};

pub const GEN12_REGISTERS: RegisterTable = RegisterTable {
    oa_tail: 0xDB04,
    oa_status: 0xDAFC,
    oa_trigger: 0xDB1C,
    oa_trigger_report_id: None,
    gpu_ticks: 0xDA90,
    timestamp: 0x2358,
    core_frequency: 0xA01C,
    perf_count: [0x91B8, 0x91C0],
    oa_counters: Some(OaCounterRegisters {
        a_low: 0x2900,
        a_high: 0x2980,
        b: 0x29A0,
        c: 0x29C0,
    }),
    oa_tail_mask: 0xFFFF_FFC0,
};

pub const XE_HP_REGISTERS: RegisterTable = RegisterTable {
    oa_counters: None,
    ..GEN12_REGISTERS
};

pub const XE2_REGISTERS: RegisterTable = RegisterTable {
    oa_trigger_report_id: Some(0xDB20),
    oa_counters: None,
    oa_tail_mask: 0x00FF_FFFF,
    ..GEN12_REGISTERS
};
