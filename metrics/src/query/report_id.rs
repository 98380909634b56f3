//! Process-wide report id sequence
//!
//! Ids are embedded in MI_REPORT_PERF_COUNT and tagged triggers so readback
//! can tell a query's records apart from others. One counter is shared by
//! every context in the process; it starts at zero and wraps at 12 bits.

use std::sync::atomic::{AtomicU32, Ordering};

use oa_metrics_shared::REPORT_ID_MASK;

static REPORT_ID: AtomicU32 = AtomicU32::new(0);

/// Next 12-bit report id.
pub fn next_report_id() -> u32 {
    REPORT_ID.fetch_add(1, Ordering::Relaxed) & REPORT_ID_MASK
}
