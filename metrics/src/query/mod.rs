//! Hardware counter queries

pub mod calculator;
pub mod hw_counters;
pub mod report_id;

pub use calculator::ReportCalculator;
pub use hw_counters::{CopyReportsData, HwCounterQuery, QuerySlot, QueryWriteData};
pub use report_id::next_report_id;
