//! GPU tick and timestamp conversions

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Convert a timestamp delta to nanoseconds for a counter running at `frequency_hz`.
pub fn ticks_to_ns(ticks: u64, frequency_hz: u64) -> u64 {
    if frequency_hz == 0 {
        return 0;
    }
    (ticks as u128 * NANOS_PER_SECOND / frequency_hz as u128) as u64
}

/// Difference of two wrapping timestamps of the given bit width.
pub fn timestamp_delta(begin: u64, end: u64, width: u32) -> u64 {
    crate::counter_delta(begin, end, width)
}
