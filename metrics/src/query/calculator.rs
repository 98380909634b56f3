//! Turns raw slot memory into client reports
//!
//! Counter payloads differ per record format (40-bit split counters or
//! 64-bit PEC counters); deltas are always taken modulo the counter width
//! so a counter wrapping between begin and end still yields the right value.

use oa_metrics_shared::{
    counter_delta, utils::time::ticks_to_ns, OaReport, ReportApi, ReportCollectingMode,
    ReportFlags, ReportGpu, Result, GP_COUNTER_COUNT, REPORT_ID_MASK,
};
use tracing::{debug, warn};

use super::hw_counters::{not_ready, QuerySlot};
use crate::context::Context;
use crate::gpu::registers::{OA_STATUS_BUFFER_OVERFLOW, OA_STATUS_REPORT_LOST};
use crate::oa_buffer::{QueryBoundary, TriggerMatch};

pub struct ReportCalculator<'a> {
    context: &'a Context,
}

impl<'a> ReportCalculator<'a> {
    pub fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Report for one slot.
    pub fn calculate(&self, slot: &mut QuerySlot, gpu: &ReportGpu) -> Result<ReportApi> {
        let Some(mode) = slot.mode else {
            return Ok(not_ready());
        };
        if slot.end_tag == 0 || gpu.end_tag != slot.end_tag {
            return Ok(not_ready());
        }

        let mut flags = ReportFlags::empty();
        let mut report_count = 0;

        let (begin, end) = if mode.uses_ring_buffer() {
            let reports = self.triggered_reports(slot, gpu, mode, &mut flags);
            report_count = self
                .context
                .oa_buffer()
                .find_oa_window(&slot.oa_state)
                .unwrap_or(0);
            reports
        } else {
            self.slot_reports(slot, gpu, &mut flags)?
        };

        if !slot.oa_state.configuration_valid {
            flags |= ReportFlags::EMPTY_CONFIGURATION;
        }
        if gpu.oa_status & (OA_STATUS_BUFFER_OVERFLOW | OA_STATUS_REPORT_LOST) != 0 {
            warn!(slot = slot.index, status = gpu.oa_status, "OA unit reported lost data");
            flags |= ReportFlags::LOST;
        }

        let width = begin.header_width();
        let gpu_ticks = counter_delta(begin.gpu_ticks(), end.gpu_ticks(), width);
        if gpu_ticks == 0 {
            flags |= ReportFlags::WITHOUT_WORKLOAD;
        }
        if !flags.contains(ReportFlags::LOST) && begin.context_id() != end.context_id() {
            flags |= ReportFlags::CONTEXT_MISMATCH;
        }

        let timestamp = counter_delta(begin.timestamp(), end.timestamp(), width);
        let traits = self.context.traits();
        let frequency_begin = traits.core_frequency_mhz(gpu.core_frequency_begin);
        let frequency_end = traits.core_frequency_mhz(gpu.core_frequency_end);

        let format = begin.format();
        let oa_counters = (0..format.counter_count())
            .map(|i| counter_delta(begin.counter(i), end.counter(i), format.counter_width(i)))
            .collect();

        let user_counters = slot
            .user_registers
            .iter()
            .enumerate()
            .map(|(i, register)| {
                counter_delta(gpu.user_begin[i], gpu.user_end[i], register.width_bits())
            })
            .collect();

        let mut gp_counters = [0u64; GP_COUNTER_COUNT];
        for (i, value) in gp_counters.iter_mut().enumerate() {
            *value = counter_delta(gpu.gp_begin[i], gpu.gp_end[i], 64);
        }

        Ok(ReportApi {
            total_time_ns: ticks_to_ns(timestamp, self.context.oa_frequency()),
            gpu_ticks,
            core_frequency_mhz: frequency_begin,
            core_frequency_changed: frequency_begin != frequency_end,
            context_id: begin.context_id(),
            report_id: slot.report_id_begin,
            report_count,
            oa_counters,
            user_counters,
            gp_counters,
            marker_user: gpu.marker_user,
            marker_driver: gpu.marker_driver,
            flags,
        })
    }

    /// Records written straight into slot memory by MI_RPC or register stores.
    fn slot_reports(
        &self,
        slot: &QuerySlot,
        gpu: &ReportGpu,
        flags: &mut ReportFlags,
    ) -> Result<(OaReport, OaReport)> {
        let format = self.context.oa_buffer().format();
        let short = || oa_metrics_shared::Error::failed("slot too small for OA record");
        let begin = gpu.oa_begin_report(format).ok_or_else(short)?;
        let end = gpu.oa_end_report(format).ok_or_else(short)?;

        let begin_id = begin.report_id().id() & REPORT_ID_MASK;
        let end_id = end.report_id().id() & REPORT_ID_MASK;
        if begin_id != slot.report_id_begin || end_id != slot.report_id_end {
            debug!(
                slot = slot.index,
                begin_id,
                end_id,
                expected_begin = slot.report_id_begin,
                expected_end = slot.report_id_end,
                "report id mismatch"
            );
            *flags |= ReportFlags::INCONSISTENT;
        }
        Ok((begin, end))
    }

    /// Records located in the OA ring buffer through the tail snapshots.
    ///
    /// Any failure is local to the slot: the report is flagged lost and
    /// both records carry zeroed counters. A record written outside a valid
    /// context marks the slot context-switch lost.
    fn triggered_reports(
        &self,
        slot: &mut QuerySlot,
        gpu: &ReportGpu,
        mode: ReportCollectingMode,
        flags: &mut ReportFlags,
    ) -> (OaReport, OaReport) {
        let ring = self.context.oa_buffer();
        let zeroed = OaReport::zeroed(ring.format());

        if !ring.is_valid() {
            *flags |= ReportFlags::CONTEXT_SWITCH_LOST | ReportFlags::LOST;
            return (zeroed, zeroed);
        }

        let tagged = mode == ReportCollectingMode::TriggerOagExtended;
        let window = |report_id: u32| TriggerMatch {
            report_id: tagged.then_some(report_id),
            ticks_begin: gpu.trigger_ticks_begin,
            ticks_end: gpu.trigger_ticks_end,
        };

        let state = &mut slot.oa_state;
        let mut valid = true;
        for (boundary, report_id) in [
            (QueryBoundary::Begin, slot.report_id_begin),
            (QueryBoundary::End, slot.report_id_end),
        ] {
            match ring.use_triggered_report(state, gpu, boundary, &window(report_id)) {
                Ok(found) => valid &= found,
                Err(e) => {
                    warn!(slot = slot.index, ?boundary, error = %e, "triggered report lookup failed");
                    state.reports[boundary as usize] = Some(zeroed);
                    valid = false;
                }
            }
        }

        if !state.context_valid {
            *flags |= ReportFlags::CONTEXT_SWITCH_LOST;
        }

        let mut begin = state.report(QueryBoundary::Begin).copied().unwrap_or(zeroed);
        let mut end = state.report(QueryBoundary::End).copied().unwrap_or(zeroed);
        if !valid {
            // Lost slots carry no counters from either boundary
            *flags |= ReportFlags::LOST;
            begin.clear_payload();
            end.clear_payload();
        }
        (begin, end)
    }
}
