//! Hardware counter query state machine
//!
//! A query owns `N` slots laid out back to back in one GPU allocation, slot
//! `n` at `n * ReportGpu::SIZE`. Each slot goes through begin and end any
//! number of times; readback may happen after any end.
//!
//! Command sequences stop at the first failing write and return that error
//! unchanged. During the calculate-size phase the same commands are emitted
//! but no slot state is touched.

use std::sync::Arc;

use oa_metrics_shared::{
    report_gpu_offset as offset, CommandBufferType, Error, ReportApi, ReportCollectingMode,
    ReportFlags, ReportGpu, Result, GP_COUNTER_COUNT,
};
use tracing::{debug, instrument};

use super::calculator::ReportCalculator;
use super::report_id::next_report_id;
use crate::configuration::{UserConfiguration, UserRegister};
use crate::context::Context;
use crate::gpu::buffer::CommandBuffer;
use crate::gpu::commands::GpuCommands;
use crate::kernel::memory::GpuMemory;
use crate::oa_buffer::OaBufferState;

/// Parameters of one begin or end write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryWriteData {
    pub slot: u32,
    pub begin: bool,
    pub marker_user: u64,
    pub marker_driver: u64,
    pub command_buffer_type: CommandBufferType,
}

impl QueryWriteData {
    pub fn begin(slot: u32) -> Self {
        Self {
            slot,
            begin: true,
            ..Self::default()
        }
    }

    pub fn end(slot: u32) -> Self {
        Self {
            slot,
            begin: false,
            ..Self::default()
        }
    }
}

/// Slot range copied from one query into another.
///
/// An empty range is valid and emits no commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyReportsData {
    pub source_slot: u32,
    pub target_slot: u32,
    pub slot_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySlot {
    pub index: u32,
    pub gpu_address: u64,
    /// Decided at begin, reused at end
    pub mode: Option<ReportCollectingMode>,
    pub oa_state: OaBufferState,
    pub report_id_begin: u32,
    pub report_id_end: u32,
    /// End tag the GPU writes last; 0 until the slot has been ended
    pub end_tag: u32,
    pub api_report_index: u32,
    pub api_report_count: u32,
    pub user_registers: Vec<UserRegister>,
}

impl QuerySlot {
    fn new(index: u32, gpu_address: u64) -> Self {
        Self {
            index,
            gpu_address,
            mode: None,
            oa_state: OaBufferState::default(),
            report_id_begin: 0,
            report_id_end: 0,
            end_tag: 0,
            api_report_index: 0,
            api_report_count: 0,
            user_registers: Vec::new(),
        }
    }

    /// Take over the bookkeeping of a slot whose memory was copied here.
    fn adopt(&mut self, source: &QuerySlot) {
        *self = Self {
            index: self.index,
            gpu_address: self.gpu_address,
            ..source.clone()
        };
    }
}

/// Slots of a query captured for a GPU-side copy.
#[derive(Debug, Clone)]
pub struct SlotExport {
    pub gpu_address: u64,
    pub slots: Vec<QuerySlot>,
}

#[derive(Debug)]
pub struct HwCounterQuery {
    slots: Vec<QuerySlot>,
    memory: Arc<dyn GpuMemory>,
    user_configuration: Option<UserConfiguration>,
    end_tag: u32,
}

fn slot_offset(index: u32) -> u64 {
    index as u64 * ReportGpu::SIZE as u64
}

fn check_range(first: u32, count: u32, available: usize) -> Result<()> {
    let end = first as u64 + count as u64;
    if end > available as u64 {
        return Err(Error::IncorrectSlot {
            first,
            count,
            available: available as u32,
        });
    }
    Ok(())
}

impl HwCounterQuery {
    /// Allocate `slot_count` slots of GPU memory.
    #[instrument(skip(context))]
    pub fn create(context: &Context, slot_count: u32) -> Result<Self> {
        if slot_count == 0 {
            return Err(Error::parameter("query needs at least one slot"));
        }

        let size = ReportGpu::SIZE
            .checked_mul(slot_count as usize)
            .ok_or(Error::OutOfMemory(usize::MAX))?;
        let memory = context.allocator().allocate(size)?;
        let base = memory.gpu_address();

        let slots = (0..slot_count)
            .map(|i| QuerySlot::new(i, base + slot_offset(i)))
            .collect();

        debug!(slot_count, base, "query created");
        Ok(Self {
            slots,
            memory,
            user_configuration: context.always_on_user_configuration()?,
            end_tag: 0,
        })
    }

    pub fn slots(&self) -> &[QuerySlot] {
        &self.slots
    }

    pub fn slot(&self, index: u32) -> Result<&QuerySlot> {
        self.slots.get(index as usize).ok_or(Error::IncorrectSlot {
            first: index,
            count: 1,
            available: self.slots.len() as u32,
        })
    }

    pub fn memory(&self) -> &Arc<dyn GpuMemory> {
        &self.memory
    }

    pub fn user_configuration(&self) -> Option<&UserConfiguration> {
        self.user_configuration.as_ref()
    }

    /// Emit begin or end commands for one slot.
    #[instrument(skip(self, context, buffer), fields(calculate = buffer.is_calculate_size_phase()))]
    pub fn write(
        &mut self,
        context: &Context,
        buffer: &mut dyn CommandBuffer,
        data: &QueryWriteData,
    ) -> Result<()> {
        self.slot(data.slot)?;
        if data.begin {
            self.write_begin(context, buffer, data)
        } else {
            self.write_end(context, buffer, data)
        }
    }

    fn write_begin(
        &mut self,
        context: &Context,
        buffer: &mut dyn CommandBuffer,
        data: &QueryWriteData,
    ) -> Result<()> {
        let commands = context.commands();
        let traits = context.traits();
        let registers = traits.registers();
        let calculate = buffer.is_calculate_size_phase();

        let mode = traits.collecting_mode(
            context.config().default_collecting_mode,
            data.command_buffer_type,
        );
        let report_id = if calculate { 0 } else { next_report_id() };
        let user_registers =
            context.user_registers(self.user_configuration.as_ref());
        let address = self.memory.gpu_address() + slot_offset(data.slot);

        if !calculate {
            let slot = &mut self.slots[data.slot as usize];
            slot.gpu_address = address;
            slot.oa_state.reset(context.oa_configuration_active());
            slot.mode = Some(mode);
            slot.report_id_begin = report_id;
            slot.end_tag = 0;
            slot.user_registers = user_registers.clone();
            debug!(slot = data.slot, ?mode, report_id, "query begin");
        }

        commands.flush_command_streamer(buffer)?;
        commands.write_identification(buffer, report_id)?;
        commands.store_register(
            buffer,
            registers.core_frequency,
            address + offset::CORE_FREQUENCY_BEGIN as u64,
        )?;
        commands.store_register(buffer, registers.oa_tail, address + offset::OA_TAIL_PRE_BEGIN as u64)?;
        write_user_counters(&commands, buffer, &user_registers, address + offset::USER_BEGIN as u64)?;
        write_gp_counters(&commands, buffer, &registers.perf_count, address + offset::GP_BEGIN as u64)?;
        commands.store_hw_counters(
            buffer,
            mode,
            address + offset::OA_BEGIN as u64,
            address + offset::TRIGGER_TICKS_BEGIN as u64,
            report_id,
        )?;
        commands.store_register(buffer, registers.oa_tail, address + offset::OA_TAIL_POST_BEGIN as u64)
    }

    fn write_end(
        &mut self,
        context: &Context,
        buffer: &mut dyn CommandBuffer,
        data: &QueryWriteData,
    ) -> Result<()> {
        let commands = context.commands();
        let traits = context.traits();
        let registers = traits.registers();
        let calculate = buffer.is_calculate_size_phase();
        let slot = &self.slots[data.slot as usize];

        let mode = match (slot.mode, calculate) {
            (Some(mode), _) => mode,
            (None, true) => traits.collecting_mode(
                context.config().default_collecting_mode,
                data.command_buffer_type,
            ),
            (None, false) => {
                return Err(Error::parameter(format!(
                    "slot {} ended without a begin",
                    data.slot
                )))
            }
        };
        let user_registers = if calculate && slot.mode.is_none() {
            context.user_registers(self.user_configuration.as_ref())
        } else {
            slot.user_registers.clone()
        };
        let address = slot.gpu_address;

        let (report_id, end_tag) = if calculate {
            (0, 0)
        } else {
            self.end_tag = self.end_tag.wrapping_add(1).max(1);
            let report_id = next_report_id();
            let slot = &mut self.slots[data.slot as usize];
            slot.report_id_end = report_id;
            slot.end_tag = self.end_tag;
            debug!(slot = data.slot, ?mode, report_id, end_tag = self.end_tag, "query end");
            (report_id, self.end_tag)
        };

        commands.flush_command_streamer(buffer)?;
        commands.write_identification(buffer, report_id)?;
        commands.store_register(buffer, registers.oa_tail, address + offset::OA_TAIL_PRE_END as u64)?;
        commands.store_hw_counters(
            buffer,
            mode,
            address + offset::OA_END as u64,
            address + offset::TRIGGER_TICKS_END as u64,
            report_id,
        )?;
        commands.store_register(buffer, registers.oa_tail, address + offset::OA_TAIL_POST_END as u64)?;
        write_gp_counters(&commands, buffer, &registers.perf_count, address + offset::GP_END as u64)?;
        write_user_counters(&commands, buffer, &user_registers, address + offset::USER_END as u64)?;
        commands.store_register(
            buffer,
            registers.core_frequency,
            address + offset::CORE_FREQUENCY_END as u64,
        )?;
        commands.store_register(buffer, registers.oa_status, address + offset::OA_STATUS as u64)?;
        commands.store_data64(buffer, address + offset::MARKER_USER as u64, data.marker_user)?;
        commands.store_data64(buffer, address + offset::MARKER_DRIVER as u64, data.marker_driver)?;

        // Must stay the final write: its presence proves everything above landed.
        commands.store_data(buffer, address + offset::END_TAG as u64, end_tag)
    }

    /// Snapshot of `count` slots starting at `first`, for [`copy_reports`](Self::copy_reports).
    pub fn export_slots(&self, first: u32, count: u32) -> Result<SlotExport> {
        check_range(first, count, self.slots.len())?;
        Ok(SlotExport {
            gpu_address: self.memory.gpu_address() + slot_offset(first),
            slots: self.slots[first as usize..(first + count) as usize].to_vec(),
        })
    }

    /// Copy raw slot memory from `source` into this query's slots.
    #[instrument(skip(self, context, buffer, source))]
    pub fn copy_reports(
        &mut self,
        context: &Context,
        buffer: &mut dyn CommandBuffer,
        source: &SlotExport,
        target_slot: u32,
    ) -> Result<()> {
        let count = source.slots.len() as u32;
        check_range(target_slot, count, self.slots.len())?;
        if count == 0 {
            return Ok(());
        }

        let destination = self.memory.gpu_address() + slot_offset(target_slot);
        context.commands().copy_memory(
            buffer,
            source.gpu_address,
            destination,
            count as usize * ReportGpu::SIZE,
        )?;

        if !buffer.is_calculate_size_phase() {
            for (i, slot) in source.slots.iter().enumerate() {
                self.slots[target_slot as usize + i].adopt(slot);
            }
        }
        Ok(())
    }

    /// Raw slot memory as last written by the GPU.
    pub fn read_slot(&self, index: u32) -> Result<ReportGpu> {
        self.slot(index)?;
        let mut bytes = vec![0u8; ReportGpu::SIZE];
        self.memory.read(slot_offset(index) as usize, &mut bytes)?;
        ReportGpu::from_bytes(&bytes).ok_or_else(|| Error::failed("short slot read"))
    }

    /// Assemble reports for `count` slots starting at `first`.
    ///
    /// Data quality problems are returned as flags inside each report.
    #[instrument(skip(self, context))]
    pub fn get_data(&mut self, context: &Context, first: u32, count: u32) -> Result<Vec<ReportApi>> {
        check_range(first, count, self.slots.len())?;

        if context.null_query() {
            debug!("null query override active");
            return Ok(vec![ReportApi::default(); count as usize]);
        }

        let calculator = ReportCalculator::new(context);
        let mut reports = Vec::with_capacity(count as usize);
        for (n, index) in (first..first + count).enumerate() {
            let gpu = self.read_slot(index)?;
            let slot = &mut self.slots[index as usize];
            slot.api_report_index = n as u32;
            slot.api_report_count = count;

            let report = calculator.calculate(slot, &gpu)?;
            if !report.flags.is_empty() {
                debug!(slot = index, flags = ?report.flags, status = %report.flags.status(), "report quality");
            }
            let dump = slot.mode.is_some_and(|m| m.uses_ring_buffer()) && report.flags.contains(ReportFlags::LOST);
            reports.push(report);

            if dump {
                if let Err(e) = self.dump_reports(context, index) {
                    debug!(slot = index, error = %e, "unable to dump OA window");
                }
            }
        }
        Ok(reports)
    }

    /// Log the ring records bracketing a slot.
    pub fn dump_reports(&self, context: &Context, index: u32) -> Result<()> {
        let gpu = self.read_slot(index)?;
        context.oa_buffer().dump_reports(&gpu)
    }

    /// True when every slot in the range has a complete end tag.
    pub fn is_ready(&self, first: u32, count: u32) -> Result<bool> {
        check_range(first, count, self.slots.len())?;
        for index in first..first + count {
            let expected = self.slots[index as usize].end_tag;
            if expected == 0 || self.read_slot(index)?.end_tag != expected {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn write_user_counters(
    commands: &GpuCommands<'_>,
    buffer: &mut dyn CommandBuffer,
    registers: &[UserRegister],
    address: u64,
) -> Result<()> {
    for (i, register) in registers.iter().enumerate() {
        let destination = address + i as u64 * 8;
        if register.size == 8 {
            commands.store_register64(buffer, register.offset, destination)?;
        } else {
            commands.store_register(buffer, register.offset, destination)?;
        }
    }
    Ok(())
}

fn write_gp_counters(
    commands: &GpuCommands<'_>,
    buffer: &mut dyn CommandBuffer,
    perf_count: &[u32; GP_COUNTER_COUNT],
    address: u64,
) -> Result<()> {
    for (i, register) in perf_count.iter().enumerate() {
        commands.store_register64(buffer, *register, address + i as u64 * 8)?;
    }
    Ok(())
}

/// Flags for a slot that has not been completed by the GPU.
pub(crate) fn not_ready() -> ReportApi {
    ReportApi {
        flags: ReportFlags::NOT_READY,
        ..ReportApi::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_offsets_do_not_alias() {
        for index in 0..16u32 {
            let start = slot_offset(index);
            assert_eq!(start, index as u64 * ReportGpu::SIZE as u64);
            assert_eq!(slot_offset(index + 1) - start, ReportGpu::SIZE as u64);
        }
    }

    #[test]
    fn test_range_check() {
        assert!(check_range(0, 4, 4).is_ok());
        assert!(check_range(3, 1, 4).is_ok());
        assert!(check_range(3, 2, 4).is_err());
        assert!(check_range(0, 0, 4).is_ok());
        assert!(check_range(4, 0, 4).is_ok());
        assert!(check_range(5, 0, 4).is_err());
        assert!(check_range(u32::MAX, 2, 4).is_err());
    }

    #[test]
    fn test_adopt_keeps_location() {
        let mut target = QuerySlot::new(2, 0x2000);
        let mut source = QuerySlot::new(0, 0x1000);
        source.mode = Some(ReportCollectingMode::TriggerOag);
        source.end_tag = 7;

        target.adopt(&source);
        assert_eq!(target.index, 2);
        assert_eq!(target.gpu_address, 0x2000);
        assert_eq!(target.end_tag, 7);
        assert_eq!(target.mode, Some(ReportCollectingMode::TriggerOag));
    }
}
