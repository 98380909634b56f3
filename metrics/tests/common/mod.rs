//! Test doubles: a fake kernel io-control and a software GPU
//!
//! `SimulatedGpu` executes the dwords a command buffer recorded against host
//! memory, a register file and an OA ring buffer, so begin/end/get-data can
//! be exercised end to end with real offsets and wraparound.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use oa_metrics::ddi::QueryObject;
use oa_metrics::generation::{GenerationTraits, TailEncoding};
use oa_metrics::gpu::command::GpuCommand;
use oa_metrics::gpu::registers::OA_TRIGGER_REPORT;
use oa_metrics::gpu::RecordingCommandBuffer;
use oa_metrics::kernel::memory::{GpuMemory, HostMemory};
use oa_metrics::kernel::tbs::StreamParams;
use oa_metrics::kernel::{
    EngineInfo, IoControl, MemoryClass, MemoryRegion, OaUnit, TimestampDomain,
};
use oa_metrics::shared::{
    EngineClass, Error, Generation, MetricsConfig, OaReport, OaReportFormat, ReportId,
    ReportReason, Result,
};
use oa_metrics::{
    traits_for, CommandBufferData, ConfigurationCreateData, Context, Handle, HostAllocator, MetricsLibrary,
    QueryWriteData, SubDeviceClientData,
};

pub const OA_FREQUENCY: u64 = 12_000_000;
pub const OA_BUFFER_ADDRESS: u64 = 0x8000_0000;

/// Ticks each executed command takes.
pub const TICKS_PER_COMMAND: u64 = 8;

pub fn chipset_for(generation: Generation) -> u32 {
    match generation {
        Generation::Gen9 => 0x1912,
        Generation::Gen11 => 0x8A52,
        Generation::Gen12 => 0x9A49,
        Generation::XeHp => 0x0201,
        Generation::XeHpg => 0x56A0,
        Generation::Xe2Hpg => 0xE20B,
    }
}

pub fn engine(class: EngineClass, instance: u16, gt_id: u16) -> EngineInfo {
    EngineInfo {
        class,
        instance,
        gt_id,
    }
}

#[derive(Debug)]
pub struct FakeIoControl {
    pub chipset_id: u32,
    pub oa_frequency: u64,
    pub engines: Vec<EngineInfo>,
    pub regions: Vec<MemoryRegion>,
    pub oa_units: Option<Vec<OaUnit>>,
    pub sub_device_supported: bool,
    pub null_query: bool,
    pub oa_buffer_size: Option<usize>,
    pub fail_open_stream: bool,
    oa_buffer: Mutex<Option<HostMemory>>,
    next_kernel_id: AtomicU64,
    pub unloaded: Mutex<Vec<u64>>,
}

impl FakeIoControl {
    /// Single tile with render, copy and compute engines in system memory.
    pub fn new(generation: Generation) -> Self {
        Self {
            chipset_id: chipset_for(generation),
            oa_frequency: OA_FREQUENCY,
            engines: vec![
                engine(EngineClass::Render, 0, 0),
                engine(EngineClass::Copy, 0, 0),
                engine(EngineClass::Compute, 0, 0),
            ],
            regions: vec![MemoryRegion {
                class: MemoryClass::System,
                instance: 0,
            }],
            oa_units: None,
            sub_device_supported: false,
            null_query: false,
            oa_buffer_size: Some(64 * 1024),
            fail_open_stream: false,
            oa_buffer: Mutex::new(None),
            next_kernel_id: AtomicU64::new(100),
            unloaded: Mutex::new(Vec::new()),
        }
    }

    /// `tiles` tiles, each with its own device memory and compute engine.
    pub fn with_tiles(generation: Generation, tiles: u16) -> Self {
        let mut io = Self::new(generation);
        io.engines.clear();
        io.regions = vec![MemoryRegion {
            class: MemoryClass::System,
            instance: 0,
        }];
        for tile in 0..tiles {
            io.engines.push(engine(EngineClass::Compute, tile, tile));
            io.engines.push(engine(EngineClass::Copy, tile, tile));
            io.regions.push(MemoryRegion {
                class: MemoryClass::Device,
                instance: tile,
            });
        }
        io
    }

    pub fn oa_buffer(&self) -> Option<HostMemory> {
        self.oa_buffer.lock().unwrap().clone()
    }
}

impl IoControl for FakeIoControl {
    fn chipset_id(&self) -> Result<u32> {
        Ok(self.chipset_id)
    }

    fn gpu_timestamp_frequency(&self, _domain: TimestampDomain) -> Result<u64> {
        Ok(self.oa_frequency)
    }

    fn query_engines(&self) -> Result<Vec<EngineInfo>> {
        Ok(self.engines.clone())
    }

    fn query_memory_regions(&self) -> Result<Vec<MemoryRegion>> {
        Ok(self.regions.clone())
    }

    fn query_distance(&self, engine: &EngineInfo, region: &MemoryRegion) -> Result<u32> {
        let local = region.class == MemoryClass::System || engine.gt_id == region.instance;
        Ok(if local { 0 } else { 1 })
    }

    fn query_oa_units(&self) -> Result<Option<Vec<OaUnit>>> {
        Ok(self.oa_units.clone())
    }

    fn sub_device_supported(&self) -> bool {
        self.sub_device_supported
    }

    fn load_metric_set(&self, set_id: u32) -> Result<u64> {
        if set_id == 0 {
            return Err(Error::IoControl {
                request: "load_metric_set",
                reason: "invalid set".into(),
            });
        }
        Ok(self.next_kernel_id.fetch_add(1, Ordering::Relaxed))
    }

    fn unload_metric_set(&self, kernel_id: u64) -> Result<()> {
        self.unloaded.lock().unwrap().push(kernel_id);
        Ok(())
    }

    fn open_oa_stream(&self, params: &StreamParams) -> Result<Arc<dyn GpuMemory>> {
        if self.fail_open_stream {
            return Err(Error::IoControl {
                request: "open_oa_stream",
                reason: "EACCES".into(),
            });
        }
        let size = self.oa_buffer_size.unwrap_or(params.buffer_size);
        let memory = HostMemory::new(OA_BUFFER_ADDRESS, size);
        *self.oa_buffer.lock().unwrap() = Some(memory.clone());
        Ok(Arc::new(memory))
    }

    fn close_oa_stream(&self) -> Result<()> {
        Ok(())
    }

    fn null_query_override(&self) -> bool {
        self.null_query
    }
}

struct SimulatedRing {
    memory: HostMemory,
    tail: usize,
}

/// Executes recorded command dwords.
pub struct SimulatedGpu {
    traits: &'static dyn GenerationTraits,
    memories: Vec<Arc<dyn GpuMemory>>,
    ring: Option<SimulatedRing>,
    registers: HashMap<u32, u32>,
    pub ticks: u64,
    pub timestamp: u64,
    pub context_id: u32,
    /// Extra ticks between a trigger and the record the OA unit writes
    pub trigger_latency: u64,
    /// Drop triggered records instead of writing them
    pub drop_triggers: bool,
    /// Context-valid bit of triggered records
    pub trigger_context_valid: bool,
}

impl SimulatedGpu {
    pub fn new(traits: &'static dyn GenerationTraits) -> Self {
        // 1000 MHz in RPSTAT units
        let registers = HashMap::from([(traits.registers().core_frequency, 60 << 23)]);
        Self {
            traits,
            memories: Vec::new(),
            ring: None,
            registers,
            ticks: 1_000,
            timestamp: 500,
            context_id: 0x42,
            trigger_latency: 0,
            drop_triggers: false,
            trigger_context_valid: true,
        }
    }

    pub fn attach(&mut self, memory: Arc<dyn GpuMemory>) {
        self.memories.push(memory);
    }

    pub fn attach_ring(&mut self, memory: HostMemory) {
        self.ring = Some(SimulatedRing { memory, tail: 0 });
    }

    pub fn set_register(&mut self, register: u32, value: u32) {
        self.registers.insert(register, value);
    }

    pub fn register(&self, register: u32) -> u32 {
        self.registers.get(&register).copied().unwrap_or(0)
    }

    /// Move the ring tail, e.g. to just before the wrap point.
    pub fn set_ring_tail(&mut self, tail: usize) {
        if let Some(ring) = &mut self.ring {
            ring.tail = tail;
        }
    }

    pub fn ring_tail(&self) -> usize {
        self.ring.as_ref().map(|r| r.tail).unwrap_or(0)
    }

    /// Value of OA counter `index`, growing with GPU time.
    pub fn counter_value(&self, index: usize) -> u64 {
        self.ticks * (index as u64 + 1)
    }

    /// Let the GPU run a workload of `ticks` ticks.
    pub fn run_workload(&mut self, ticks: u64) {
        self.ticks += ticks;
        self.timestamp += ticks / 2;
    }

    /// Append a periodic record the way the OA timer would.
    pub fn write_timer_report(&mut self) {
        let report = self.make_report(ReportId::new(0, ReportReason::TIMER, true));
        self.append_ring(&report);
    }

    /// Append a triggered record tagged `id`, as another client's query would.
    pub fn write_foreign_trigger(&mut self, id: u32) {
        let report = self.make_report(ReportId::new(id, ReportReason::QUERY_TRIGGER, true));
        self.append_ring(&report);
    }

    fn format(&self) -> OaReportFormat {
        self.traits.report_format()
    }

    fn make_report(&self, id: ReportId) -> OaReport {
        let mut report = OaReport::zeroed(self.format());
        report.set_header(id, self.timestamp, self.context_id, self.ticks);
        for i in 0..report.counter_count() {
            report.set_counter(i, self.counter_value(i));
        }
        report
    }

    fn append_ring(&mut self, report: &OaReport) {
        // Unmapped stream: the OA unit writes nowhere we can see
        let Some(ring) = self.ring.as_mut() else {
            return;
        };
        let bytes = report.as_bytes();
        let size = ring.memory.size();
        let head = bytes.len().min(size - ring.tail);
        ring.memory.write(ring.tail, &bytes[..head]).unwrap();
        if head < bytes.len() {
            ring.memory.write(0, &bytes[head..]).unwrap();
        }
        ring.tail = (ring.tail + bytes.len()) % size;
    }

    fn locate(&self, address: u64) -> (&Arc<dyn GpuMemory>, usize) {
        self.memories
            .iter()
            .find(|m| address >= m.gpu_address() && address < m.gpu_address() + m.size() as u64)
            .map(|m| (m, (address - m.gpu_address()) as usize))
            .unwrap_or_else(|| panic!("no memory mapped at {:#x}", address))
    }

    fn write_memory(&self, address: u64, bytes: &[u8]) {
        let (memory, offset) = self.locate(address);
        memory.write(offset, bytes).unwrap();
    }

    fn read_memory(&self, address: u64, out: &mut [u8]) {
        let (memory, offset) = self.locate(address);
        memory.read(offset, out).unwrap();
    }

    fn oa_counter_register(&self, register: u32) -> Option<u32> {
        let counters = self.traits.registers().oa_counters?;
        let index = |base: u32, count: u32| {
            (register >= base && register < base + count * 4).then(|| ((register - base) / 4) as usize)
        };
        if let Some(i) = index(counters.a_low, 32) {
            return Some(self.counter_value(i) as u32);
        }
        if let Some(i) = index(counters.a_high, 8) {
            let mut packed = 0u32;
            for byte in 0..4 {
                let high = (self.counter_value(i * 4 + byte) >> 32) as u8;
                packed |= (high as u32) << (byte * 8);
            }
            return Some(packed);
        }
        if let Some(i) = index(counters.b, 8) {
            return Some(self.counter_value(32 + i) as u32);
        }
        if let Some(i) = index(counters.c, 8) {
            return Some(self.counter_value(40 + i) as u32);
        }
        None
    }

    fn read_register(&self, register: u32) -> u32 {
        let registers = self.traits.registers();
        if register == registers.oa_tail {
            let tail = self.ring_tail() as u32;
            return match self.traits.tail_encoding() {
                TailEncoding::GpuAddress => OA_BUFFER_ADDRESS as u32 + tail,
                TailEncoding::RingOffset => tail,
            };
        }
        if register == registers.gpu_ticks {
            return self.ticks as u32;
        }
        if register == registers.timestamp {
            return self.timestamp as u32;
        }
        if let Some(value) = self.oa_counter_register(register) {
            return value;
        }
        self.register(register)
    }

    fn trigger(&mut self) {
        if self.drop_triggers {
            return;
        }
        let id = self
            .traits
            .registers()
            .oa_trigger_report_id
            .map(|r| self.register(r))
            .unwrap_or(0);

        self.ticks += self.trigger_latency;
        let report = self.make_report(ReportId::new(
            id,
            ReportReason::QUERY_TRIGGER,
            self.trigger_context_valid,
        ));
        self.append_ring(&report);
    }

    pub fn execute_command(&mut self, command: GpuCommand) {
        self.ticks += TICKS_PER_COMMAND;
        self.timestamp += TICKS_PER_COMMAND / 2;

        match command {
            GpuCommand::Noop { .. } | GpuCommand::PipeControl { .. } => {}
            GpuCommand::StoreRegisterMemory { register, address } => {
                let value = self.read_register(register);
                self.write_memory(address, &value.to_le_bytes());
            }
            GpuCommand::LoadRegisterImmediate { register, value } => {
                if register == self.traits.registers().oa_trigger && value & OA_TRIGGER_REPORT != 0 {
                    self.trigger();
                } else {
                    self.set_register(register, value);
                }
            }
            GpuCommand::StoreDataImmediate {
                address,
                value,
                qword,
            } => {
                if qword {
                    self.write_memory(address, &value.to_le_bytes());
                } else {
                    self.write_memory(address, &(value as u32).to_le_bytes());
                }
            }
            GpuCommand::ReportPerfCount { address, report_id } => {
                let report = self.make_report(ReportId(report_id));
                self.write_memory(address, report.as_bytes());
            }
            GpuCommand::CopyMemory {
                source,
                destination,
            } => {
                let mut dword = [0u8; 4];
                self.read_memory(source, &mut dword);
                self.write_memory(destination, &dword);
            }
        }
    }

    /// Decode and run an encoded command stream.
    pub fn execute(&mut self, dwords: &[u32]) {
        let mut rest = dwords;
        while !rest.is_empty() {
            let (command, used) = GpuCommand::decode(rest).expect("valid command stream");
            self.execute_command(command);
            rest = &rest[used..];
        }
    }
}

/// Library, context and simulated GPU wired together.
pub struct Harness {
    pub io: Arc<FakeIoControl>,
    pub library: MetricsLibrary,
    pub context: Handle<Context>,
    pub gpu: SimulatedGpu,
}

impl Harness {
    pub fn new(generation: Generation) -> Self {
        Self::with(FakeIoControl::new(generation), MetricsConfig::default())
    }

    pub fn with(io: FakeIoControl, config: MetricsConfig) -> Self {
        let generation = Generation::from_chipset(io.chipset_id).expect("known chipset");
        let io = Arc::new(io);
        let mut library = MetricsLibrary::open(
            1,
            0,
            io.clone(),
            Arc::new(HostAllocator::default()),
            config,
        )
        .expect("library opens");
        let context = library.context_create(None).expect("context created");

        let mut gpu = SimulatedGpu::new(traits_for(generation));
        if let Some(ring) = io.oa_buffer() {
            gpu.attach_ring(ring);
        }

        Self {
            io,
            library,
            context,
            gpu,
        }
    }

    pub fn create_query(&mut self, slots: u32) -> Handle<QueryObject> {
        let query = self
            .library
            .query_create(self.context, slots)
            .expect("query created");
        let memory = self.library.query(query).unwrap().memory().clone();
        self.gpu.attach(memory);
        query
    }

    /// Record `data` into a fresh command buffer and run it.
    pub fn submit(&mut self, data: CommandBufferData) {
        let mut buffer = RecordingCommandBuffer::new();
        self.library
            .command_buffer_get(&mut buffer, &data)
            .expect("commands recorded");
        self.gpu.execute(buffer.dwords());
    }

    pub fn write(&mut self, query: Handle<QueryObject>, data: QueryWriteData) {
        self.submit(CommandBufferData::QueryWrite { query, data });
    }

    /// Begin, run `ticks` of work, end.
    pub fn measure(&mut self, query: Handle<QueryObject>, slot: u32, ticks: u64) {
        self.write(query, QueryWriteData::begin(slot));
        self.gpu.run_workload(ticks);
        self.write(query, QueryWriteData::end(slot));
    }

    /// Create and activate an OA configuration.
    pub fn activate_metric_set(&mut self, set_id: u32) {
        let configuration = self
            .library
            .configuration_create(self.context, ConfigurationCreateData::Oa { set_id })
            .expect("configuration created");
        self.library
            .configuration_activate(configuration)
            .expect("configuration activated");
    }
}

/// Client data for a sub-device.
pub fn sub_device(index: u32, count: u32) -> SubDeviceClientData {
    SubDeviceClientData {
        is_sub_device: true,
        sub_device_index: index,
        sub_device_count: count,
    }
}
