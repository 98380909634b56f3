//! Typed GPU commands and their MI dword encoding

use bitflags::bitflags;

const MI_NOOP: u32 = 0x00 << 23;
const MI_NOOP_IDENTIFICATION_ENABLE: u32 = 1 << 22;
const MI_NOOP_IDENTIFICATION_MASK: u32 = 0x3F_FFFF;
const MI_STORE_DATA_IMM: u32 = 0x20 << 23;
const MI_STORE_DATA_IMM_QWORD: u32 = 1 << 21;
const MI_LOAD_REGISTER_IMM: u32 = 0x22 << 23;
const MI_STORE_REGISTER_MEM: u32 = 0x24 << 23;
const MI_REPORT_PERF_COUNT: u32 = 0x28 << 23;
const MI_COPY_MEM_MEM: u32 = 0x2E << 23;
const PIPE_CONTROL: u32 = (3 << 29) | (3 << 27) | (2 << 24);

const MI_OPCODE_MASK: u32 = 0x3F << 23;
const PIPE_CONTROL_MASK: u32 = 0xFFFF << 16;
const LENGTH_MASK: u32 = 0xFF;

bitflags! {
    /// PIPE_CONTROL dword 1 flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipeControlFlags: u32 {
        const DEPTH_CACHE_FLUSH = 1 << 0;
        const STALL_AT_PIXEL_SCOREBOARD = 1 << 1;
        const DC_FLUSH = 1 << 5;
        const TEXTURE_CACHE_INVALIDATE = 1 << 10;
        const RENDER_TARGET_CACHE_FLUSH = 1 << 12;
        const COMMAND_STREAMER_STALL = 1 << 20;
    }
}

/// A single command appended to a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuCommand {
    /// MI_NOOP, optionally latching an identification number.
    Noop { identification: Option<u32> },
    PipeControl { flags: PipeControlFlags },
    /// MI_STORE_REGISTER_MEM: 32-bit register to memory.
    StoreRegisterMemory { register: u32, address: u64 },
    /// MI_LOAD_REGISTER_IMM: immediate to a 32-bit register.
    LoadRegisterImmediate { register: u32, value: u32 },
    /// MI_STORE_DATA_IMM: a dword, or a qword when `qword` is set.
    StoreDataImmediate { address: u64, value: u64, qword: bool },
    /// MI_REPORT_PERF_COUNT: the OA unit writes a whole report at `address`.
    ReportPerfCount { address: u64, report_id: u32 },
    /// MI_COPY_MEM_MEM: copies one dword.
    CopyMemory { source: u64, destination: u64 },
}

impl GpuCommand {
    pub fn dword_count(&self) -> usize {
        match self {
            GpuCommand::Noop { .. } => 1,
            GpuCommand::PipeControl { .. } => 6,
            GpuCommand::StoreRegisterMemory { .. } => 4,
            GpuCommand::LoadRegisterImmediate { .. } => 3,
            GpuCommand::StoreDataImmediate { qword: false, .. } => 4,
            GpuCommand::StoreDataImmediate { qword: true, .. } => 5,
            GpuCommand::ReportPerfCount { .. } => 4,
            GpuCommand::CopyMemory { .. } => 5,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.dword_count() * 4
    }

    /// Append the encoded dwords to `out`.
    pub fn encode(&self, out: &mut Vec<u32>) {
        let length = (self.dword_count() as u32).saturating_sub(2);
        match *self {
            GpuCommand::Noop { identification } => {
                let mut dw = MI_NOOP;
                if let Some(id) = identification {
                    dw |= MI_NOOP_IDENTIFICATION_ENABLE | (id & MI_NOOP_IDENTIFICATION_MASK);
                }
                out.push(dw);
            }
            GpuCommand::PipeControl { flags } => {
                out.extend_from_slice(&[PIPE_CONTROL | length, flags.bits(), 0, 0, 0, 0]);
            }
            GpuCommand::StoreRegisterMemory { register, address } => {
                out.extend_from_slice(&[MI_STORE_REGISTER_MEM | length, register]);
                push_address(out, address);
            }
            GpuCommand::LoadRegisterImmediate { register, value } => {
                out.extend_from_slice(&[MI_LOAD_REGISTER_IMM | length, register, value]);
            }
            GpuCommand::StoreDataImmediate {
                address,
                value,
                qword,
            } => {
                let qword_bit = if qword { MI_STORE_DATA_IMM_QWORD } else { 0 };
                out.push(MI_STORE_DATA_IMM | qword_bit | length);
                push_address(out, address);
                out.push(value as u32);
                if qword {
                    out.push((value >> 32) as u32);
                }
            }
            GpuCommand::ReportPerfCount { address, report_id } => {
                out.push(MI_REPORT_PERF_COUNT | length);
                push_address(out, address);
                out.push(report_id);
            }
            GpuCommand::CopyMemory {
                source,
                destination,
            } => {
                out.push(MI_COPY_MEM_MEM | length);
                push_address(out, destination);
                push_address(out, source);
            }
        }
    }

    /// Decode one command from the front of `dwords`, returning it with the
    /// number of dwords consumed.
    pub fn decode(dwords: &[u32]) -> Option<(GpuCommand, usize)> {
        let header = *dwords.first()?;

        if header & PIPE_CONTROL_MASK == PIPE_CONTROL {
            let body = dwords.get(..6)?;
            let flags = PipeControlFlags::from_bits_truncate(body[1]);
            return Some((GpuCommand::PipeControl { flags }, 6));
        }

        let command = match header & MI_OPCODE_MASK {
            MI_NOOP => {
                let identification = (header & MI_NOOP_IDENTIFICATION_ENABLE != 0)
                    .then_some(header & MI_NOOP_IDENTIFICATION_MASK);
                GpuCommand::Noop { identification }
            }
            MI_STORE_REGISTER_MEM => {
                let body = dwords.get(..4)?;
                GpuCommand::StoreRegisterMemory {
                    register: body[1],
                    address: join_address(body[2], body[3]),
                }
            }
            MI_LOAD_REGISTER_IMM => {
                let body = dwords.get(..3)?;
                GpuCommand::LoadRegisterImmediate {
                    register: body[1],
                    value: body[2],
                }
            }
            MI_STORE_DATA_IMM => {
                let qword = header & MI_STORE_DATA_IMM_QWORD != 0;
                let body = dwords.get(..if qword { 5 } else { 4 })?;
                let high = if qword { (body[4] as u64) << 32 } else { 0 };
                GpuCommand::StoreDataImmediate {
                    address: join_address(body[1], body[2]),
                    value: body[3] as u64 | high,
                    qword,
                }
            }
            MI_REPORT_PERF_COUNT => {
                let body = dwords.get(..4)?;
                GpuCommand::ReportPerfCount {
                    address: join_address(body[1], body[2]),
                    report_id: body[3],
                }
            }
            MI_COPY_MEM_MEM => {
                let body = dwords.get(..5)?;
                GpuCommand::CopyMemory {
                    destination: join_address(body[1], body[2]),
                    source: join_address(body[3], body[4]),
                }
            }
            _ => return None,
        };

        let consumed = command.dword_count();
        if header & MI_OPCODE_MASK != MI_NOOP && (header & LENGTH_MASK) as usize + 2 != consumed {
            return None;
        }
        Some((command, consumed))
    }
}

fn push_address(out: &mut Vec<u32>, address: u64) {
    out.push(address as u32);
    out.push((address >> 32) as u32);
}

fn join_address(low: u32, high: u32) -> u64 {
    low as u64 | (high as u64) << 32
}
