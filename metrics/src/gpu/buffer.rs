//! Command buffer interface consumed by the query engine

use oa_metrics_shared::{Error, Result};

use super::command::GpuCommand;

/// Destination for emitted commands. Owned and synchronized by the caller.
pub trait CommandBuffer {
    /// Append a command.
    fn write(&mut self, command: GpuCommand) -> Result<()>;

    /// True while the caller is only measuring how many bytes a write needs.
    /// Nothing is executed and query state must not change.
    fn is_calculate_size_phase(&self) -> bool {
        false
    }
}

/// Command buffer that keeps both the typed commands and their encoding.
#[derive(Debug, Default, Clone)]
pub struct RecordingCommandBuffer {
    commands: Vec<GpuCommand>,
    dwords: Vec<u32>,
    capacity: Option<usize>,
}

impl RecordingCommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer refusing writes beyond `bytes`.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            capacity: Some(bytes),
            ..Self::default()
        }
    }

    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    pub fn dwords(&self) -> &[u32] {
        &self.dwords
    }

    pub fn used_bytes(&self) -> usize {
        self.dwords.len() * 4
    }

    pub fn clear(&mut self) {
        self.commands.clear();
        self.dwords.clear();
    }
}

impl CommandBuffer for RecordingCommandBuffer {
    fn write(&mut self, command: GpuCommand) -> Result<()> {
        if let Some(capacity) = self.capacity {
            let needed = self.used_bytes() + command.size_in_bytes();
            if needed > capacity {
                return Err(Error::InsufficientSpace {
                    needed,
                    available: capacity,
                });
            }
        }

        command.encode(&mut self.dwords);
        self.commands.push(command);
        Ok(())
    }
}

/// Calculate-size phase: only accumulates byte counts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SizeCalculator {
    bytes: usize,
}

impl SizeCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl CommandBuffer for SizeCalculator {
    fn write(&mut self, command: GpuCommand) -> Result<()> {
        self.bytes += command.size_in_bytes();
        Ok(())
    }

    fn is_calculate_size_phase(&self) -> bool {
        true
    }
}
