//! GPU command emission

pub mod buffer;
pub mod command;
pub mod commands;
pub mod registers;

pub use buffer::{CommandBuffer, RecordingCommandBuffer, SizeCalculator};
pub use command::{GpuCommand, PipeControlFlags};
pub use commands::GpuCommands;
