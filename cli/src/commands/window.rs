//! Window command implementation

use anyhow::Result;
use clap::Args;
use oa_metrics::oa_buffer::{window_bytes, window_records};
use oa_metrics::traits_for;
use oa_metrics_shared::Generation;

use crate::output;

#[derive(Args, Debug)]
pub struct WindowArgs {
    /// Generation whose record size applies
    #[arg(short, long, value_parser = super::parse_generation)]
    pub generation: Generation,

    /// OA buffer size in bytes
    #[arg(short, long, default_value = "0x1000000", value_parser = super::parse_u32)]
    pub size: u32,

    /// Ring offset of the first record
    #[arg(value_parser = super::parse_u32)]
    pub first: u32,

    /// Ring offset one past the last record
    #[arg(value_parser = super::parse_u32)]
    pub last: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Window {
    pub bytes: u32,
    pub records: u32,
    /// Bytes past the last whole record
    pub remainder: u32,
    pub wraps: bool,
}

pub fn measure(args: &WindowArgs) -> Result<Window> {
    if args.first >= args.size || args.last >= args.size {
        anyhow::bail!(
            "Offsets {:#x}..{:#x} must lie inside the {} byte buffer",
            args.first,
            args.last,
            args.size
        );
    }

    let stride = traits_for(args.generation).report_format().size() as u32;
    let bytes = window_bytes(args.first, args.last, args.size);
    Ok(Window {
        bytes,
        records: window_records(args.first, args.last, args.size, stride),
        remainder: bytes % stride,
        wraps: args.last < args.first,
    })
}

pub fn run(args: WindowArgs) -> Result<()> {
    let window = measure(&args)?;

    output::info(&format!(
        "{:#x}..{:#x}: {} bytes, {} records{}",
        args.first,
        args.last,
        window.bytes,
        window.records,
        if window.wraps { " (wraps)" } else { "" }
    ));
    if window.remainder != 0 {
        output::warning(&format!(
            "window ends {} bytes into a record; offsets are not record aligned",
            window.remainder
        ));
    }
    Ok(())
}
