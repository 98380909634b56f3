//! Dump command implementation
//!
//! Loads a raw OA buffer capture and decodes it with the same ring model
//! queries use, so records split across the wrap point come out whole.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use oa_metrics::{traits_for, HostMemory, OaRingBuffer};
use oa_metrics_shared::{
    utils::{bytes_to_hex, time::ticks_to_ns, time::timestamp_delta},
    Generation, MetricsConfig, OaReport, ReportReason,
};
use serde::Serialize;
use tracing::debug;

use crate::output;

#[derive(Args, Debug)]
pub struct DumpArgs {
    /// Raw OA buffer capture
    pub input: PathBuf,

    /// Generation the capture was taken on (gen9, gen11, gen12, xe-hp, xe-hpg, xe2-hpg)
    #[arg(short, long, value_parser = super::parse_generation)]
    pub generation: Generation,

    /// Ring offset of the first record
    #[arg(long, default_value = "0", value_parser = super::parse_u32)]
    pub offset: u32,

    /// Number of records to decode (defaults to the whole buffer)
    #[arg(short = 'n', long)]
    pub count: Option<u32>,

    /// OA timestamp frequency in Hz
    #[arg(long, default_value = "12000000")]
    pub frequency: u64,

    /// Only show records written by query triggers
    #[arg(long)]
    pub triggers_only: bool,

    /// Include counter payloads
    #[arg(long)]
    pub counters: bool,

    /// Write records as JSON instead of printing a table
    #[arg(long)]
    pub json: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub offset: u32,
    pub report_id: u32,
    pub reason: String,
    pub context_valid: bool,
    pub context_id: u32,
    pub timestamp: u64,
    pub gpu_ticks: u64,
    /// Time since the previous decoded record
    pub elapsed_ns: u64,
    pub header: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters: Option<Vec<u64>>,
}

impl RecordSummary {
    fn new(offset: u32, report: &OaReport, elapsed_ns: u64, counters: bool) -> Self {
        let id = report.report_id();
        Self {
            offset,
            report_id: id.id(),
            reason: output::reason_name(id.reason()),
            context_valid: id.context_valid(),
            context_id: report.context_id(),
            timestamp: report.timestamp(),
            gpu_ticks: report.gpu_ticks(),
            elapsed_ns,
            header: bytes_to_hex(&report.as_bytes()[..16]),
            counters: counters.then(|| report.counters()),
        }
    }
}

pub fn run(args: DumpArgs) -> Result<()> {
    let records = decode(&args.input, &args)?;

    if let Some(path) = &args.json {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &records).context("Failed to write JSON")?;
        output::success(&format!("{} records written to {}", records.len(), path.display()));
        return Ok(());
    }

    if records.is_empty() {
        output::warning("No records matched.");
        return Ok(());
    }

    output::heading(&format!(
        "{:>8}  {:>6}  {:<16}  {:>10}  {:>12}  {:>12}",
        "OFFSET", "ID", "REASON", "CONTEXT", "TICKS", "+NS"
    ));
    for record in &records {
        println!(
            "{:>#8x}  {:>6}  {:<16}  {:>#10x}  {:>12}  {:>12}",
            record.offset,
            record.report_id,
            record.reason,
            record.context_id,
            record.gpu_ticks,
            record.elapsed_ns
        );
        if let Some(counters) = &record.counters {
            println!("          {:?}", counters);
        }
    }
    output::info(&format!("{} records", records.len()));
    Ok(())
}

/// Decode the records `args` selects from the capture at `path`.
pub fn decode(path: &Path, args: &DumpArgs) -> Result<Vec<RecordSummary>> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let traits = traits_for(args.generation);
    let stride = traits.report_format().size();
    if bytes.len() < stride {
        anyhow::bail!(
            "Capture of {} bytes is smaller than one {} byte record",
            bytes.len(),
            stride
        );
    }

    debug!(
        path = %path.display(),
        bytes = bytes.len(),
        generation = %args.generation,
        "decoding capture"
    );
    let memory = HostMemory::from_bytes(0, bytes);
    let ring = OaRingBuffer::with_memory(traits, &MetricsConfig::default(), Arc::new(memory));
    let count = args.count.unwrap_or(ring.size() / ring.report_size());

    let mut records = Vec::with_capacity(count as usize);
    let mut previous: Option<OaReport> = None;
    for (offset, report) in ring.reports(args.offset, count)? {
        let elapsed = previous
            .map(|p| timestamp_delta(p.timestamp(), report.timestamp(), report.header_width()))
            .unwrap_or(0);
        previous = Some(report);

        if args.triggers_only && !report.reason().contains(ReportReason::QUERY_TRIGGER) {
            continue;
        }
        records.push(RecordSummary::new(
            offset,
            &report,
            ticks_to_ns(elapsed, args.frequency),
            args.counters,
        ));
    }
    Ok(records)
}
