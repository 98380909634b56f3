//! Info command implementation

use anyhow::{Context, Result};
use clap::Args;
use oa_metrics::generation::TailEncoding;
use oa_metrics::traits_for;
use oa_metrics_shared::{
    CommandBufferType, Generation, MetricsConfig, OaReportFormat, ReportCollectingMode,
};
use serde::Serialize;

use crate::output;

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// PCI device id, decimal or 0x-prefixed
    #[arg(value_parser = super::parse_u32)]
    pub chipset: u32,

    /// Collecting mode policy to resolve against (defaults to the configured policy)
    #[arg(long, value_parser = super::collecting_mode_parser())]
    pub policy: Option<ReportCollectingMode>,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct GenerationInfo {
    pub chipset: String,
    pub generation: Generation,
    pub report_format: OaReportFormat,
    pub record_size: usize,
    pub counters: usize,
    pub tail_holds_gpu_address: bool,
    pub register_store_collection: bool,
    pub tagged_triggers: bool,
    pub render_mode: ReportCollectingMode,
    pub posh_mode: ReportCollectingMode,
    pub sub_device_always_supported: bool,
}

pub fn describe(chipset: u32, policy: ReportCollectingMode) -> Result<GenerationInfo> {
    let generation = Generation::from_chipset(chipset)
        .with_context(|| format!("Unknown chipset {:#06x}", chipset))?;
    let traits = traits_for(generation);
    let format = traits.report_format();

    Ok(GenerationInfo {
        chipset: format!("{:#06x}", chipset),
        generation,
        report_format: format,
        record_size: format.size(),
        counters: format.counter_count(),
        tail_holds_gpu_address: traits.tail_encoding() == TailEncoding::GpuAddress,
        register_store_collection: traits.registers().oa_counters.is_some(),
        tagged_triggers: traits.supports_collecting_mode(ReportCollectingMode::TriggerOagExtended),
        render_mode: traits.collecting_mode(policy, CommandBufferType::Render),
        posh_mode: traits.collecting_mode(policy, CommandBufferType::Posh),
        sub_device_always_supported: traits.sub_device_always_supported(),
    })
}

pub fn run(args: InfoArgs) -> Result<()> {
    let policy = args
        .policy
        .unwrap_or(MetricsConfig::default().default_collecting_mode);
    let info = describe(args.chipset, policy)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    output::heading(&format!("{} ({})", info.generation, info.chipset));
    println!("  record format      {:?}, {} bytes, {} counters", info.report_format, info.record_size, info.counters);
    println!("  tail register      {}", if info.tail_holds_gpu_address { "gpu address" } else { "ring offset" });
    println!("  register stores    {}", info.register_store_collection);
    println!("  tagged triggers    {}", info.tagged_triggers);
    println!("  render / compute   {:?}", info.render_mode);
    println!("  posh               {:?}", info.posh_mode);
    println!("  any sub-device     {}", info.sub_device_always_supported);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_xe_hpg() {
        let info = describe(0x56A0, ReportCollectingMode::ReportPerformanceCounters).unwrap();
        assert_eq!(info.generation, Generation::XeHpg);
        assert_eq!(info.record_size, 256);
        assert!(info.tail_holds_gpu_address);
        assert!(!info.register_store_collection);
        assert_eq!(info.render_mode, ReportCollectingMode::TriggerOag);
    }

    #[test]
    fn test_describe_gen9_posh() {
        let info = describe(0x1912, ReportCollectingMode::ReportPerformanceCounters).unwrap();
        assert_eq!(info.posh_mode, ReportCollectingMode::StoreRegisterMemoryOar);
        assert_eq!(info.render_mode, ReportCollectingMode::ReportPerformanceCounters);
    }

    #[test]
    fn test_unknown_chipset() {
        assert!(describe(0x1234, ReportCollectingMode::TriggerOag).is_err());
    }
}
