pub mod config;
pub mod dump;
pub mod info;
pub mod window;

use clap::builder::{PossibleValuesParser, TypedValueParser};
use oa_metrics_shared::{utils::parse_u64, Generation, ReportCollectingMode};

/// Parse a generation name such as `gen12` or `xe-hpg`.
pub fn parse_generation(s: &str) -> Result<Generation, String> {
    s.trim().parse::<Generation>().map_err(|e| {
        let names: Vec<_> = Generation::ALL.iter().map(|g| g.name()).collect();
        format!("{}, expected one of: {}", e, names.join(", "))
    })
}

/// Collecting mode names, as spelled in configuration files.
pub fn collecting_mode_parser() -> impl TypedValueParser<Value = ReportCollectingMode> {
    PossibleValuesParser::new([
        "report_performance_counters",
        "store_register_memory_oar",
        "trigger_oag",
        "trigger_oag_extended",
    ])
    .try_map(|name| serde_json::from_value::<ReportCollectingMode>(serde_json::Value::String(name)))
}

/// Parse a decimal or hex value that must fit a 32-bit register.
pub fn parse_u32(s: &str) -> Result<u32, String> {
    let value = parse_u64(s).map_err(|e| e.to_string())?;
    u32::try_from(value).map_err(|_| format!("{} does not fit in 32 bits", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generation() {
        assert_eq!(parse_generation("xe-hpg"), Ok(Generation::XeHpg));
        assert_eq!(parse_generation(" GEN9 "), Ok(Generation::Gen9));
        assert_eq!(parse_generation("xe_lp"), Ok(Generation::Gen12));
        assert!(parse_generation("gen10").unwrap_err().contains("xe2-hpg"));
    }

    #[test]
    fn test_collecting_mode_parser() {
        let command = clap::Command::new("test")
            .arg(clap::Arg::new("policy").value_parser(collecting_mode_parser()));

        let matches = command
            .clone()
            .try_get_matches_from(["test", "trigger_oag_extended"])
            .unwrap();
        assert_eq!(
            matches.get_one::<ReportCollectingMode>("policy"),
            Some(&ReportCollectingMode::TriggerOagExtended)
        );
        assert!(command.try_get_matches_from(["test", "mirpc"]).is_err());
    }

    #[test]
    fn test_parse_u32() {
        assert_eq!(parse_u32("0x56A0"), Ok(0x56A0));
        assert!(parse_u32("0x100000000").is_err());
    }
}
