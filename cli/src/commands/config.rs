//! Config command implementation

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use oa_metrics_shared::MetricsConfig;
use tracing::debug;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// TOML file layered over the defaults (OA_METRICS_* variables apply on top)
    #[arg(short, long)]
    pub file: Option<PathBuf>,
}

pub fn render(config: &MetricsConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to render configuration")
}

pub fn run(args: ConfigArgs) -> Result<()> {
    debug!(file = ?args.file, "loading configuration");
    let config = MetricsConfig::load(args.file.as_deref()).context("Failed to load configuration")?;
    print!("{}", render(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendered_config_loads_back() {
        let config = MetricsConfig {
            trigger_threshold_ticks: 1234,
            always_on_user_registers: vec![0x2000, 0x2004],
            ..Default::default()
        };
        let text = render(&config).unwrap();
        assert!(text.contains("trigger_threshold_ticks = 1234"));

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        std::io::Write::write_all(&mut file, text.as_bytes()).unwrap();
        assert_eq!(MetricsConfig::load(Some(file.path())).unwrap(), config);
    }
}
