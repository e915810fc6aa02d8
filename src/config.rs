use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::PlatformError;

const DEFAULT_PROTOCOL_VERSION: &str = "1";

/// CLI flags take precedence, falling back to an optional JSON config file,
/// falling back to hardcoded defaults.
#[derive(Debug, Parser)]
#[command(name = "arcadehostd", about = "Control plane for the game-hosting platform")]
pub struct Cli {
    /// Address the control-plane (client-facing) listener binds.
    #[arg(long)]
    pub bind: Option<String>,

    /// Address the match-report listener binds.
    #[arg(long)]
    pub report_bind: Option<String>,

    /// Directory holding the SQLite database and published package tree.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Optional JSON file overriding any of the above.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    bind: Option<String>,
    report_bind: Option<String>,
    data_dir: Option<PathBuf>,
    platform_protocol_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub report_bind: String,
    pub data_dir: PathBuf,
    pub platform_protocol_version: String,
}

impl Config {
    pub fn load(cli: Cli) -> Result<Self, PlatformError> {
        let file_config = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| PlatformError::Internal(format!("failed to read config file {}: {e}", path.display())))?;
                serde_json::from_str(&text)
                    .map_err(|e| PlatformError::Internal(format!("invalid config file {}: {e}", path.display())))?
            }
            None => FileConfig::default(),
        };

        Ok(Self {
            bind: cli.bind.or(file_config.bind).unwrap_or_else(|| "0.0.0.0:7878".to_string()),
            report_bind: cli
                .report_bind
                .or(file_config.report_bind)
                .unwrap_or_else(|| "0.0.0.0:7879".to_string()),
            data_dir: cli.data_dir.or(file_config.data_dir).unwrap_or_else(|| PathBuf::from("data")),
            platform_protocol_version: file_config
                .platform_protocol_version
                .unwrap_or_else(|| DEFAULT_PROTOCOL_VERSION.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_provided() {
        let cli = Cli { bind: None, report_bind: None, data_dir: None, config: None };
        let config = Config::load(cli).unwrap();
        assert_eq!(config.bind, "0.0.0.0:7878");
        assert_eq!(config.platform_protocol_version, DEFAULT_PROTOCOL_VERSION);
    }

    #[test]
    fn cli_flag_overrides_default() {
        let cli = Cli {
            bind: Some("127.0.0.1:9999".to_string()),
            report_bind: None,
            data_dir: None,
            config: None,
        };
        let config = Config::load(cli).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9999");
    }
}
