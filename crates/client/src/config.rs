use std::path::Path;

use anyhow::{Context, Result};
use driveway_protocol::DrivewayConfig;

use crate::cli::Args;

pub(crate) const TOKEN_ENV: &str = "DRIVEWAY_TOKEN";

/// Load configuration from a TOML file at the given path.
/// If the file doesn't exist, returns default configuration.
pub(crate) fn load_config(path: &Path) -> Result<DrivewayConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(DrivewayConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: DrivewayConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Layer the environment and command line over the file: CLI beats env beats file.
pub(crate) fn apply_overrides(config: &mut DrivewayConfig, args: &Args, env_token: Option<String>) {
    if let Some(host) = &args.host {
        config.controller.host = host.clone();
    }
    if let Some(token) = env_token.filter(|t| !t.is_empty()) {
        config.controller.token = token;
    }
    if let Some(token) = &args.token {
        config.controller.token = token.clone();
    }
}
