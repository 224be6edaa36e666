use std::path::Path;

use anyhow::{Context, Result};

use packplane::config::Config;

/// Print the effective configuration (file + environment overrides) as YAML.
pub fn run(config_path: Option<&Path>) -> Result<()> {
    let mut config = Config::load(config_path).context("Failed to load configuration")?;
    if config.pod_token_secret.is_some() {
        config.pod_token_secret = Some("<redacted>".to_string());
    }
    let yaml = serde_yaml::to_string(&config)?;
    print!("{yaml}");
    Ok(())
}
