// crates/cadence-core/src/cli/config.rs
// check-config and show-config commands

use super::{config_path, load_config};
use anyhow::{Result, bail};
use cadence::config::EnvConfig;
use std::path::Path;

/// Print the validation report for the config file and environment
pub async fn run_check_config(cli_path: Option<&Path>) -> Result<()> {
    let path = config_path(cli_path);
    println!("Cadence Configuration Status\n");
    if path.exists() {
        println!("  config.toml: {} (exists)", path.display());
    } else {
        println!("  config.toml: {} (MISSING, using defaults)", path.display());
    }

    let handle = load_config(cli_path)?;
    let config = handle.snapshot();
    let env = EnvConfig::load(&config);

    println!("  API keys: {}", env.api_keys.summary());
    println!("  Providers: {}", config.providers.keys().cloned().collect::<Vec<_>>().join(", "));
    println!();

    let mut validation = config.validate();
    validation.merge(env.validate(&config));
    println!("{}", validation.report());

    if !validation.is_valid() {
        bail!("configuration has errors");
    }
    Ok(())
}

/// Print the effective configuration (defaults filled in)
pub async fn run_show_config(cli_path: Option<&Path>) -> Result<()> {
    let handle = load_config(cli_path)?;
    print!("{}", handle.snapshot().to_toml()?);
    Ok(())
}
