// crates/cadence-core/src/cli/mod.rs
// CLI module for Cadence commands

use cadence::config::{CadenceConfig, ConfigHandle, EnvConfig};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

pub mod config;
pub mod simulate;

pub use config::{run_check_config, run_show_config};
pub use simulate::run_simulate;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Turn orchestration and model routing core for sales-coaching sessions")]
#[command(version)]
pub struct Cli {
    /// Config file (default: ~/.cadence/config.toml)
    #[arg(long, global = true, env = "CADENCE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a scripted multi-turn session against the configured providers (default)
    Simulate {
        /// Session id
        #[arg(short, long, default_value = "demo")]
        session: String,

        /// Trainee messages, one per turn (a built-in script is used when empty)
        #[arg(short, long = "message")]
        messages: Vec<String>,

        /// Turn importance in [0, 1]
        #[arg(short, long)]
        importance: Option<f64>,

        /// Persist the audit log to this SQLite file
        #[arg(long)]
        audit_db: Option<PathBuf>,

        /// How long to wait for slow-path results after each turn
        #[arg(long, default_value = "1500")]
        settle_ms: u64,
    },

    /// Validate the config file and environment
    CheckConfig,

    /// Print the effective configuration as TOML
    ShowConfig,
}

/// Resolve the config file path: --config / CADENCE_CONFIG, else the default location
pub fn config_path(cli_path: Option<&Path>) -> PathBuf {
    cli_path
        .map(Path::to_path_buf)
        .unwrap_or_else(EnvConfig::config_path_from_env)
}

/// Config handle backed by the file when it exists, else the built-in defaults
pub fn load_config(cli_path: Option<&Path>) -> anyhow::Result<ConfigHandle> {
    let path = config_path(cli_path);
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(ConfigHandle::from_file(path)?)
    } else {
        info!(path = %path.display(), "No config file, using defaults");
        Ok(ConfigHandle::new(CadenceConfig::with_default_providers()))
    }
}
