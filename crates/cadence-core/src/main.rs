// crates/cadence-core/src/main.rs
// Cadence - turn orchestration and model routing core for sales-coaching sessions

mod cli;

use anyhow::Result;
use clap::Parser;
use cli::simulate::SimulateArgs;
use cli::{Cli, Commands};
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env files (global first, then project - project overrides)
    if let Some(home) = dirs::home_dir() {
        let _ = dotenvy::from_path(home.join(".cadence/.env"));
    }
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Config commands print reports to stdout; keep their logs quiet
    let level = match (&cli.command, cli.verbose) {
        (_, true) => Level::DEBUG,
        (Some(Commands::CheckConfig) | Some(Commands::ShowConfig), false) => Level::WARN,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.config.as_deref();
    match cli.command {
        None => {
            cli::run_simulate(
                config,
                SimulateArgs {
                    session: "demo".to_string(),
                    messages: Vec::new(),
                    importance: None,
                    audit_db: None,
                    settle: Duration::from_millis(1500),
                },
            )
            .await?;
        }
        Some(Commands::Simulate {
            session,
            messages,
            importance,
            audit_db,
            settle_ms,
        }) => {
            cli::run_simulate(
                config,
                SimulateArgs {
                    session,
                    messages,
                    importance,
                    audit_db,
                    settle: Duration::from_millis(settle_ms),
                },
            )
            .await?;
        }
        Some(Commands::CheckConfig) => {
            cli::run_check_config(config).await?;
        }
        Some(Commands::ShowConfig) => {
            cli::run_show_config(config).await?;
        }
    }

    Ok(())
}
