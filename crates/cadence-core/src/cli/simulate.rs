// crates/cadence-core/src/cli/simulate.rs
// Scripted coaching session: drives the turn planner end to end and prints what happens

use super::load_config;
use anyhow::Result;
use cadence::audit::{EventSink, MemoryEventLog, SharedSink, SqliteEventLog};
use cadence::config::EnvConfig;
use cadence::llm::ProviderRegistry;
use cadence::{TurnPlanner, UserTurn};
use cadence_types::{CloseReason, TurnEvent};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);

const DEFAULT_SCRIPT: [&str; 4] = [
    "Hi, thanks for taking the call. I wanted to walk you through our new savings plan.",
    "It has no setup fees and you can cancel at any time.",
    "Most customers in your situation see lower monthly costs within a quarter.",
    "Would you like me to send over the paperwork today?",
];

pub struct SimulateArgs {
    pub session: String,
    pub messages: Vec<String>,
    pub importance: Option<f64>,
    pub audit_db: Option<PathBuf>,
    pub settle: Duration,
}

/// Run one session through the planner, turn by turn
pub async fn run_simulate(cli_config: Option<&Path>, args: SimulateArgs) -> Result<()> {
    let config = load_config(cli_config)?;
    let snapshot = config.snapshot();
    let env = EnvConfig::load(&snapshot);
    let providers = ProviderRegistry::from_config(&snapshot, &env.api_keys);
    if providers.is_empty() {
        warn!("No providers initialized; every turn will degrade");
    }

    let audit_path = args.audit_db.clone().or_else(|| snapshot.audit.path.clone());
    let sqlite = match &audit_path {
        Some(path) => Some(Arc::new(SqliteEventLog::open(path).await?)),
        None => None,
    };
    let memory = Arc::new(MemoryEventLog::new());
    let audit: SharedSink = match &sqlite {
        Some(log) => log.clone(),
        None => memory.clone(),
    };

    let planner = TurnPlanner::new(config.clone(), providers, audit.clone())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = planner.spawn_reaper(shutdown_rx.clone());
    let watcher = config.spawn_watcher(CONFIG_POLL_INTERVAL, shutdown_rx);

    let events = planner.subscribe();
    let event_printer = tokio::spawn(print_events(events));

    let messages: Vec<String> = if args.messages.is_empty() {
        DEFAULT_SCRIPT.iter().map(|m| m.to_string()).collect()
    } else {
        args.messages
    };

    println!("Session {} ({} turns)\n", args.session, messages.len());

    for (i, message) in messages.into_iter().enumerate() {
        let turn_number = i as u64 + 1;
        let mut turn = UserTurn::new(args.session.as_str(), turn_number, message.as_str());
        if let Some(importance) = args.importance {
            turn = turn.with_importance(importance);
        }

        println!("[turn {turn_number}] trainee: {message}");
        print!("[turn {turn_number}] customer: ");
        let (tx, rx) = mpsc::channel(64);
        let printer = tokio::spawn(print_fragments(rx));
        let reply = planner.handle_turn(turn, tx).await;
        let _ = printer.await;
        println!();

        match reply {
            Ok(reply) => {
                println!(
                    "[turn {}] {} via {} in {}ms, ${:.6}{}",
                    turn_number,
                    reply.outcome.as_str(),
                    reply
                        .key
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "-".to_string()),
                    reply.elapsed.as_millis(),
                    reply.cost_usd,
                    if reply.downgraded { " (downgraded)" } else { "" }
                );
                if let Some(retrieval) = reply.retrieval {
                    println!("[turn {turn_number}] retrieval: {retrieval}");
                }
            }
            Err(e) => println!("[turn {turn_number}] rejected: {e}"),
        }

        // Give the slow path a chance to report before the next turn supersedes it
        tokio::time::sleep(args.settle).await;
        println!();
    }

    let stats = planner.router().stats().summary();
    let unhealthy = planner.breaker().unhealthy();
    let budget = planner.end_session(&args.session).await;

    println!("Routing: {stats}");
    if unhealthy.is_empty() {
        println!("Breakers: all closed");
    } else {
        for (key, status) in unhealthy {
            println!("Breaker {key}: {status:?}");
        }
    }
    if let Some(state) = budget {
        println!(
            "Budget: ${:.6} of ${:.2} spent ({:.0}% left)",
            state.session_spent_usd,
            state.session_cap_usd,
            state.session_remaining_fraction() * 100.0
        );
    }

    audit.flush().await?;
    match &sqlite {
        Some(log) => {
            let counts = log.count_by_kind().await?;
            let path = log.path().map(|p| p.display().to_string()).unwrap_or_default();
            println!("Audit log {path}:");
            for (kind, count) in counts {
                println!("  {kind}: {count}");
            }
        }
        None => println!("Audit: {} records (in memory)", memory.len()),
    }

    let _ = shutdown_tx.send(true);
    let _ = reaper.await;
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }
    event_printer.abort();
    info!(session = %args.session, "Simulation finished");
    Ok(())
}

async fn print_fragments(mut rx: mpsc::Receiver<String>) {
    let mut stdout = std::io::stdout();
    while let Some(fragment) = rx.recv().await {
        let _ = write!(stdout, "{fragment}");
        let _ = stdout.flush();
    }
}

async fn print_events(mut events: broadcast::Receiver<TurnEvent>) {
    loop {
        match events.recv().await {
            Ok(TurnEvent::SlowResult {
                turn_number,
                role,
                content,
                cost_usd,
                ..
            }) => {
                println!("  <turn {turn_number}> {}: {content} (${cost_usd:.6})", role.as_str());
            }
            Ok(TurnEvent::SlowTaskFailed {
                turn_number,
                role,
                error,
                ..
            }) => {
                println!("  <turn {turn_number}> {} failed: {error}", role.as_str());
            }
            Ok(TurnEvent::TurnClosed {
                turn_number,
                reason,
                ..
            }) => {
                let reason = match reason {
                    CloseReason::Completed => "completed",
                    CloseReason::Superseded => "superseded",
                };
                println!("  <turn {turn_number}> closed ({reason})");
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
