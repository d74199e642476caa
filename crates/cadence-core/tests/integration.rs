//! Integration tests for the Cadence turn pipeline
//!
//! Each test drives whole turns through the planner against a scripted provider
//! and checks what the trainee would see, what was charged, and what was audited.


use cadence::audit::EventSink;
use cadence::budget::BudgetLedger;
use cadence::config::{CadenceConfig, ConfigHandle};
use cadence::llm::{ModelScript, ProviderKey};
use cadence::{CadenceError, ReplyOutcome, UserTurn};
use cadence_types::{AuditEvent, BreakerStatus, CloseReason, TurnEvent};
use std::io::Write;
use std::time::Duration;
use test_utils::{TestContext, events_until_closed, fast_only_config};
use tokio::sync::watch;
use tokio::time::Instant;

// ============================================================================
// Fast path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_primary_is_downgraded_before_hard_deadline() {
    let (ctx, log) = TestContext::new(fast_only_config());
    ctx.provider.script(
        "sim-standard",
        ModelScript {
            reply: Some("You will never hear this.".into()),
            latency: Some(Duration::from_secs(10)),
            ..ModelScript::default()
        },
    );
    ctx.provider.set_reply("sim-lite", "Okay, go on.");

    let started = Instant::now();
    let (reply, fragments) = ctx.run_turn(UserTurn::new("s", 1, "Hello there")).await;

    assert!(started.elapsed() <= Duration::from_secs(3));
    assert_eq!(reply.outcome, ReplyOutcome::Downgraded);
    assert_eq!(reply.text, "Okay, go on.");
    assert_eq!(fragments.concat(), "Okay, go on.");
    assert_eq!(reply.key, Some(ProviderKey::new("sim", "sim-lite")));

    // The abandoned primary hold was released, not charged
    let state = ctx.planner.ledger().snapshot("s").await.unwrap();
    assert_eq!(state.session_reserved_usd, 0.0);
    assert!((state.session_spent_usd - reply.cost_usd).abs() < 1e-9);

    // A deadline is not a provider failure
    let primary = ProviderKey::new("sim", "sim-standard");
    assert_eq!(ctx.planner.breaker().state(&primary).consecutive_failures, 0);

    let forced = log
        .of_kind("routing")
        .into_iter()
        .filter(|r| matches!(&r.event, AuditEvent::Routing { reason, .. } if reason == "forced cheapest"))
        .count();
    assert_eq!(forced, 1);
}

fn numbered_words(count: usize) -> String {
    (1..=count)
        .map(|i| format!("w{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::test(start_paused = true)]
async fn test_started_reply_runs_past_primary_deadline() {
    let (ctx, _log) = TestContext::new(fast_only_config());
    // 30 fragments at 80ms: output starts early, the stream ends at 2.4s
    let text = numbered_words(30);
    ctx.provider.script(
        "sim-standard",
        ModelScript {
            reply: Some(text.clone()),
            fragment_delay: Some(Duration::from_millis(80)),
            ..ModelScript::default()
        },
    );

    let started = Instant::now();
    let (reply, fragments) = ctx.run_turn(UserTurn::new("s", 1, "Tell me more")).await;

    assert!(started.elapsed() > Duration::from_millis(2250));
    assert!(started.elapsed() <= Duration::from_secs(3));
    assert_eq!(reply.outcome, ReplyOutcome::Complete);
    assert_eq!(reply.text, text);
    assert_eq!(fragments.concat(), text);
    assert_eq!(reply.key.unwrap().model, "sim-standard");
}

#[tokio::test(start_paused = true)]
async fn test_started_reply_is_cut_at_hard_deadline() {
    let (ctx, _log) = TestContext::new(fast_only_config());
    // 50 fragments at 80ms would need 4s
    ctx.provider.script(
        "sim-standard",
        ModelScript {
            reply: Some(numbered_words(50)),
            fragment_delay: Some(Duration::from_millis(80)),
            ..ModelScript::default()
        },
    );

    let started = Instant::now();
    let (reply, fragments) = ctx.run_turn(UserTurn::new("s", 1, "Tell me more")).await;

    assert!(started.elapsed() <= Duration::from_secs(3) + Duration::from_millis(1));
    assert_eq!(reply.outcome, ReplyOutcome::Partial);
    assert!(!reply.downgraded);
    assert!(!reply.text.is_empty());
    assert_eq!(fragments.concat(), reply.text);
}

#[tokio::test]
async fn test_blocked_content_never_reaches_output() {
    let (ctx, log) = TestContext::new(fast_only_config());
    ctx.provider.set_reply(
        "sim-standard",
        "Honestly this plan is risk-free and I could sign today if the price is right.",
    );

    let (reply, fragments) = ctx.run_turn(UserTurn::new("s", 1, "What do you think?")).await;

    assert_eq!(reply.outcome, ReplyOutcome::Truncated);
    assert!(fragments.iter().all(|f| !f.to_lowercase().contains("risk")));
    assert_eq!(fragments.concat(), reply.text);
    assert!(reply.text.ends_with("Let's keep going with the conversation."));

    let blocked = log.of_kind("blocked");
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].session_id.as_deref(), Some("s"));
    assert_eq!(blocked[0].turn_number, Some(1));
}

#[tokio::test]
async fn test_repeated_failures_open_breaker_and_route_around() {
    let (ctx, log) = TestContext::new(fast_only_config());
    ctx.provider.set_failing("sim-standard", true);
    let standard = ProviderKey::new("sim", "sim-standard");

    for turn in 1..=5 {
        let (reply, _) = ctx.run_turn(UserTurn::new("s", turn, "hello")).await;
        assert_eq!(reply.outcome, ReplyOutcome::Complete);
        assert_eq!(reply.key.unwrap().model, "sim-premium");
    }
    let snapshot = ctx.planner.breaker().state(&standard);
    assert_eq!(snapshot.status, BreakerStatus::Open);
    assert_eq!(snapshot.consecutive_failures, 5);

    // Open key is skipped without being called
    let (reply, _) = ctx.run_turn(UserTurn::new("s", 6, "hello again")).await;
    assert_eq!(reply.key.unwrap().model, "sim-premium");
    assert_eq!(ctx.planner.breaker().state(&standard).consecutive_failures, 5);

    let transitions = log.of_kind("breaker_transition");
    assert_eq!(transitions.len(), 1);
    assert!(transitions[0].session_id.is_none());
    assert!(matches!(
        transitions[0].event,
        AuditEvent::BreakerTransition {
            from: BreakerStatus::Closed,
            to: BreakerStatus::Open,
            ..
        }
    ));
}

// ============================================================================
// Slow path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_next_turn_supersedes_pending_slow_work() {
    let (ctx, _log) = TestContext::new(CadenceConfig::with_default_providers());
    ctx.provider.script(
        "sim-premium",
        ModelScript {
            latency: Some(Duration::from_secs(120)),
            ..ModelScript::default()
        },
    );
    let mut events = ctx.planner.subscribe();

    ctx.run_turn(UserTurn::new("s", 1, "first")).await;
    assert_eq!(ctx.planner.tasks().live_count("s", 1), 3);

    ctx.run_turn(UserTurn::new("s", 2, "second")).await;
    let (before_close, reason) = events_until_closed(&mut events, 1).await;
    assert_eq!(reason, CloseReason::Superseded);
    assert!(before_close.is_empty());

    // Turn 2 finishes normally; nothing more is ever said about turn 1
    let (turn_two, reason) = events_until_closed(&mut events, 2).await;
    assert_eq!(reason, CloseReason::Completed);
    assert!(turn_two.iter().all(|e| e.turn_number() == 2));
    assert_eq!(ctx.planner.tasks().total_live(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_slow_tasks_are_reaped() {
    let (ctx, log) = TestContext::new(CadenceConfig::with_default_providers());
    ctx.provider.script(
        "sim-premium",
        ModelScript {
            latency: Some(Duration::from_secs(3600)),
            ..ModelScript::default()
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = ctx.planner.spawn_reaper(shutdown_rx);
    let mut events = ctx.planner.subscribe();

    ctx.run_turn(UserTurn::new("s", 1, "hello")).await;
    let (seen, reason) = events_until_closed(&mut events, 1).await;

    assert_eq!(reason, CloseReason::Completed);
    assert_eq!(seen.len(), 3);
    assert!(
        seen.iter()
            .all(|e| matches!(e, TurnEvent::SlowTaskFailed { error, .. } if error.contains("timed out")))
    );
    assert_eq!(log.of_kind("task_timeout").len(), 3);
    assert_eq!(ctx.planner.tasks().total_live(), 0);

    shutdown_tx.send(true).unwrap();
    reaper.await.unwrap();
}

// ============================================================================
// Budget
// ============================================================================

#[tokio::test]
async fn test_concurrent_reservations_never_exceed_caps() {
    let mut config = CadenceConfig::default();
    config.budget.turn_cap_usd = 0.05;
    config.budget.session_cap_usd = 0.05;
    let ledger = BudgetLedger::new(ConfigHandle::new(config));
    ledger.begin_turn("s", 1).await;

    let mut handles = Vec::new();
    for _ in 0..50 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            match ledger.reserve("s", 1, 0.004).await {
                Ok(reservation) => {
                    tokio::task::yield_now().await;
                    ledger.commit(reservation, 0.004).await.map(|_| true)
                }
                Err(CadenceError::BudgetExhausted { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() {
            granted += 1;
        }
    }

    assert_eq!(granted, 12);
    let state = ledger.snapshot("s").await.unwrap();
    assert!(state.session_spent_usd <= 0.05 + 1e-9);
    assert!((state.session_spent_usd - 0.048).abs() < 1e-9);
    assert_eq!(state.session_reserved_usd, 0.0);
}

#[tokio::test]
async fn test_session_spend_stays_within_cap_across_turns() {
    let mut config = fast_only_config();
    config.budget.session_cap_usd = 0.02;
    let (ctx, _log) = TestContext::new(config);

    let mut outcomes = Vec::new();
    for turn in 1..=10 {
        let (reply, _) = ctx.run_turn(UserTurn::new("s", turn, "keep talking")).await;
        outcomes.push(reply.outcome);
    }

    let state = ctx.planner.ledger().snapshot("s").await.unwrap();
    assert!(state.session_spent_usd <= 0.02 + 1e-9);
    // Once even the cheapest candidate no longer fits, turns degrade instead of overspending
    assert_eq!(outcomes.last(), Some(&ReplyOutcome::Degraded));
}

// ============================================================================
// Audit and configuration
// ============================================================================

#[tokio::test]
async fn test_turn_is_audited_to_sqlite() {
    let mut config = fast_only_config();
    config.stream.window_size = 2;
    let (ctx, log) = TestContext::with_sqlite(config).await;
    ctx.provider
        .set_reply("sim-standard", "I can promise guaranteed returns on that.");

    let (reply, _) = ctx.run_turn(UserTurn::new("audited", 1, "Is it safe?")).await;
    assert!(reply.is_truncated());

    log.flush().await.unwrap();

    let records = log.query_session("audited").await.unwrap();
    let kinds: Vec<&str> = records.iter().map(|r| r.event.kind()).collect();
    assert!(kinds.contains(&"routing"));
    assert!(kinds.contains(&"blocked"));
    assert!(records.iter().all(|r| r.turn_number == Some(1)));

    let counts = log.count_by_kind().await.unwrap();
    let blocked = counts.iter().find(|(kind, _)| kind == "blocked").map(|(_, n)| *n);
    assert_eq!(blocked, Some(1));
}

#[tokio::test]
async fn test_config_reload_applies_to_next_turn() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[turn]\nslow_roles = []").unwrap();
    let handle = ConfigHandle::from_file(file.path()).unwrap();
    let (ctx, _log) = TestContext::with_handle(handle.clone());

    let (reply, _) = ctx
        .run_turn(UserTurn::new("s", 1, "hi").with_importance(0.5))
        .await;
    assert_eq!(reply.key.unwrap().model, "sim-standard");

    // Lower the escalation threshold below the turn's importance
    std::fs::write(
        file.path(),
        "[turn]\nslow_roles = []\n\n[routing]\nescalation_importance = 0.3\n",
    )
    .unwrap();
    handle.reload().unwrap();

    let (reply, _) = ctx
        .run_turn(UserTurn::new("s", 2, "hi again").with_importance(0.5))
        .await;
    assert_eq!(reply.key.unwrap().model, "sim-premium");

    // A broken file is rejected and the live config kept
    std::fs::write(file.path(), "[budget]\nturn_cap_usd = -1.0\n").unwrap();
    assert!(handle.reload().is_err());
    assert!((ctx.config.snapshot().routing.escalation_importance - 0.3).abs() < 1e-9);
}
