// crates/cadence-core/src/turn/mod.rs
// Turn planner: one user turn through the fast path, then the slow path
//
// The fast path streams the customer reply through the compliance gate while
// retrieval runs alongside, both under one hard deadline. Slow-path roles are
// registered as tasks and report out-of-band on the TurnEvent channel.

pub mod agents;
pub mod state;

pub use agents::{AgentOutput, ContextBundle, PromptAgent, SubAgent, role_prompt};
pub use state::{TurnPhase, TurnState};

use crate::audit::SharedSink;
use crate::budget::{BudgetLedger, BudgetState, Reservation};
use crate::compliance::{
    self, ComplianceGate, GateContext, GateOutcome, GateVerdict, Released, SharedScanner,
};
use crate::config::{CadenceConfig, ConfigHandle};
use crate::error::{CadenceError, Result};
use crate::llm::pricing::actual_cost;
use crate::llm::{CircuitBreaker, ModelPricing, Prompt, ProviderKey, ProviderRegistry, Usage};
use crate::router::{ModelRouter, RouteOptions, TaskDescriptor};
use crate::tasks::{TaskHandle, TaskRegistry};
use agents::call_routed;
use cadence_types::{AgentRole, RiskLevel, TurnEvent};
use state::TurnTracker;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One user message
#[derive(Debug, Clone, PartialEq)]
pub struct UserTurn {
    pub session_id: String,
    pub turn_number: u64,
    pub message: String,
    /// Falls back to `turn.default_importance`
    pub importance: Option<f64>,
    pub risk_level: RiskLevel,
}

impl UserTurn {
    pub fn new(session_id: impl Into<String>, turn_number: u64, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            turn_number,
            message: message.into(),
            importance: None,
            risk_level: RiskLevel::Low,
        }
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_risk(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }
}

/// How the fast-path reply was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Routed candidate answered in time
    Complete,
    /// Primary overran; the cheapest candidate answered
    Downgraded,
    /// Deadline or transport error after part of the reply was released
    Partial,
    /// Compliance gate blocked; fallback sentence appended
    Truncated,
    /// No candidate could answer; canned reply
    Degraded,
}

impl ReplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Downgraded => "downgraded",
            Self::Partial => "partial",
            Self::Truncated => "truncated",
            Self::Degraded => "degraded",
        }
    }
}

/// Fast-path result returned to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReply {
    pub session_id: String,
    pub turn_number: u64,
    pub text: String,
    pub outcome: ReplyOutcome,
    /// A forced downgrade happened, whatever the final outcome
    pub downgraded: bool,
    /// Candidate whose output was released
    pub key: Option<ProviderKey>,
    /// Charged on the fast path (reply and retrieval)
    pub cost_usd: f64,
    pub retrieval: Option<String>,
    pub elapsed: Duration,
}

impl TurnReply {
    pub fn is_truncated(&self) -> bool {
        self.outcome == ReplyOutcome::Truncated
    }

    pub fn is_degraded(&self) -> bool {
        self.outcome == ReplyOutcome::Degraded
    }
}

struct FastReply {
    text: String,
    outcome: ReplyOutcome,
    downgraded: bool,
    key: Option<ProviderKey>,
    cost_usd: f64,
}

/// Orchestrates turns for any number of sessions. Cheap to clone.
#[derive(Clone)]
pub struct TurnPlanner {
    config: ConfigHandle,
    router: ModelRouter,
    providers: ProviderRegistry,
    tasks: TaskRegistry,
    scanner: SharedScanner,
    audit: SharedSink,
    agents: Arc<HashMap<AgentRole, Arc<dyn SubAgent>>>,
    tracker: TurnTracker,
}

impl TurnPlanner {
    /// Wire ledger, breaker, router, task registry and scanner from one config handle
    pub fn new(config: ConfigHandle, providers: ProviderRegistry, audit: SharedSink) -> Result<Self> {
        let snapshot = config.snapshot();
        let ledger = BudgetLedger::new(config.clone());
        let breaker = CircuitBreaker::new(config.clone(), audit.clone());
        let router = ModelRouter::new(config.clone(), ledger, breaker, audit.clone());
        let tasks = TaskRegistry::new(config.clone(), audit.clone());
        let scanner = compliance::scanner_from_config(&snapshot)?;

        let agents: HashMap<AgentRole, Arc<dyn SubAgent>> = AgentRole::ALL
            .iter()
            .map(|&role| {
                let agent: Arc<dyn SubAgent> =
                    Arc::new(PromptAgent::new(role, router.clone(), providers.clone()));
                (role, agent)
            })
            .collect();

        Ok(Self {
            config,
            router,
            providers,
            tasks,
            scanner,
            audit,
            agents: Arc::new(agents),
            tracker: TurnTracker::new(snapshot.turn.event_channel_capacity),
        })
    }

    /// Replace the sub-agent for `agent.role()`
    pub fn with_agent(mut self, agent: Arc<dyn SubAgent>) -> Self {
        Arc::make_mut(&mut self.agents).insert(agent.role(), agent);
        self
    }

    pub fn with_scanner(mut self, scanner: SharedScanner) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    pub fn ledger(&self) -> &BudgetLedger {
        self.router.ledger()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        self.router.breaker()
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Out-of-band slow results and turn closures
    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.tracker.subscribe()
    }

    pub fn turn_state(&self, session_id: &str) -> Option<TurnState> {
        self.tracker.current(session_id)
    }

    /// Start the slow-path task reaper
    pub fn spawn_reaper(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.tasks.spawn_reaper(shutdown)
    }

    /// Handle one user turn. Released reply fragments are sent on `output` as they
    /// pass the compliance gate; the receiver must be drained concurrently.
    ///
    /// Only invalid input is an error. Every fast-path failure resolves to a reply.
    pub async fn handle_turn(&self, turn: UserTurn, output: mpsc::Sender<String>) -> Result<TurnReply> {
        let started = Instant::now();
        let config = self.config.snapshot();
        let importance = turn.importance.unwrap_or(config.turn.default_importance);
        let desc = TaskDescriptor::for_role(
            AgentRole::CustomerSimulation,
            importance,
            turn.risk_level,
            turn.session_id.as_str(),
            turn.turn_number,
        )?;
        let session_id = turn.session_id.as_str();
        let turn_number = turn.turn_number;

        // RECEIVED
        if let Some(previous) = self.tracker.open(session_id, turn_number)? {
            let cancelled = self.tasks.cancel_all(session_id, previous);
            info!(session_id, previous, cancelled, "Superseded open turn");
        }
        self.router.ledger().begin_turn(session_id, turn_number).await;

        // FAST_DISPATCHED
        self.tracker
            .advance(session_id, turn_number, TurnPhase::FastDispatched)?;
        let mut bundle = ContextBundle {
            session_id: turn.session_id.clone(),
            turn_number,
            user_message: turn.message.clone(),
            reply: None,
            retrieval: None,
            turn_importance: importance,
            risk_level: turn.risk_level,
        };
        let hard_deadline = started + config.turn.fast_deadline();
        let primary_deadline = started + config.turn.primary_deadline();
        let prompt = role_prompt(AgentRole::CustomerSimulation, &bundle);

        let (reply, (retrieval, retrieval_cost)) = tokio::join!(
            self.fast_reply(&desc, &prompt, &config, &output, primary_deadline, hard_deadline),
            self.fast_retrieval(&bundle, &config, hard_deadline),
        );

        // FAST_COMPLETE
        self.tracker
            .advance(session_id, turn_number, TurnPhase::FastComplete)?;
        let elapsed = started.elapsed();
        info!(
            session_id,
            turn = turn_number,
            outcome = reply.outcome.as_str(),
            key = ?reply.key.as_ref().map(ToString::to_string),
            elapsed_ms = elapsed.as_millis() as u64,
            "Fast path complete"
        );

        // SLOW_DISPATCHED
        bundle.reply = Some(reply.text.clone());
        bundle.retrieval = retrieval.clone();
        self.dispatch_slow(&config, bundle)?;

        Ok(TurnReply {
            session_id: turn.session_id,
            turn_number,
            text: reply.text,
            outcome: reply.outcome,
            downgraded: reply.downgraded,
            key: reply.key,
            cost_usd: reply.cost_usd + retrieval_cost,
            retrieval,
            elapsed,
        })
    }

    /// Cancel the session's open turn and drop its budget; returns the final budget
    pub async fn end_session(&self, session_id: &str) -> Option<BudgetState> {
        if let Some(turn_number) = self.tracker.remove(session_id) {
            self.tasks.cancel_all(session_id, turn_number);
        }
        self.router.ledger().end_session(session_id).await
    }

    async fn fast_reply(
        &self,
        desc: &TaskDescriptor,
        prompt: &Prompt,
        config: &CadenceConfig,
        output: &mpsc::Sender<String>,
        primary_deadline: Instant,
        hard_deadline: Instant,
    ) -> FastReply {
        let gate = ComplianceGate::new(self.scanner.clone(), self.audit.clone(), &config.stream);
        let mut released = Released::default();
        let mut opts = RouteOptions::default();
        let mut stage_deadline = primary_deadline;
        let mut downgraded = false;
        let mut retried = false;
        let mut cost_usd = 0.0;

        loop {
            let decision = match self.router.route_with(desc, &opts).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(session_id = desc.session_id(), error = %e, "No reply candidate");
                    return self.degraded(config, output, downgraded, cost_usd).await;
                }
            };
            let (key, pricing, estimate, reservation) = decision.into_parts();
            let ctx = GateContext {
                session_id: desc.session_id(),
                turn_number: desc.turn_number(),
                key: &key,
            };
            let attempt = {
                let call = self.stream_reply(&gate, ctx, prompt, output, &mut released);
                tokio::pin!(call);
                match tokio::time::timeout_at(stage_deadline, &mut call).await {
                    // Output has started, so no downgrade is possible: run on to the hard deadline
                    Err(_) if stage_deadline < hard_deadline && gate.released_fragments() > 0 => {
                        debug!(key = %key, "Primary deadline passed mid-reply, holding until hard deadline");
                        tokio::time::timeout_at(hard_deadline, &mut call).await
                    }
                    attempt => attempt,
                }
            };

            match attempt {
                Ok(Ok(GateOutcome {
                    verdict,
                    usage,
                    stream_error,
                })) => {
                    let broke = stream_error.is_some();
                    if broke {
                        self.router.breaker().record_failure(&key);
                    } else {
                        self.router.breaker().record_success(&key);
                    }

                    if broke && released.is_empty() && !verdict.is_blocked() {
                        self.release(reservation).await;
                        if !retried {
                            warn!(key = %key, "Reply stream failed before any output, retrying");
                            retried = true;
                            opts.exclude.push(key);
                            continue;
                        }
                        return self.degraded(config, output, downgraded, cost_usd).await;
                    }

                    cost_usd += self.commit(reservation, pricing, &usage, estimate).await;
                    return self
                        .finish(config, output, verdict, released, key, downgraded, broke, cost_usd)
                        .await;
                }
                Ok(Err(e)) => {
                    self.release(reservation).await;
                    if e.is_provider_failure() {
                        self.router.breaker().record_failure(&key);
                        if !retried {
                            warn!(key = %key, error = %e, "Reply call failed, retrying next candidate");
                            retried = true;
                            opts.exclude.push(key);
                            continue;
                        }
                    }
                    warn!(key = %key, error = %e, "Reply call failed");
                    return self.degraded(config, output, downgraded, cost_usd).await;
                }
                Err(_) if released.is_empty() => {
                    self.release(reservation).await;
                    if !downgraded && stage_deadline < hard_deadline {
                        warn!(key = %key, "Primary reply overran, forcing downgrade");
                        downgraded = true;
                        stage_deadline = hard_deadline;
                        let mut exclude = opts.exclude;
                        exclude.push(key);
                        opts = RouteOptions::cheapest_excluding(exclude);
                        continue;
                    }
                    warn!(key = %key, "Fast deadline expired with no reply");
                    return self.degraded(config, output, downgraded, cost_usd).await;
                }
                Err(_) => {
                    // Part of the reply already crossed the boundary: return it as-is
                    cost_usd += self
                        .commit(reservation, pricing, &Usage::default(), estimate)
                        .await;
                    return FastReply {
                        text: released.text,
                        outcome: ReplyOutcome::Partial,
                        downgraded,
                        key: Some(key),
                        cost_usd,
                    };
                }
            }
        }
    }

    async fn stream_reply(
        &self,
        gate: &ComplianceGate,
        ctx: GateContext<'_>,
        prompt: &Prompt,
        output: &mpsc::Sender<String>,
        released: &mut Released,
    ) -> Result<GateOutcome> {
        let key = ctx.key;
        let adapter = self.providers.get(&key.provider).ok_or_else(|| {
            CadenceError::transport(&key.provider, &key.model, "provider not initialized")
        })?;
        let response = adapter.call(&key.model, prompt, true).await?;
        Ok(gate.run(ctx, response.into_stream(), output, released).await)
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        config: &CadenceConfig,
        output: &mpsc::Sender<String>,
        verdict: GateVerdict,
        released: Released,
        key: ProviderKey,
        downgraded: bool,
        broke: bool,
        cost_usd: f64,
    ) -> FastReply {
        let mut text = released.text;
        let outcome = match verdict {
            GateVerdict::Blocked { .. } => {
                let mut fallback = config.turn.blocked_fallback.clone();
                if !text.is_empty() && !text.ends_with(char::is_whitespace) {
                    fallback.insert(0, ' ');
                }
                text.push_str(&fallback);
                let _ = output.send(fallback).await;
                ReplyOutcome::Truncated
            }
            GateVerdict::Complete if broke => ReplyOutcome::Partial,
            GateVerdict::Complete if downgraded => ReplyOutcome::Downgraded,
            GateVerdict::Complete => ReplyOutcome::Complete,
        };
        FastReply {
            text,
            outcome,
            downgraded,
            key: Some(key),
            cost_usd,
        }
    }

    async fn degraded(
        &self,
        config: &CadenceConfig,
        output: &mpsc::Sender<String>,
        downgraded: bool,
        cost_usd: f64,
    ) -> FastReply {
        let text = config.turn.degraded_reply.clone();
        let _ = output.send(text.clone()).await;
        FastReply {
            text,
            outcome: ReplyOutcome::Degraded,
            downgraded,
            key: None,
            cost_usd,
        }
    }

    async fn fast_retrieval(
        &self,
        ctx: &ContextBundle,
        config: &CadenceConfig,
        deadline: Instant,
    ) -> (Option<String>, f64) {
        if !config.turn.fast_retrieval {
            return (None, 0.0);
        }
        let desc = match TaskDescriptor::for_role(
            AgentRole::Retrieval,
            ctx.turn_importance,
            ctx.risk_level,
            ctx.session_id.as_str(),
            ctx.turn_number,
        ) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "Invalid retrieval descriptor");
                return (None, 0.0);
            }
        };
        let prompt = role_prompt(AgentRole::Retrieval, ctx);
        let cancel = CancellationToken::new();
        match call_routed(&self.router, &self.providers, &desc, &prompt, &cancel, Some(deadline)).await {
            Ok(routed) => (Some(routed.text), routed.cost_usd),
            Err(e) => {
                debug!(session_id = %ctx.session_id, error = %e, "Fast retrieval skipped");
                (None, 0.0)
            }
        }
    }

    fn dispatch_slow(&self, config: &CadenceConfig, ctx: ContextBundle) -> Result<()> {
        let session_id = ctx.session_id.clone();
        let turn_number = ctx.turn_number;
        let agents: Vec<Arc<dyn SubAgent>> = config
            .turn
            .slow_roles()
            .into_iter()
            .filter_map(|role| self.agents.get(&role).cloned())
            .collect();

        if agents.is_empty() {
            self.tracker.close_if_idle(&session_id, turn_number);
            return Ok(());
        }

        // Handles exist before the turn counts them, so a newer turn opening in
        // between either cancels them or makes `add_slow` refuse them
        let handles: Vec<TaskHandle> = agents
            .iter()
            .map(|_| self.tasks.register(&session_id, turn_number))
            .collect();
        if !self.tracker.add_slow(&session_id, turn_number, handles.len())? {
            debug!(session_id = %session_id, turn = turn_number, "Turn closed before slow dispatch");
            return Ok(());
        }

        let ctx = Arc::new(ctx);
        for (agent, handle) in agents.into_iter().zip(handles) {
            let tracker = self.tracker.clone();
            let ctx = ctx.clone();

            tokio::spawn(async move {
                let role = agent.role();
                let cancel = handle.cancel_token();
                let result = agent.run(&ctx, &cancel).await;

                let event = match result {
                    Ok(out) => Some(TurnEvent::SlowResult {
                        session_id: ctx.session_id.clone(),
                        turn_number: ctx.turn_number,
                        role,
                        content: out.content,
                        cost_usd: out.cost_usd,
                    }),
                    // Superseded by a newer turn: the close event was already sent
                    Err(CadenceError::Cancelled)
                        if !tracker.is_open(&ctx.session_id, ctx.turn_number) =>
                    {
                        None
                    }
                    Err(CadenceError::Cancelled) => Some(TurnEvent::SlowTaskFailed {
                        session_id: ctx.session_id.clone(),
                        turn_number: ctx.turn_number,
                        role,
                        error: CadenceError::TaskTimeout {
                            task_id: handle.task_id().to_string(),
                        }
                        .to_string(),
                    }),
                    Err(e) => {
                        warn!(role = %role, error = %e, "Slow-path task failed");
                        Some(TurnEvent::SlowTaskFailed {
                            session_id: ctx.session_id.clone(),
                            turn_number: ctx.turn_number,
                            role,
                            error: e.to_string(),
                        })
                    }
                };

                drop(handle);
                if let Some(event) = event {
                    tracker.emit(event);
                }
                tracker.finish_slow(&ctx.session_id, ctx.turn_number);
            });
        }
        Ok(())
    }

    async fn commit(
        &self,
        reservation: Reservation,
        pricing: Option<ModelPricing>,
        usage: &Usage,
        estimate_usd: f64,
    ) -> f64 {
        let cost = actual_cost(pricing, usage, estimate_usd);
        match self.router.ledger().commit(reservation, cost).await {
            Ok(charged) => charged,
            Err(e) => {
                warn!(error = %e, "Failed to commit reservation");
                0.0
            }
        }
    }

    async fn release(&self, reservation: Reservation) {
        if let Err(e) = self.router.ledger().release(reservation).await {
            warn!(error = %e, "Failed to release reservation");
        }
    }
}

impl std::fmt::Debug for TurnPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnPlanner")
            .field("providers", &self.providers)
            .field("tasks", &self.tasks)
            .finish()
    }
}
