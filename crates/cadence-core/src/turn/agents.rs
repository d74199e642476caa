// crates/cadence-core/src/turn/agents.rs
// Sub-agents: opaque async units that take a context bundle and report their cost

use crate::error::{CadenceError, Result};
use crate::llm::pricing::actual_cost;
use crate::llm::{Prompt, ProviderKey, ProviderRegistry, StreamEvent, Usage};
use crate::router::{ModelRouter, RouteOptions, TaskDescriptor};
use async_trait::async_trait;
use cadence_types::{AgentRole, RiskLevel};
use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What a sub-agent sees of the turn
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBundle {
    pub session_id: String,
    pub turn_number: u64,
    pub user_message: String,
    /// Fast-path reply as returned to the user
    pub reply: Option<String>,
    /// Fast-path retrieval result
    pub retrieval: Option<String>,
    pub turn_importance: f64,
    pub risk_level: RiskLevel,
}

/// Structured result plus the cost actually charged for it
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    pub role: AgentRole,
    pub content: String,
    pub cost_usd: f64,
    pub key: ProviderKey,
}

#[async_trait]
pub trait SubAgent: Send + Sync {
    fn role(&self) -> AgentRole;

    /// Run to completion, or return `Cancelled` once `cancel` fires.
    /// Budget holds must be committed or released before returning.
    async fn run(&self, ctx: &ContextBundle, cancel: &CancellationToken) -> Result<AgentOutput>;
}

/// Text of one routed call and what it cost
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RoutedText {
    pub text: String,
    pub key: ProviderKey,
    pub cost_usd: f64,
}

/// Call the adapter and collect the full reply text
async fn collect_text(
    providers: &ProviderRegistry,
    key: &ProviderKey,
    prompt: &Prompt,
) -> Result<(String, Usage)> {
    let adapter = providers
        .get(&key.provider)
        .ok_or_else(|| CadenceError::transport(&key.provider, &key.model, "provider not initialized"))?;
    let response = adapter.call(&key.model, prompt, false).await?;
    let mut usage = response.usage;
    let mut stream = response.into_stream();
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Delta(fragment) => text.push_str(&fragment),
            StreamEvent::Done { usage: reported } => usage = reported,
        }
    }
    Ok((text, usage))
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Route, call and settle one non-streaming sub-task.
///
/// The reservation stays outside the call future: cancellation or the deadline
/// drops the call and releases the hold. A transport error is recorded on the
/// breaker and retried once on the next candidate.
pub(crate) async fn call_routed(
    router: &ModelRouter,
    providers: &ProviderRegistry,
    desc: &TaskDescriptor,
    prompt: &Prompt,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Result<RoutedText> {
    let mut opts = RouteOptions::default();
    let mut retried = false;

    loop {
        if cancel.is_cancelled() {
            return Err(CadenceError::Cancelled);
        }
        let decision = router.route_with(desc, &opts).await?;
        let (key, pricing, estimate, reservation) = decision.into_parts();

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(CadenceError::Cancelled),
            _ = until(deadline) => Err(CadenceError::Cancelled),
            r = collect_text(providers, &key, prompt) => r,
        };

        match result {
            Ok((text, usage)) => {
                router.breaker().record_success(&key);
                let cost = actual_cost(pricing, &usage, estimate);
                let charged = router.ledger().commit(reservation, cost).await?;
                debug!(role = %desc.agent_role(), key = %key, cost_usd = charged, "Sub-task settled");
                return Ok(RoutedText {
                    text,
                    key,
                    cost_usd: charged,
                });
            }
            Err(e) => {
                if let Err(release_err) = router.ledger().release(reservation).await {
                    warn!(error = %release_err, "Failed to release reservation");
                }
                if !e.is_provider_failure() {
                    return Err(e);
                }
                router.breaker().record_failure(&key);
                if retried {
                    return Err(e);
                }
                warn!(role = %desc.agent_role(), key = %key, error = %e, "Transport error, retrying next candidate");
                retried = true;
                opts.exclude.push(key);
            }
        }
    }
}

fn system_prompt(role: AgentRole) -> &'static str {
    match role {
        AgentRole::CustomerSimulation => {
            "You play the prospective customer in a sales role-play. Answer in one or two sentences."
        }
        AgentRole::Retrieval => "Return the course notes most relevant to the message.",
        AgentRole::TeachingAdvice => {
            "You are a sales coach. Give the trainee one concrete tip for their next message."
        }
        AgentRole::Evaluation => {
            "Assess the trainee's message against the course rubric. Reply with a short verdict."
        }
        AgentRole::KnowledgeGraph => "List the course concepts the trainee's message touches on.",
    }
}

/// Build the prompt a role sends for this turn
pub fn role_prompt(role: AgentRole, ctx: &ContextBundle) -> Prompt {
    let mut user = format!("Trainee: {}", ctx.user_message);
    if let Some(reply) = ctx.reply.as_deref() {
        user.push_str("\nCustomer: ");
        user.push_str(reply);
    }
    if let Some(notes) = ctx.retrieval.as_deref() {
        user.push_str("\nNotes: ");
        user.push_str(notes);
    }
    Prompt::new(user).with_system(system_prompt(role))
}

/// Default sub-agent: one routed model call with the role's prompt
pub struct PromptAgent {
    role: AgentRole,
    router: ModelRouter,
    providers: ProviderRegistry,
}

impl PromptAgent {
    pub fn new(role: AgentRole, router: ModelRouter, providers: ProviderRegistry) -> Self {
        Self {
            role,
            router,
            providers,
        }
    }
}

#[async_trait]
impl SubAgent for PromptAgent {
    fn role(&self) -> AgentRole {
        self.role
    }

    async fn run(&self, ctx: &ContextBundle, cancel: &CancellationToken) -> Result<AgentOutput> {
        let desc = TaskDescriptor::for_role(
            self.role,
            ctx.turn_importance,
            ctx.risk_level,
            ctx.session_id.as_str(),
            ctx.turn_number,
        )?;
        let prompt = role_prompt(self.role, ctx);
        let routed = call_routed(&self.router, &self.providers, &desc, &prompt, cancel, None).await?;
        Ok(AgentOutput {
            role: self.role,
            content: routed.text,
            cost_usd: routed.cost_usd,
            key: routed.key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryEventLog;
    use crate::budget::BudgetLedger;
    use crate::config::{CadenceConfig, ConfigHandle};
    use crate::llm::{CircuitBreaker, ScriptedProvider};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(provider: ScriptedProvider) -> (ModelRouter, ProviderRegistry, Arc<ScriptedProvider>) {
        let config = ConfigHandle::new(CadenceConfig::with_default_providers());
        let log = Arc::new(MemoryEventLog::new());
        let router = ModelRouter::new(
            config.clone(),
            BudgetLedger::new(config.clone()),
            CircuitBreaker::new(config, log.clone()),
            log,
        );
        let provider = Arc::new(provider);
        let mut providers = ProviderRegistry::new();
        providers.insert(provider.clone());
        (router, providers, provider)
    }

    fn ctx() -> ContextBundle {
        ContextBundle {
            session_id: "s".into(),
            turn_number: 1,
            user_message: "Our tool saves your reps an hour a day".into(),
            reply: Some("How do you know that?".into()),
            retrieval: None,
            turn_importance: 0.5,
            risk_level: RiskLevel::Low,
        }
    }

    #[test]
    fn test_role_prompt_includes_context() {
        let prompt = role_prompt(AgentRole::TeachingAdvice, &ctx());
        assert!(prompt.user.contains("Trainee: Our tool"));
        assert!(prompt.user.contains("Customer: How do you know"));
        assert!(prompt.system.unwrap().contains("sales coach"));
    }

    #[tokio::test]
    async fn test_prompt_agent_commits_cost() {
        let (router, providers, _) = setup(ScriptedProvider::new("sim"));
        let agent = PromptAgent::new(AgentRole::Evaluation, router.clone(), providers);

        let out = agent.run(&ctx(), &CancellationToken::new()).await.unwrap();
        assert_eq!(out.role, AgentRole::Evaluation);
        assert!(!out.content.is_empty());

        let state = router.ledger().snapshot("s").await.unwrap();
        assert_eq!(state.turn_reserved_usd, 0.0);
        assert!((state.session_spent_usd - out.cost_usd).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_transport_error_retries_next_candidate() {
        let (router, providers, provider) = setup(ScriptedProvider::new("sim"));
        provider.fail_next(1);
        let agent = PromptAgent::new(AgentRole::Evaluation, router.clone(), providers);

        let out = agent.run(&ctx(), &CancellationToken::new()).await.unwrap();
        assert_eq!(provider.call_count(), 2);
        let first = router.breaker().state(&ProviderKey::new("sim", "sim-premium"));
        assert_eq!(first.consecutive_failures, 1);
        assert_eq!(out.key.model, "sim-standard");
    }

    #[tokio::test]
    async fn test_second_transport_error_surfaces() {
        let (router, providers, provider) = setup(ScriptedProvider::new("sim"));
        provider.fail_next(2);
        let agent = PromptAgent::new(AgentRole::Evaluation, router.clone(), providers);

        let err = agent.run(&ctx(), &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_provider_failure());
        let state = router.ledger().snapshot("s").await.unwrap();
        assert_eq!(state.turn_reserved_usd, 0.0);
        assert_eq!(state.session_spent_usd, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_hold() {
        let (router, providers, _) =
            setup(ScriptedProvider::new("sim").with_latency(Duration::from_secs(30)));
        let agent = PromptAgent::new(AgentRole::TeachingAdvice, router.clone(), providers);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = agent.run(&ctx(), &cancel).await.unwrap_err();
        assert!(matches!(err, CadenceError::Cancelled));
        let state = router.ledger().snapshot("s").await.unwrap();
        assert_eq!(state.turn_reserved_usd, 0.0);
        assert_eq!(state.session_spent_usd, 0.0);
    }

    #[tokio::test]
    async fn test_missing_adapter_counts_as_transport_failure() {
        let (router, _, _) = setup(ScriptedProvider::new("sim"));
        let agent = PromptAgent::new(AgentRole::Evaluation, router.clone(), ProviderRegistry::new());
        let err = agent.run(&ctx(), &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_provider_failure());
    }
}
