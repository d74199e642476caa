// crates/cadence-core/src/router/mod.rs
// Model router: task descriptor -> (provider, model), with escalation and de-escalation

mod types;

pub use types::{
    RouteOptions, RouteReason, RoutingDecision, RoutingStats, RoutingStatsSnapshot,
    TaskDescriptor,
};

use crate::audit::{self, SharedSink};
use crate::budget::BudgetLedger;
use crate::config::{CandidateConfig, ConfigHandle};
use crate::error::{CadenceError, Result};
use crate::llm::{CircuitBreaker, ModelPricing, ProviderKey};
use cadence_types::{AuditEvent, RiskLevel};
use std::sync::Arc;
use tracing::{debug, info};

fn key_of(candidate: &CandidateConfig) -> ProviderKey {
    ProviderKey::new(&candidate.provider, &candidate.model)
}

/// Preference order for the surviving candidates
fn order_candidates<'a>(
    mut candidates: Vec<&'a CandidateConfig>,
    desc: &TaskDescriptor,
    remaining_fraction: f64,
    escalation_importance: f64,
    low_water_fraction: f64,
    force_cheapest: bool,
) -> (Vec<&'a CandidateConfig>, RouteReason) {
    let by_cost = |a: &&CandidateConfig, b: &&CandidateConfig| a.cost_usd.total_cmp(&b.cost_usd);

    if force_cheapest {
        candidates.sort_by(by_cost);
        return (candidates, RouteReason::ForcedCheapest);
    }
    if desc.turn_importance() > escalation_importance {
        candidates.sort_by(|a, b| b.quality.cmp(&a.quality));
        return (candidates, RouteReason::Escalated);
    }
    if remaining_fraction < low_water_fraction {
        if desc.risk_level() == RiskLevel::High {
            return (candidates, RouteReason::HighRiskHold);
        }
        candidates.sort_by(by_cost);
        return (candidates, RouteReason::DeEscalated);
    }
    (candidates, RouteReason::Default)
}

/// Index of the most expensive candidate strictly cheaper than `cost`
fn next_cheaper(pool: &[&CandidateConfig], cost: f64) -> Option<usize> {
    pool.iter()
        .enumerate()
        .filter(|(_, c)| c.cost_usd < cost)
        .max_by(|(ia, a), (ib, b)| a.cost_usd.total_cmp(&b.cost_usd).then(ib.cmp(ia)))
        .map(|(i, _)| i)
}

/// Routes sub-task calls. Cheap to clone.
#[derive(Clone)]
pub struct ModelRouter {
    config: ConfigHandle,
    ledger: BudgetLedger,
    breaker: CircuitBreaker,
    audit: SharedSink,
    stats: Arc<RoutingStats>,
}

impl ModelRouter {
    pub fn new(
        config: ConfigHandle,
        ledger: BudgetLedger,
        breaker: CircuitBreaker,
        audit: SharedSink,
    ) -> Self {
        Self {
            config,
            ledger,
            breaker,
            audit,
            stats: Arc::new(RoutingStats::default()),
        }
    }

    pub fn stats(&self) -> &RoutingStats {
        &self.stats
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn route(&self, desc: &TaskDescriptor) -> Result<RoutingDecision> {
        self.route_with(desc, &RouteOptions::default()).await
    }

    /// Route with options (forced downgrade, excluded candidates)
    pub async fn route_with(
        &self,
        desc: &TaskDescriptor,
        opts: &RouteOptions,
    ) -> Result<RoutingDecision> {
        let config = self.config.snapshot();
        let role = desc.agent_role();

        let configured: Vec<&CandidateConfig> = config
            .routing
            .candidates(role)
            .iter()
            .filter(|c| !opts.exclude.contains(&key_of(c)))
            .collect();
        let available: Vec<&CandidateConfig> = configured
            .iter()
            .copied()
            .filter(|c| self.breaker.is_available(&key_of(c)))
            .collect();

        if available.is_empty() {
            debug!(
                role = %role,
                configured = configured.len(),
                "No candidate with a closed or probing breaker"
            );
            self.stats.record_no_provider();
            return Err(CadenceError::NoProviderAvailable {
                role: role.to_string(),
            });
        }

        let remaining = self
            .ledger
            .remaining_fraction(desc.session_id(), desc.turn_number())
            .await;
        let (mut pool, reason) = order_candidates(
            available,
            desc,
            remaining,
            config.routing.escalation_importance,
            config.budget.low_water_fraction,
            opts.force_cheapest,
        );

        let mut next = Some(0);
        let mut budget_error = None;

        while let Some(i) = next {
            let candidate = pool.remove(i);
            let key = key_of(candidate);

            match self
                .ledger
                .reserve(desc.session_id(), desc.turn_number(), candidate.cost_usd)
                .await
            {
                Ok(reservation) => {
                    if self.breaker.allow(&key) {
                        let decision = RoutingDecision {
                            key,
                            estimated_cost_usd: candidate.cost_usd,
                            quality: candidate.quality,
                            escalated: reason == RouteReason::Escalated,
                            reason,
                            budget_fallback: budget_error.is_some(),
                            pricing: ModelPricing::for_candidate(candidate),
                            reservation,
                        };
                        self.record(desc, &decision, remaining);
                        return Ok(decision);
                    }
                    // A concurrent caller took the half-open probe
                    debug!(key = %key, "Breaker permit refused, trying next candidate");
                    self.ledger.release(reservation).await?;
                    next = (!pool.is_empty()).then_some(0);
                }
                Err(e @ CadenceError::BudgetExhausted { .. }) => {
                    debug!(key = %key, cost_usd = candidate.cost_usd, "Reservation failed, trying cheaper candidate");
                    self.stats.record_budget_rejection();
                    next = next_cheaper(&pool, candidate.cost_usd);
                    budget_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match budget_error {
            Some(e) => Err(e),
            None => {
                self.stats.record_no_provider();
                Err(CadenceError::NoProviderAvailable {
                    role: role.to_string(),
                })
            }
        }
    }

    fn record(&self, desc: &TaskDescriptor, decision: &RoutingDecision, remaining: f64) {
        self.stats.record_decision(decision.reason());
        let reason = decision.reason_text();

        info!(
            session_id = desc.session_id(),
            turn = desc.turn_number(),
            role = %desc.agent_role(),
            key = %decision.key(),
            cost_usd = decision.estimated_cost_usd(),
            remaining_budget = remaining,
            reason = %reason,
            "Routed"
        );

        self.audit.append(audit::record(
            Some(desc.session_id()),
            Some(desc.turn_number()),
            AuditEvent::Routing {
                agent_role: desc.agent_role(),
                provider: decision.provider().to_string(),
                model: decision.model().to_string(),
                reason,
                reserved_cost_usd: decision.estimated_cost_usd(),
                escalated: decision.escalated(),
            },
        ));
    }
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryEventLog;
    use crate::config::CadenceConfig;
    use cadence_types::AgentRole;
    use std::time::Duration;

    struct Harness {
        router: ModelRouter,
        log: Arc<MemoryEventLog>,
    }

    fn harness_with(config: CadenceConfig) -> Harness {
        let handle = ConfigHandle::new(config);
        let log = Arc::new(MemoryEventLog::new());
        let ledger = BudgetLedger::new(handle.clone());
        let breaker = CircuitBreaker::new(handle.clone(), log.clone());
        Harness {
            router: ModelRouter::new(handle, ledger, breaker, log.clone()),
            log,
        }
    }

    fn harness() -> Harness {
        harness_with(CadenceConfig::with_default_providers())
    }

    fn reply(importance: f64, risk: RiskLevel) -> TaskDescriptor {
        TaskDescriptor::for_role(AgentRole::CustomerSimulation, importance, risk, "s", 1).unwrap()
    }

    /// Spend `amount` USD over earlier turns so the turn cap never binds
    async fn spend_session(h: &Harness, amount: f64) {
        let ledger = h.router.ledger();
        let mut left = amount;
        let mut turn = 1;
        while left > 1e-9 {
            let step = left.min(0.05);
            let r = ledger.reserve("s", turn, step).await.unwrap();
            ledger.commit(r, step).await.unwrap();
            left -= step;
            turn += 1;
        }
    }

    fn late_turn(importance: f64, risk: RiskLevel) -> TaskDescriptor {
        TaskDescriptor::for_role(AgentRole::CustomerSimulation, importance, risk, "s", 50).unwrap()
    }

    fn trip(h: &Harness, model: &str) {
        let key = ProviderKey::new("sim", model);
        for _ in 0..5 {
            h.router.breaker().record_failure(&key);
        }
    }

    // ========================================================================
    // Ordering
    // ========================================================================

    #[tokio::test]
    async fn test_default_order_takes_first_candidate() {
        let h = harness();
        let d = h.router.route(&reply(0.5, RiskLevel::Low)).await.unwrap();
        assert_eq!(d.model(), "sim-standard");
        assert_eq!(d.reason(), RouteReason::Default);
        assert!(!d.escalated());
    }

    #[tokio::test]
    async fn test_high_importance_half_budget_escalates() {
        let h = harness();
        spend_session(&h, 0.5).await;

        let d = h.router.route(&late_turn(0.9, RiskLevel::Low)).await.unwrap();
        assert_eq!(d.model(), "sim-premium");
        assert!(d.escalated());
    }

    #[tokio::test]
    async fn test_high_importance_low_budget_high_risk_escalates() {
        let h = harness();
        spend_session(&h, 0.9).await;

        let d = h.router.route(&late_turn(0.9, RiskLevel::High)).await.unwrap();
        assert_eq!(d.model(), "sim-premium");
        assert!(d.escalated());
    }

    #[tokio::test]
    async fn test_low_budget_de_escalates() {
        let h = harness();
        spend_session(&h, 0.9).await;

        let d = h.router.route(&late_turn(0.5, RiskLevel::Low)).await.unwrap();
        assert_eq!(d.model(), "sim-lite");
        assert_eq!(d.reason(), RouteReason::DeEscalated);
        assert_eq!(h.router.stats().snapshot().de_escalated, 1);
    }

    #[tokio::test]
    async fn test_low_budget_high_risk_keeps_table_order() {
        let h = harness();
        spend_session(&h, 0.9).await;

        let d = h.router.route(&late_turn(0.5, RiskLevel::High)).await.unwrap();
        assert_eq!(d.model(), "sim-standard");
        assert_eq!(d.reason(), RouteReason::HighRiskHold);
    }

    #[tokio::test]
    async fn test_force_cheapest_with_exclude() {
        let h = harness();
        let opts = RouteOptions::cheapest_excluding(vec![ProviderKey::new("sim", "sim-lite")]);
        let d = h.router.route_with(&reply(0.9, RiskLevel::Low), &opts).await.unwrap();
        assert_eq!(d.model(), "sim-standard");
        assert_eq!(d.reason(), RouteReason::ForcedCheapest);
    }

    // ========================================================================
    // Breaker interaction
    // ========================================================================

    #[tokio::test]
    async fn test_open_breaker_is_skipped() {
        let h = harness();
        trip(&h, "sim-standard");
        let d = h.router.route(&reply(0.5, RiskLevel::Low)).await.unwrap();
        assert_eq!(d.model(), "sim-premium");
    }

    #[tokio::test]
    async fn test_all_open_is_no_provider() {
        let h = harness();
        for model in ["sim-standard", "sim-premium", "sim-lite"] {
            trip(&h, model);
        }
        let err = h.router.route(&reply(0.5, RiskLevel::Low)).await.unwrap_err();
        assert!(matches!(err, CadenceError::NoProviderAvailable { .. }));
        assert_eq!(h.router.stats().snapshot().no_provider, 1);
        // Nothing was held
        let state = h.router.ledger().snapshot("s").await;
        assert!(state.is_none_or(|s| s.turn_reserved_usd == 0.0));
    }

    #[tokio::test]
    async fn test_unconfigured_role_is_no_provider() {
        let mut config = CadenceConfig::with_default_providers();
        config.routing.roles.remove("evaluation");
        let h = harness_with(config);
        let desc =
            TaskDescriptor::for_role(AgentRole::Evaluation, 0.5, RiskLevel::Low, "s", 1).unwrap();
        assert!(matches!(
            h.router.route(&desc).await,
            Err(CadenceError::NoProviderAvailable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_failures_then_cooldown_and_two_successes() {
        let h = harness();
        let key = ProviderKey::new("sim", "sim-standard");
        let breaker = h.router.breaker();
        for _ in 0..5 {
            breaker.record_failure(&key);
        }
        assert!(!breaker.allow(&key));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(breaker.allow(&key));
        breaker.record_success(&key);
        assert!(breaker.allow(&key));
        breaker.record_success(&key);
        assert!(breaker.allow(&key));

        let d = h.router.route(&reply(0.5, RiskLevel::Low)).await.unwrap();
        assert_eq!(d.model(), "sim-standard");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_taken_releases_reservation_and_moves_on() {
        let h = harness();
        let key = ProviderKey::new("sim", "sim-standard");
        trip(&h, "sim-standard");
        tokio::time::advance(Duration::from_secs(60)).await;

        // First route takes the probe
        let first = h.router.route(&reply(0.5, RiskLevel::Low)).await.unwrap();
        assert_eq!(first.key(), &key);

        // Probe in flight: the key is filtered out
        let second = h.router.route(&reply(0.5, RiskLevel::Low)).await.unwrap();
        assert_eq!(second.model(), "sim-premium");

        let state = h.router.ledger().snapshot("s").await.unwrap();
        assert!((state.turn_reserved_usd - 0.016).abs() < 1e-9);
    }

    // ========================================================================
    // Budget interaction
    // ========================================================================

    #[tokio::test]
    async fn test_reservation_failure_falls_back_to_cheaper() {
        let mut config = CadenceConfig::with_default_providers();
        config.budget.turn_cap_usd = 0.006;
        let h = harness_with(config);

        // Escalation wants premium ($0.012) which does not fit; standard ($0.004) does
        let d = h.router.route(&reply(0.9, RiskLevel::Low)).await.unwrap();
        assert_eq!(d.model(), "sim-standard");
        assert!(d.budget_fallback());
        assert!(d.reason_text().contains("cheaper fallback"));
        assert_eq!(h.router.stats().snapshot().budget_rejections, 1);
    }

    #[tokio::test]
    async fn test_nothing_fits_is_budget_exhausted() {
        let mut config = CadenceConfig::with_default_providers();
        config.budget.turn_cap_usd = 0.0005;
        let h = harness_with(config);
        let err = h.router.route(&reply(0.5, RiskLevel::Low)).await.unwrap_err();
        assert!(matches!(err, CadenceError::BudgetExhausted { .. }));
    }

    #[tokio::test]
    async fn test_decision_is_audited() {
        let h = harness();
        let d = h.router.route(&reply(0.9, RiskLevel::Low)).await.unwrap();
        let records = h.log.of_kind("routing");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].session_id.as_deref(), Some("s"));
        assert_eq!(records[0].turn_number, Some(1));
        match &records[0].event {
            AuditEvent::Routing { model, escalated, reserved_cost_usd, .. } => {
                assert_eq!(model, d.model());
                assert!(*escalated);
                assert!((reserved_cost_usd - 0.012).abs() < 1e-9);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_next_cheaper_picks_most_expensive_below() {
        let mk = |model: &str, cost: f64| CandidateConfig {
            provider: "sim".into(),
            model: model.into(),
            cost_usd: cost,
            quality: 1,
            input_per_million: None,
            output_per_million: None,
        };
        let a = mk("a", 0.001);
        let b = mk("b", 0.004);
        let c = mk("c", 0.004);
        let pool = vec![&a, &b, &c];
        assert_eq!(next_cheaper(&pool, 0.012), Some(1));
        assert_eq!(next_cheaper(&pool, 0.004), Some(0));
        assert_eq!(next_cheaper(&pool, 0.001), None);
    }
}
