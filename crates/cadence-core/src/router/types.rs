// crates/cadence-core/src/router/types.rs
// Routing request/decision types

use crate::budget::Reservation;
use crate::error::{CadenceError, Result};
use crate::llm::{ModelPricing, ProviderKey};
use cadence_types::{AgentRole, LatencyMode, RiskLevel};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Immutable request for one model call
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    agent_role: AgentRole,
    turn_importance: f64,
    risk_level: RiskLevel,
    latency_mode: LatencyMode,
    session_id: String,
    turn_number: u64,
}

impl TaskDescriptor {
    /// Validating constructor: importance must lie in [0, 1], session id non-empty
    pub fn new(
        agent_role: AgentRole,
        turn_importance: f64,
        risk_level: RiskLevel,
        latency_mode: LatencyMode,
        session_id: impl Into<String>,
        turn_number: u64,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&turn_importance) {
            return Err(CadenceError::InvalidInput(format!(
                "turn_importance must be within [0, 1], got {}",
                turn_importance
            )));
        }
        let session_id = session_id.into();
        if session_id.trim().is_empty() {
            return Err(CadenceError::InvalidInput("session_id is empty".into()));
        }
        Ok(Self {
            agent_role,
            turn_importance,
            risk_level,
            latency_mode,
            session_id,
            turn_number,
        })
    }

    /// Descriptor on the role's default path
    pub fn for_role(
        agent_role: AgentRole,
        turn_importance: f64,
        risk_level: RiskLevel,
        session_id: impl Into<String>,
        turn_number: u64,
    ) -> Result<Self> {
        Self::new(
            agent_role,
            turn_importance,
            risk_level,
            agent_role.default_latency_mode(),
            session_id,
            turn_number,
        )
    }

    pub fn agent_role(&self) -> AgentRole {
        self.agent_role
    }

    pub fn turn_importance(&self) -> f64 {
        self.turn_importance
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    pub fn latency_mode(&self) -> LatencyMode {
        self.latency_mode
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn turn_number(&self) -> u64 {
        self.turn_number
    }
}

/// Why a candidate order was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    /// Table order
    Default,
    /// Importance above threshold: highest quality first
    Escalated,
    /// Budget below low-water mark: cheapest first
    DeEscalated,
    /// Budget low but risk is high: table order kept
    HighRiskHold,
    /// Caller asked for the cheapest available candidate
    ForcedCheapest,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default order",
            Self::Escalated => "escalated: high importance",
            Self::DeEscalated => "de-escalated: low budget",
            Self::HighRiskHold => "low budget, de-escalation withheld for high risk",
            Self::ForcedCheapest => "forced cheapest",
        }
    }
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call routing options
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    /// Pick the cheapest available candidate regardless of importance
    pub force_cheapest: bool,
    /// Candidates to skip (e.g. the one that just failed)
    pub exclude: Vec<ProviderKey>,
}

impl RouteOptions {
    pub fn cheapest_excluding(exclude: Vec<ProviderKey>) -> Self {
        Self {
            force_cheapest: true,
            exclude,
        }
    }

    pub fn excluding(exclude: Vec<ProviderKey>) -> Self {
        Self {
            force_cheapest: false,
            exclude,
        }
    }
}

/// A routed call with its budget hold. Consumed once: the hold is committed or released.
#[derive(Debug)]
pub struct RoutingDecision {
    pub(crate) key: ProviderKey,
    pub(crate) estimated_cost_usd: f64,
    pub(crate) quality: u32,
    pub(crate) escalated: bool,
    pub(crate) reason: RouteReason,
    /// Chosen after a more expensive candidate failed to reserve
    pub(crate) budget_fallback: bool,
    pub(crate) pricing: Option<ModelPricing>,
    pub(crate) reservation: Reservation,
}

impl RoutingDecision {
    pub fn provider(&self) -> &str {
        &self.key.provider
    }

    pub fn model(&self) -> &str {
        &self.key.model
    }

    pub fn key(&self) -> &ProviderKey {
        &self.key
    }

    pub fn estimated_cost_usd(&self) -> f64 {
        self.estimated_cost_usd
    }

    pub fn quality(&self) -> u32 {
        self.quality
    }

    pub fn escalated(&self) -> bool {
        self.escalated
    }

    pub fn reason(&self) -> RouteReason {
        self.reason
    }

    pub fn budget_fallback(&self) -> bool {
        self.budget_fallback
    }

    pub fn pricing(&self) -> Option<ModelPricing> {
        self.pricing
    }

    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    /// Audit text for the decision
    pub fn reason_text(&self) -> String {
        if self.budget_fallback {
            format!("{}; cheaper fallback after budget rejection", self.reason)
        } else {
            self.reason.to_string()
        }
    }

    /// Split into the routed key and the budget hold
    pub fn into_parts(self) -> (ProviderKey, Option<ModelPricing>, f64, Reservation) {
        (
            self.key,
            self.pricing,
            self.estimated_cost_usd,
            self.reservation,
        )
    }
}

/// Router counters
#[derive(Debug, Default)]
pub struct RoutingStats {
    total: AtomicU64,
    escalated: AtomicU64,
    de_escalated: AtomicU64,
    forced: AtomicU64,
    budget_rejections: AtomicU64,
    no_provider: AtomicU64,
}

/// Plain copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingStatsSnapshot {
    pub total: u64,
    pub escalated: u64,
    pub de_escalated: u64,
    pub forced: u64,
    pub budget_rejections: u64,
    pub no_provider: u64,
}

impl RoutingStats {
    pub(crate) fn record_decision(&self, reason: RouteReason) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let counter = match reason {
            RouteReason::Escalated => &self.escalated,
            RouteReason::DeEscalated => &self.de_escalated,
            RouteReason::ForcedCheapest => &self.forced,
            RouteReason::Default | RouteReason::HighRiskHold => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_budget_rejection(&self) {
        self.budget_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_no_provider(&self) {
        self.no_provider.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RoutingStatsSnapshot {
        RoutingStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            escalated: self.escalated.load(Ordering::Relaxed),
            de_escalated: self.de_escalated.load(Ordering::Relaxed),
            forced: self.forced.load(Ordering::Relaxed),
            budget_rejections: self.budget_rejections.load(Ordering::Relaxed),
            no_provider: self.no_provider.load(Ordering::Relaxed),
        }
    }

    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "{} routed ({} escalated, {} de-escalated, {} forced), {} budget rejections, {} no-provider failures",
            s.total, s.escalated, s.de_escalated, s.forced, s.budget_rejections, s.no_provider
        )
    }
}
