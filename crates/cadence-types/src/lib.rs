// crates/cadence-types/src/lib.rs
// Shared types for Cadence (audit records, out-of-band events, task vocabulary)
// No runtime dependencies allowed here

use serde::{Deserialize, Serialize};
use std::fmt;

// ═══════════════════════════════════════
// TASK VOCABULARY
// ═══════════════════════════════════════

/// Sub-agent role a model call is made for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Simulated customer reply shown to the trainee
    CustomerSimulation,
    /// Lightweight knowledge lookup on the fast path
    Retrieval,
    TeachingAdvice,
    Evaluation,
    /// Knowledge-graph retrieval (slow path)
    KnowledgeGraph,
}

impl AgentRole {
    pub const ALL: [AgentRole; 5] = [
        AgentRole::CustomerSimulation,
        AgentRole::Retrieval,
        AgentRole::TeachingAdvice,
        AgentRole::Evaluation,
        AgentRole::KnowledgeGraph,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomerSimulation => "customer_simulation",
            Self::Retrieval => "retrieval",
            Self::TeachingAdvice => "teaching_advice",
            Self::Evaluation => "evaluation",
            Self::KnowledgeGraph => "knowledge_graph",
        }
    }

    /// Parse role from its config/table name
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == s.trim().to_lowercase())
    }

    /// Which path this role runs on unless the caller says otherwise
    pub fn default_latency_mode(&self) -> LatencyMode {
        match self {
            Self::CustomerSimulation | Self::Retrieval => LatencyMode::Fast,
            Self::TeachingAdvice | Self::Evaluation | Self::KnowledgeGraph => LatencyMode::Slow,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LatencyMode {
    /// Must finish before the reply is shown
    Fast,
    /// May finish after the reply is shown
    Slow,
}

/// Circuit breaker state for one (provider, model) key
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

// ═══════════════════════════════════════
// AUDIT LOG
// ═══════════════════════════════════════

/// Event appended to the durable audit log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    Routing {
        agent_role: AgentRole,
        provider: String,
        model: String,
        reason: String,
        reserved_cost_usd: f64,
        escalated: bool,
    },
    BreakerTransition {
        provider: String,
        model: String,
        from: BreakerStatus,
        to: BreakerStatus,
        consecutive_failures: u32,
    },
    Blocked {
        provider: String,
        model: String,
        /// Violating text, or the whole window when the scanner was unavailable
        span: String,
        reason: String,
    },
    TaskTimeout {
        task_id: String,
        age_secs: u64,
    },
}

impl AuditEvent {
    /// Stable kind label, matches the serde tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Routing { .. } => "routing",
            Self::BreakerTransition { .. } => "breaker_transition",
            Self::Blocked { .. } => "blocked",
            Self::TaskTimeout { .. } => "task_timeout",
        }
    }
}

/// One append-only audit record, keyed by session, turn and timestamp.
///
/// Provider-scoped events (breaker transitions) carry no session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub turn_number: Option<u64>,
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub event: AuditEvent,
}

// ═══════════════════════════════════════
// OUT-OF-BAND TURN EVENTS
// ═══════════════════════════════════════

/// Why a turn was closed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Every slow-path task of the turn finished
    Completed,
    /// The next user turn arrived first
    Superseded,
}

/// Event pushed to subscribers after the fast-path reply was returned
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    SlowResult {
        session_id: String,
        turn_number: u64,
        role: AgentRole,
        content: String,
        cost_usd: f64,
    },
    SlowTaskFailed {
        session_id: String,
        turn_number: u64,
        role: AgentRole,
        error: String,
    },
    TurnClosed {
        session_id: String,
        turn_number: u64,
        reason: CloseReason,
    },
}

impl TurnEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::SlowResult { session_id, .. }
            | Self::SlowTaskFailed { session_id, .. }
            | Self::TurnClosed { session_id, .. } => session_id,
        }
    }

    pub fn turn_number(&self) -> u64 {
        match self {
            Self::SlowResult { turn_number, .. }
            | Self::SlowTaskFailed { turn_number, .. }
            | Self::TurnClosed { turn_number, .. } => *turn_number,
        }
    }
}
