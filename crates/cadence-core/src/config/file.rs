// crates/cadence-core/src/config/file.rs
// File-based configuration from ~/.cadence/config.toml

use super::env::ConfigValidation;
use crate::error::{CadenceError, Result};
use cadence_types::AgentRole;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Top-level config structure. Every section has defaults, so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CadenceConfig {
    pub budget: BudgetConfig,
    pub breaker: BreakerConfig,
    pub routing: RoutingConfig,
    pub turn: TurnConfig,
    pub stream: StreamConfig,
    pub tasks: TaskConfig,
    pub compliance: ComplianceConfig,
    pub audit: AuditConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// Spend caps, in USD
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    pub turn_cap_usd: f64,
    pub session_cap_usd: f64,
    /// Remaining-budget fraction below which routing de-escalates
    pub low_water_fraction: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            turn_cap_usd: 0.05,
            session_cap_usd: 1.00,
            low_water_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed circuit
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    /// Consecutive half-open probe successes needed to close again
    pub recovery_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
            recovery_successes: 2,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutingConfig {
    /// Turn importance above which the highest-quality candidate is preferred
    pub escalation_importance: f64,
    /// Role name -> candidates in preference order
    pub roles: BTreeMap<String, Vec<CandidateConfig>>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let sim = |model: &str, cost_usd: f64, quality: u32| CandidateConfig {
            provider: "sim".to_string(),
            model: model.to_string(),
            cost_usd,
            quality,
            input_per_million: None,
            output_per_million: None,
        };

        let mut roles = BTreeMap::new();
        roles.insert(
            AgentRole::CustomerSimulation.as_str().to_string(),
            vec![
                sim("sim-standard", 0.004, 2),
                sim("sim-premium", 0.012, 3),
                sim("sim-lite", 0.001, 1),
            ],
        );
        roles.insert(
            AgentRole::Retrieval.as_str().to_string(),
            vec![sim("sim-lite", 0.001, 1)],
        );
        for role in [
            AgentRole::TeachingAdvice,
            AgentRole::Evaluation,
            AgentRole::KnowledgeGraph,
        ] {
            roles.insert(
                role.as_str().to_string(),
                vec![sim("sim-premium", 0.012, 3), sim("sim-standard", 0.004, 2)],
            );
        }

        Self {
            escalation_importance: 0.8,
            roles,
        }
    }
}

impl RoutingConfig {
    /// Candidates for a role, in table order
    pub fn candidates(&self, role: AgentRole) -> &[CandidateConfig] {
        self.roles
            .get(role.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// One routable (provider, model) entry in the role table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateConfig {
    pub provider: String,
    pub model: String,
    /// Estimated cost per call, reserved before the call runs
    pub cost_usd: f64,
    /// Higher is better; used when escalating
    #[serde(default)]
    pub quality: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_per_million: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_per_million: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TurnConfig {
    /// Hard deadline for the fast path
    pub fast_deadline_ms: u64,
    /// Share of the deadline held back for a forced downgrade
    pub downgrade_reserve_fraction: f64,
    /// Importance used when the caller does not supply one
    pub default_importance: f64,
    /// Run the lightweight retrieval sub-task alongside the reply
    pub fast_retrieval: bool,
    /// Roles dispatched on the slow path after the reply is returned
    pub slow_roles: Vec<String>,
    /// Reply used when the fast path cannot produce one
    pub degraded_reply: String,
    /// Sentence appended when the compliance gate truncates a reply
    pub blocked_fallback: String,
    pub event_channel_capacity: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            fast_deadline_ms: 3000,
            downgrade_reserve_fraction: 0.25,
            default_importance: 0.5,
            fast_retrieval: true,
            slow_roles: vec![
                AgentRole::TeachingAdvice.as_str().to_string(),
                AgentRole::Evaluation.as_str().to_string(),
                AgentRole::KnowledgeGraph.as_str().to_string(),
            ],
            degraded_reply: "Sorry, could you say that again? I lost track for a second."
                .to_string(),
            blocked_fallback: "Let's keep going with the conversation.".to_string(),
            event_channel_capacity: 256,
        }
    }
}

impl TurnConfig {
    pub fn fast_deadline(&self) -> Duration {
        Duration::from_millis(self.fast_deadline_ms)
    }

    /// Time the primary reply attempt gets before a forced downgrade
    pub fn primary_deadline(&self) -> Duration {
        let fraction = self.downgrade_reserve_fraction.clamp(0.0, 0.9);
        self.fast_deadline().mul_f64(1.0 - fraction)
    }

    /// Parsed slow-path roles; unknown names are skipped (validation reports them)
    pub fn slow_roles(&self) -> Vec<AgentRole> {
        self.slow_roles
            .iter()
            .filter_map(|name| AgentRole::parse(name))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Trailing window size W, in fragments
    pub window_size: usize,
    pub scan_timeout_ms: u64,
    /// Max memoized scan verdicts
    pub scan_cache_capacity: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            scan_timeout_ms: 500,
            scan_cache_capacity: 4096,
        }
    }
}

impl StreamConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskConfig {
    /// Age after which the reaper cancels a slow-path task
    pub timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5 * 60,
            sweep_interval_secs: 30,
        }
    }
}

impl TaskConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ComplianceConfig {
    /// Regex patterns that block a window when matched
    pub blocked_patterns: Vec<String>,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            blocked_patterns: vec![
                r"(?i)\bguaranteed\s+(returns?|profits?|results)\b".to_string(),
                r"(?i)\brisk[-\s]free\b".to_string(),
                r"\b\d{3}-\d{2}-\d{4}\b".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuditConfig {
    /// SQLite file for the audit log; in-memory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions endpoint
    OpenaiCompat,
    /// Deterministic local provider (demo, tests)
    #[default]
    Scripted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Env var holding the API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    pub request_timeout_secs: u64,
    /// Scripted provider: simulated time to first fragment
    pub latency_ms: u64,
    /// Scripted provider: delay between fragments
    pub fragment_delay_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Scripted,
            base_url: None,
            api_key_env: None,
            request_timeout_secs: 60,
            latency_ms: 150,
            fragment_delay_ms: 10,
        }
    }
}

impl CadenceConfig {
    /// Load config from ~/.cadence/config.toml, falling back to defaults
    pub fn load() -> Self {
        let path = Self::config_path();

        match Self::load_from(&path) {
            Ok(config) => {
                debug!(path = %path.display(), "Loaded config from file");
                config
            }
            Err(CadenceError::Io(_)) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::with_default_providers()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse config file");
                Self::with_default_providers()
            }
        }
    }

    /// Load and parse a specific config file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse TOML text; fills in the demo provider when none are declared
    pub fn parse(contents: &str) -> Result<Self> {
        let mut config: CadenceConfig = toml::from_str(contents)?;
        if config.providers.is_empty() {
            config.providers = default_providers();
        }
        Ok(config)
    }

    /// Defaults plus the scripted demo provider referenced by the default role table
    pub fn with_default_providers() -> Self {
        Self {
            providers: default_providers(),
            ..Self::default()
        }
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
            .join("config.toml")
    }

    /// Render as TOML (for `cadence show-config`)
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CadenceError::Config(e.to_string()))
    }

    /// Check structural consistency of the config
    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::new();

        let b = &self.budget;
        if b.turn_cap_usd <= 0.0 || b.session_cap_usd <= 0.0 {
            validation.add_error("budget caps must be positive");
        }
        if b.turn_cap_usd > b.session_cap_usd {
            validation.add_warning(format!(
                "turn cap (${:.4}) exceeds session cap (${:.4})",
                b.turn_cap_usd, b.session_cap_usd
            ));
        }
        if !(0.0..=1.0).contains(&b.low_water_fraction) {
            validation.add_error("budget.low_water_fraction must be within [0, 1]");
        }

        if self.breaker.failure_threshold == 0 || self.breaker.recovery_successes == 0 {
            validation.add_error("breaker thresholds must be at least 1");
        }

        if !(0.0..=1.0).contains(&self.routing.escalation_importance) {
            validation.add_error("routing.escalation_importance must be within [0, 1]");
        }

        for (name, candidates) in &self.routing.roles {
            if AgentRole::parse(name).is_none() {
                validation.add_warning(format!("unknown role '{}' in routing table", name));
            }
            if candidates.is_empty() {
                validation.add_warning(format!("role '{}' has no candidates", name));
            }
            for c in candidates {
                if c.cost_usd < 0.0 {
                    validation.add_error(format!(
                        "negative cost for {}/{} in role '{}'",
                        c.provider, c.model, name
                    ));
                }
                if !self.providers.contains_key(&c.provider) {
                    validation.add_error(format!(
                        "role '{}' references undeclared provider '{}'",
                        name, c.provider
                    ));
                }
            }
        }
        if self
            .routing
            .candidates(AgentRole::CustomerSimulation)
            .is_empty()
        {
            validation.add_error("no candidates configured for 'customer_simulation'");
        }

        if self.turn.fast_deadline_ms == 0 {
            validation.add_error("turn.fast_deadline_ms must be positive");
        }
        if !(0.0..1.0).contains(&self.turn.downgrade_reserve_fraction) {
            validation.add_error("turn.downgrade_reserve_fraction must be within [0, 1)");
        }
        for name in &self.turn.slow_roles {
            if AgentRole::parse(name).is_none() {
                validation.add_warning(format!("unknown slow role '{}' will be ignored", name));
            }
        }

        if self.stream.window_size == 0 {
            validation.add_error("stream.window_size must be at least 1");
        }
        if self.tasks.sweep_interval_secs == 0 {
            validation.add_error("tasks.sweep_interval_secs must be positive");
        }

        for pattern in &self.compliance.blocked_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                validation.add_error(format!("invalid blocked pattern '{}': {}", pattern, e));
            }
        }

        for (name, provider) in &self.providers {
            if provider.kind == ProviderKind::OpenaiCompat {
                match provider.base_url.as_deref() {
                    None => validation
                        .add_error(format!("provider '{}' needs a base_url", name)),
                    Some(raw) => {
                        if let Err(e) = url::Url::parse(raw) {
                            validation.add_error(format!(
                                "provider '{}' has an invalid base_url: {}",
                                name, e
                            ));
                        }
                    }
                }
                if provider.api_key_env.is_none() {
                    validation.add_warning(format!("provider '{}' has no api_key_env", name));
                }
            }
        }

        validation
    }
}

fn default_providers() -> BTreeMap<String, ProviderConfig> {
    let mut providers = BTreeMap::new();
    providers.insert("sim".to_string(), ProviderConfig::default());
    providers
}
