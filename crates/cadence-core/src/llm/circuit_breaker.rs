// crates/cadence-core/src/llm/circuit_breaker.rs
// Circuit breaker per (provider, model): tracks failure streaks and temporarily
// excludes keys that are down or rate-limited.

use crate::audit::{self, SharedSink};
use crate::config::{BreakerConfig, ConfigHandle};
use crate::llm::provider::ProviderKey;
use cadence_types::{AuditEvent, BreakerStatus};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state for a single key
#[derive(Debug, Clone)]
struct KeyState {
    status: BreakerStatus,
    consecutive_failures: u32,
    /// Probe successes while half-open
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    /// Outstanding half-open probe
    probe_started: Option<Instant>,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            status: BreakerStatus::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            probe_started: None,
        }
    }
}

impl KeyState {
    fn cooldown_elapsed(&self, config: &BreakerConfig) -> bool {
        self.opened_at
            .is_none_or(|at| at.elapsed() >= config.cooldown())
    }

    /// No probe in flight, or the one in flight has been out longer than the cooldown
    fn probe_free(&self, config: &BreakerConfig) -> bool {
        self.probe_started
            .is_none_or(|at| at.elapsed() >= config.cooldown())
    }

    fn open(&mut self) {
        self.status = BreakerStatus::Open;
        self.opened_at = Some(Instant::now());
        self.consecutive_successes = 0;
        self.probe_started = None;
    }
}

/// Point-in-time view of one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

struct Transition {
    from: BreakerStatus,
    to: BreakerStatus,
    consecutive_failures: u32,
}

/// Thread-safe circuit breaker.
///
/// The key map lock is only held to find or insert a key; each key has its own
/// mutex, so keys never contend with each other.
#[derive(Clone)]
pub struct CircuitBreaker {
    keys: Arc<RwLock<HashMap<ProviderKey, Arc<Mutex<KeyState>>>>>,
    config: ConfigHandle,
    audit: SharedSink,
}

impl CircuitBreaker {
    pub fn new(config: ConfigHandle, audit: SharedSink) -> Self {
        Self {
            keys: Arc::new(RwLock::new(HashMap::new())),
            config,
            audit,
        }
    }

    fn entry(&self, key: &ProviderKey) -> Arc<Mutex<KeyState>> {
        if let Some(state) = self.keys.read().get(key) {
            return state.clone();
        }
        self.keys.write().entry(key.clone()).or_default().clone()
    }

    fn thresholds(&self) -> BreakerConfig {
        self.config.snapshot().breaker.clone()
    }

    /// Take a call permit.
    ///
    /// CLOSED always admits. OPEN admits nothing until the cooldown has elapsed,
    /// then moves to HALF_OPEN and hands this caller the probe. HALF_OPEN admits
    /// one probe at a time.
    pub fn allow(&self, key: &ProviderKey) -> bool {
        let config = self.thresholds();
        let entry = self.entry(key);
        let mut transition = None;

        let allowed = {
            let mut state = entry.lock();
            match state.status {
                BreakerStatus::Closed => true,
                BreakerStatus::Open => {
                    if state.cooldown_elapsed(&config) {
                        transition = Some(Transition {
                            from: BreakerStatus::Open,
                            to: BreakerStatus::HalfOpen,
                            consecutive_failures: state.consecutive_failures,
                        });
                        state.status = BreakerStatus::HalfOpen;
                        state.consecutive_successes = 0;
                        state.probe_started = Some(Instant::now());
                        true
                    } else {
                        false
                    }
                }
                BreakerStatus::HalfOpen => {
                    if state.probe_free(&config) {
                        if state.probe_started.is_some() {
                            debug!(key = %key, "Half-open probe abandoned, admitting a new one");
                        }
                        state.probe_started = Some(Instant::now());
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if let Some(t) = transition {
            self.emit(key, t);
        }
        allowed
    }

    /// Non-mutating check: would `allow` admit a call right now?
    pub fn is_available(&self, key: &ProviderKey) -> bool {
        let config = self.thresholds();
        let Some(entry) = self.keys.read().get(key).cloned() else {
            return true;
        };
        let state = entry.lock();
        match state.status {
            BreakerStatus::Closed => true,
            BreakerStatus::Open => state.cooldown_elapsed(&config),
            BreakerStatus::HalfOpen => state.probe_free(&config),
        }
    }

    /// Record a successful call
    pub fn record_success(&self, key: &ProviderKey) {
        let config = self.thresholds();
        let entry = self.entry(key);
        let mut transition = None;

        {
            let mut state = entry.lock();
            match state.status {
                BreakerStatus::Closed => {
                    state.consecutive_failures = 0;
                }
                BreakerStatus::HalfOpen => {
                    state.consecutive_successes += 1;
                    state.probe_started = None;
                    if state.consecutive_successes >= config.recovery_successes {
                        transition = Some(Transition {
                            from: BreakerStatus::HalfOpen,
                            to: BreakerStatus::Closed,
                            consecutive_failures: state.consecutive_failures,
                        });
                        *state = KeyState::default();
                    }
                }
                BreakerStatus::Open => {
                    // Late result from a call admitted before the trip
                    debug!(key = %key, "Success recorded while open, ignored");
                }
            }
        }

        if let Some(t) = transition {
            self.emit(key, t);
        }
    }

    /// Record a failed call; may trip the circuit
    pub fn record_failure(&self, key: &ProviderKey) {
        let config = self.thresholds();
        let entry = self.entry(key);
        let mut transition = None;

        {
            let mut state = entry.lock();
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            match state.status {
                BreakerStatus::Closed => {
                    if state.consecutive_failures >= config.failure_threshold {
                        state.open();
                        transition = Some(Transition {
                            from: BreakerStatus::Closed,
                            to: BreakerStatus::Open,
                            consecutive_failures: state.consecutive_failures,
                        });
                    }
                }
                BreakerStatus::HalfOpen => {
                    state.open();
                    transition = Some(Transition {
                        from: BreakerStatus::HalfOpen,
                        to: BreakerStatus::Open,
                        consecutive_failures: state.consecutive_failures,
                    });
                }
                BreakerStatus::Open => {}
            }
        }

        if let Some(t) = transition {
            self.emit(key, t);
        }
    }

    pub fn state(&self, key: &ProviderKey) -> BreakerSnapshot {
        let state = self
            .keys
            .read()
            .get(key)
            .map(|entry| entry.lock().clone())
            .unwrap_or_default();
        BreakerSnapshot {
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
        }
    }

    /// Keys currently not closed
    pub fn unhealthy(&self) -> Vec<(ProviderKey, BreakerStatus)> {
        let keys = self.keys.read();
        let mut out: Vec<_> = keys
            .iter()
            .filter_map(|(key, entry)| {
                let status = entry.lock().status;
                (status != BreakerStatus::Closed).then(|| (key.clone(), status))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn emit(&self, key: &ProviderKey, t: Transition) {
        match t.to {
            BreakerStatus::Open => warn!(
                key = %key,
                from = %t.from,
                failures = t.consecutive_failures,
                "Circuit tripped"
            ),
            BreakerStatus::HalfOpen => info!(key = %key, "Circuit half-open, allowing probe request"),
            BreakerStatus::Closed => info!(key = %key, "Circuit recovered"),
        }

        self.audit.append(audit::record(
            None,
            None,
            AuditEvent::BreakerTransition {
                provider: key.provider.clone(),
                model: key.model.clone(),
                from: t.from,
                to: t.to,
                consecutive_failures: t.consecutive_failures,
            },
        ));
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("keys", &self.keys.read().len())
            .finish()
    }
}
