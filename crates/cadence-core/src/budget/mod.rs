// crates/cadence-core/src/budget/mod.rs
// Budget ledger: per-turn and per-session spend caps
//
// Amounts are USD at the API surface and integer micro-dollars inside, so the
// cap check is exact. Reserved-but-uncommitted holds count against both caps.
// Each session has its own async mutex; the session map lock is held only to
// find or insert an entry.

use crate::config::ConfigHandle;
use crate::error::{CadenceError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const MICROS_PER_USD: f64 = 1_000_000.0;

/// USD -> micro-dollars, rounding up (reservations never under-hold)
fn to_micros_ceil(usd: f64) -> u64 {
    let scaled = usd * MICROS_PER_USD;
    let nearest = scaled.round();
    // Absorb float noise like 4000.0000000000005
    if (scaled - nearest).abs() < 1e-6 {
        nearest.max(0.0) as u64
    } else {
        scaled.ceil().max(0.0) as u64
    }
}

/// USD -> micro-dollars, rounding to nearest (caps)
fn to_micros(usd: f64) -> u64 {
    (usd * MICROS_PER_USD).round().max(0.0) as u64
}

fn to_usd(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationId(Uuid);

impl ReservationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A hold against both caps. Consumed by `commit` or `release`.
#[derive(Debug, PartialEq)]
pub struct Reservation {
    id: ReservationId,
    session_id: String,
    turn_number: u64,
    amount_micros: u64,
}

impl Reservation {
    pub fn id(&self) -> ReservationId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn turn_number(&self) -> u64 {
        self.turn_number
    }

    pub fn amount_usd(&self) -> f64 {
        to_usd(self.amount_micros)
    }
}

/// Snapshot of one session's budget
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetState {
    pub session_id: String,
    pub session_cap_usd: f64,
    pub session_spent_usd: f64,
    pub session_reserved_usd: f64,
    pub turn_number: u64,
    pub turn_cap_usd: f64,
    pub turn_spent_usd: f64,
    pub turn_reserved_usd: f64,
}

impl BudgetState {
    fn fraction(cap: f64, used: f64) -> f64 {
        if cap <= 0.0 {
            0.0
        } else {
            ((cap - used) / cap).clamp(0.0, 1.0)
        }
    }

    /// Remaining share of the session cap; holds count as spent
    pub fn session_remaining_fraction(&self) -> f64 {
        Self::fraction(
            self.session_cap_usd,
            self.session_spent_usd + self.session_reserved_usd,
        )
    }

    pub fn turn_remaining_fraction(&self) -> f64 {
        Self::fraction(self.turn_cap_usd, self.turn_spent_usd + self.turn_reserved_usd)
    }

    /// The tighter of the two
    pub fn remaining_fraction(&self) -> f64 {
        self.session_remaining_fraction()
            .min(self.turn_remaining_fraction())
    }
}

#[derive(Debug)]
struct Hold {
    turn_number: u64,
    amount: u64,
}

#[derive(Debug)]
struct SessionBudget {
    session_cap: u64,
    session_spent: u64,
    session_reserved: u64,
    turn_number: u64,
    turn_cap: u64,
    turn_spent: u64,
    turn_reserved: u64,
    holds: HashMap<ReservationId, Hold>,
}

impl SessionBudget {
    fn new(session_cap: u64, turn_cap: u64) -> Self {
        Self {
            session_cap,
            session_spent: 0,
            session_reserved: 0,
            turn_number: 0,
            turn_cap,
            turn_spent: 0,
            turn_reserved: 0,
            holds: HashMap::new(),
        }
    }

    fn begin_turn(&mut self, turn_number: u64, turn_cap: u64) {
        self.turn_number = turn_number;
        self.turn_cap = turn_cap;
        self.turn_spent = 0;
        // Holds of earlier turns keep counting against the session only
        self.turn_reserved = 0;
    }

    fn session_headroom(&self) -> u64 {
        self.session_cap
            .saturating_sub(self.session_spent + self.session_reserved)
    }

    fn turn_headroom(&self) -> u64 {
        self.turn_cap.saturating_sub(self.turn_spent + self.turn_reserved)
    }

    /// Drop a hold from the reserved totals
    fn take_hold(&mut self, id: ReservationId) -> Option<Hold> {
        let hold = self.holds.remove(&id)?;
        self.session_reserved -= hold.amount;
        if hold.turn_number == self.turn_number {
            self.turn_reserved -= hold.amount;
        }
        Some(hold)
    }

    fn state(&self, session_id: &str) -> BudgetState {
        BudgetState {
            session_id: session_id.to_string(),
            session_cap_usd: to_usd(self.session_cap),
            session_spent_usd: to_usd(self.session_spent),
            session_reserved_usd: to_usd(self.session_reserved),
            turn_number: self.turn_number,
            turn_cap_usd: to_usd(self.turn_cap),
            turn_spent_usd: to_usd(self.turn_spent),
            turn_reserved_usd: to_usd(self.turn_reserved),
        }
    }
}

/// Owns all budget state
#[derive(Clone)]
pub struct BudgetLedger {
    sessions: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<SessionBudget>>>>>,
    config: ConfigHandle,
}

impl BudgetLedger {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    fn turn_cap(&self) -> u64 {
        to_micros(self.config.snapshot().budget.turn_cap_usd)
    }

    fn session(&self, session_id: &str) -> Arc<tokio::sync::Mutex<SessionBudget>> {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get(session_id) {
            return entry.clone();
        }
        let config = self.config.snapshot();
        let budget = &config.budget;
        let entry = Arc::new(tokio::sync::Mutex::new(SessionBudget::new(
            to_micros(budget.session_cap_usd),
            to_micros(budget.turn_cap_usd),
        )));
        sessions.insert(session_id.to_string(), entry.clone());
        entry
    }

    fn existing(&self, session_id: &str) -> Option<Arc<tokio::sync::Mutex<SessionBudget>>> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Start a new turn: zero turn spend and re-read the turn cap
    pub async fn begin_turn(&self, session_id: &str, turn_number: u64) {
        let turn_cap = self.turn_cap();
        let entry = self.session(session_id);
        let mut s = entry.lock().await;
        if turn_number > s.turn_number {
            s.begin_turn(turn_number, turn_cap);
            debug!(session_id, turn_number, "Budget turn started");
        }
    }

    /// Hold `amount_usd` against both caps, or fail with `BudgetExhausted`
    pub async fn reserve(
        &self,
        session_id: &str,
        turn_number: u64,
        amount_usd: f64,
    ) -> Result<Reservation> {
        if !amount_usd.is_finite() || amount_usd < 0.0 {
            return Err(CadenceError::InvalidInput(format!(
                "reservation amount must be a non-negative number, got {}",
                amount_usd
            )));
        }
        let amount = to_micros_ceil(amount_usd);
        let turn_cap = self.turn_cap();
        let entry = self.session(session_id);
        let mut s = entry.lock().await;

        if turn_number < s.turn_number {
            debug!(session_id, turn_number, current = s.turn_number, "Reservation for superseded turn");
            return Err(CadenceError::Cancelled);
        }
        if turn_number > s.turn_number {
            s.begin_turn(turn_number, turn_cap);
        }

        if amount > s.session_headroom() || amount > s.turn_headroom() {
            debug!(
                session_id,
                turn_number,
                requested_usd = amount_usd,
                session_headroom_usd = to_usd(s.session_headroom()),
                turn_headroom_usd = to_usd(s.turn_headroom()),
                "Reservation rejected"
            );
            return Err(CadenceError::BudgetExhausted {
                session_id: session_id.to_string(),
                requested_usd: amount_usd,
            });
        }

        let id = ReservationId::new();
        s.holds.insert(
            id,
            Hold {
                turn_number,
                amount,
            },
        );
        s.session_reserved += amount;
        s.turn_reserved += amount;

        Ok(Reservation {
            id,
            session_id: session_id.to_string(),
            turn_number,
            amount_micros: amount,
        })
    }

    /// Reconcile a hold to the actual cost; returns the USD actually charged.
    ///
    /// Under-runs refund the difference. Over-runs are charged only up to the
    /// remaining headroom so spend never exceeds a cap.
    pub async fn commit(&self, reservation: Reservation, actual_usd: f64) -> Result<f64> {
        let entry = self
            .existing(&reservation.session_id)
            .ok_or_else(|| CadenceError::UnknownReservation(reservation.id.to_string()))?;
        let mut s = entry.lock().await;
        let hold = s
            .take_hold(reservation.id)
            .ok_or_else(|| CadenceError::UnknownReservation(reservation.id.to_string()))?;

        let actual = if actual_usd.is_finite() {
            to_micros_ceil(actual_usd.max(0.0))
        } else {
            hold.amount
        };
        let current_turn = hold.turn_number == s.turn_number;

        let mut charge = actual;
        if actual > hold.amount {
            let mut headroom = s.session_headroom();
            if current_turn {
                headroom = headroom.min(s.turn_headroom());
            }
            if actual > headroom {
                warn!(
                    session_id = %reservation.session_id,
                    reserved_usd = to_usd(hold.amount),
                    actual_usd,
                    charged_usd = to_usd(headroom),
                    "Actual cost exceeds remaining budget, clamping charge"
                );
                charge = headroom;
            }
        }

        s.session_spent += charge;
        if current_turn {
            s.turn_spent += charge;
        }
        Ok(to_usd(charge))
    }

    /// Drop a hold with no charge
    pub async fn release(&self, reservation: Reservation) -> Result<()> {
        let entry = self
            .existing(&reservation.session_id)
            .ok_or_else(|| CadenceError::UnknownReservation(reservation.id.to_string()))?;
        let mut s = entry.lock().await;
        s.take_hold(reservation.id)
            .map(|_| ())
            .ok_or_else(|| CadenceError::UnknownReservation(reservation.id.to_string()))
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<BudgetState> {
        let entry = self.existing(session_id)?;
        let s = entry.lock().await;
        Some(s.state(session_id))
    }

    /// Remaining budget fraction as seen by a reservation for `turn_number`
    pub async fn remaining_fraction(&self, session_id: &str, turn_number: u64) -> f64 {
        let Some(mut state) = self.snapshot(session_id).await else {
            return 1.0;
        };
        if turn_number > state.turn_number {
            // That turn has not begun; it starts with a fresh turn budget
            state.turn_spent_usd = 0.0;
            state.turn_reserved_usd = 0.0;
            state.turn_cap_usd = to_usd(self.turn_cap());
        }
        state.remaining_fraction()
    }

    /// Forget a session; returns its final state
    pub async fn end_session(&self, session_id: &str) -> Option<BudgetState> {
        let entry = self.sessions.lock().remove(session_id)?;
        let s = entry.lock().await;
        if !s.holds.is_empty() {
            warn!(session_id, holds = s.holds.len(), "Session ended with open reservations");
        }
        Some(s.state(session_id))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("sessions", &self.session_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CadenceConfig;

    fn ledger_with(turn_cap: f64, session_cap: f64) -> BudgetLedger {
        let mut config = CadenceConfig::with_default_providers();
        config.budget.turn_cap_usd = turn_cap;
        config.budget.session_cap_usd = session_cap;
        BudgetLedger::new(ConfigHandle::new(config))
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    // ========================================================================
    // Conversions
    // ========================================================================

    #[test]
    fn test_micros_rounding() {
        assert_eq!(to_micros_ceil(0.004), 4000);
        assert_eq!(to_micros_ceil(0.0000001), 1);
        assert_eq!(to_micros_ceil(0.0), 0);
        assert_eq!(to_micros(1.0), 1_000_000);
        assert!(approx(to_usd(12_000), 0.012));
    }

    // ========================================================================
    // Reserve / commit / release
    // ========================================================================

    #[tokio::test]
    async fn test_reserve_counts_against_caps() {
        let ledger = ledger_with(0.01, 1.0);
        let r = ledger.reserve("s", 1, 0.006).await.unwrap();
        assert!(approx(r.amount_usd(), 0.006));

        let err = ledger.reserve("s", 1, 0.005).await.unwrap_err();
        assert!(matches!(err, CadenceError::BudgetExhausted { .. }));

        let state = ledger.snapshot("s").await.unwrap();
        assert!(approx(state.turn_reserved_usd, 0.006));
        assert!(approx(state.turn_spent_usd, 0.0));
    }

    #[tokio::test]
    async fn test_commit_refunds_underrun() {
        let ledger = ledger_with(0.05, 1.0);
        let r = ledger.reserve("s", 1, 0.01).await.unwrap();
        let charged = ledger.commit(r, 0.004).await.unwrap();
        assert!(approx(charged, 0.004));

        let state = ledger.snapshot("s").await.unwrap();
        assert!(approx(state.turn_spent_usd, 0.004));
        assert!(approx(state.session_spent_usd, 0.004));
        assert!(approx(state.turn_reserved_usd, 0.0));
    }

    #[tokio::test]
    async fn test_commit_overrun_is_clamped() {
        let ledger = ledger_with(0.01, 1.0);
        let r = ledger.reserve("s", 1, 0.008).await.unwrap();
        let charged = ledger.commit(r, 0.05).await.unwrap();
        assert!(approx(charged, 0.01));

        let state = ledger.snapshot("s").await.unwrap();
        assert!(state.turn_spent_usd <= state.turn_cap_usd);
        assert!(approx(state.turn_remaining_fraction(), 0.0));
    }

    #[tokio::test]
    async fn test_release_drops_hold() {
        let ledger = ledger_with(0.01, 1.0);
        let r = ledger.reserve("s", 1, 0.01).await.unwrap();
        ledger.release(r).await.unwrap();
        let state = ledger.snapshot("s").await.unwrap();
        assert!(approx(state.turn_reserved_usd, 0.0));
        assert!(approx(state.turn_spent_usd, 0.0));
        assert!(ledger.reserve("s", 1, 0.01).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_amount() {
        let ledger = ledger_with(0.01, 1.0);
        assert!(matches!(
            ledger.reserve("s", 1, f64::NAN).await,
            Err(CadenceError::InvalidInput(_))
        ));
        assert!(ledger.reserve("s", 1, -0.1).await.is_err());
    }

    #[tokio::test]
    async fn test_commit_after_end_session_is_unknown() {
        let ledger = ledger_with(0.05, 1.0);
        let r = ledger.reserve("s", 1, 0.01).await.unwrap();
        let final_state = ledger.end_session("s").await.unwrap();
        assert!(approx(final_state.session_reserved_usd, 0.01));
        assert!(matches!(
            ledger.commit(r, 0.01).await,
            Err(CadenceError::UnknownReservation(_))
        ));
        assert_eq!(ledger.session_count(), 0);
    }

    // ========================================================================
    // Turns
    // ========================================================================

    #[tokio::test]
    async fn test_new_turn_resets_turn_spend_only() {
        let ledger = ledger_with(0.01, 0.015);
        let r = ledger.reserve("s", 1, 0.01).await.unwrap();
        ledger.commit(r, 0.01).await.unwrap();
        assert!(ledger.reserve("s", 1, 0.001).await.is_err());

        ledger.begin_turn("s", 2).await;
        let state = ledger.snapshot("s").await.unwrap();
        assert_eq!(state.turn_number, 2);
        assert!(approx(state.turn_spent_usd, 0.0));
        assert!(approx(state.session_spent_usd, 0.01));

        // Session cap now binds
        assert!(ledger.reserve("s", 2, 0.006).await.is_err());
        assert!(ledger.reserve("s", 2, 0.005).await.is_ok());
    }

    #[tokio::test]
    async fn test_superseded_turn_is_rejected() {
        let ledger = ledger_with(0.05, 1.0);
        ledger.begin_turn("s", 3).await;
        assert!(matches!(
            ledger.reserve("s", 2, 0.001).await,
            Err(CadenceError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_old_turn_hold_charges_session_only() {
        let ledger = ledger_with(0.05, 1.0);
        let slow = ledger.reserve("s", 1, 0.02).await.unwrap();
        ledger.begin_turn("s", 2).await;

        let fresh = ledger.snapshot("s").await.unwrap();
        assert!(approx(fresh.turn_reserved_usd, 0.0));
        assert!(approx(fresh.session_reserved_usd, 0.02));

        ledger.commit(slow, 0.02).await.unwrap();
        let state = ledger.snapshot("s").await.unwrap();
        assert!(approx(state.turn_spent_usd, 0.0));
        assert!(approx(state.session_spent_usd, 0.02));
    }

    #[tokio::test]
    async fn test_remaining_fraction() {
        let ledger = ledger_with(0.01, 1.0);
        assert!(approx(ledger.remaining_fraction("new", 1).await, 1.0));

        let r = ledger.reserve("s", 1, 0.009).await.unwrap();
        assert!(approx(ledger.remaining_fraction("s", 1).await, 0.1));
        // A turn that has not begun sees a fresh turn budget
        assert!(ledger.remaining_fraction("s", 2).await > 0.99);
        ledger.release(r).await.unwrap();
    }

    #[tokio::test]
    async fn test_turn_cap_follows_config_at_turn_start() {
        let handle = ConfigHandle::new(CadenceConfig::with_default_providers());
        let ledger = BudgetLedger::new(handle.clone());
        ledger.begin_turn("s", 1).await;

        let mut next = CadenceConfig::with_default_providers();
        next.budget.turn_cap_usd = 0.2;
        handle.replace(next).unwrap();

        // Turn 1 keeps its cap
        assert!(ledger.reserve("s", 1, 0.1).await.is_err());
        assert!(ledger.reserve("s", 2, 0.1).await.is_ok());
    }

    // ========================================================================
    // Concurrency
    // ========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_exceed_caps() {
        let ledger = ledger_with(0.05, 0.5);
        let mut tasks = Vec::new();
        for i in 0..64 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move {
                let session = if i % 2 == 0 { "a" } else { "b" };
                match ledger.reserve(session, 1, 0.004).await {
                    Ok(r) => {
                        // Some calls overrun their estimate
                        let actual = if i % 3 == 0 { 0.009 } else { 0.003 };
                        ledger.commit(r, actual).await.map(|_| true)
                    }
                    Err(CadenceError::BudgetExhausted { .. }) => Ok(false),
                    Err(e) => Err(e),
                }
            }));
        }

        let mut admitted = 0;
        for t in tasks {
            if t.await.unwrap().unwrap() {
                admitted += 1;
            }
        }
        assert!(admitted >= 12, "admitted {admitted}");

        for session in ["a", "b"] {
            let state = ledger.snapshot(session).await.unwrap();
            assert!(state.turn_spent_usd <= state.turn_cap_usd + 1e-12);
            assert!(state.session_spent_usd <= state.session_cap_usd + 1e-12);
            assert!(approx(state.turn_reserved_usd, 0.0));
        }
    }
}
