// crates/cadence-core/src/turn/state.rs
// Per-turn state machine and the open-turn table

use crate::error::{CadenceError, Result};
use cadence_types::{CloseReason, TurnEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// RECEIVED -> FAST_DISPATCHED -> FAST_COMPLETE -> (SLOW_DISPATCHED ->)* TURN_CLOSED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Received,
    FastDispatched,
    FastComplete,
    SlowDispatched,
    Closed,
}

impl TurnPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::FastDispatched => "fast_dispatched",
            Self::FastComplete => "fast_complete",
            Self::SlowDispatched => "slow_dispatched",
            Self::Closed => "turn_closed",
        }
    }

    /// Any open phase may close (a newer turn supersedes it)
    pub fn can_advance_to(&self, next: TurnPhase) -> bool {
        use TurnPhase::*;
        matches!(
            (self, next),
            (Received, FastDispatched)
                | (FastDispatched, FastComplete)
                | (FastComplete, SlowDispatched)
                | (SlowDispatched, SlowDispatched)
                | (Received | FastDispatched | FastComplete | SlowDispatched, Closed)
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnState {
    pub turn_number: u64,
    pub phase: TurnPhase,
    /// Slow-path tasks dispatched and not yet finished
    pub pending_slow: usize,
}

impl TurnState {
    fn new(turn_number: u64) -> Self {
        Self {
            turn_number,
            phase: TurnPhase::Received,
            pending_slow: 0,
        }
    }

    fn advance(&mut self, next: TurnPhase) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(CadenceError::Other(format!(
                "invalid turn transition {} -> {} (turn {})",
                self.phase, next, self.turn_number
            )));
        }
        self.phase = next;
        Ok(())
    }
}

/// Latest turn per session, plus the out-of-band event channel.
///
/// Whoever moves a turn to `Closed` emits its `TurnClosed` event, so each turn
/// is closed exactly once.
#[derive(Clone)]
pub(crate) struct TurnTracker {
    turns: Arc<Mutex<HashMap<String, TurnState>>>,
    events: broadcast::Sender<TurnEvent>,
}

impl TurnTracker {
    pub(crate) fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            turns: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: TurnEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Open `turn_number`. Returns the previous turn if it was still open; it is
    /// closed as superseded.
    pub(crate) fn open(&self, session_id: &str, turn_number: u64) -> Result<Option<u64>> {
        let previous = {
            let mut turns = self.turns.lock();
            if let Some(current) = turns.get(session_id)
                && turn_number <= current.turn_number
            {
                return Err(CadenceError::InvalidInput(format!(
                    "turn {} is not newer than turn {} of session {}",
                    turn_number, current.turn_number, session_id
                )));
            }
            turns
                .insert(session_id.to_string(), TurnState::new(turn_number))
                .filter(|prev| !prev.phase.is_closed())
                .map(|prev| prev.turn_number)
        };

        if let Some(prev) = previous {
            debug!(session_id, turn = prev, "Turn superseded");
            self.emit(TurnEvent::TurnClosed {
                session_id: session_id.to_string(),
                turn_number: prev,
                reason: CloseReason::Superseded,
            });
        }
        Ok(previous)
    }

    /// Advance the session's current turn if it is still `turn_number`
    pub(crate) fn advance(&self, session_id: &str, turn_number: u64, next: TurnPhase) -> Result<()> {
        let mut turns = self.turns.lock();
        match turns.get_mut(session_id) {
            Some(state) if state.turn_number == turn_number => state.advance(next),
            _ => Ok(()),
        }
    }

    /// Count `count` slow-path tasks for the turn before any of them is spawned.
    /// Returns false if the turn is no longer the open one.
    pub(crate) fn add_slow(&self, session_id: &str, turn_number: u64, count: usize) -> Result<bool> {
        let mut turns = self.turns.lock();
        match turns.get_mut(session_id) {
            Some(state) if state.turn_number == turn_number && !state.phase.is_closed() => {
                state.advance(TurnPhase::SlowDispatched)?;
                state.pending_slow += count;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// A slow-path task finished. Closes the turn when it was the last one.
    pub(crate) fn finish_slow(&self, session_id: &str, turn_number: u64) {
        let closed = {
            let mut turns = self.turns.lock();
            match turns.get_mut(session_id) {
                Some(state) if state.turn_number == turn_number && !state.phase.is_closed() => {
                    state.pending_slow = state.pending_slow.saturating_sub(1);
                    if state.pending_slow == 0 {
                        state.phase = TurnPhase::Closed;
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };
        if closed {
            self.emit_completed(session_id, turn_number);
        }
    }

    /// Close the turn now if nothing is pending (no slow roles configured)
    pub(crate) fn close_if_idle(&self, session_id: &str, turn_number: u64) {
        let closed = {
            let mut turns = self.turns.lock();
            match turns.get_mut(session_id) {
                Some(state)
                    if state.turn_number == turn_number
                        && state.pending_slow == 0
                        && !state.phase.is_closed() =>
                {
                    state.phase = TurnPhase::Closed;
                    true
                }
                _ => false,
            }
        };
        if closed {
            self.emit_completed(session_id, turn_number);
        }
    }

    fn emit_completed(&self, session_id: &str, turn_number: u64) {
        debug!(session_id, turn = turn_number, "Turn closed");
        self.emit(TurnEvent::TurnClosed {
            session_id: session_id.to_string(),
            turn_number,
            reason: CloseReason::Completed,
        });
    }

    /// Whether `turn_number` is the session's latest turn and still open
    pub(crate) fn is_open(&self, session_id: &str, turn_number: u64) -> bool {
        self.turns
            .lock()
            .get(session_id)
            .is_some_and(|s| s.turn_number == turn_number && !s.phase.is_closed())
    }

    pub(crate) fn current(&self, session_id: &str) -> Option<TurnState> {
        self.turns.lock().get(session_id).copied()
    }

    /// Drop the session; returns its last turn if it was still open
    pub(crate) fn remove(&self, session_id: &str) -> Option<u64> {
        self.turns
            .lock()
            .remove(session_id)
            .filter(|s| !s.phase.is_closed())
            .map(|s| s.turn_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use TurnPhase::*;
        assert!(Received.can_advance_to(FastDispatched));
        assert!(FastComplete.can_advance_to(SlowDispatched));
        assert!(SlowDispatched.can_advance_to(SlowDispatched));
        assert!(FastDispatched.can_advance_to(Closed));
        assert!(!Received.can_advance_to(FastComplete));
        assert!(!Closed.can_advance_to(Received));
        assert!(!Closed.can_advance_to(Closed));
    }

    #[test]
    fn test_open_rejects_stale_turn() {
        let tracker = TurnTracker::new(8);
        assert_eq!(tracker.open("s", 2).unwrap(), None);
        assert!(tracker.open("s", 2).is_err());
        assert!(tracker.open("s", 1).is_err());
    }

    #[test]
    fn test_new_turn_supersedes_open_turn() {
        let tracker = TurnTracker::new(8);
        let mut rx = tracker.subscribe();
        tracker.open("s", 1).unwrap();
        tracker.advance("s", 1, TurnPhase::FastDispatched).unwrap();

        assert_eq!(tracker.open("s", 2).unwrap(), Some(1));
        assert_eq!(
            rx.try_recv().unwrap(),
            TurnEvent::TurnClosed {
                session_id: "s".into(),
                turn_number: 1,
                reason: CloseReason::Superseded,
            }
        );
        assert_eq!(tracker.current("s").unwrap().phase, TurnPhase::Received);
    }

    #[test]
    fn test_last_slow_task_closes_turn_once() {
        let tracker = TurnTracker::new(8);
        let mut rx = tracker.subscribe();
        tracker.open("s", 1).unwrap();
        tracker.advance("s", 1, TurnPhase::FastDispatched).unwrap();
        tracker.advance("s", 1, TurnPhase::FastComplete).unwrap();
        assert!(tracker.add_slow("s", 1, 2).unwrap());

        tracker.finish_slow("s", 1);
        assert!(tracker.is_open("s", 1));
        tracker.finish_slow("s", 1);
        assert!(!tracker.is_open("s", 1));
        tracker.finish_slow("s", 1);

        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            TurnEvent::TurnClosed {
                reason: CloseReason::Completed,
                ..
            }
        ));
        assert!(rx.try_recv().is_err());

        // A closed turn is not superseded again
        assert_eq!(tracker.open("s", 2).unwrap(), None);
    }

    #[test]
    fn test_invalid_advance_is_error() {
        let tracker = TurnTracker::new(8);
        tracker.open("s", 1).unwrap();
        assert!(tracker.advance("s", 1, TurnPhase::SlowDispatched).is_err());
        // Stale turn numbers are ignored
        assert!(tracker.advance("s", 7, TurnPhase::Closed).is_ok());
        assert!(!tracker.add_slow("s", 7, 1).unwrap());
    }
}
