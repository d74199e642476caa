// crates/cadence-core/src/lib.rs
// Cadence - turn orchestration, model routing and compliance gating for sales-coaching sessions

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod audit;
pub mod budget;
pub mod compliance;
pub mod config;
pub mod error;
pub mod llm;
pub mod router;
pub mod tasks;
pub mod turn;

pub use error::{CadenceError, Result};
pub use turn::{ReplyOutcome, TurnPlanner, TurnReply, UserTurn};
