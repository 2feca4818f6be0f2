//! Turn orchestration: per-session reservation, circuit breaking, prompt
//! budgeting and the streaming turn state machine.

pub mod breaker;
pub mod budget;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod prompt;
pub mod registry;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use budget::{apply_budget, BudgetReport};
pub use config::TurnConfig;
pub use coordinator::{TurnCoordinator, TurnOutcome, TurnPhase, TurnRequest};
pub use error::TurnError;
pub use registry::{TurnGuard, TurnJobInfo, TurnRegistry};
