use merlin_core::provider::GenerateOptions;

use crate::breaker::BreakerConfig;

/// Tunables of the turn coordinator.
#[derive(Clone, Debug)]
pub struct TurnConfig {
    /// Prompt estimate the budget pruner reduces to.
    pub soft_limit_tokens: u32,
    pub hard_limit_tokens: u32,
    /// Committed messages loaded as history.
    pub history_limit: usize,
    pub generation: GenerateOptions,
    pub breaker: BreakerConfig,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            soft_limit_tokens: 6000,
            hard_limit_tokens: 8000,
            history_limit: 10,
            generation: GenerateOptions::default(),
            breaker: BreakerConfig::default(),
        }
    }
}
