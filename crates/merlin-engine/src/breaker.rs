use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Thresholds for the generation circuit breaker.
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub open_threshold: u32,
    /// Time after opening at which the breaker closes again.
    pub reset_after: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            open_threshold: 5,
            reset_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Binary fail-fast gate in front of the generation backend.
///
/// Closed → (`open_threshold` consecutive failures) → Open → (`reset_after`
/// elapsed, observed by [`is_open`](Self::is_open)) → Closed. There is no
/// half-open probe: the first request after the cooldown goes straight through.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config: BreakerConfig {
                open_threshold: config.open_threshold.max(1),
                ..config
            },
            state: Mutex::new(CircuitState::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BreakerConfig::default())
    }

    /// True while open. Closes the breaker and clears the counter once the
    /// cooldown has elapsed.
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock();
        match state.opened_at {
            Some(opened) if opened.elapsed() >= self.config.reset_after => {
                state.opened_at = None;
                state.consecutive_failures = 0;
                info!("circuit breaker closed after cooldown");
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.opened_at.is_some() {
            info!("circuit breaker closed after successful generation");
        }
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.config.open_threshold && state.opened_at.is_none() {
            warn!(
                failures = state.consecutive_failures,
                cooldown_secs = self.config.reset_after.as_secs(),
                "circuit breaker opened after {} consecutive failures",
                state.consecutive_failures
            );
            state.opened_at = Some(Instant::now());
        }
    }

    /// Whole seconds until the breaker closes, rounded up. Zero when closed.
    pub fn remaining_cooldown(&self) -> u64 {
        let state = self.state.lock();
        match state.opened_at {
            Some(opened) => {
                let remaining = self.config.reset_after.saturating_sub(opened.elapsed());
                remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
            }
            None => 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn state_name(&self) -> &'static str {
        if self.is_open() {
            "open"
        } else {
            "closed"
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::with_defaults()
    }
}
