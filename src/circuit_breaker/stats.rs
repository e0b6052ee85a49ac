//! Introspection snapshot of a circuit breaker.

use crate::circuit_breaker::config::CircuitBreakerConfig;
use crate::circuit_breaker::state::{CircuitBreakerMetrics, CircuitState};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A consistent point-in-time view of one breaker, taken under a single
/// lock acquisition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Current consecutive-failure streak.
    pub failure_count: u32,
    /// Current consecutive-success streak.
    pub success_count: u32,
    /// Calls currently in flight.
    pub concurrent_requests: u32,
    /// Calls admitted at once while half-open.
    pub half_open_limit: u32,
    /// Time spent in the current state, in milliseconds.
    pub time_in_state_ms: u64,
    /// When the current state was entered.
    pub state_changed_at: DateTime<Utc>,
    /// Success rate of the current epoch, in percent.
    pub success_rate: f64,
    /// Error rate of the current epoch, in percent.
    pub error_rate: f64,
    /// Outcome counters.
    pub metrics: CircuitBreakerMetrics,
    /// Active configuration.
    pub config: CircuitBreakerConfig,
}

impl CircuitBreakerStats {
    /// Returns `true` if the breaker is closed.
    pub fn is_healthy(&self) -> bool {
        self.state.is_closed()
    }

    /// Returns `true` if the breaker is currently rejecting calls outright.
    pub fn is_rejecting(&self) -> bool {
        self.state.is_open()
    }
}
