//! Circuit breaker state and outcome counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy; every call is admitted.
    #[default]
    Closed,

    /// Dependency presumed down; calls are rejected until the sleep window passes.
    Open,

    /// Probing recovery with a limited number of calls.
    HalfOpen,
}

impl CircuitState {
    /// Returns `true` if the circuit is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns `true` if the circuit is open.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns `true` if the circuit is half-open.
    pub fn is_half_open(&self) -> bool {
        matches!(self, Self::HalfOpen)
    }

    /// Returns the name of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome counters for one circuit breaker.
///
/// `requests` through `fallback_failures` belong to the current measurement
/// epoch and start over whenever the circuit closes. `circuit_opens`,
/// `circuit_closes` and the two timestamps carry over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls admitted.
    pub requests: u64,
    /// Calls that completed without error.
    pub successes: u64,
    /// Calls whose operation returned an error or panicked.
    pub failures: u64,
    /// Calls that hit their deadline or were cancelled by the caller.
    pub timeouts: u64,
    /// Calls rejected without running.
    pub rejections: u64,
    /// Fallbacks that produced a value.
    pub fallback_successes: u64,
    /// Fallbacks that failed.
    pub fallback_failures: u64,
    /// Number of times the circuit has opened.
    pub circuit_opens: u64,
    /// Number of times the circuit has closed again.
    pub circuit_closes: u64,
    /// When the last failure or timeout was recorded.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// When the last success was recorded.
    pub last_success_time: Option<DateTime<Utc>>,
}

impl CircuitBreakerMetrics {
    /// Creates new empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new measurement epoch, keeping lifetime counters and timestamps.
    pub fn next_epoch(&self) -> Self {
        Self {
            circuit_opens: self.circuit_opens,
            circuit_closes: self.circuit_closes,
            last_failure_time: self.last_failure_time,
            last_success_time: self.last_success_time,
            ..Self::default()
        }
    }

    /// Records an admitted call.
    pub fn record_request(&mut self) {
        self.requests += 1;
    }

    /// Records a successful call.
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.successes += 1;
        self.last_success_time = Some(at);
    }

    /// Records a failed call.
    pub fn record_failure(&mut self, at: DateTime<Utc>) {
        self.failures += 1;
        self.last_failure_time = Some(at);
    }

    /// Records a timed-out call.
    pub fn record_timeout(&mut self, at: DateTime<Utc>) {
        self.timeouts += 1;
        self.last_failure_time = Some(at);
    }

    /// Records a rejected call.
    pub fn record_rejection(&mut self) {
        self.rejections += 1;
    }

    /// Records a fallback invocation.
    pub fn record_fallback(&mut self, succeeded: bool) {
        if succeeded {
            self.fallback_successes += 1;
        } else {
            self.fallback_failures += 1;
        }
    }

    /// Records that the circuit opened.
    pub fn record_opened(&mut self) {
        self.circuit_opens += 1;
    }

    /// Records that the circuit closed.
    pub fn record_closed(&mut self) {
        self.circuit_closes += 1;
    }

    /// Failures plus timeouts.
    pub fn failed_requests(&self) -> u64 {
        self.failures + self.timeouts
    }

    /// Returns the error rate as a percentage (0.0 to 100.0).
    pub fn error_percentage(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.failed_requests() as f64 * 100.0 / self.requests as f64
    }

    /// Returns the success rate as a percentage (0.0 to 100.0).
    pub fn success_percentage(&self) -> f64 {
        if self.requests == 0 {
            return 100.0;
        }
        self.successes as f64 * 100.0 / self.requests as f64
    }

    /// Returns `true` if the error rate meets `threshold` percent.
    ///
    /// A threshold of zero never trips.
    pub fn error_rate_reached(&self, threshold: u8) -> bool {
        threshold > 0
            && self.requests > 0
            && self.failed_requests() * 100 >= u64::from(threshold) * self.requests
    }
}
