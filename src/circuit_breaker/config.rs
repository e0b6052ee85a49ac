//! Circuit breaker configuration.

use crate::core::time::duration_ms;
use crate::core::ConfigError;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one circuit breaker.
///
/// Durations are written as milliseconds (`timeout_ms`, `sleep_window_ms`)
/// when serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Dependency name; registry key and label on every event.
    pub name: String,

    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,

    /// Deadline for each wrapped call.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,

    /// Capacity ceiling; a tenth of it (at least one) is admitted while half-open.
    pub max_concurrent_requests: u32,

    /// Requests needed in the current epoch before the circuit may open.
    pub request_volume_threshold: u32,

    /// Minimum time the circuit stays open before probing.
    #[serde(rename = "sleep_window_ms", with = "duration_ms")]
    pub sleep_window: Duration,

    /// Error rate (failures and timeouts over requests, in percent) that
    /// opens the circuit. Zero disables the rate check.
    pub error_percent_threshold: u8,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(10),
            max_concurrent_requests: 100,
            request_volume_threshold: 20,
            sleep_window: Duration::from_secs(30),
            error_percent_threshold: 50,
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a configuration with default values for the named dependency.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the success threshold.
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Sets the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the concurrency ceiling.
    pub fn with_max_concurrent_requests(mut self, max: u32) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// Sets the request volume threshold.
    pub fn with_request_volume_threshold(mut self, threshold: u32) -> Self {
        self.request_volume_threshold = threshold;
        self
    }

    /// Sets the sleep window.
    pub fn with_sleep_window(mut self, window: Duration) -> Self {
        self.sleep_window = window;
        self
    }

    /// Sets the error percentage threshold.
    pub fn with_error_percent_threshold(mut self, percent: u8) -> Self {
        self.error_percent_threshold = percent;
        self
    }

    /// Creates a configuration for a dependency that must fail fast.
    ///
    /// This configuration:
    /// - Opens after 3 consecutive failures or a 25% error rate over 10 requests
    /// - Uses a short 5 second timeout
    /// - Needs 2 successes to close again
    pub fn strict(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_secs(5),
            max_concurrent_requests: 200,
            request_volume_threshold: 10,
            sleep_window: Duration::from_secs(10),
            error_percent_threshold: 25,
        }
    }

    /// Creates a configuration for a best-effort dependency.
    ///
    /// This configuration:
    /// - Tolerates 10 consecutive failures or a 60% error rate over 20 requests
    /// - Uses a longer 15 second timeout
    /// - Stays open for a minute before probing
    pub fn high_availability(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: 10,
            success_threshold: 5,
            timeout: Duration::from_secs(15),
            max_concurrent_requests: 50,
            request_volume_threshold: 20,
            sleep_window: Duration::from_secs(60),
            error_percent_threshold: 60,
        }
    }

    /// Returns how many calls may be in flight while half-open.
    pub fn half_open_max_requests(&self) -> u32 {
        (self.max_concurrent_requests / 10).max(1)
    }

    /// Checks the configuration for values the breaker cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| -> Result<(), ConfigError> {
            Err(ConfigError::invalid(&self.name, reason))
        };

        if self.name.trim().is_empty() {
            return invalid("name must not be empty");
        }
        if self.failure_threshold == 0 {
            return invalid("failure_threshold must be at least 1");
        }
        if self.success_threshold == 0 {
            return invalid("success_threshold must be at least 1");
        }
        if self.timeout.is_zero() {
            return invalid("timeout must be greater than zero");
        }
        if self.max_concurrent_requests == 0 {
            return invalid("max_concurrent_requests must be at least 1");
        }
        if self.error_percent_threshold > 100 {
            return invalid("error_percent_threshold must be between 0 and 100");
        }
        Ok(())
    }
}
