//! Circuit breakers for calls to remote dependencies.
//!
//! A circuit breaker stops sending traffic to a dependency that keeps
//! failing, fails fast while it is down, and probes it with a limited
//! number of calls to detect recovery.
//!
//! ## States
//!
//! - **Closed**: Normal operation; calls pass through and outcomes are tracked.
//! - **Open**: The dependency is failing; calls are rejected immediately.
//! - **Half-Open**: A few probe calls are let through to test recovery.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use depguard::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use depguard::CallContext;
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::new("database")
//!     .with_failure_threshold(5)
//!     .with_sleep_window(Duration::from_secs(30));
//!
//! let breaker = CircuitBreaker::new(config);
//! let value = breaker
//!     .execute(&CallContext::new(), |ctx| async move { fetch(ctx).await })
//!     .await?;
//! ```

mod breaker;
mod config;
mod state;
mod stats;

pub use breaker::CircuitBreaker;
pub use config::CircuitBreakerConfig;
pub use state::{CircuitBreakerMetrics, CircuitState};
pub use stats::CircuitBreakerStats;
