//! # Depguard
//!
//! Per-dependency circuit breakers for async services: admission control,
//! deadlines, fallbacks and failure statistics for every remote call.
//!
//! ## Overview
//!
//! Depguard wraps each call to a remote dependency (an identity provider,
//! a database, a message bus) in a named circuit breaker, allowing you to:
//!
//! - Fail fast while a dependency is down instead of piling up timeouts
//! - Bound every call by a deadline and honor caller cancellation
//! - Probe a recovering dependency with a limited number of calls
//! - Fall back to a cached or degraded answer when a call cannot be made
//! - Report every outcome and transition to logs and metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use depguard::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Breakers for passkey_provider, database and message_bus
//!     let manager = Arc::new(CircuitBreakerManager::new(Arc::new(TracingSink)));
//!
//!     let database = manager.require("database")?;
//!     let user = database
//!         .execute(&CallContext::new(), |ctx| async move { load_user(ctx, 42).await })
//!         .await?;
//!
//!     println!("{user:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `default` - Includes the `metrics` sink
//! - `metrics` - [`telemetry::MetricsFacadeSink`] reporting to the `metrics` facade
//!
//! ## Architecture
//!
//! - **Core**: Errors, call context and serde helpers
//! - **Circuit Breaker**: The state machine, its configuration and statistics
//! - **Manager**: The registry of named breakers and its configuration
//! - **Telemetry**: Breaker events and the sinks that receive them

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod circuit_breaker;
pub mod core;
pub mod manager;
pub mod telemetry;

// Re-export commonly used types at the crate root
pub use crate::core::{
    BreakerError, BreakerResult, CallContext, ConfigError, DependencyError, ErrorCategory,
    ErrorKind,
};

pub use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerStats,
    CircuitState,
};
pub use crate::manager::{CircuitBreakerManager, ManagerConfig};
pub use crate::telemetry::{BreakerEvent, EventKind, MetricsSink};

/// Prelude module for convenient imports.
///
/// ```rust
/// use depguard::prelude::*;
/// ```
pub mod prelude {
    pub use crate::circuit_breaker::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
    };
    pub use crate::core::{BreakerError, CallContext, ConfigError, DependencyError};
    pub use crate::manager::{CircuitBreakerManager, ManagerConfig};
    pub use crate::telemetry::{ArcSink, MetricsSink, NoopSink, TracingSink};
}
