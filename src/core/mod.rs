//! Core types for the depguard library.
//!
//! - [`error`] - The breaker error taxonomy and the configuration error type
//! - [`context`] - Caller context: cancellation, deadline, request id
//! - [`time`] - Serde helpers for durations

pub mod context;
pub mod error;
pub mod time;

pub use context::CallContext;
pub use error::{
    BreakerError, BreakerResult, ConfigError, DependencyError, ErrorCategory, ErrorKind,
};
