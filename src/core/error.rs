//! Error types for the depguard library.
//!
//! The breaker introduces a small set of synthetic errors (rejections,
//! timeouts, internal failures) and otherwise passes the wrapped operation's
//! error through untouched. Nothing in this crate panics on a call path;
//! every failure is returned as a `Result`.

use crate::circuit_breaker::CircuitState;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The error returned by a call made through a circuit breaker.
///
/// `E` is the wrapped operation's own error type.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open and the call was rejected without running.
    #[error("circuit breaker '{name}' is {state}; call rejected")]
    Open {
        /// Name of the breaker that rejected the call.
        name: String,
        /// State the breaker was in when it rejected the call.
        state: CircuitState,
    },

    /// The circuit is half-open and already running its full probe allowance.
    #[error("circuit breaker '{name}' is half-open at capacity ({in_flight}/{limit} calls in flight)")]
    HalfOpenAtCapacity {
        /// Name of the breaker that rejected the call.
        name: String,
        /// Calls in flight when the call was rejected.
        in_flight: u32,
        /// Half-open admission allowance.
        limit: u32,
    },

    /// The call did not complete before its deadline, or the caller cancelled it.
    #[error("call through circuit breaker '{name}' abandoned after {elapsed:?}: deadline exceeded")]
    Timeout {
        /// Name of the breaker.
        name: String,
        /// How long the call ran before it was abandoned.
        elapsed: Duration,
    },

    /// The wrapped operation returned an error.
    #[error(transparent)]
    Operation(E),

    /// The primary call failed and the fallback failed as well.
    #[error("fallback for circuit breaker '{name}' failed after {primary_kind} ({primary}): {source}")]
    Fallback {
        /// Name of the breaker.
        name: String,
        /// Kind of the primary failure that triggered the fallback.
        primary_kind: ErrorKind,
        /// Rendered primary failure.
        primary: String,
        /// The fallback's own error.
        source: E,
    },

    /// The call could not be completed for a reason internal to the breaker,
    /// such as the operation task panicking.
    #[error("circuit breaker '{name}' internal error: {message}")]
    Internal {
        /// Name of the breaker.
        name: String,
        /// Description of the internal error.
        message: String,
    },
}

impl<E> BreakerError<E> {
    /// Returns the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Open { .. } => ErrorKind::RejectedOpen,
            Self::HalfOpenAtCapacity { .. } => ErrorKind::RejectedHalfOpenCapacity,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Operation(_) => ErrorKind::Operation,
            Self::Fallback { .. } => ErrorKind::Fallback,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns `true` if the breaker rejected the call without running it.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open { .. } | Self::HalfOpenAtCapacity { .. })
    }

    /// Returns `true` if the dependency should be considered unavailable
    /// (rejected by the breaker or timed out).
    pub fn is_unavailable(&self) -> bool {
        self.is_rejection() || self.is_timeout()
    }

    /// Returns `true` if this is a deadline-exceeded error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns the breaker name for errors synthesized by the breaker.
    pub fn breaker_name(&self) -> Option<&str> {
        match self {
            Self::Open { name, .. }
            | Self::HalfOpenAtCapacity { name, .. }
            | Self::Timeout { name, .. }
            | Self::Fallback { name, .. }
            | Self::Internal { name, .. } => Some(name),
            Self::Operation(_) => None,
        }
    }

    /// Returns the wrapped operation's error, if this is a pass-through.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation(err) => Some(err),
            _ => None,
        }
    }
}

/// The taxonomy of errors a breaker call can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected because the circuit is open.
    RejectedOpen,
    /// Rejected because the half-open probe allowance is used up.
    RejectedHalfOpenCapacity,
    /// The deadline elapsed first.
    Timeout,
    /// The wrapped operation failed.
    Operation,
    /// The fallback failed.
    Fallback,
    /// Internal breaker failure.
    Internal,
}

impl ErrorKind {
    /// Returns the label used for this kind in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RejectedOpen => "rejected_open",
            Self::RejectedHalfOpenCapacity => "rejected_half_open_capacity",
            Self::Timeout => "timeout",
            Self::Operation => "operation",
            Self::Fallback => "fallback",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observability category of a failed operation.
///
/// Categories label failure events; the state machine treats every failure
/// the same regardless of category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Credentials were rejected.
    Authentication,
    /// The requested resource does not exist.
    NotFound,
    /// A quota, pool or rate limit was exhausted.
    ResourceExhausted,
    /// The dependency could not be reached.
    Unavailable,
    /// The dependency reported a deadline of its own.
    DeadlineExceeded,
    /// The request was rejected as malformed.
    InvalidInput,
    /// The dependency failed internally.
    Internal,
    /// Not recognized.
    Unknown,
}

impl ErrorCategory {
    /// Categorizes an error by walking its source chain.
    ///
    /// Recognizes [`DependencyError`], `std::io::Error` and tokio's elapsed
    /// error; anything else is [`ErrorCategory::Unknown`].
    pub fn of(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut current = Some(error);
        while let Some(err) = current {
            if let Some(dep) = err.downcast_ref::<DependencyError>() {
                return dep.category();
            }
            if let Some(io) = err.downcast_ref::<std::io::Error>() {
                return Self::from_io(io.kind());
            }
            if err.is::<tokio::time::error::Elapsed>() {
                return Self::DeadlineExceeded;
            }
            current = err.source();
        }
        Self::Unknown
    }

    fn from_io(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind as Io;
        match kind {
            Io::NotFound => Self::NotFound,
            Io::PermissionDenied => Self::Authentication,
            Io::TimedOut => Self::DeadlineExceeded,
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::AddrNotAvailable => Self::Unavailable,
            Io::InvalidInput | Io::InvalidData => Self::InvalidInput,
            Io::OutOfMemory => Self::ResourceExhausted,
            _ => Self::Internal,
        }
    }

    /// Returns the label used for this category in events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::NotFound => "not_found",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Unavailable => "unavailable",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::InvalidInput => "invalid_input",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ready-made error type for operations wrapped by a breaker.
///
/// Call sites are free to use their own error types; this one carries a
/// category that [`ErrorCategory::of`] recognizes.
#[derive(Debug, Error)]
pub enum DependencyError {
    /// The dependency rejected our credentials.
    #[error("authentication with '{dependency}' failed: {reason}")]
    Authentication {
        /// Name of the dependency.
        dependency: String,
        /// Reason given.
        reason: String,
    },

    /// The dependency has no such resource.
    #[error("'{resource}' not found in '{dependency}'")]
    NotFound {
        /// Name of the dependency.
        dependency: String,
        /// The missing resource.
        resource: String,
    },

    /// A pool, quota or rate limit was exhausted.
    #[error("'{dependency}' resources exhausted: {reason}")]
    ResourceExhausted {
        /// Name of the dependency.
        dependency: String,
        /// Reason given.
        reason: String,
    },

    /// The dependency is unreachable or refusing work.
    #[error("'{dependency}' is unavailable: {reason}")]
    Unavailable {
        /// Name of the dependency.
        dependency: String,
        /// Reason given.
        reason: String,
    },

    /// The dependency rejected the request as invalid.
    #[error("invalid request to '{dependency}': {reason}")]
    InvalidInput {
        /// Name of the dependency.
        dependency: String,
        /// Reason given.
        reason: String,
    },

    /// The dependency failed internally.
    #[error("internal error in '{dependency}': {message}")]
    Internal {
        /// Name of the dependency.
        dependency: String,
        /// Description of the failure.
        message: String,
    },

    /// An I/O error talking to the dependency.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DependencyError {
    /// Returns the observability category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::ResourceExhausted { .. } => ErrorCategory::ResourceExhausted,
            Self::Unavailable { .. } => ErrorCategory::Unavailable,
            Self::InvalidInput { .. } => ErrorCategory::InvalidInput,
            Self::Internal { .. } => ErrorCategory::Internal,
            Self::Io(err) => ErrorCategory::from_io(err.kind()),
        }
    }

    /// Returns the dependency name, if known.
    pub fn dependency(&self) -> Option<&str> {
        match self {
            Self::Authentication { dependency, .. }
            | Self::NotFound { dependency, .. }
            | Self::ResourceExhausted { dependency, .. }
            | Self::Unavailable { dependency, .. }
            | Self::InvalidInput { dependency, .. }
            | Self::Internal { dependency, .. } => Some(dependency),
            Self::Io(_) => None,
        }
    }

    /// Creates an `Authentication` error.
    pub fn authentication(dependency: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Authentication {
            dependency: dependency.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(dependency: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::NotFound {
            dependency: dependency.into(),
            resource: resource.into(),
        }
    }

    /// Creates a `ResourceExhausted` error.
    pub fn resource_exhausted(dependency: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            dependency: dependency.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `Unavailable` error.
    pub fn unavailable(dependency: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            dependency: dependency.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `InvalidInput` error.
    pub fn invalid_input(dependency: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            dependency: dependency.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `Internal` error.
    pub fn internal(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            dependency: dependency.into(),
            message: message.into(),
        }
    }
}

/// Error type for breaker configuration and registry operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A breaker configuration failed validation.
    #[error("invalid configuration for breaker '{name}': {reason}")]
    Invalid {
        /// Name of the breaker.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// No breaker is registered under this name.
    #[error("no circuit breaker registered for '{name}'")]
    UnknownBreaker {
        /// The requested name.
        name: String,
    },

    /// Failed to read a configuration file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse a configuration document.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    /// Creates an `Invalid` error.
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// A specialized `Result` type for calls made through a breaker.
pub type BreakerResult<T, E> = Result<T, BreakerError<E>>;
