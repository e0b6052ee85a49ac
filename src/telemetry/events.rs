//! Breaker event types.

use crate::circuit_breaker::CircuitState;
use crate::core::ErrorCategory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Something a circuit breaker observed or did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerEvent {
    /// Name of the breaker that produced the event.
    pub breaker: String,

    /// What happened.
    pub kind: EventKind,

    /// When it happened.
    pub timestamp: DateTime<Utc>,
}

impl BreakerEvent {
    /// Creates an event stamped with the current time.
    pub fn new(breaker: impl Into<String>, kind: EventKind) -> Self {
        Self {
            breaker: breaker.into(),
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Returns the event label (`success`, `state_change`, ...).
    pub fn label(&self) -> &'static str {
        self.kind.label()
    }
}

/// The kinds of events a breaker reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The wrapped operation succeeded.
    Success,

    /// The wrapped operation failed.
    Failure {
        /// Observability category of the error.
        category: ErrorCategory,
    },

    /// The call hit its deadline or the caller cancelled it.
    Timeout,

    /// The call was rejected without running.
    Rejected {
        /// Why it was rejected.
        reason: RejectReason,
    },

    /// The breaker changed state.
    StateChange {
        /// Previous state.
        from: CircuitState,
        /// New state.
        to: CircuitState,
    },

    /// A fallback ran.
    Fallback {
        /// Whether the fallback produced a value.
        succeeded: bool,
    },

    /// The breaker was reset by an operator.
    Reset,
}

impl EventKind {
    /// Returns the label used for this kind in logs and metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure { .. } => "failure",
            Self::Timeout => "timeout",
            Self::Rejected { .. } => "rejected",
            Self::StateChange { .. } => "state_change",
            Self::Fallback { succeeded: true } => "fallback_success",
            Self::Fallback { succeeded: false } => "fallback_failure",
            Self::Reset => "reset",
        }
    }
}

/// Why a call was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The circuit is open.
    Open,
    /// The half-open allowance is in use.
    HalfOpenAtCapacity,
}

impl RejectReason {
    /// Returns the label for this reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::HalfOpenAtCapacity => "half_open_at_capacity",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
