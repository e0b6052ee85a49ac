//! The sink interface breakers report to, and the built-in sinks.

use crate::circuit_breaker::CircuitState;
use crate::telemetry::events::{BreakerEvent, EventKind};

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

/// Receives every event a circuit breaker produces.
///
/// Breakers call `record` after releasing their lock, on the calling task.
/// Implementations must return quickly and must not panic; anything slow
/// belongs behind a channel inside the sink.
pub trait MetricsSink: Send + Sync + Debug {
    /// Records one event.
    fn record(&self, event: &BreakerEvent);
}

/// An arc-wrapped sink for shared ownership.
pub type ArcSink = Arc<dyn MetricsSink>;

/// A sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record(&self, _event: &BreakerEvent) {}
}

/// A sink that turns events into structured `tracing` events.
///
/// Events are emitted under the `depguard::events` target so they can be
/// routed separately from the crate's diagnostic logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&self, event: &BreakerEvent) {
        let breaker = event.breaker.as_str();
        match event.kind {
            EventKind::Success => tracing::trace!(
                target: "depguard::events",
                breaker = %breaker,
                event = "success",
                "Call succeeded"
            ),
            EventKind::Failure { category } => tracing::debug!(
                target: "depguard::events",
                breaker = %breaker,
                event = "failure",
                category = %category,
                "Call failed"
            ),
            EventKind::Timeout => tracing::debug!(
                target: "depguard::events",
                breaker = %breaker,
                event = "timeout",
                "Call timed out"
            ),
            EventKind::Rejected { reason } => tracing::debug!(
                target: "depguard::events",
                breaker = %breaker,
                event = "rejected",
                reason = %reason,
                "Call rejected"
            ),
            EventKind::StateChange {
                from,
                to: CircuitState::Open,
            } => tracing::warn!(
                target: "depguard::events",
                breaker = %breaker,
                event = "state_change",
                from = %from,
                to = "open",
                "Circuit opened"
            ),
            EventKind::StateChange { from, to } => tracing::info!(
                target: "depguard::events",
                breaker = %breaker,
                event = "state_change",
                from = %from,
                to = %to,
                "Circuit state changed"
            ),
            EventKind::Fallback { succeeded } => tracing::info!(
                target: "depguard::events",
                breaker = %breaker,
                event = "fallback",
                succeeded = succeeded,
                "Fallback invoked"
            ),
            EventKind::Reset => tracing::info!(
                target: "depguard::events",
                breaker = %breaker,
                event = "reset",
                "Circuit breaker reset"
            ),
        }
    }
}

/// A sink that keeps every event in memory.
///
/// Useful in tests and for operator tooling that wants a recent event log.
#[derive(Debug, Default)]
pub struct InMemorySink {
    events: Mutex<Vec<BreakerEvent>>,
}

impl InMemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all recorded events.
    pub fn events(&self) -> Vec<BreakerEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Returns how many recorded events carry the given label.
    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|event| event.label() == label)
            .count()
    }

    /// Returns the recorded state transitions in order.
    pub fn transitions(&self) -> Vec<(CircuitState, CircuitState)> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter_map(|event| match event.kind {
                EventKind::StateChange { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    /// Discards all recorded events.
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl MetricsSink for InMemorySink {
    fn record(&self, event: &BreakerEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

/// A sink that forwards every event to several sinks in order.
#[derive(Debug, Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<ArcSink>,
}

impl FanoutSink {
    /// Creates an empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    pub fn with_sink(mut self, sink: ArcSink) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Returns the number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns `true` if there are no sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricsSink for FanoutSink {
    fn record(&self, event: &BreakerEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}
