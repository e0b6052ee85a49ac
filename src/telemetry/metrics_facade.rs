//! A sink that reports to the `metrics` facade.
//!
//! # Metrics
//! - `circuit_breaker_events_total` (counter): every event, by `breaker` and `event`
//! - `circuit_breaker_failures_total` (counter): failures, by `breaker` and `category`
//! - `circuit_breaker_rejections_total` (counter): rejections, by `breaker` and `reason`
//! - `circuit_breaker_state` (gauge): 0 = closed, 1 = half-open, 2 = open

use crate::circuit_breaker::CircuitState;
use crate::telemetry::events::{BreakerEvent, EventKind};
use crate::telemetry::sink::MetricsSink;

/// Forwards breaker events to whatever `metrics` recorder is installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsFacadeSink;

impl MetricsFacadeSink {
    /// Creates the sink.
    pub fn new() -> Self {
        Self
    }

    /// Gauge value for a state.
    pub fn state_value(state: CircuitState) -> f64 {
        match state {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl MetricsSink for MetricsFacadeSink {
    fn record(&self, event: &BreakerEvent) {
        metrics::counter!(
            "circuit_breaker_events_total",
            "breaker" => event.breaker.clone(),
            "event" => event.label()
        )
        .increment(1);

        match event.kind {
            EventKind::Failure { category } => {
                metrics::counter!(
                    "circuit_breaker_failures_total",
                    "breaker" => event.breaker.clone(),
                    "category" => category.as_str()
                )
                .increment(1);
            }
            EventKind::Rejected { reason } => {
                metrics::counter!(
                    "circuit_breaker_rejections_total",
                    "breaker" => event.breaker.clone(),
                    "reason" => reason.as_str()
                )
                .increment(1);
            }
            EventKind::StateChange { to, .. } => {
                metrics::gauge!("circuit_breaker_state", "breaker" => event.breaker.clone())
                    .set(Self::state_value(to));
            }
            EventKind::Reset => {
                metrics::gauge!("circuit_breaker_state", "breaker" => event.breaker.clone())
                    .set(Self::state_value(CircuitState::Closed));
            }
            _ => {}
        }
    }
}
