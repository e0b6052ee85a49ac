//! Breaker event reporting.
//!
//! Every outcome, rejection, state change, fallback and reset a breaker
//! observes is reported as a [`BreakerEvent`] to a [`MetricsSink`]. Sinks are
//! fire-and-forget: they are called outside the breaker's lock and return
//! nothing the call path could fail on.
//!
//! Built-in sinks:
//! - [`TracingSink`] - structured `tracing` events (the default)
//! - [`MetricsFacadeSink`] - counters and gauges on the `metrics` facade
//!   (requires the `metrics` feature)
//! - [`InMemorySink`] - keeps events for inspection
//! - [`FanoutSink`] - forwards to several sinks
//! - [`NoopSink`] - discards events

mod events;
#[cfg(feature = "metrics")]
mod metrics_facade;
mod sink;

pub use events::{BreakerEvent, EventKind, RejectReason};
#[cfg(feature = "metrics")]
pub use metrics_facade::MetricsFacadeSink;
pub use sink::{ArcSink, FanoutSink, InMemorySink, MetricsSink, NoopSink, TracingSink};
