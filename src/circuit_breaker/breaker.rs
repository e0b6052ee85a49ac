//! Circuit breaker implementation.

use crate::circuit_breaker::config::CircuitBreakerConfig;
use crate::circuit_breaker::state::{CircuitBreakerMetrics, CircuitState};
use crate::circuit_breaker::stats::CircuitBreakerStats;
use crate::core::{BreakerError, CallContext, ErrorCategory};
use crate::telemetry::{ArcSink, BreakerEvent, EventKind, RejectReason, TracingSink};

use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::Instant;

/// A circuit breaker guarding calls to one named dependency.
///
/// The breaker decides whether a call may run, runs it under a deadline,
/// classifies the outcome and updates its state before returning.
///
/// # States
///
/// - **Closed**: Every call is admitted; failures and the error rate are tracked.
/// - **Open**: Calls are rejected immediately. The first call after the sleep
///   window moves the breaker to half-open and is admitted as a probe.
/// - **Half-Open**: A tenth of `max_concurrent_requests` (at least one) may be
///   in flight. Enough consecutive successes close the circuit; any failure
///   or timeout opens it again.
///
/// All state lives behind one lock per breaker. No background task is used;
/// transitions happen on the call path that observes them.
///
/// # Example
///
/// ```rust,ignore
/// use depguard::{CallContext, CircuitBreaker, CircuitBreakerConfig};
///
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::new("database"));
/// let rows = breaker
///     .execute(&CallContext::new(), |ctx| async move { db.query(ctx).await })
///     .await?;
/// ```
pub struct CircuitBreaker {
    /// Configuration.
    config: CircuitBreakerConfig,
    /// State, streaks, in-flight count and metrics.
    core: RwLock<BreakerCore>,
    /// Where events go.
    sink: ArcSink,
}

#[derive(Debug, Clone)]
struct BreakerCore {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    concurrent_requests: u32,
    /// Bumped by `reset` so in-flight guards from before it don't decrement.
    generation: u64,
    /// Bumped on every close; outcomes of calls admitted earlier are not counted.
    epoch: u64,
    last_state_change: Instant,
    state_changed_at: DateTime<Utc>,
    metrics: CircuitBreakerMetrics,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            concurrent_requests: 0,
            generation: 0,
            epoch: 0,
            last_state_change: Instant::now(),
            state_changed_at: Utc::now(),
            metrics: CircuitBreakerMetrics::new(),
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) -> Option<Transition> {
        if self.state == to {
            return None;
        }

        let from = self.state;
        self.state = to;
        self.failure_count = 0;
        self.success_count = 0;
        self.last_state_change = now;
        self.state_changed_at = Utc::now();

        match to {
            CircuitState::Open => self.metrics.record_opened(),
            CircuitState::Closed => {
                self.epoch = self.epoch.wrapping_add(1);
                self.metrics = self.metrics.next_epoch();
                self.metrics.record_closed();
            }
            CircuitState::HalfOpen => {}
        }

        Some(Transition { from, to })
    }

    fn admitted(&self) -> Admission {
        Admission {
            generation: self.generation,
            epoch: self.epoch,
        }
    }
}

/// When a call was admitted, as seen by the counters it was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Admission {
    generation: u64,
    epoch: u64,
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
}

#[derive(Debug, Clone, Copy)]
struct Rejection {
    reason: RejectReason,
    state: CircuitState,
    in_flight: u32,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure(ErrorCategory),
    Timeout,
}

impl Outcome {
    fn event(self) -> EventKind {
        match self {
            Self::Success => EventKind::Success,
            Self::Failure(category) => EventKind::Failure { category },
            Self::Timeout => EventKind::Timeout,
        }
    }
}

/// Releases an admitted call's in-flight slot when dropped.
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut core = self.breaker.write();
        if core.generation == self.admission.generation {
            core.concurrent_requests = core.concurrent_requests.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    /// Creates a breaker that reports events to a [`TracingSink`].
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    /// Creates a breaker that reports events to the given sink.
    pub fn with_sink(config: CircuitBreakerConfig, sink: ArcSink) -> Self {
        Self {
            config,
            core: RwLock::new(BreakerCore::new()),
            sink,
        }
    }

    /// Returns the breaker name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the current state.
    pub fn state(&self) -> CircuitState {
        self.read().state
    }

    /// Returns a copy of the current metrics.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.read().metrics.clone()
    }

    /// Returns a consistent snapshot of state, counters and configuration.
    pub fn stats(&self) -> CircuitBreakerStats {
        let core = self.read().clone();
        let time_in_state = core.last_state_change.elapsed();

        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: core.state,
            failure_count: core.failure_count,
            success_count: core.success_count,
            concurrent_requests: core.concurrent_requests,
            half_open_limit: self.config.half_open_max_requests(),
            time_in_state_ms: u64::try_from(time_in_state.as_millis()).unwrap_or(u64::MAX),
            state_changed_at: core.state_changed_at,
            success_rate: core.metrics.success_percentage(),
            error_rate: core.metrics.error_percentage(),
            metrics: core.metrics,
            config: self.config.clone(),
        }
    }

    /// Forces the breaker closed with zeroed streaks, metrics and in-flight
    /// count.
    ///
    /// This is an operator override, not a state transition: no open/close is
    /// counted. Calls still in flight finish normally but no longer hold a slot.
    pub fn reset(&self) {
        let previous = {
            let mut core = self.write();
            let previous = core.state;
            *core = BreakerCore {
                generation: core.generation.wrapping_add(1),
                ..BreakerCore::new()
            };
            previous
        };

        tracing::info!(
            breaker = %self.config.name,
            previous_state = %previous,
            "Circuit breaker reset"
        );
        self.emit(EventKind::Reset);
    }

    /// Forces the circuit open, as if it had just tripped.
    pub fn force_open(&self) {
        self.force(CircuitState::Open);
    }

    /// Forces the circuit half-open so the next calls probe the dependency.
    pub fn force_half_open(&self) {
        self.force(CircuitState::HalfOpen);
    }

    /// Forces the circuit closed, starting a new measurement epoch.
    pub fn force_closed(&self) {
        self.force(CircuitState::Closed);
    }

    /// Runs `operation` through the breaker.
    ///
    /// The operation receives a context derived from `ctx` whose deadline is
    /// bounded by the configured timeout. It runs as a separate tokio task;
    /// if the deadline passes or `ctx` is cancelled first, the call is
    /// classified as a timeout, the derived context is cancelled and the
    /// task's eventual result is discarded.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - `Open` / `HalfOpenAtCapacity` - rejected; `operation` was not called.
    /// - `Timeout` - the deadline passed or the caller cancelled.
    /// - `Operation` - `operation` returned an error, passed through as-is.
    /// - `Internal` - the operation task panicked.
    pub async fn execute<F, Fut, T, E>(
        &self,
        ctx: &CallContext,
        operation: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let admission = match self.admit() {
            Ok(admission) => admission,
            Err(rejection) => return Err(self.rejection_error(rejection)),
        };
        let _in_flight = InFlight {
            breaker: self,
            admission,
        };

        let started = Instant::now();
        let deadline = ctx.deadline_within(self.config.timeout);
        let call_ctx = ctx.child(deadline);
        // Cancels the operation if this future is dropped mid-race.
        let cancel_on_drop = call_ctx.cancellation_token().clone().drop_guard();
        let mut task = tokio::spawn(operation(call_ctx.clone()));

        let joined = tokio::select! {
            biased;
            joined = &mut task => Some(joined),
            _ = tokio::time::sleep_until(deadline) => None,
            _ = ctx.cancelled() => None,
        };
        if joined.is_some() {
            cancel_on_drop.disarm();
        }

        match joined {
            Some(Ok(Ok(value))) => {
                self.complete(admission, Outcome::Success);
                Ok(value)
            }
            Some(Ok(Err(err))) => {
                self.complete(admission, Outcome::Failure(ErrorCategory::of(&err)));
                Err(BreakerError::Operation(err))
            }
            Some(Err(join_error)) => {
                tracing::error!(
                    breaker = %self.config.name,
                    error = %join_error,
                    request_id = ?ctx.request_id(),
                    "Protected operation did not run to completion"
                );
                self.complete(admission, Outcome::Failure(ErrorCategory::Internal));
                Err(BreakerError::Internal {
                    name: self.config.name.clone(),
                    message: join_error.to_string(),
                })
            }
            None => {
                call_ctx.cancel();
                let elapsed = started.elapsed();
                tracing::debug!(
                    breaker = %self.config.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    caller_cancelled = ctx.is_cancelled(),
                    request_id = ?ctx.request_id(),
                    "Call abandoned at deadline"
                );
                self.complete(admission, Outcome::Timeout);
                Err(BreakerError::Timeout {
                    name: self.config.name.clone(),
                    elapsed,
                })
            }
        }
    }

    /// Runs `operation` through the breaker, falling back on any error.
    ///
    /// If [`execute`](Self::execute) fails for any reason, including a
    /// rejection, `fallback` is called with a clone of `ctx` and the error,
    /// and its result is returned instead. The fallback is not subject to the
    /// breaker's admission rules or deadline, so it must be safe to call while
    /// the dependency is down. Fallback outcomes are counted separately from
    /// the primary ones.
    ///
    /// # Errors
    ///
    /// Returns `Fallback` when the fallback fails too; it carries both the
    /// primary failure and the fallback's own error.
    pub async fn execute_with_fallback<F, Fut, FB, FbFut, T, E>(
        &self,
        ctx: &CallContext,
        operation: F,
        fallback: FB,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        FB: FnOnce(CallContext, BreakerError<E>) -> FbFut,
        FbFut: Future<Output = Result<T, E>>,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let primary = match self.execute(ctx, operation).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let primary_kind = primary.kind();
        let rendered = primary.to_string();

        match fallback(ctx.clone(), primary).await {
            Ok(value) => {
                self.record_fallback(true);
                Ok(value)
            }
            Err(source) => {
                self.record_fallback(false);
                tracing::warn!(
                    breaker = %self.config.name,
                    primary = %primary_kind,
                    error = %source,
                    "Fallback failed after primary failure"
                );
                Err(BreakerError::Fallback {
                    name: self.config.name.clone(),
                    primary_kind,
                    primary: rendered,
                    source,
                })
            }
        }
    }

    /// Applies the admission rule and takes an in-flight slot on success.
    fn admit(&self) -> Result<Admission, Rejection> {
        let now = Instant::now();
        let limit = self.config.half_open_max_requests();

        let (decision, transition) = {
            let mut core = self.write();
            let mut transition = None;

            let admitted = match core.state {
                CircuitState::Closed => true,
                CircuitState::Open => {
                    let elapsed = now.saturating_duration_since(core.last_state_change);
                    if elapsed >= self.config.sleep_window {
                        transition = core.transition(CircuitState::HalfOpen, now);
                        true
                    } else {
                        false
                    }
                }
                CircuitState::HalfOpen => core.concurrent_requests < limit,
            };

            let decision = if admitted {
                core.concurrent_requests = core.concurrent_requests.saturating_add(1);
                core.metrics.record_request();
                Ok(core.admitted())
            } else {
                core.metrics.record_rejection();
                let reason = if core.state.is_open() {
                    RejectReason::Open
                } else {
                    RejectReason::HalfOpenAtCapacity
                };
                Err(Rejection {
                    reason,
                    state: core.state,
                    in_flight: core.concurrent_requests,
                })
            };

            (decision, transition)
        };

        if let Some(transition) = transition {
            self.announce(transition);
        }
        if let Err(rejection) = &decision {
            tracing::debug!(
                breaker = %self.config.name,
                state = %rejection.state,
                reason = %rejection.reason,
                "Call rejected"
            );
            self.emit(EventKind::Rejected {
                reason: rejection.reason,
            });
        }

        decision
    }

    fn rejection_error<E>(&self, rejection: Rejection) -> BreakerError<E> {
        match rejection.reason {
            RejectReason::Open => BreakerError::Open {
                name: self.config.name.clone(),
                state: rejection.state,
            },
            RejectReason::HalfOpenAtCapacity => BreakerError::HalfOpenAtCapacity {
                name: self.config.name.clone(),
                in_flight: rejection.in_flight,
                limit: self.config.half_open_max_requests(),
            },
        }
    }

    /// Records an outcome and applies any transition it triggers.
    ///
    /// Outcomes of calls admitted before the last close or reset only produce
    /// an event; their admission was counted in counters that no longer exist.
    fn complete(&self, admission: Admission, outcome: Outcome) {
        let now = Instant::now();
        let at = Utc::now();

        let transition = {
            let mut core = self.write();
            let state = core.state;

            if core.admitted() != admission {
                drop(core);
                tracing::debug!(
                    breaker = %self.config.name,
                    event = outcome.event().label(),
                    "Outcome of a call admitted before the last close or reset not counted"
                );
                self.emit(outcome.event());
                return;
            }

            match outcome {
                Outcome::Success => {
                    core.metrics.record_success(at);
                    core.failure_count = 0;
                    core.success_count = core.success_count.saturating_add(1);

                    if state.is_half_open() && core.success_count >= self.config.success_threshold
                    {
                        core.transition(CircuitState::Closed, now)
                    } else {
                        None
                    }
                }
                Outcome::Failure(_) | Outcome::Timeout => {
                    if matches!(outcome, Outcome::Timeout) {
                        core.metrics.record_timeout(at);
                    } else {
                        core.metrics.record_failure(at);
                    }
                    core.success_count = 0;
                    core.failure_count = core.failure_count.saturating_add(1);

                    match state {
                        CircuitState::HalfOpen => core.transition(CircuitState::Open, now),
                        CircuitState::Closed if self.should_trip(&core) => {
                            core.transition(CircuitState::Open, now)
                        }
                        _ => None,
                    }
                }
            }
        };

        self.emit(outcome.event());
        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    /// Closed-state trip rule: volume gate, then streak or error rate.
    fn should_trip(&self, core: &BreakerCore) -> bool {
        core.metrics.requests >= u64::from(self.config.request_volume_threshold)
            && (core.failure_count >= self.config.failure_threshold
                || core
                    .metrics
                    .error_rate_reached(self.config.error_percent_threshold))
    }

    fn record_fallback(&self, succeeded: bool) {
        self.write().metrics.record_fallback(succeeded);
        self.emit(EventKind::Fallback { succeeded });
    }

    fn force(&self, to: CircuitState) {
        let transition = self.write().transition(to, Instant::now());
        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    fn announce(&self, transition: Transition) {
        if transition.to.is_open() {
            tracing::warn!(
                breaker = %self.config.name,
                from = %transition.from,
                sleep_window_ms = self.config.sleep_window.as_millis() as u64,
                "Circuit breaker opened"
            );
        } else {
            tracing::info!(
                breaker = %self.config.name,
                from = %transition.from,
                to = %transition.to,
                "Circuit breaker state changed"
            );
        }
        self.emit(EventKind::StateChange {
            from: transition.from,
            to: transition.to,
        });
    }

    fn emit(&self, kind: EventKind) {
        self.sink.record(&BreakerEvent::new(&self.config.name, kind));
    }

    fn read(&self) -> RwLockReadGuard<'_, BreakerCore> {
        self.core
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BreakerCore> {
        self.core
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.read();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("state", &core.state)
            .field("concurrent_requests", &core.concurrent_requests)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DependencyError;
    use crate::telemetry::InMemorySink;

    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    type CallResult<T> = Result<T, BreakerError<DependencyError>>;

    fn config(name: &str) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(name)
            .with_timeout(Duration::from_secs(1))
            .with_sleep_window(Duration::from_secs(30))
            .with_request_volume_threshold(0)
            .with_error_percent_threshold(0)
    }

    fn breaker_with_sink(config: CircuitBreakerConfig) -> (CircuitBreaker, Arc<InMemorySink>) {
        let sink = Arc::new(InMemorySink::new());
        (CircuitBreaker::with_sink(config, sink.clone()), sink)
    }

    async fn succeed(breaker: &CircuitBreaker) -> CallResult<&'static str> {
        breaker
            .execute(&CallContext::new(), |_| async { Ok("ok") })
            .await
    }

    async fn fail(breaker: &CircuitBreaker) -> CallResult<&'static str> {
        breaker
            .execute(&CallContext::new(), |_| async {
                Err(DependencyError::unavailable("test", "connection refused"))
            })
            .await
    }

    async fn hang(breaker: &CircuitBreaker) -> CallResult<()> {
        breaker
            .execute(&CallContext::new(), |_| {
                std::future::pending::<Result<(), DependencyError>>()
            })
            .await
    }

    async fn counted(
        breaker: &CircuitBreaker,
        invocations: &Arc<AtomicU32>,
        ok: bool,
    ) -> CallResult<()> {
        let invocations = invocations.clone();
        breaker
            .execute(&CallContext::new(), move |_| async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                if ok {
                    Ok(())
                } else {
                    Err(DependencyError::unavailable("database", "down"))
                }
            })
            .await
    }

    #[tokio::test]
    async fn test_call_passes_through_when_closed() {
        let (breaker, sink) = breaker_with_sink(config("database"));

        assert_eq!(succeed(&breaker).await.unwrap(), "ok");
        assert!(breaker.state().is_closed());

        let metrics = breaker.metrics();
        assert_eq!(metrics.requests, 1);
        assert_eq!(metrics.successes, 1);
        assert!(metrics.last_success_time.is_some());
        assert_eq!(breaker.stats().concurrent_requests, 0);
        assert_eq!(sink.count("success"), 1);
    }

    #[tokio::test]
    async fn test_operation_error_passes_through_with_category() {
        let (breaker, sink) = breaker_with_sink(config("passkey_provider"));

        let result: CallResult<()> = breaker
            .execute(&CallContext::new(), |_| async {
                Err(DependencyError::authentication("passkey_provider", "bad signature"))
            })
            .await;

        match result {
            Err(BreakerError::Operation(DependencyError::Authentication { reason, .. })) => {
                assert_eq!(reason, "bad signature");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(breaker.metrics().failures, 1);
        assert!(sink.events().iter().any(|event| event.kind
            == EventKind::Failure {
                category: ErrorCategory::Authentication
            }));
    }

    #[tokio::test]
    async fn test_consecutive_failures_open_circuit() {
        let (breaker, sink) = breaker_with_sink(
            config("database")
                .with_failure_threshold(3)
                .with_error_percent_threshold(0),
        );

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert!(breaker.state().is_closed());
        assert_eq!(breaker.stats().failure_count, 2);

        let _ = fail(&breaker).await;
        assert!(breaker.state().is_open());
        assert_eq!(breaker.metrics().circuit_opens, 1);
        assert_eq!(
            sink.transitions(),
            vec![(CircuitState::Closed, CircuitState::Open)]
        );
    }

    #[tokio::test]
    async fn test_success_breaks_failure_streak() {
        let breaker = CircuitBreaker::new(
            config("database")
                .with_failure_threshold(3)
                .with_error_percent_threshold(0),
        );

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        assert_eq!(breaker.stats().failure_count, 0);
        assert_eq!(breaker.stats().success_count, 1);

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert!(breaker.state().is_closed());
    }

    #[tokio::test]
    async fn test_volume_gating_prevents_small_sample_trips() {
        let breaker = CircuitBreaker::new(
            config("database")
                .with_failure_threshold(100)
                .with_request_volume_threshold(10)
                .with_error_percent_threshold(50),
        );

        for _ in 0..9 {
            let _ = fail(&breaker).await;
        }
        assert!(breaker.state().is_closed());
        assert_eq!(breaker.metrics().error_percentage(), 100.0);

        let _ = fail(&breaker).await;
        assert!(breaker.state().is_open());
    }

    #[tokio::test]
    async fn test_error_rate_trips_on_mixed_traffic() {
        let breaker = CircuitBreaker::new(
            config("message_bus")
                .with_failure_threshold(100)
                .with_request_volume_threshold(10)
                .with_error_percent_threshold(50),
        );

        for _ in 0..5 {
            succeed(&breaker).await.unwrap();
        }
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        assert!(breaker.state().is_closed());

        let _ = fail(&breaker).await;
        assert!(breaker.state().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_does_not_invoke_operation_during_sleep_window() {
        let breaker = CircuitBreaker::new(
            config("database")
                .with_failure_threshold(1)
                .with_success_threshold(2)
                .with_sleep_window(Duration::from_secs(30)),
        );
        let invocations = Arc::new(AtomicU32::new(0));

        let _ = counted(&breaker, &invocations, false).await;
        assert!(breaker.state().is_open());
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(5)).await;
            let result = counted(&breaker, &invocations, true).await;
            assert!(matches!(result, Err(BreakerError::Open { .. })));
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.metrics().rejections, 5);

        tokio::time::advance(Duration::from_secs(5)).await;
        counted(&breaker, &invocations, true).await.unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert!(breaker.state().is_half_open());
    }

    #[tokio::test]
    async fn test_half_open_closes_after_success_threshold() {
        let (breaker, sink) = breaker_with_sink(config("database").with_success_threshold(3));
        let _ = fail(&breaker).await;

        breaker.force_half_open();
        assert!(breaker.state().is_half_open());

        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        assert!(breaker.state().is_half_open());

        succeed(&breaker).await.unwrap();
        assert!(breaker.state().is_closed());

        let metrics = breaker.metrics();
        assert_eq!(metrics.requests, 0);
        assert_eq!(metrics.successes, 0);
        assert_eq!(metrics.circuit_closes, 1);
        assert!(metrics.last_failure_time.is_some());
        assert!(metrics.last_success_time.is_some());
        assert_eq!(
            sink.transitions(),
            vec![
                (CircuitState::Closed, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(config("database").with_success_threshold(3));
        breaker.force_half_open();

        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;

        assert!(breaker.state().is_open());
        assert_eq!(breaker.stats().success_count, 0);
        assert_eq!(breaker.metrics().circuit_opens, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_timeout_reopens() {
        let breaker = CircuitBreaker::new(config("database"));
        breaker.force_half_open();

        let result = hang(&breaker).await;
        assert!(matches!(result, Err(BreakerError::Timeout { .. })));
        assert!(breaker.state().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_a_tenth_of_capacity() {
        let breaker = Arc::new(CircuitBreaker::new(
            config("passkey_provider")
                .with_max_concurrent_requests(100)
                .with_success_threshold(3)
                .with_timeout(Duration::from_secs(60)),
        ));
        breaker.force_half_open();

        let gate = Arc::new(Semaphore::new(0));
        let mut probes = Vec::new();
        for _ in 0..10 {
            let breaker = breaker.clone();
            let gate = gate.clone();
            probes.push(tokio::spawn(async move {
                breaker
                    .execute(&CallContext::new(), move |_| async move {
                        let _permit = gate
                            .acquire()
                            .await
                            .map_err(|_| DependencyError::internal("gate", "closed"))?;
                        Ok::<_, DependencyError>(())
                    })
                    .await
            }));
        }

        while breaker.stats().concurrent_requests < 10 {
            tokio::task::yield_now().await;
        }

        let rejected = succeed(&breaker).await;
        match rejected {
            Err(BreakerError::HalfOpenAtCapacity {
                in_flight, limit, ..
            }) => {
                assert_eq!(in_flight, 10);
                assert_eq!(limit, 10);
            }
            other => panic!("expected capacity rejection, got {other:?}"),
        }

        gate.add_permits(10);
        for probe in probes {
            probe.await.unwrap().unwrap();
        }
        assert!(breaker.state().is_closed());
        assert_eq!(breaker.stats().concurrent_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allowance_floor_is_one() {
        let breaker = Arc::new(CircuitBreaker::new(
            config("message_bus")
                .with_max_concurrent_requests(5)
                .with_timeout(Duration::from_secs(60)),
        ));
        breaker.force_half_open();

        let probe = {
            let breaker = breaker.clone();
            tokio::spawn(async move { hang(&breaker).await })
        };
        while breaker.stats().concurrent_requests < 1 {
            tokio::task::yield_now().await;
        }

        let result = succeed(&breaker).await;
        assert!(matches!(
            result,
            Err(BreakerError::HalfOpenAtCapacity { limit: 1, .. })
        ));

        probe.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_after_configured_duration() {
        let (breaker, sink) =
            breaker_with_sink(config("database").with_timeout(Duration::from_millis(200)));

        let start = Instant::now();
        let result = hang(&breaker).await;
        let elapsed = start.elapsed();

        match result {
            Err(BreakerError::Timeout { name, .. }) => assert_eq!(name, "database"),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(210));

        let metrics = breaker.metrics();
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.failures, 0);
        assert_eq!(breaker.stats().failure_count, 1);
        assert_eq!(sink.count("timeout"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_completion_does_not_change_recorded_outcome() {
        let breaker = CircuitBreaker::new(config("database").with_timeout(Duration::from_millis(100)));
        let completed = Arc::new(AtomicBool::new(false));

        let flag = completed.clone();
        let result = breaker
            .execute(&CallContext::new(), move |_| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, DependencyError>("late")
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Timeout { .. })));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(completed.load(Ordering::SeqCst));

        let metrics = breaker.metrics();
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.successes, 0);
        assert_eq!(breaker.stats().concurrent_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_context_is_cancelled_at_deadline() {
        let breaker = CircuitBreaker::new(config("database").with_timeout(Duration::from_millis(100)));
        let observed = Arc::new(AtomicBool::new(false));

        let flag = observed.clone();
        let result = breaker
            .execute(&CallContext::new(), move |ctx| async move {
                assert!(ctx.deadline().is_some());
                ctx.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, DependencyError>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Timeout { .. })));

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancellation_counts_as_timeout() {
        let breaker = CircuitBreaker::new(config("database").with_timeout(Duration::from_secs(10)));
        let ctx = CallContext::new();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result: CallResult<()> = breaker
            .execute(&ctx, |_| std::future::pending::<Result<(), DependencyError>>())
            .await;

        assert!(matches!(result, Err(BreakerError::Timeout { .. })));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(breaker.metrics().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_deadline_bounds_call() {
        let breaker = CircuitBreaker::new(config("database").with_timeout(Duration::from_secs(10)));
        let ctx = CallContext::new().with_timeout(Duration::from_millis(150));

        let start = Instant::now();
        let result: CallResult<()> = breaker
            .execute(&ctx, |_| std::future::pending::<Result<(), DependencyError>>())
            .await;

        match result {
            Err(BreakerError::Timeout { elapsed, .. }) => {
                assert!(elapsed >= Duration::from_millis(150));
                assert!(elapsed < Duration::from_secs(1));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast() {
        let breaker = CircuitBreaker::new(config("database").with_timeout(Duration::from_secs(2)));

        let start = Instant::now();
        let _ = hang(&breaker).await;
        let timeout_latency = start.elapsed();

        breaker.force_open();
        let start = Instant::now();
        let result = hang(&breaker).await;
        let rejection_latency = start.elapsed();

        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert!(timeout_latency >= Duration::from_secs(2));
        assert_eq!(rejection_latency, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_releases_its_slot() {
        let breaker = CircuitBreaker::new(config("database").with_timeout(Duration::from_secs(60)));
        let observed = Arc::new(AtomicBool::new(false));

        let flag = observed.clone();
        let ctx = CallContext::new();
        let call = breaker.execute(&ctx, move |ctx| async move {
            ctx.cancelled().await;
            flag.store(true, Ordering::SeqCst);
            Ok::<_, DependencyError>(())
        });
        let abandoned = tokio::time::timeout(Duration::from_millis(10), call).await;
        assert!(abandoned.is_err());
        assert_eq!(breaker.stats().concurrent_requests, 0);
        assert_eq!(breaker.metrics().requests, 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_half_open_outcomes_are_not_counted_after_close() {
        let breaker = Arc::new(CircuitBreaker::new(
            config("passkey_provider")
                .with_max_concurrent_requests(100)
                .with_success_threshold(1)
                .with_timeout(Duration::from_secs(60)),
        ));
        breaker.force_half_open();

        let first_gate = Arc::new(Semaphore::new(0));
        let late_gate = Arc::new(Semaphore::new(0));
        let mut probes = Vec::new();
        for i in 0..10 {
            let breaker = breaker.clone();
            let gate = if i == 0 {
                first_gate.clone()
            } else {
                late_gate.clone()
            };
            probes.push(tokio::spawn(async move {
                breaker
                    .execute(&CallContext::new(), move |_| async move {
                        let _permit = gate
                            .acquire()
                            .await
                            .map_err(|_| DependencyError::internal("gate", "closed"))?;
                        if i == 0 {
                            Ok(())
                        } else {
                            Err(DependencyError::unavailable("passkey_provider", "still flaky"))
                        }
                    })
                    .await
            }));
        }
        while breaker.stats().concurrent_requests < 10 {
            tokio::task::yield_now().await;
        }

        let mut probes = probes.into_iter();
        first_gate.add_permits(1);
        if let Some(first) = probes.next() {
            first.await.unwrap().unwrap();
        }
        assert!(breaker.state().is_closed());

        late_gate.add_permits(9);
        for probe in probes {
            assert!(probe.await.unwrap().is_err());
        }

        let stats = breaker.stats();
        assert!(stats.state.is_closed());
        assert_eq!(stats.concurrent_requests, 0);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.metrics.requests, 0);
        assert_eq!(stats.metrics.failures, 0);
        assert_eq!(stats.metrics.circuit_closes, 1);

        succeed(&breaker).await.unwrap();
        let metrics = breaker.metrics();
        assert_eq!(metrics.requests, 1);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.success_percentage(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_after_reset_is_not_counted() {
        let breaker = Arc::new(CircuitBreaker::new(
            config("database").with_timeout(Duration::from_millis(100)),
        ));

        let stale = {
            let breaker = breaker.clone();
            tokio::spawn(async move { hang(&breaker).await })
        };
        while breaker.stats().concurrent_requests < 1 {
            tokio::task::yield_now().await;
        }
        breaker.reset();

        assert!(matches!(
            stale.await.unwrap(),
            Err(BreakerError::Timeout { .. })
        ));
        let metrics = breaker.metrics();
        assert_eq!(metrics.requests, 0);
        assert_eq!(metrics.timeouts, 0);
        assert_eq!(breaker.stats().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_does_not_overflow() {
        let breaker = CircuitBreaker::new(config("database").with_timeout(Duration::MAX));
        assert!(breaker.config().validate().is_ok());

        assert_eq!(succeed(&breaker).await.unwrap(), "ok");
        assert_eq!(breaker.metrics().successes, 1);
    }

    #[tokio::test]
    async fn test_panicking_operation_is_internal_error() {
        let breaker = CircuitBreaker::new(config("database"));

        let result: CallResult<()> = breaker
            .execute(&CallContext::new(), |_| async {
                if true {
                    panic!("driver bug");
                }
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Internal { .. })));
        assert_eq!(breaker.metrics().failures, 1);
        assert_eq!(breaker.stats().concurrent_requests, 0);
    }

    #[tokio::test]
    async fn test_fallback_covers_rejection() {
        let (breaker, sink) = breaker_with_sink(config("passkey_provider"));
        breaker.force_open();

        let primary_calls = Arc::new(AtomicU32::new(0));
        let counter = primary_calls.clone();
        let result = breaker
            .execute_with_fallback(
                &CallContext::new(),
                move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, DependencyError>("fresh")
                },
                |_, err| async move {
                    assert!(err.is_rejection());
                    Ok("cached")
                },
            )
            .await;

        assert_eq!(result.unwrap(), "cached");
        assert_eq!(primary_calls.load(Ordering::SeqCst), 0);

        let metrics = breaker.metrics();
        assert_eq!(metrics.fallback_successes, 1);
        assert_eq!(metrics.requests, 0);
        assert_eq!(metrics.successes, 0);
        assert_eq!(metrics.rejections, 1);
        assert_eq!(sink.count("fallback_success"), 1);
    }

    #[tokio::test]
    async fn test_fallback_after_operation_failure() {
        let breaker = CircuitBreaker::new(config("message_bus"));

        let result = breaker
            .execute_with_fallback(
                &CallContext::new(),
                |_| async { Err::<u64, _>(DependencyError::unavailable("message_bus", "broker down")) },
                |_, err| async move {
                    assert_eq!(err.kind(), crate::core::ErrorKind::Operation);
                    Ok(0_u64)
                },
            )
            .await;

        assert_eq!(result.unwrap(), 0);
        let metrics = breaker.metrics();
        assert_eq!(metrics.requests, 1);
        assert_eq!(metrics.failures, 1);
        assert_eq!(metrics.fallback_successes, 1);
    }

    #[tokio::test]
    async fn test_fallback_failure_is_reported_distinctly() {
        let breaker = CircuitBreaker::new(config("message_bus"));
        breaker.force_open();

        let result: CallResult<()> = breaker
            .execute_with_fallback(
                &CallContext::new(),
                |_| async { Ok(()) },
                |_, _| async { Err(DependencyError::not_found("cache", "outbox snapshot")) },
            )
            .await;

        match result {
            Err(BreakerError::Fallback {
                name,
                primary_kind,
                source,
                ..
            }) => {
                assert_eq!(name, "message_bus");
                assert_eq!(primary_kind, crate::core::ErrorKind::RejectedOpen);
                assert!(matches!(source, DependencyError::NotFound { .. }));
            }
            other => panic!("expected fallback error, got {other:?}"),
        }
        assert_eq!(breaker.metrics().fallback_failures, 1);
    }

    #[tokio::test]
    async fn test_reset_admits_next_call_in_closed_state() {
        let (breaker, sink) = breaker_with_sink(
            config("database")
                .with_failure_threshold(2)
                .with_error_percent_threshold(0),
        );
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert!(breaker.state().is_open());
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open { .. })));

        breaker.reset();
        let stats = breaker.stats();
        assert!(stats.state.is_closed());
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.metrics, CircuitBreakerMetrics::new());

        assert_eq!(succeed(&breaker).await.unwrap(), "ok");
        assert_eq!(breaker.metrics().requests, 1);
        assert_eq!(sink.count("reset"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_while_in_flight_keeps_count_exact() {
        let breaker = Arc::new(CircuitBreaker::new(
            config("database").with_timeout(Duration::from_millis(100)),
        ));

        let stale = {
            let breaker = breaker.clone();
            tokio::spawn(async move { hang(&breaker).await })
        };
        while breaker.stats().concurrent_requests < 1 {
            tokio::task::yield_now().await;
        }

        breaker.reset();
        assert_eq!(breaker.stats().concurrent_requests, 0);

        tokio::time::advance(Duration::from_millis(50)).await;
        let fresh = {
            let breaker = breaker.clone();
            tokio::spawn(async move { hang(&breaker).await })
        };
        while breaker.stats().concurrent_requests < 1 {
            tokio::task::yield_now().await;
        }
        let _ = stale.await.unwrap();
        assert_eq!(breaker.stats().concurrent_requests, 1);

        let _ = fresh.await.unwrap();
        assert_eq!(breaker.stats().concurrent_requests, 0);
    }

    #[tokio::test]
    async fn test_forced_transitions() {
        let (breaker, sink) = breaker_with_sink(config("database"));

        breaker.force_open();
        assert!(breaker.state().is_open());
        breaker.force_open();
        breaker.force_closed();
        assert!(breaker.state().is_closed());

        assert_eq!(sink.transitions().len(), 2);
        let metrics = breaker.metrics();
        assert_eq!(metrics.circuit_opens, 1);
        assert_eq!(metrics.circuit_closes, 1);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let breaker = CircuitBreaker::new(
            config("database")
                .with_max_concurrent_requests(200)
                .with_failure_threshold(10),
        );
        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;

        let stats = breaker.stats();
        assert_eq!(stats.name, "database");
        assert!(stats.is_healthy());
        assert_eq!(stats.half_open_limit, 20);
        assert_eq!(stats.success_rate, 75.0);
        assert_eq!(stats.error_rate, 25.0);
        assert_eq!(stats.metrics.requests, 4);
        assert_eq!(stats.config.failure_threshold, 10);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["state"], "closed");
        assert_eq!(json["config"]["timeout_ms"], 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_load_never_leaks_in_flight_slots() {
        let breaker = Arc::new(CircuitBreaker::with_sink(
            CircuitBreakerConfig::new("stress")
                .with_timeout(Duration::from_millis(250))
                .with_failure_threshold(u32::MAX)
                .with_error_percent_threshold(0),
            Arc::new(crate::telemetry::NoopSink),
        ));

        let calls = (0..300_usize).map(|i| {
            let breaker = breaker.clone();
            async move {
                breaker
                    .execute(&CallContext::new(), move |_| async move {
                        match i % 3 {
                            0 => Ok(i),
                            1 => Err(DependencyError::unavailable("stress", "flaky")),
                            _ => std::future::pending::<Result<usize, DependencyError>>().await,
                        }
                    })
                    .await
            }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(results.len(), 300);
        let stats = breaker.stats();
        assert_eq!(stats.concurrent_requests, 0);
        assert!(stats.state.is_closed());
        assert_eq!(stats.metrics.requests, 300);
        assert_eq!(stats.metrics.successes, 100);
        assert_eq!(stats.metrics.failures, 100);
        assert_eq!(stats.metrics.timeouts, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_load_with_tripping_keeps_totals() {
        let breaker = Arc::new(CircuitBreaker::with_sink(
            CircuitBreakerConfig::new("stress")
                .with_timeout(Duration::from_millis(100))
                .with_failure_threshold(5)
                .with_request_volume_threshold(20)
                .with_sleep_window(Duration::from_secs(60)),
            Arc::new(crate::telemetry::NoopSink),
        ));

        let calls = (0..400_usize).map(|i| {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(&CallContext::new(), move |_| async move {
                        match i % 4 {
                            0 | 1 => Ok(i),
                            2 => Err(DependencyError::unavailable("stress", "flaky")),
                            _ => {
                                tokio::time::sleep(Duration::from_secs(5)).await;
                                Ok(i)
                            }
                        }
                    })
                    .await
            })
        });
        let results = futures::future::join_all(calls).await;

        let rejected = results
            .iter()
            .filter(|joined| matches!(joined, Ok(Err(err)) if err.is_rejection()))
            .count() as u64;

        let stats = breaker.stats();
        let metrics = &stats.metrics;
        assert_eq!(stats.concurrent_requests, 0);
        assert_eq!(metrics.requests + metrics.rejections, 400);
        assert_eq!(metrics.rejections, rejected);
        assert_eq!(
            metrics.requests,
            metrics.successes + metrics.failures + metrics.timeouts
        );
    }
}
