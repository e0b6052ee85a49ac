//! Circuit breaker example demonstrating resilient dependency calls.
//!
//! This example shows how to:
//! - Get named breakers from a manager
//! - Trip a breaker with a failing dependency
//! - Recover through half-open probes
//! - Serve a cached answer through a fallback
//! - Dump operator stats as JSON
//!
//! Run with: cargo run --example resilient_calls

use depguard::prelude::*;
use depguard::telemetry::{FanoutSink, InMemorySink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A stand-in for a remote database that can be switched off.
#[derive(Debug, Default)]
struct FlakyDatabase {
    down: AtomicBool,
}

impl FlakyDatabase {
    async fn load_user(&self, ctx: CallContext, id: u64) -> Result<String, DependencyError> {
        if ctx.is_cancelled() {
            return Err(DependencyError::internal("database", "cancelled"));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.down.load(Ordering::SeqCst) {
            Err(DependencyError::unavailable("database", "connection refused"))
        } else {
            Ok(format!("user-{id}"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,depguard=debug".into()),
        )
        .init();

    println!("=== Circuit Breaker Example ===\n");

    let events = Arc::new(InMemorySink::new());
    let sink = FanoutSink::new()
        .with_sink(Arc::new(TracingSink))
        .with_sink(events.clone());

    let manager = CircuitBreakerManager::builder()
        .with_sink(Arc::new(sink))
        .with_config(
            CircuitBreakerConfig::new("database")
                .with_failure_threshold(3)
                .with_success_threshold(2)
                .with_request_volume_threshold(0)
                .with_timeout(Duration::from_millis(500))
                .with_sleep_window(Duration::from_secs(2)),
        )
        .build()?;

    let database = manager.require("database")?;
    let backend = Arc::new(FlakyDatabase::default());

    println!("Breakers: {:?}", manager.names());
    println!("Database timeout: {:?}\n", database.config().timeout);

    backend.down.store(true, Ordering::SeqCst);
    println!("Database is down, sending requests...\n");

    for i in 1..=6 {
        let db = backend.clone();
        let result = database
            .execute(&CallContext::new().with_request_id(format!("req-{i}")), |ctx| async move {
                db.load_user(ctx, i).await
            })
            .await;

        match result {
            Ok(user) => println!("Request #{i}: loaded {user}"),
            Err(err) if err.is_rejection() => println!("Request #{i}: rejected ({err})"),
            Err(err) => println!("Request #{i}: failed ({err})"),
        }
    }

    let metrics = database.metrics();
    println!(
        "\nState = {}, {} requests, {} failures, {} rejected\n",
        database.state(),
        metrics.requests,
        metrics.failures,
        metrics.rejections
    );

    println!("=== Fallback ===\n");

    let db = backend.clone();
    let user = database
        .execute_with_fallback(
            &CallContext::new(),
            |ctx| async move { db.load_user(ctx, 7).await },
            |_, err| async move {
                println!("Primary unavailable ({}), serving cached user", err.kind());
                Ok("user-7 (cached)".to_string())
            },
        )
        .await?;
    println!("Got {user}\n");

    println!("=== Recovery ===\n");

    backend.down.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(2)).await;

    for i in 10..=12 {
        let db = backend.clone();
        let user = database
            .execute(&CallContext::new(), |ctx| async move { db.load_user(ctx, i).await })
            .await?;
        println!("Request #{i}: loaded {user}, state = {}", database.state());
    }

    println!("\nTransitions seen: {:?}", events.transitions());
    println!("\nStats:\n{}", serde_json::to_string_pretty(&manager.stats_json()?)?);

    println!("\n=== Example Complete ===");
    Ok(())
}
