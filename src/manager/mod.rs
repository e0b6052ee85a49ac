//! Named circuit breakers, one per dependency.
//!
//! The `CircuitBreakerManager` owns the breakers, seeds them from a default
//! table or a TOML document, and exposes aggregate stats and reset for
//! operators.

pub mod defaults;
mod loader;
mod registry;

pub use loader::ManagerConfig;
pub use registry::{CircuitBreakerManager, CircuitBreakerManagerBuilder};
