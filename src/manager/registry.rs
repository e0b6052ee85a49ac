//! The circuit breaker registry.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::core::ConfigError;
use crate::manager::defaults;
use crate::manager::loader::ManagerConfig;
use crate::telemetry::{ArcSink, TracingSink};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Builder for creating a `CircuitBreakerManager`.
pub struct CircuitBreakerManagerBuilder {
    sink: ArcSink,
    include_defaults: bool,
    configs: Vec<CircuitBreakerConfig>,
}

impl CircuitBreakerManagerBuilder {
    /// Creates a new builder that seeds the default table and logs via `tracing`.
    pub fn new() -> Self {
        Self {
            sink: Arc::new(TracingSink),
            include_defaults: true,
            configs: Vec::new(),
        }
    }

    /// Sets the sink every breaker reports to.
    pub fn with_sink(mut self, sink: ArcSink) -> Self {
        self.sink = sink;
        self
    }

    /// Adds a breaker configuration, replacing any earlier one with the same name.
    pub fn with_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.configs.retain(|existing| existing.name != config.name);
        self.configs.push(config);
        self
    }

    /// Adds several breaker configurations.
    pub fn with_configs(self, configs: impl IntoIterator<Item = CircuitBreakerConfig>) -> Self {
        configs
            .into_iter()
            .fold(self, |builder, config| builder.with_config(config))
    }

    /// Skips the built-in dependency table.
    pub fn without_defaults(mut self) -> Self {
        self.include_defaults = false;
        self
    }

    /// Validates every configuration and builds the manager.
    pub fn build(self) -> Result<CircuitBreakerManager, ConfigError> {
        let table = ManagerConfig {
            include_defaults: self.include_defaults,
            breakers: self.configs,
        };
        table.validate()?;

        let mut breakers = HashMap::new();
        for config in table.resolved() {
            config.validate()?;
            let breaker = CircuitBreaker::with_sink(config, self.sink.clone());
            breakers.insert(breaker.name().to_string(), Arc::new(breaker));
        }

        tracing::debug!(breakers = breakers.len(), "Circuit breaker manager built");

        Ok(CircuitBreakerManager {
            breakers: RwLock::new(breakers),
            sink: self.sink,
        })
    }
}

impl Default for CircuitBreakerManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns one circuit breaker per named dependency.
///
/// The manager is built once and shared behind an `Arc`. Lookups hand out
/// `Arc<CircuitBreaker>` clones, so callers never hold the registry lock
/// while a call is in flight.
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    sink: ArcSink,
}

impl CircuitBreakerManager {
    /// Creates a manager seeded with the default dependency table.
    pub fn new(sink: ArcSink) -> Self {
        let breakers = defaults::default_configs()
            .into_iter()
            .map(|config| {
                let breaker = CircuitBreaker::with_sink(config, sink.clone());
                (breaker.name().to_string(), Arc::new(breaker))
            })
            .collect();

        Self {
            breakers: RwLock::new(breakers),
            sink,
        }
    }

    /// Creates a new builder.
    pub fn builder() -> CircuitBreakerManagerBuilder {
        CircuitBreakerManagerBuilder::new()
    }

    /// Creates a manager from a loaded configuration.
    pub fn from_config(config: ManagerConfig, sink: ArcSink) -> Result<Self, ConfigError> {
        let builder = Self::builder().with_sink(sink).with_configs(config.breakers);
        if config.include_defaults {
            builder.build()
        } else {
            builder.without_defaults().build()
        }
    }

    /// Installs a breaker under `name`, replacing any existing one.
    ///
    /// The configuration's name is set to `name`. A replaced breaker keeps
    /// working for callers that still hold it but is no longer reachable
    /// through the manager.
    pub fn add_circuit_breaker(
        &self,
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Arc<CircuitBreaker>, ConfigError> {
        let config = config.with_name(name);
        config.validate()?;

        let breaker = Arc::new(CircuitBreaker::with_sink(config, self.sink.clone()));
        let replaced = self
            .write()
            .insert(breaker.name().to_string(), breaker.clone())
            .is_some();

        tracing::info!(
            breaker = %breaker.name(),
            replaced = replaced,
            "Circuit breaker registered"
        );

        Ok(breaker)
    }

    /// Returns the breaker registered under `name`.
    pub fn get_circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.read().get(name).cloned()
    }

    /// Returns the breaker registered under `name`, or `UnknownBreaker`.
    pub fn require(&self, name: &str) -> Result<Arc<CircuitBreaker>, ConfigError> {
        self.get_circuit_breaker(name)
            .ok_or_else(|| ConfigError::UnknownBreaker {
                name: name.to_string(),
            })
    }

    /// Removes and returns the breaker registered under `name`.
    pub fn remove_circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let removed = self.write().remove(name);
        if removed.is_some() {
            tracing::info!(breaker = %name, "Circuit breaker removed");
        }
        removed
    }

    /// Returns the registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of registered breakers.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if no breakers are registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Returns a stats snapshot of every breaker, keyed by name.
    ///
    /// Each snapshot is consistent on its own; snapshots of different
    /// breakers are taken one after another.
    pub fn get_all_stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        self.snapshot()
            .into_iter()
            .map(|breaker| (breaker.name().to_string(), breaker.stats()))
            .collect()
    }

    /// Renders all stats as a JSON document for an operator endpoint.
    pub fn stats_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self.get_all_stats())
    }

    /// Resets every breaker.
    pub fn reset_all(&self) {
        let breakers = self.snapshot();
        for breaker in &breakers {
            breaker.reset();
        }
        tracing::info!(breakers = breakers.len(), "All circuit breakers reset");
    }

    /// Resets the breaker registered under `name`. Returns `false` if there is none.
    pub fn reset(&self, name: &str) -> bool {
        match self.get_circuit_breaker(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        self.read().values().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("breakers", &self.names())
            .field("sink", &self.sink)
            .finish()
    }
}
