//! The dependencies every manager knows about out of the box.

use crate::circuit_breaker::CircuitBreakerConfig;

/// Passkey / WebAuthn provider.
pub const PASSKEY_PROVIDER: &str = "passkey_provider";

/// Primary database.
pub const DATABASE: &str = "database";

/// Message bus.
pub const MESSAGE_BUS: &str = "message_bus";

/// Returns the default configuration table.
///
/// The database fails fast with a tighter timeout and error threshold; the
/// message bus is the most lenient.
pub fn default_configs() -> Vec<CircuitBreakerConfig> {
    vec![
        CircuitBreakerConfig::new(PASSKEY_PROVIDER),
        CircuitBreakerConfig::strict(DATABASE),
        CircuitBreakerConfig::high_availability(MESSAGE_BUS),
    ]
}

/// Returns the default configuration for `name`, if it is a known dependency.
pub fn default_config(name: &str) -> Option<CircuitBreakerConfig> {
    default_configs()
        .into_iter()
        .find(|config| config.name == name)
}
