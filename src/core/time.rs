//! Serde helpers for durations expressed in milliseconds.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// (De)serializes a `Duration` as an integer number of milliseconds.
pub mod duration_ms {
    use super::*;

    /// Serializes a duration as milliseconds.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    /// Deserializes milliseconds into a duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
