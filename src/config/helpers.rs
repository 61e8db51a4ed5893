//! Shared serde helpers for configuration values.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Deserializes a [`Duration`] from a second count.
pub fn deserialize_duration_from_seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let seconds = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(seconds))
}
