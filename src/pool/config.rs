//! Bounds and idle-reclamation policy of a [`ResourcePool`](super::ResourcePool).
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::time::Duration;

use super::PoolError;

const DEFAULT_MAX: usize = 10;
const DEFAULT_MIN: usize = 0;
const DEFAULT_IDLE_TIMEOUT_MILLIS: u64 = 5_000;
const DEFAULT_EVICTION_INTERVAL_MILLIS: u64 = 15_000;

/// Runtime configuration of a [`ResourcePool`](super::ResourcePool).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of live resources.
    pub max: usize,
    /// Number of live resources idle eviction never goes below.
    pub min: usize,
    /// How long a resource may sit in the idle set before it can be evicted.
    pub idle_timeout: Duration,
    /// How often the eviction task runs. `Duration::ZERO` disables it.
    pub eviction_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX,
            min: DEFAULT_MIN,
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MILLIS),
            eviction_interval: Duration::from_millis(DEFAULT_EVICTION_INTERVAL_MILLIS),
        }
    }
}

impl PoolConfig {
    pub(crate) fn validate(&self) -> Result<(), PoolError> {
        if self.max == 0 {
            return Err(PoolError::Config("`max` must be at least 1".into()));
        }
        if self.min > self.max {
            return Err(PoolError::Config(format!(
                "`min` ({}) cannot exceed `max` ({})",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Pool bounds as they come from configuration files or environment variables.
///
/// Numbers are accepted both as numbers and as strings, and every field falls back to its
/// default when missing.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PoolSettings {
    #[serde(default = "default_max", deserialize_with = "deserialize_number_from_string")]
    pub max: usize,
    #[serde(default = "default_min", deserialize_with = "deserialize_number_from_string")]
    pub min: usize,
    #[serde(
        default = "default_idle_timeout_millis",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub idle_timeout_millis: u64,
    #[serde(
        default = "default_eviction_interval_millis",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub eviction_interval_millis: u64,
}

fn default_max() -> usize {
    DEFAULT_MAX
}

fn default_min() -> usize {
    DEFAULT_MIN
}

fn default_idle_timeout_millis() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MILLIS
}

fn default_eviction_interval_millis() -> u64 {
    DEFAULT_EVICTION_INTERVAL_MILLIS
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX,
            min: DEFAULT_MIN,
            idle_timeout_millis: DEFAULT_IDLE_TIMEOUT_MILLIS,
            eviction_interval_millis: DEFAULT_EVICTION_INTERVAL_MILLIS,
        }
    }
}

impl From<PoolSettings> for PoolConfig {
    fn from(settings: PoolSettings) -> Self {
        Self {
            max: settings.max,
            min: settings.min,
            idle_timeout: Duration::from_millis(settings.idle_timeout_millis),
            eviction_interval: Duration::from_millis(settings.eviction_interval_millis),
        }
    }
}
