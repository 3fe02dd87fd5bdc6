use std::collections::HashMap;
use std::time::Duration;

use garde::Validate;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;

/// Cache settings for a [`Registry`](crate::Registry), usually loaded as part of the server configuration.
///
/// ```json
/// { "maxCapacity": 50000, "timeToIdleSecs": 600, "capacityOverrides": { "posts": 200000 } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum number of cached models per collection.
    #[garde(range(min = 1))]
    pub max_capacity: u64,

    /// Drop models nobody has read or updated for this many seconds.
    #[garde(range(min = 1))]
    pub time_to_idle_secs: Option<u64>,

    /// Per-collection replacements of `max_capacity`.
    #[garde(custom(positive_capacities))]
    pub capacity_overrides: HashMap<String, u64>,
}

fn positive_capacities(overrides: &HashMap<String, u64>, _ctx: &()) -> garde::Result {
    match overrides.iter().find(|(_, capacity)| **capacity == 0) {
        Some((name, _)) => Err(garde::Error::new(format!("capacity of '{name}' must be at least 1"))),
        None => Ok(()),
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity:       10_000,
            time_to_idle_secs:  None,
            capacity_overrides: HashMap::new(),
        }
    }
}

impl CacheConfig {
    pub fn checked(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }

    pub fn capacity_for(&self, collection: &str) -> u64 {
        self.capacity_overrides
            .get(collection)
            .copied()
            .unwrap_or(self.max_capacity)
    }

    pub fn time_to_idle(&self) -> Option<Duration> {
        self.time_to_idle_secs.map(Duration::from_secs)
    }
}
