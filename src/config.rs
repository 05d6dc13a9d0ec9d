//! Store tuning.
//!
//! `StoreConfig` is plain data with serde support so a service embedding the
//! store can carry it in its own configuration file:
//!
//! ```toml
//! [topics]
//! shards = 64
//! capacity = 4096
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors, reported when a store is built.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("shard count must be at least 1")]
    ZeroShards,

    #[error("shard count must be a power of two, got {0}")]
    ShardsNotPowerOfTwo(usize),
}

/// Sizing for an `RcStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of independently locked shards. Must be a power of two.
    pub shards: usize,
    /// Total number of entries to preallocate, spread evenly over shards.
    pub capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shards: default_shard_amount(),
            capacity: 0,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards == 0 {
            return Err(ConfigError::ZeroShards);
        }
        if !self.shards.is_power_of_two() {
            return Err(ConfigError::ShardsNotPowerOfTwo(self.shards));
        }
        Ok(())
    }

    /// Initial capacity of each shard.
    pub(crate) fn shard_capacity(&self) -> usize {
        self.capacity.div_ceil(self.shards.max(1))
    }
}

/// Four shards per available core, rounded up to a power of two.
fn default_shard_amount() -> usize {
    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (parallelism * 4).next_power_of_two()
}
