// SPDX-License-Identifier: Apache-2.0

//! Process configuration, in the shape of the teacher's `aptos-config`
//! `NodeConfig`: one struct per subsystem, each with a sane `Default`, loaded
//! together from a single TOML file via `serde`.
//!
//! Every tunable here is explicitly a configuration knob, not an invariant
//! (spec.md §9: "Exact TTL for mempool batches, high-water marks, and
//! processor timeouts are configuration and not invariants").

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MerkleStateConfig {
    /// Byte prefix for trie node rows in the backing KV store.
    pub node_key_prefix: String,
}

impl Default for MerkleStateConfig {
    fn default() -> Self {
        Self {
            node_key_prefix: "s:".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockStoreConfig {
    pub block_key_prefix: String,
    pub number_key_prefix: String,
    pub metadata_key_prefix: String,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            block_key_prefix: "b:".to_string(),
            number_key_prefix: "n:".to_string(),
            metadata_key_prefix: "m:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum retries for a transient `InternalError` from a processor.
    pub max_processor_retries: u32,
    /// Deadline before a transaction with no available processor fails
    /// `NoProcessor`.
    pub processor_dispatch_deadline_ms: u64,
    /// Deadline for `Scheduler::finish` to wait for in-flight transactions.
    pub finish_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_processor_retries: 3,
            processor_dispatch_deadline_ms: 5_000,
            finish_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Request/response round-trip timeout (spec.md §6: "default ~30s").
    pub request_timeout_ms: u64,
    /// Heartbeat cadence (spec.md §6: "every 10s").
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before a worker is unregistered.
    pub missed_heartbeats_limit: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            missed_heartbeats_limit: 3,
        }
    }
}

impl ProcessorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Batch TTL in the pending pool.
    pub batch_ttl_secs: u64,
    /// Pool size above which `submit` returns `PoolFull`.
    pub pool_high_water_mark: usize,
    /// Wall-clock budget for assembling one candidate block.
    pub block_time_budget_ms: u64,
    /// Grace window with no new batches before the publisher finalizes an
    /// otherwise-idle block.
    pub idle_grace_window_ms: u64,
    /// Maximum batches per candidate block.
    pub max_batches_per_block: usize,
    /// Maximum cumulative transaction count per candidate block.
    pub max_transactions_per_block: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_ttl_secs: 300,
            pool_high_water_mark: 10_000,
            block_time_budget_ms: 2_000,
            idle_grace_window_ms: 100,
            max_batches_per_block: 500,
            max_transactions_per_block: 50_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainControllerConfig {
    /// Fixed-size pool of BlockValidator worker tasks (spec.md §5: "default
    /// small, e.g. 2-4").
    pub validator_worker_pool_size: usize,
    /// Bound on the candidate-tip work queue before it exerts backpressure.
    pub work_queue_capacity: usize,
}

impl Default for ChainControllerConfig {
    fn default() -> Self {
        Self {
            validator_worker_pool_size: 4,
            work_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Compact
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub format: LogFormat,
    pub default_level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            default_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub logger: LoggerConfig,
    pub merkle_state: MerkleStateConfig,
    pub block_store: BlockStoreConfig,
    pub scheduler: SchedulerConfig,
    pub processor: ProcessorConfig,
    pub publisher: PublisherConfig,
    pub chain_controller: ChainControllerConfig,
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config at {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let serialized = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, serialized)
            .with_context(|| format!("failed to write config at {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_toml() {
        let config = NodeConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        config.save(&path).unwrap();
        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "[scheduler]\nmax_processor_retries = 7\n").unwrap();
        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.scheduler.max_processor_retries, 7);
        assert_eq!(
            loaded.scheduler.finish_timeout_ms,
            SchedulerConfig::default().finish_timeout_ms
        );
    }
}
