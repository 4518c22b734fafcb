//! Configuration for the broker

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What happens to a consumer's pending records when it is removed
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerRemovalPolicy {
    /// Records stay pending under the departed name and are picked up by
    /// idle-based reclaim
    #[default]
    LeavePending,
    /// Records move to the named consumer immediately
    ReassignTo(String),
}

/// Configuration for a [`Broker`](crate::Broker)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Directory for the journal; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// Flush the journal after every write
    pub sync_writes: bool,
    /// Default handling of pending records on consumer removal
    pub removal_policy: ConsumerRemovalPolicy,
    /// Longest a blocking read may wait, in milliseconds
    pub max_block_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            sync_writes: true,
            removal_policy: ConsumerRemovalPolicy::default(),
            max_block_ms: 60_000,
        }
    }
}

impl BrokerConfig {
    /// Create a configuration journaling to `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Self::default()
        }
    }

    /// Set the journal sync policy
    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    /// Set the consumer removal policy
    pub fn with_removal_policy(mut self, policy: ConsumerRemovalPolicy) -> Self {
        self.removal_policy = policy;
        self
    }

    /// Set the blocking read ceiling
    pub fn with_max_block(mut self, max_block: Duration) -> Self {
        self.max_block_ms = u64::try_from(max_block.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Blocking read ceiling
    pub fn max_block(&self) -> Duration {
        Duration::from_millis(self.max_block_ms)
    }
}
