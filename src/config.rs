//! Static configuration of the outbox processors.
//!
//! Sources, lowest priority first:
//! 1. Default values
//! 2. An optional TOML file
//! 3. `OUTBOX__*` environment variables (`OUTBOX__ASSIGNED_SHARDS=0,2`)

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigurationError;
use crate::sharding::ShardAssignment;

pub const ENV_PREFIX: &str = "OUTBOX";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxConfig {
    /// Static number of shards. Unset means one shard without hash filtering.
    #[serde(default)]
    pub total_shard_count: Option<i64>,

    /// Shard indices processed by this node. Required iff `total_shard_count` is set.
    #[serde(default, deserialize_with = "shard_list")]
    pub assigned_shards: Vec<i64>,

    /// Pause after a run that found nothing to do
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Handed to the store when opening transactions
    #[serde(default)]
    pub transaction_timeout_ms: Option<u64>,

    /// Attempts before an event is deleted and reported
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause between update rounds while rows are locked elsewhere
    #[serde(default = "default_update_retry_delay_ms")]
    pub update_retry_delay_ms: u64,

    /// Update rounds before giving up on the remaining rows of a batch;
    /// those rows stay in the outbox and are processed again later.
    #[serde(default = "default_max_update_attempts")]
    pub max_update_attempts: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            total_shard_count: None,
            assigned_shards: Vec::new(),
            polling_interval_ms: default_polling_interval_ms(),
            batch_size: default_batch_size(),
            transaction_timeout_ms: None,
            max_retries: default_max_retries(),
            update_retry_delay_ms: default_update_retry_delay_ms(),
            max_update_attempts: default_max_update_attempts(),
        }
    }
}

/// Environment values arrive as one integer (`2`), a parsed list, or raw text (`"0,2"`).
#[derive(Deserialize)]
#[serde(untagged)]
enum ShardList {
    Many(Vec<i64>),
    One(i64),
    Text(String),
}

fn shard_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<i64>, D::Error> {
    match ShardList::deserialize(deserializer)? {
        ShardList::Many(shards) => Ok(shards),
        ShardList::One(shard) => Ok(vec![shard]),
        ShardList::Text(text) => text
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| part.parse::<i64>().map_err(serde::de::Error::custom))
            .collect(),
    }
}

fn default_polling_interval_ms() -> u64 {
    100
}
fn default_batch_size() -> usize {
    50
}
fn default_max_retries() -> u32 {
    3
}
fn default_update_retry_delay_ms() -> u64 {
    10
}
fn default_max_update_attempts() -> u32 {
    100
}

impl OutboxConfig {
    /// Load from an optional file, overlaid with `OUTBOX__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        Self::load_with_env(path, None)
    }

    fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigurationError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("assigned_shards")
                .try_parsing(true)
                .ignore_empty(true)
                .source(env),
        );

        let config: OutboxConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value and resolve the shard assignment.
    pub fn validate(&self) -> Result<ShardAssignment, ConfigurationError> {
        if self.batch_size == 0 {
            return Err(ConfigurationError::InvalidBatchSize);
        }
        if self.max_retries == 0 {
            return Err(ConfigurationError::InvalidMaxRetries);
        }
        match self.total_shard_count {
            None if self.assigned_shards.is_empty() => Ok(ShardAssignment::single()),
            None => Err(ConfigurationError::MissingTotalShardCount(
                self.assigned_shards.clone(),
            )),
            Some(total) => ShardAssignment::new(total, &self.assigned_shards),
        }
    }

    pub fn with_shards(mut self, total: i64, assigned: impl IntoIterator<Item = i64>) -> Self {
        self.total_shard_count = Some(total);
        self.assigned_shards = assigned.into_iter().collect();
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_update_retry_delay(mut self, delay: Duration) -> Self {
        self.update_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_update_attempts(mut self, attempts: u32) -> Self {
        self.max_update_attempts = attempts;
        self
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn transaction_timeout(&self) -> Option<Duration> {
        self.transaction_timeout_ms.map(Duration::from_millis)
    }

    pub fn update_retry_delay(&self) -> Duration {
        Duration::from_millis(self.update_retry_delay_ms)
    }
}
