//! Static sharding of the outbox by entity id hash.
//!
//! The hash domain is split into `total` contiguous ranges; each locally
//! started processor owns one range and only drains events whose
//! `entity_id_hash` falls inside it. With a single shard no filter is applied.

mod hash;
mod range_table;

pub use hash::entity_id_hash;
pub use range_table::{HashRange, RangeTable, HASH_DOMAIN_END, HASH_DOMAIN_MIN};

use std::collections::BTreeSet;
use std::fmt;

use crate::error::ConfigurationError;

/// Restricts the rows a finder may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardFilter {
    /// Single-shard deployment: every row belongs to the processor.
    All,
    Range(HashRange),
}

impl ShardFilter {
    pub fn matches(&self, hash: i32) -> bool {
        match self {
            ShardFilter::All => true,
            ShardFilter::Range(range) => range.contains(hash),
        }
    }
}

impl fmt::Display for ShardFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardFilter::All => write!(f, "all"),
            ShardFilter::Range(range) => write!(f, "{}", range),
        }
    }
}

/// Validated static shard setup: the total count and the indices owned locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAssignment {
    table: RangeTable,
    assigned: Vec<u32>,
}

impl ShardAssignment {
    /// One shard, processed locally, without any hash filter.
    pub fn single() -> Self {
        Self {
            table: RangeTable::single(),
            assigned: vec![0],
        }
    }

    pub fn new(total: i64, assigned: &[i64]) -> Result<Self, ConfigurationError> {
        let table = RangeTable::new(total)?;
        if assigned.is_empty() {
            return Err(ConfigurationError::MissingAssignedShards(table.size()));
        }

        let mut seen = BTreeSet::new();
        for &index in assigned {
            if index < 0 || index >= table.size() as i64 {
                return Err(ConfigurationError::ShardIndexOutOfRange {
                    index,
                    total: table.size(),
                });
            }
            if !seen.insert(index as u32) {
                return Err(ConfigurationError::DuplicateShardIndex(index as u32));
            }
        }

        Ok(Self {
            table,
            assigned: seen.into_iter().collect(),
        })
    }

    pub fn total(&self) -> u32 {
        self.table.size()
    }

    /// Locally owned shard indices, ascending.
    pub fn assigned(&self) -> &[u32] {
        &self.assigned
    }

    pub fn table(&self) -> &RangeTable {
        &self.table
    }

    pub fn filter_for(&self, index: u32) -> Result<ShardFilter, ConfigurationError> {
        if self.table.size() == 1 {
            // still reject a bogus index
            self.table.range_for_shard(index)?;
            return Ok(ShardFilter::All);
        }
        Ok(ShardFilter::Range(self.table.range_for_shard(index)?))
    }
}
