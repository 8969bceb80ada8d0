use std::fmt;

use crate::error::ConfigurationError;

/// Lowest value of the hash domain (inclusive).
pub const HASH_DOMAIN_MIN: i64 = i32::MIN as i64;
/// Upper bound of the hash domain (exclusive).
pub const HASH_DOMAIN_END: i64 = i32::MAX as i64 + 1;

const DOMAIN_SIZE: u128 = (HASH_DOMAIN_END - HASH_DOMAIN_MIN) as u128;

/// Half-open range `[low, high)` of entity id hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashRange {
    low: i64,
    high: i64,
}

impl HashRange {
    /// The whole hash domain.
    pub const FULL: HashRange = HashRange {
        low: HASH_DOMAIN_MIN,
        high: HASH_DOMAIN_END,
    };

    pub fn low(&self) -> i64 {
        self.low
    }

    pub fn high(&self) -> i64 {
        self.high
    }

    pub fn contains(&self, hash: i32) -> bool {
        let hash = hash as i64;
        self.low <= hash && hash < self.high
    }

    pub fn len(&self) -> u64 {
        (self.high - self.low) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.high <= self.low
    }
}

impl fmt::Display for HashRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.low, self.high)
    }
}

/// Splits the hash domain into `size` contiguous, disjoint ranges.
///
/// Range `i` starts at `ceil(i * D / size)` from the bottom of the domain,
/// which keeps `shard_for_hash` a plain division.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeTable {
    size: u32,
}

impl RangeTable {
    pub fn new(size: i64) -> Result<Self, ConfigurationError> {
        if size <= 0 || size > u32::MAX as i64 {
            return Err(ConfigurationError::InvalidShardCount(size));
        }
        Ok(Self { size: size as u32 })
    }

    pub const fn single() -> Self {
        Self { size: 1 }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn range_for_shard(&self, index: u32) -> Result<HashRange, ConfigurationError> {
        if index >= self.size {
            return Err(ConfigurationError::ShardIndexOutOfRange {
                index: index as i64,
                total: self.size,
            });
        }
        Ok(HashRange {
            low: self.boundary(index),
            high: self.boundary(index + 1),
        })
    }

    pub fn shard_for_hash(&self, hash: i32) -> u32 {
        let offset = (hash as i64 - HASH_DOMAIN_MIN) as u128;
        (offset * self.size as u128 / DOMAIN_SIZE) as u32
    }

    pub fn ranges(&self) -> impl Iterator<Item = HashRange> + '_ {
        (0..self.size).map(move |i| HashRange {
            low: self.boundary(i),
            high: self.boundary(i + 1),
        })
    }

    fn boundary(&self, index: u32) -> i64 {
        let size = self.size as u128;
        let offset = (index as u128 * DOMAIN_SIZE + size - 1) / size;
        HASH_DOMAIN_MIN + offset as i64
    }
}
