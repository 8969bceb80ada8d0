use tracing::debug;

use crate::error::StoreError;
use crate::sharding::ShardFilter;
use crate::store::{OutboxEvent, OutboxTransaction};

/// Outcome of a lock query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindResult {
    Batch(Vec<OutboxEvent>),
    /// The query could not take its locks; try again on the next poll.
    LockContention,
}

impl FindResult {
    pub fn into_events(self) -> Vec<OutboxEvent> {
        match self {
            FindResult::Batch(events) => events,
            FindResult::LockContention => Vec::new(),
        }
    }

    pub fn is_contended(&self) -> bool {
        matches!(self, FindResult::LockContention)
    }
}

/// Locks the next batch of a shard's events, oldest first.
#[derive(Debug, Clone)]
pub struct EventFinder {
    filter: ShardFilter,
    batch_size: usize,
}

impl EventFinder {
    pub fn new(filter: ShardFilter, batch_size: usize) -> Self {
        Self { filter, batch_size }
    }

    pub fn filter(&self) -> &ShardFilter {
        &self.filter
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn find<T: OutboxTransaction>(&self, tx: &mut T) -> Result<FindResult, StoreError> {
        match tx.find_and_lock(&self.filter, self.batch_size) {
            Ok(events) => Ok(FindResult::Batch(events)),
            Err(err) if err.is_transient() => {
                debug!(filter = %self.filter, "outbox lock contention while finding events: {}", err);
                Ok(FindResult::LockContention)
            }
            Err(err) => Err(err),
        }
    }

    /// Re-lock already processed events by id.
    pub fn find_by_ids<T: OutboxTransaction>(
        &self,
        tx: &mut T,
        ids: &[u64],
    ) -> Result<FindResult, StoreError> {
        match tx.lock_by_ids(ids) {
            Ok(events) => Ok(FindResult::Batch(events)),
            Err(err) if err.is_transient() => {
                debug!(count = ids.len(), "outbox lock contention while re-locking events: {}", err);
                Ok(FindResult::LockContention)
            }
            Err(err) => Err(err),
        }
    }
}
