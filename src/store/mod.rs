//! Outbox store abstraction.
//!
//! Rows are inserted by the business write path, in the same transaction as
//! the change they describe. This crate only locks, deletes, and bumps the
//! `retries` column of existing rows.
//!
//! Coordination between processors (threads or nodes) happens exclusively
//! through row locks taken with *skip locked* semantics: a row locked by
//! another transaction is silently left out of a result instead of blocking.

mod in_memory;

pub use in_memory::{ForeignLock, InMemoryOutboxStore, InMemoryTransaction};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::sharding::{entity_id_hash, ShardFilter};

/// One pending change to propagate to the index.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct OutboxEvent {
    /// Monotonic surrogate key; defines processing order within a shard.
    pub id: u64,
    pub entity_name: String,
    pub entity_id: String,
    /// `entity_id_hash(entity_id)`, computed once by the producer.
    pub entity_id_hash: i32,
    /// Serialized change, opaque to the store.
    pub payload: Vec<u8>,
    /// Number of failed processing attempts so far.
    pub retries: u32,
}

/// A row as handed over by the producer, before the store assigns its id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOutboxEvent {
    pub entity_name: String,
    pub entity_id: String,
    pub entity_id_hash: i32,
    pub payload: Vec<u8>,
}

impl NewOutboxEvent {
    pub fn new(
        entity_name: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        let entity_id = entity_id.into();
        Self {
            entity_name: entity_name.into(),
            entity_id_hash: entity_id_hash(&entity_id),
            entity_id,
            payload,
        }
    }
}

/// A transactional datastore holding the outbox table.
pub trait OutboxStore: Send + Sync + 'static {
    type Transaction<'a>: OutboxTransaction
    where
        Self: 'a;

    /// Open a transaction. Dropping it without `commit` rolls it back and
    /// releases every lock it holds.
    fn begin(&self, timeout: Option<Duration>) -> Result<Self::Transaction<'_>, StoreError>;

    /// Whether the store has been shut down by its owner.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Operations available inside one outbox transaction.
pub trait OutboxTransaction {
    /// Lock and return up to `limit` rows matching `filter`, oldest id first,
    /// skipping rows locked by other transactions.
    ///
    /// Fails with `StoreError::LockTimeout` when the query as a whole cannot
    /// take its locks.
    fn find_and_lock(
        &mut self,
        filter: &ShardFilter,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Lock and return the rows with the given ids, in id order, skipping
    /// rows that are locked elsewhere or no longer exist.
    fn lock_by_ids(&mut self, ids: &[u64]) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Delete rows locked by this transaction. Returns how many were staged.
    fn delete(&mut self, ids: &[u64]) -> Result<usize, StoreError>;

    /// Add one to `retries` on rows locked by this transaction.
    fn increment_retries(&mut self, ids: &[u64]) -> Result<usize, StoreError>;

    fn commit(self) -> Result<(), StoreError>
    where
        Self: Sized;
}

/// Run `work` inside a transaction: commit on `Ok`, roll back on `Err` or unwind.
pub fn in_transaction<'s, S, T, F>(
    store: &'s S,
    timeout: Option<Duration>,
    work: F,
) -> Result<T, StoreError>
where
    S: OutboxStore,
    F: FnOnce(&mut S::Transaction<'s>) -> Result<T, StoreError>,
{
    let mut tx = store.begin(timeout)?;
    let value = work(&mut tx)?;
    tx.commit()?;
    Ok(value)
}
