use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::trace;

use super::{NewOutboxEvent, OutboxEvent, OutboxStore, OutboxTransaction};
use crate::error::StoreError;
use crate::sharding::ShardFilter;

struct Row {
    event: OutboxEvent,
    locked_by: Option<u64>,
}

#[derive(Default)]
struct State {
    rows: BTreeMap<u64, Row>,
    next_id: u64,
    lock_failures: usize,
}

struct Shared {
    state: Mutex<State>,
    next_tx: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn state(&self, operation: &'static str) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Poisoned(operation))
    }

    /// Counters and cleanup keep working on a poisoned table.
    fn recovered_state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn release(&self, tx: u64) {
        let mut state = self.recovered_state();
        for row in state.rows.values_mut() {
            if row.locked_by == Some(tx) {
                row.locked_by = None;
            }
        }
    }
}

/// Outbox table held in memory, with row locks and skip-locked reads.
///
/// Cloning creates another handle to the same table, so a clone can play
/// the producer while the original is drained by processors.
///
/// ## Example
///
/// ```
/// use outbox_polling::{in_transaction, InMemoryOutboxStore, NewOutboxEvent, OutboxTransaction, ShardFilter};
///
/// let store = InMemoryOutboxStore::new();
/// store.append(NewOutboxEvent::new("Book", "1", vec![])).unwrap();
///
/// let batch = in_transaction(&store, None, |tx| tx.find_and_lock(&ShardFilter::All, 10)).unwrap();
/// assert_eq!(batch.len(), 1);
/// ```
#[derive(Clone)]
pub struct InMemoryOutboxStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_id: 1,
                    ..State::default()
                }),
                next_tx: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Insert one row, as the business write path would. Returns its id.
    pub fn append(&self, event: NewOutboxEvent) -> Result<u64, StoreError> {
        let ids = self.append_all(vec![event])?;
        Ok(ids[0])
    }

    /// Insert several rows atomically, in order.
    pub fn append_all(&self, events: Vec<NewOutboxEvent>) -> Result<Vec<u64>, StoreError> {
        let mut state = self.shared.state("append")?;
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            let id = state.next_id;
            state.next_id += 1;
            state.rows.insert(
                id,
                Row {
                    event: OutboxEvent {
                        id,
                        entity_name: event.entity_name,
                        entity_id: event.entity_id,
                        entity_id_hash: event.entity_id_hash,
                        payload: event.payload,
                        retries: 0,
                    },
                    locked_by: None,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    /// Committed rows, in id order.
    pub fn events(&self) -> Result<Vec<OutboxEvent>, StoreError> {
        let state = self.shared.state("events")?;
        Ok(state.rows.values().map(|row| row.event.clone()).collect())
    }

    pub fn get(&self, id: u64) -> Result<Option<OutboxEvent>, StoreError> {
        let state = self.shared.state("get")?;
        Ok(state.rows.get(&id).map(|row| row.event.clone()))
    }

    pub fn len(&self) -> usize {
        self.shared.recovered_state().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows currently locked by any transaction.
    pub fn locked_count(&self) -> usize {
        self.shared
            .recovered_state()
            .rows
            .values()
            .filter(|r| r.locked_by.is_some())
            .count()
    }

    /// Make the next `count` lock queries fail with `StoreError::LockTimeout`.
    pub fn fail_next_locks(&self, count: usize) {
        if let Ok(mut state) = self.shared.state("fail next locks") {
            state.lock_failures += count;
        }
    }

    /// Lock rows on behalf of a foreign transaction until the guard is dropped.
    ///
    /// Rows already locked elsewhere are left alone.
    pub fn lock_externally(&self, ids: &[u64]) -> Result<ForeignLock, StoreError> {
        let tx = self.shared.next_tx.fetch_add(1, Ordering::Relaxed);
        let mut state = self.shared.state("lock externally")?;
        for id in ids {
            if let Some(row) = state.rows.get_mut(id) {
                if row.locked_by.is_none() {
                    row.locked_by = Some(tx);
                }
            }
        }
        Ok(ForeignLock {
            shared: Arc::clone(&self.shared),
            tx,
        })
    }

    /// Refuse new work; processors turn their runs into no-ops.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

impl OutboxStore for InMemoryOutboxStore {
    type Transaction<'a> = InMemoryTransaction<'a>;

    fn begin(&self, timeout: Option<Duration>) -> Result<InMemoryTransaction<'_>, StoreError> {
        let id = self.shared.next_tx.fetch_add(1, Ordering::Relaxed);
        trace!(tx = id, "begin outbox transaction");
        Ok(InMemoryTransaction {
            shared: &self.shared,
            id,
            started: Instant::now(),
            timeout,
            deletes: BTreeSet::new(),
            retries: BTreeSet::new(),
            finished: false,
        })
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Locks held for a transaction that is not driven by this process.
pub struct ForeignLock {
    shared: Arc<Shared>,
    tx: u64,
}

impl ForeignLock {
    pub fn release(self) {}
}

impl Drop for ForeignLock {
    fn drop(&mut self) {
        self.shared.release(self.tx);
    }
}

/// Transaction over an `InMemoryOutboxStore`.
///
/// Deletes and retry increments are staged and applied on `commit`; locks
/// are released on commit and on drop.
pub struct InMemoryTransaction<'a> {
    shared: &'a Shared,
    id: u64,
    started: Instant,
    timeout: Option<Duration>,
    deletes: BTreeSet<u64>,
    retries: BTreeSet<u64>,
    finished: bool,
}

impl InMemoryTransaction<'_> {
    fn take_lock_failure(state: &mut State) -> Result<(), StoreError> {
        if state.lock_failures > 0 {
            state.lock_failures -= 1;
            return Err(StoreError::LockTimeout);
        }
        Ok(())
    }

    /// Lock the listed rows for writing. A row held by another transaction
    /// cannot be written without waiting for it, which this store reports
    /// as a lock timeout.
    fn lock_for_write(&self, state: &mut State, ids: &[u64]) -> Result<Vec<u64>, StoreError> {
        let mut staged = Vec::with_capacity(ids.len());
        for id in ids {
            if self.deletes.contains(id) {
                continue;
            }
            let Some(row) = state.rows.get_mut(id) else {
                continue;
            };
            match row.locked_by {
                Some(owner) if owner != self.id => return Err(StoreError::LockTimeout),
                _ => row.locked_by = Some(self.id),
            }
            staged.push(*id);
        }
        Ok(staged)
    }
}

impl OutboxTransaction for InMemoryTransaction<'_> {
    fn find_and_lock(
        &mut self,
        filter: &ShardFilter,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let shared = self.shared;
        let mut state = shared.state("find and lock")?;
        Self::take_lock_failure(&mut state)?;

        let mut found = Vec::new();
        for row in state.rows.values_mut() {
            if found.len() >= limit {
                break;
            }
            if self.deletes.contains(&row.event.id) || !filter.matches(row.event.entity_id_hash) {
                continue;
            }
            match row.locked_by {
                Some(owner) if owner != self.id => continue,
                _ => row.locked_by = Some(self.id),
            }
            found.push(row.event.clone());
        }
        Ok(found)
    }

    fn lock_by_ids(&mut self, ids: &[u64]) -> Result<Vec<OutboxEvent>, StoreError> {
        let shared = self.shared;
        let mut state = shared.state("lock by ids")?;
        Self::take_lock_failure(&mut state)?;

        let wanted: BTreeSet<u64> = ids.iter().copied().collect();
        let mut found = Vec::new();
        for id in wanted {
            if self.deletes.contains(&id) {
                continue;
            }
            let Some(row) = state.rows.get_mut(&id) else {
                continue;
            };
            match row.locked_by {
                Some(owner) if owner != self.id => continue,
                _ => row.locked_by = Some(self.id),
            }
            found.push(row.event.clone());
        }
        Ok(found)
    }

    fn delete(&mut self, ids: &[u64]) -> Result<usize, StoreError> {
        let shared = self.shared;
        let mut state = shared.state("delete")?;
        let staged = self.lock_for_write(&mut state, ids)?;
        for id in &staged {
            self.retries.remove(id);
            self.deletes.insert(*id);
        }
        Ok(staged.len())
    }

    fn increment_retries(&mut self, ids: &[u64]) -> Result<usize, StoreError> {
        let shared = self.shared;
        let mut state = shared.state("increment retries")?;
        let staged = self.lock_for_write(&mut state, ids)?;
        self.retries.extend(staged.iter().copied());
        Ok(staged.len())
    }

    fn commit(mut self) -> Result<(), StoreError> {
        if let Some(timeout) = self.timeout {
            if self.started.elapsed() > timeout {
                return Err(StoreError::TransactionTimeout(timeout));
            }
        }

        let shared = self.shared;
        let mut state = shared.state("commit")?;
        for id in &self.deletes {
            state.rows.remove(id);
        }
        for id in &self.retries {
            if let Some(row) = state.rows.get_mut(id) {
                row.event.retries += 1;
            }
        }
        for row in state.rows.values_mut() {
            if row.locked_by == Some(self.id) {
                row.locked_by = None;
            }
        }
        drop(state);

        trace!(
            tx = self.id,
            deleted = self.deletes.len(),
            retried = self.retries.len(),
            "commit outbox transaction"
        );
        self.finished = true;
        Ok(())
    }
}

impl Drop for InMemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            trace!(tx = self.id, "roll back outbox transaction");
            self.shared.release(self.id);
        }
    }
}
