use std::collections::{BTreeSet, HashMap};

use tracing::{debug, trace};

use super::failure::{EntityIndexingFailure, FailureHandler};
use super::finder::{EventFinder, FindResult};
use super::plan::DispatchReport;
use crate::error::StoreError;
use crate::store::OutboxTransaction;

/// Changes staged by one update transaction. Only meaningful once that
/// transaction has committed.
#[derive(Debug, Default)]
pub struct UpdateRound {
    pub deleted: Vec<u64>,
    pub retried: Vec<u64>,
    pub exhausted: Vec<EntityIndexingFailure>,
    pub contended: bool,
}

impl UpdateRound {
    pub fn resolved(&self) -> usize {
        self.deleted.len() + self.retried.len() + self.exhausted.len()
    }
}

/// Finalizes a dispatched batch: deletes successes, bumps `retries` on
/// failures, and deletes and reports failures that ran out of attempts.
///
/// Rows may be locked elsewhere between dispatch and update, so one batch
/// can take several rounds; each round runs in its own transaction.
pub struct EventUpdater<'a> {
    finder: &'a EventFinder,
    report: &'a DispatchReport,
    pending: BTreeSet<u64>,
    max_retries: u32,
    uncounted: HashMap<u64, u32>,
}

impl<'a> EventUpdater<'a> {
    pub fn new(
        finder: &'a EventFinder,
        event_ids: impl IntoIterator<Item = u64>,
        report: &'a DispatchReport,
        max_retries: u32,
    ) -> Self {
        Self {
            finder,
            report,
            pending: event_ids.into_iter().collect(),
            max_retries,
            uncounted: HashMap::new(),
        }
    }

    /// Failed attempts that never reached a row's `retries` column, because
    /// an earlier update gave up on the row.
    pub fn with_uncounted_attempts(mut self, uncounted: HashMap<u64, u32>) -> Self {
        self.uncounted = uncounted;
        self
    }

    /// Pending events whose dispatch failed.
    pub fn unresolved_failures(&self) -> impl Iterator<Item = u64> + '_ {
        self.pending
            .iter()
            .copied()
            .filter(|id| self.report.failure(*id).is_some())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = u64> + '_ {
        self.pending.iter().copied()
    }

    /// Lock whatever pending rows are available and stage their outcome.
    pub fn stage<T: OutboxTransaction>(&self, tx: &mut T) -> Result<UpdateRound, StoreError> {
        let ids: Vec<u64> = self.pending.iter().copied().collect();
        let locked = match self.finder.find_by_ids(tx, &ids)? {
            FindResult::Batch(events) => events,
            FindResult::LockContention => {
                return Ok(UpdateRound {
                    contended: true,
                    ..UpdateRound::default()
                })
            }
        };

        let mut round = UpdateRound::default();
        for event in &locked {
            match self.report.failure(event.id) {
                None => round.deleted.push(event.id),
                Some(failure) => {
                    let uncounted = self.uncounted.get(&event.id).copied().unwrap_or(0);
                    let attempts = event.retries + uncounted + 1;
                    if attempts >= self.max_retries {
                        round.exhausted.push(EntityIndexingFailure::from_dispatch(
                            event.id, attempts, failure,
                        ));
                    } else {
                        trace!(event_id = event.id, attempts, "scheduling outbox event for retry");
                        round.retried.push(event.id);
                    }
                }
            }
        }

        tx.delete(&round.deleted)?;
        let exhausted: Vec<u64> = round.exhausted.iter().map(|f| f.event_id).collect();
        tx.delete(&exhausted)?;
        tx.increment_retries(&round.retried)?;
        Ok(round)
    }

    /// Record a committed round: its rows are settled and exhausted events
    /// are handed to `failure_handler`.
    pub fn complete(&mut self, round: UpdateRound, failure_handler: &dyn FailureHandler) {
        for id in round.deleted.iter().chain(&round.retried) {
            self.pending.remove(id);
        }
        if !round.retried.is_empty() {
            debug!(count = round.retried.len(), "outbox events left for retry");
        }
        for failure in round.exhausted {
            self.pending.remove(&failure.event_id);
            failure_handler.handle(failure);
        }
    }
}
