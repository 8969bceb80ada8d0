use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, trace, warn};

use super::pool::WorkerPool;
use super::singleton::{Rearm, SingletonTask, Status};
use crate::config::OutboxConfig;
use crate::error::{ProcessorError, StoreError};
use crate::processing::{
    DispatchReport, EventFinder, EventUpdater, FailureHandler, FindResult, IndexWriter,
    ProcessingPlan,
};
use crate::sharding::ShardFilter;
use crate::store::{in_transaction, OutboxStore};

/// Counters accumulated by a processor over its lifetime.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessorStats {
    pub runs: usize,
    /// Events deleted after a successful dispatch.
    pub events_processed: usize,
    pub events_retried: usize,
    /// Events deleted and reported after their last attempt.
    pub events_failed: usize,
    pub empty_polls: usize,
    pub lock_contentions: usize,
}

/// What a single run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The store was shut down; nothing was attempted.
    StoreClosed,
    Empty,
    Contended,
    Processed { events: usize },
}

impl RunOutcome {
    /// Runs that found nothing wait a polling interval before the next one.
    pub fn is_idle(&self) -> bool {
        matches!(self, RunOutcome::Empty | RunOutcome::Contended)
    }
}

enum FindPhase {
    Contended,
    Dispatched {
        event_ids: Vec<u64>,
        report: DispatchReport,
    },
}

/// Drains the events of one shard.
///
/// Each run locks a batch, dispatches its coalesced plan while the locks are
/// held, then finalizes the rows in follow-up transactions.
pub struct ShardProcessor<S: OutboxStore> {
    shard: u32,
    config: OutboxConfig,
    store: Arc<S>,
    writer: Arc<dyn IndexWriter>,
    failure_handler: Arc<dyn FailureHandler>,
    finder: EventFinder,
    stats: Mutex<ProcessorStats>,
    /// Failed attempts on rows an update phase had to leave behind.
    uncounted: Mutex<HashMap<u64, u32>>,
    task: SingletonTask,
}

impl<S: OutboxStore> ShardProcessor<S> {
    pub fn new(
        shard: u32,
        filter: ShardFilter,
        config: OutboxConfig,
        store: Arc<S>,
        writer: Arc<dyn IndexWriter>,
        failure_handler: Arc<dyn FailureHandler>,
    ) -> Self {
        Self {
            shard,
            finder: EventFinder::new(filter, config.batch_size),
            config,
            store,
            writer,
            failure_handler,
            stats: Mutex::new(ProcessorStats::default()),
            uncounted: Mutex::new(HashMap::new()),
            task: SingletonTask::new(format!("outbox-shard-{}", shard)),
        }
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }

    pub fn filter(&self) -> &ShardFilter {
        self.finder.filter()
    }

    pub fn status(&self) -> Status {
        self.task.status()
    }

    pub fn stats(&self) -> ProcessorStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Schedule runs on `pool` until stopped. The first run is immediate.
    pub fn start(self: &Arc<Self>, pool: &WorkerPool) {
        info!(shard = self.shard, filter = %self.finder.filter(), "starting outbox processor");
        let processor = Arc::clone(self);
        self.task
            .start(pool, self.config.polling_interval(), move |rearm: &Rearm| {
                processor.work(rearm)
            });
    }

    /// Stop scheduling runs; resolves once the run in flight has finished.
    pub fn pre_stop(&self) -> impl Future<Output = ()> + Send + 'static {
        info!(shard = self.shard, "pre-stopping outbox processor");
        self.task.pre_stop()
    }

    /// Resolves when the backlog visible to this processor has been drained.
    pub fn completion(&self) -> impl Future<Output = ()> + Send + 'static {
        self.task.completion()
    }

    pub async fn stop(&self) -> Result<ProcessorStats, ProcessorError> {
        self.task.stop().await?;
        let stats = self.stats();
        info!(
            shard = self.shard,
            runs = stats.runs,
            processed = stats.events_processed,
            failed = stats.events_failed,
            "stopped outbox processor"
        );
        Ok(stats)
    }

    /// Perform one run on the calling thread without scheduling a next one.
    pub fn poll(&self) -> Result<RunOutcome, ProcessorError> {
        self.run_batch(|| {})
    }

    fn work(&self, rearm: &Rearm) -> Result<(), ProcessorError> {
        let outcome = self.run_batch(|| rearm.immediately())?;
        if outcome.is_idle() {
            rearm.after(self.config.polling_interval());
        }
        Ok(())
    }

    /// `on_dispatched` is called as soon as a non-empty batch has been
    /// dispatched, before its rows are finalized.
    fn run_batch(&self, on_dispatched: impl FnOnce()) -> Result<RunOutcome, ProcessorError> {
        if self.store.is_closed() {
            debug!(shard = self.shard, "outbox store is closed, skipping run");
            return Ok(RunOutcome::StoreClosed);
        }

        let found = self.find_and_dispatch()?;
        let outcome = match found {
            None => {
                trace!(shard = self.shard, "no outbox events to process");
                self.record(|stats| stats.empty_polls += 1);
                RunOutcome::Empty
            }
            Some(FindPhase::Contended) => {
                self.record(|stats| stats.lock_contentions += 1);
                RunOutcome::Contended
            }
            Some(FindPhase::Dispatched { event_ids, report }) => {
                on_dispatched();
                let events = event_ids.len();
                debug!(
                    shard = self.shard,
                    events,
                    failed = report.failed_count(),
                    "dispatched outbox batch"
                );
                self.update(event_ids, &report)?;
                RunOutcome::Processed { events }
            }
        };

        self.record(|stats| stats.runs += 1);
        Ok(outcome)
    }

    fn find_and_dispatch(&self) -> Result<Option<FindPhase>, StoreError> {
        in_transaction(&*self.store, self.config.transaction_timeout(), |tx| {
            let events = match self.finder.find(tx)? {
                FindResult::LockContention => return Ok(Some(FindPhase::Contended)),
                FindResult::Batch(events) if events.is_empty() => return Ok(None),
                FindResult::Batch(events) => events,
            };

            // dispatch while the rows are still locked by this transaction
            let report = ProcessingPlan::build(&events).dispatch(&*self.writer);
            Ok(Some(FindPhase::Dispatched {
                event_ids: events.iter().map(|e| e.id).collect(),
                report,
            }))
        })
    }

    fn update(&self, event_ids: Vec<u64>, report: &DispatchReport) -> Result<(), StoreError> {
        let carried: HashMap<u64, u32> = {
            let uncounted = self.uncounted();
            event_ids
                .iter()
                .filter_map(|id| uncounted.get(id).map(|count| (*id, *count)))
                .collect()
        };
        let mut updater =
            EventUpdater::new(&self.finder, event_ids, report, self.config.max_retries)
                .with_uncounted_attempts(carried);

        let result = self.finalize(&mut updater);

        // a failed row left behind keeps its attempt for the next redelivery
        let unrecorded: Vec<u64> = updater.unresolved_failures().collect();
        if !unrecorded.is_empty() {
            let mut uncounted = self.uncounted();
            for id in unrecorded {
                *uncounted.entry(id).or_default() += 1;
            }
        }
        result
    }

    fn finalize(&self, updater: &mut EventUpdater<'_>) -> Result<(), StoreError> {
        let mut rounds = 0;

        while updater.has_pending() {
            if rounds == self.config.max_update_attempts {
                warn!(
                    shard = self.shard,
                    remaining = updater.pending().count(),
                    "outbox events could not be finalized, leaving them for redelivery"
                );
                break;
            }
            rounds += 1;

            let round = in_transaction(&*self.store, self.config.transaction_timeout(), |tx| {
                updater.stage(tx)
            })?;
            let progressed = round.resolved() > 0;
            self.record(|stats| {
                stats.events_processed += round.deleted.len();
                stats.events_retried += round.retried.len();
                stats.events_failed += round.exhausted.len();
            });
            if round.contended {
                self.record(|stats| stats.lock_contentions += 1);
            }
            {
                let mut uncounted = self.uncounted();
                for id in round.deleted.iter().chain(round.exhausted.iter().map(|f| &f.event_id)) {
                    uncounted.remove(id);
                }
            }
            updater.complete(round, &*self.failure_handler);

            if !progressed && updater.has_pending() {
                std::thread::sleep(self.config.update_retry_delay());
            }
        }
        Ok(())
    }

    fn uncounted(&self) -> MutexGuard<'_, HashMap<u64, u32>> {
        match self.uncounted.lock() {
            Ok(uncounted) => uncounted,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, update: impl FnOnce(&mut ProcessorStats)) {
        match self.stats.lock() {
            Ok(mut stats) => update(&mut stats),
            Err(poisoned) => update(&mut poisoned.into_inner()),
        }
    }
}
