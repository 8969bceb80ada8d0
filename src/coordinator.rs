//! Wires the static shard configuration to running processors.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::config::OutboxConfig;
use crate::error::{CloseError, ConfigurationError, Error, ProcessorError};
use crate::processing::{FailureHandler, IndexWriter};
use crate::processor::{ProcessorStats, ShardProcessor, WorkerPool};
use crate::sharding::ShardAssignment;
use crate::store::OutboxStore;

/// Runs one processor per locally assigned shard on a shared pool sized to
/// the number of local shards.
///
/// ## Example
///
/// ```ignore
/// let coordinator = OutboxCoordinator::new(
///     OutboxConfig::default().with_shards(4, [0, 1]),
///     Arc::new(store),
///     Arc::new(LogIndexWriter::new()),
///     Arc::new(LogFailureHandler::new()),
/// )?;
/// coordinator.start()?;
///
/// // on shutdown
/// coordinator.pre_stop().await;
/// coordinator.stop().await?;
/// ```
pub struct OutboxCoordinator<S: OutboxStore> {
    config: OutboxConfig,
    assignment: ShardAssignment,
    processors: Vec<Arc<ShardProcessor<S>>>,
    pool: Mutex<Option<WorkerPool>>,
}

impl<S: OutboxStore> OutboxCoordinator<S> {
    /// Validate `config` and build every local processor, without starting them.
    pub fn new(
        config: OutboxConfig,
        store: Arc<S>,
        writer: Arc<dyn IndexWriter>,
        failure_handler: Arc<dyn FailureHandler>,
    ) -> Result<Self, ConfigurationError> {
        let assignment = config.validate()?;
        let processors = assignment
            .assigned()
            .iter()
            .map(|&shard| {
                Ok(Arc::new(ShardProcessor::new(
                    shard,
                    assignment.filter_for(shard)?,
                    config.clone(),
                    Arc::clone(&store),
                    Arc::clone(&writer),
                    Arc::clone(&failure_handler),
                )))
            })
            .collect::<Result<Vec<_>, ConfigurationError>>()?;

        Ok(Self {
            config,
            assignment,
            processors,
            pool: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub fn assignment(&self) -> &ShardAssignment {
        &self.assignment
    }

    pub fn processors(&self) -> &[Arc<ShardProcessor<S>>] {
        &self.processors
    }

    /// Start every processor on the current tokio runtime.
    pub fn start(&self) -> Result<(), ProcessorError> {
        let mut slot = self.pool_slot();
        let pool = match slot.take() {
            Some(existing) if !existing.is_closed() => existing,
            _ => WorkerPool::current(self.processors.len())?,
        };
        *slot = Some(pool.clone());
        drop(slot);

        info!(
            total_shards = self.assignment.total(),
            local_shards = ?self.assignment.assigned(),
            "starting outbox coordinator"
        );
        for processor in &self.processors {
            processor.start(&pool);
        }
        Ok(())
    }

    /// Resolves once no processor has work in flight or immediately pending.
    pub fn completion(&self) -> impl Future<Output = ()> + Send + 'static {
        let pending: Vec<_> = self.processors.iter().map(|p| p.completion()).collect();
        async move {
            for processor in pending {
                processor.await;
            }
        }
    }

    /// Stop scheduling runs. Resolves once every run in flight has finished.
    pub fn pre_stop(&self) -> impl Future<Output = ()> + Send + 'static {
        let pending: Vec<_> = self.processors.iter().map(|p| p.pre_stop()).collect();
        async move {
            for processor in pending {
                processor.await;
            }
        }
    }

    /// Cancel every schedule and close the pool, reporting all failures at once.
    pub async fn stop(&self) -> Result<(), CloseError> {
        let mut closer = Closer::default();
        for processor in &self.processors {
            closer.record(processor.stop().await.map(|_| ()));
        }
        if let Some(pool) = self.pool_slot().take() {
            pool.close();
        }
        info!("stopped outbox coordinator");
        closer.finish()
    }

    /// Counters of every local processor, by shard.
    pub fn stats(&self) -> Vec<(u32, ProcessorStats)> {
        self.processors
            .iter()
            .map(|p| (p.shard(), p.stats()))
            .collect()
    }

    fn pool_slot(&self) -> std::sync::MutexGuard<'_, Option<WorkerPool>> {
        match self.pool.lock() {
            Ok(pool) => pool,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Collects close failures instead of stopping at the first one.
#[derive(Default)]
pub(crate) struct Closer {
    errors: Vec<Error>,
}

impl Closer {
    pub(crate) fn record<E: Into<Error>>(&mut self, result: Result<(), E>) {
        if let Err(err) = result {
            let err = err.into();
            warn!("failure while closing: {}", err);
            self.errors.push(err);
        }
    }

    pub(crate) fn finish(self) -> Result<(), CloseError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(CloseError::new(self.errors))
        }
    }
}
