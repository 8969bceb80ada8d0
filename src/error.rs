//! Error taxonomy for outbox processing.
//!
//! Four categories matter operationally:
//! - transient lock contention (`StoreError::LockTimeout`), retried on the next poll
//! - transient processing failures, recorded as retries on the event row
//! - permanent processing failures, reported through a `FailureHandler`
//! - configuration errors, fatal at startup

use std::error::Error as StdError;
use std::fmt;

use tokio::runtime::TryCurrentError;
use tokio::task::JoinError;

/// Boxed error returned by external collaborators (index writers, store backends).
pub type BoxError = Box<dyn StdError + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigurationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error(transparent)]
    Close(#[from] CloseError),
}

/// Invalid static configuration. Never recovered: startup fails.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("total shard count must be strictly positive, got {0}")]
    InvalidShardCount(i64),

    #[error("assigned shard {index} is outside of [0, {total})")]
    ShardIndexOutOfRange { index: i64, total: u32 },

    #[error("shard {0} is assigned more than once")]
    DuplicateShardIndex(u32),

    #[error("total shard count is {0} but no shard is assigned to this node")]
    MissingAssignedShards(u32),

    #[error("assigned shards {0:?} were given without a total shard count")]
    MissingTotalShardCount(Vec<i64>),

    #[error("batch size must be strictly positive")]
    InvalidBatchSize,

    #[error("max retries must be strictly positive")]
    InvalidMaxRetries,

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Failures raised by an `OutboxStore` or one of its transactions.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The lock query itself could not acquire its locks in time.
    #[error("lock acquisition timed out")]
    LockTimeout,

    #[error("transaction exceeded its timeout of {0:?}")]
    TransactionTimeout(std::time::Duration),

    #[error("store lock poisoned during {0}")]
    Poisoned(&'static str),

    #[error("store backend error: {0}")]
    Backend(BoxError),
}

impl StoreError {
    /// Lock exhaustion is operational noise: the rows are picked up again on the next poll.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::LockTimeout)
    }
}

/// The serialized change carried by an outbox row could not be decoded.
#[derive(Debug, thiserror::Error)]
#[error("undecodable outbox payload: {0}")]
pub struct PayloadError(#[from] pub bitcode::Error);

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A run panicked or was cancelled before completing.
    #[error("processor run did not complete: {0}")]
    Task(#[from] JoinError),

    #[error("worker pool is closed")]
    PoolClosed,

    #[error("processors must be started from within a tokio runtime: {0}")]
    NoRuntime(#[from] TryCurrentError),
}

/// Every failure collected while closing a set of resources.
#[derive(Debug)]
pub struct CloseError {
    errors: Vec<Error>,
}

impl CloseError {
    pub(crate) fn new(errors: Vec<Error>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<Error> {
        self.errors
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure(s) while closing", self.errors.len())?;
        for err in &self.errors {
            write!(f, "; {}", err)?;
        }
        Ok(())
    }
}

impl StdError for CloseError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.errors.first().map(|e| e as &(dyn StdError + 'static))
    }
}
