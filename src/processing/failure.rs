use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::error;

use super::payload::EntityReference;

/// Why an event could not be indexed.
#[derive(Clone, Debug)]
pub struct DispatchFailure {
    pub entity: EntityReference,
    /// What was being attempted, e.g. `"add Book#42"`.
    pub operation: String,
    pub cause: Arc<dyn StdError + Send + Sync>,
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.cause)
    }
}

/// An event that exhausted its retries. Its row has been deleted.
#[derive(Clone, Debug)]
pub struct EntityIndexingFailure {
    pub event_id: u64,
    pub entity: EntityReference,
    pub operation: String,
    pub cause: Arc<dyn StdError + Send + Sync>,
    /// Total processing attempts, the failed last one included.
    pub attempts: u32,
}

impl EntityIndexingFailure {
    pub(crate) fn from_dispatch(event_id: u64, attempts: u32, failure: &DispatchFailure) -> Self {
        Self {
            event_id,
            entity: failure.entity.clone(),
            operation: failure.operation.clone(),
            cause: Arc::clone(&failure.cause),
            attempts,
        }
    }
}

impl fmt::Display for EntityIndexingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event {} for {}: {} failed after {} attempt(s): {}",
            self.event_id, self.entity, self.operation, self.attempts, self.cause
        )
    }
}

/// Receives events that will never be retried again.
///
/// Expected to log or alert; the event row is already gone.
pub trait FailureHandler: Send + Sync {
    fn handle(&self, failure: EntityIndexingFailure);
}

impl<H: FailureHandler + ?Sized> FailureHandler for Arc<H> {
    fn handle(&self, failure: EntityIndexingFailure) {
        (**self).handle(failure)
    }
}

/// Logs failures at error level, or collects them into a buffer.
pub struct LogFailureHandler {
    buffer: Option<Arc<Mutex<Vec<EntityIndexingFailure>>>>,
}

impl Default for LogFailureHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl LogFailureHandler {
    pub fn new() -> Self {
        LogFailureHandler { buffer: None }
    }

    pub fn with_buffer(buffer: Arc<Mutex<Vec<EntityIndexingFailure>>>) -> Self {
        LogFailureHandler {
            buffer: Some(buffer),
        }
    }
}

impl FailureHandler for LogFailureHandler {
    fn handle(&self, failure: EntityIndexingFailure) {
        error!(
            event_id = failure.event_id,
            entity = %failure.entity,
            attempts = failure.attempts,
            "giving up on outbox event: {}",
            failure
        );
        if let Some(buffer) = &self.buffer {
            match buffer.lock() {
                Ok(mut buffer) => buffer.push(failure),
                Err(poisoned) => poisoned.into_inner().push(failure),
            }
        }
    }
}
