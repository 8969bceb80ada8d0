//! Polling processor for a transactional outbox.
//!
//! Business writes insert `OutboxEvent` rows in the same transaction as the
//! change they describe. This crate drains those rows in the background:
//! each locally assigned shard locks a batch with skip-locked semantics,
//! coalesces it per entity, hands it to an `IndexWriter`, and then deletes,
//! retries, or reports every event.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod processing;
pub mod processor;
pub mod sharding;
pub mod store;

pub use config::OutboxConfig;
pub use coordinator::OutboxCoordinator;
pub use error::{
    BoxError, CloseError, ConfigurationError, Error, PayloadError, ProcessorError, Result,
    StoreError,
};
#[cfg(feature = "emitter")]
pub use processing::{EmitterIndexWriter, IndexedChange};
pub use processing::{
    ChangeKind, ChangePayload, DispatchFailure, DispatchReport, EntityIndexingFailure,
    EntityReference, EntityWork, EventFinder, EventUpdater, FailureHandler, FindResult,
    IndexWriter, LogFailureHandler, LogIndexWriter, ProcessingPlan, UpdateRound,
};
pub use processor::{ProcessorStats, RunOutcome, ShardProcessor, Status, WorkerPool};
pub use sharding::{entity_id_hash, HashRange, RangeTable, ShardAssignment, ShardFilter};
pub use store::{
    in_transaction, ForeignLock, InMemoryOutboxStore, InMemoryTransaction, NewOutboxEvent,
    OutboxEvent, OutboxStore, OutboxTransaction,
};

// Re-export the EventEmitter consumed by `EmitterIndexWriter`
#[cfg(feature = "emitter")]
pub use event_emitter_rs::EventEmitter;
