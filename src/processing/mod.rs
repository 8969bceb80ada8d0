//! Batch processing: find, coalesce, dispatch, finalize.
//!
//! ## Separation of Concerns
//!
//! One run of a shard processor goes through two transactional phases:
//! 1. **Find and dispatch** - `EventFinder` locks a batch, `ProcessingPlan`
//!    coalesces it per entity and executes it through an `IndexWriter` while
//!    the locks are held
//! 2. **Update** - `EventUpdater` re-locks the same rows and deletes,
//!    retries, or reports them, possibly over several transactions

mod failure;
mod finder;
mod index_writer;
mod payload;
mod plan;
mod updater;

pub use failure::{DispatchFailure, EntityIndexingFailure, FailureHandler, LogFailureHandler};
pub use finder::{EventFinder, FindResult};
#[cfg(feature = "emitter")]
pub use index_writer::{EmitterIndexWriter, IndexedChange};
pub use index_writer::{IndexWriter, LogIndexWriter};
pub use payload::{ChangeKind, ChangePayload, EntityReference};
pub use plan::{DispatchReport, EntityWork, ProcessingPlan};
pub use updater::{EventUpdater, UpdateRound};
