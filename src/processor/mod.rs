//! Scheduling of shard processors.
//!
//! Every shard gets one `ShardProcessor` whose runs are driven by a
//! `SingletonTask`, so a shard never has two runs in flight. The runs of all
//! local shards share one bounded `WorkerPool`.

mod pool;
mod shard_processor;
mod singleton;

pub use pool::WorkerPool;
pub use shard_processor::{ProcessorStats, RunOutcome, ShardProcessor};
pub use singleton::{Rearm, SingletonTask, Status};
