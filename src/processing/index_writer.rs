use std::sync::{Arc, Mutex};

use base64::Engine;
use tracing::info;

use super::plan::EntityWork;
use crate::error::BoxError;

/// Applies coalesced entity changes to an index.
///
/// Delivery is at-least-once: after a crash between dispatch and delete the
/// same work is executed again, so implementations must be idempotent.
pub trait IndexWriter: Send + Sync {
    fn execute(&self, work: &EntityWork) -> Result<(), BoxError>;
}

impl<W: IndexWriter + ?Sized> IndexWriter for Arc<W> {
    fn execute(&self, work: &EntityWork) -> Result<(), BoxError> {
        (**self).execute(work)
    }
}

/// An index writer that logs every work item, or collects it into a buffer.
pub struct LogIndexWriter {
    buffer: Option<Arc<Mutex<Vec<String>>>>,
}

impl Default for LogIndexWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl LogIndexWriter {
    pub fn new() -> Self {
        LogIndexWriter { buffer: None }
    }

    pub fn with_buffer(buffer: Arc<Mutex<Vec<String>>>) -> Self {
        LogIndexWriter {
            buffer: Some(buffer),
        }
    }
}

impl IndexWriter for LogIndexWriter {
    fn execute(&self, work: &EntityWork) -> Result<(), BoxError> {
        let document = match std::str::from_utf8(&work.document) {
            Ok(text) => text.to_string(),
            Err(_) => base64::engine::general_purpose::STANDARD.encode(&work.document),
        };
        let line = format!("[INDEX] {} {} {}", work.kind, work.entity, document);
        if let Some(buffer) = &self.buffer {
            let mut buffer = buffer
                .lock()
                .map_err(|_| "log index writer buffer poisoned")?;
            buffer.push(line);
        } else {
            info!(events = ?work.event_ids, "{}", line);
        }
        Ok(())
    }
}

#[cfg(feature = "emitter")]
pub use emitter::{EmitterIndexWriter, IndexedChange};

#[cfg(feature = "emitter")]
mod emitter {
    use std::sync::Mutex;

    use event_emitter_rs::EventEmitter;
    use serde::{Deserialize, Serialize};

    use super::IndexWriter;
    use crate::error::BoxError;
    use crate::processing::plan::EntityWork;

    /// What in-process listeners receive for each executed work item.
    #[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
    pub struct IndexedChange {
        pub entity_id: String,
        pub kind: String,
        pub document: String,
    }

    /// An index writer that emits each work item on an `EventEmitter`,
    /// under the event name `"<entity_name>.<kind>"`.
    pub struct EmitterIndexWriter {
        emitter: Mutex<EventEmitter>,
    }

    impl EmitterIndexWriter {
        pub fn new(emitter: EventEmitter) -> Self {
            EmitterIndexWriter {
                emitter: Mutex::new(emitter),
            }
        }
    }

    impl IndexWriter for EmitterIndexWriter {
        fn execute(&self, work: &EntityWork) -> Result<(), BoxError> {
            let change = IndexedChange {
                entity_id: work.entity.entity_id.clone(),
                kind: work.kind.to_string(),
                document: String::from_utf8_lossy(&work.document).into_owned(),
            };
            let event = format!("{}.{}", work.entity.entity_name, work.kind);
            let mut emitter = self
                .emitter
                .lock()
                .map_err(|_| "index emitter poisoned")?;
            emitter.emit(&event, change);
            Ok(())
        }
    }
}
