//! Shared fixtures for the outbox integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use outbox_polling::{
    BoxError, ChangePayload, EntityIndexingFailure, EntityWork, IndexWriter, InMemoryOutboxStore,
    LogFailureHandler, NewOutboxEvent, OutboxConfig,
};

/// Install a test subscriber once; honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast polling so lifecycle tests settle quickly.
pub fn fast_config() -> OutboxConfig {
    OutboxConfig::default()
        .with_polling_interval(Duration::from_millis(5))
        .with_update_retry_delay(Duration::from_millis(1))
}

pub fn book(id: &str, payload: ChangePayload) -> NewOutboxEvent {
    NewOutboxEvent::new("Book", id, payload.encode().unwrap())
}

pub fn seed_books(store: &InMemoryOutboxStore, count: usize) {
    for i in 0..count {
        store
            .append(book(&format!("book-{}", i), ChangePayload::add(format!("v{}", i))))
            .unwrap();
    }
}

/// Records every executed work item and fails those on configured entities.
#[derive(Default)]
pub struct RecordingWriter {
    executed: Mutex<Vec<EntityWork>>,
    attempts: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(entity_ids: &[&str]) -> Arc<Self> {
        let writer = Self::default();
        writer
            .failing
            .lock()
            .unwrap()
            .extend(entity_ids.iter().map(|id| id.to_string()));
        Arc::new(writer)
    }

    pub fn heal(&self, entity_id: &str) {
        self.failing.lock().unwrap().remove(entity_id);
    }

    pub fn executed(&self) -> Vec<EntityWork> {
        self.executed.lock().unwrap().clone()
    }

    pub fn attempts(&self, entity_id: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(entity_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.executed()
            .into_iter()
            .map(|w| w.entity.entity_id)
            .collect()
    }
}

impl IndexWriter for RecordingWriter {
    fn execute(&self, work: &EntityWork) -> Result<(), BoxError> {
        self.executed.lock().unwrap().push(work.clone());
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(work.entity.entity_id.clone())
            .or_default() += 1;
        if self.failing.lock().unwrap().contains(&work.entity.entity_id) {
            return Err(format!("index rejected {}", work.entity).into());
        }
        Ok(())
    }
}

pub fn failure_buffer() -> (Arc<LogFailureHandler>, Arc<Mutex<Vec<EntityIndexingFailure>>>) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    (Arc::new(LogFailureHandler::with_buffer(buffer.clone())), buffer)
}

/// Await `future`, failing the test if it takes longer than five seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}
