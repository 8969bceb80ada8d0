//! Start, completion, pre-stop and stop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use outbox_polling::{
    BoxError, ChangePayload, EntityWork, IndexWriter, InMemoryOutboxStore, LogFailureHandler,
    OutboxCoordinator, Status,
};

use crate::support::{book, eventually, fast_config, seed_books, within, RecordingWriter};

/// Blocks every dispatch for a while and counts the ones that finished.
struct SlowWriter {
    delay: Duration,
    finished: AtomicUsize,
}

impl IndexWriter for SlowWriter {
    fn execute(&self, _work: &EntityWork) -> Result<(), BoxError> {
        std::thread::sleep(self.delay);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn coordinator_with(
    store: &InMemoryOutboxStore,
    writer: Arc<dyn IndexWriter>,
) -> OutboxCoordinator<InMemoryOutboxStore> {
    OutboxCoordinator::new(
        fast_config().with_batch_size(1),
        Arc::new(store.clone()),
        writer,
        Arc::new(LogFailureHandler::new()),
    )
    .unwrap()
}

// ============================================================================
// Pre-stop lets the batch in flight finish and schedules nothing after it
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn pre_stop_waits_for_the_batch_in_flight() {
    let store = InMemoryOutboxStore::new();
    seed_books(&store, 10);
    let writer = Arc::new(SlowWriter {
        delay: Duration::from_millis(50),
        finished: AtomicUsize::new(0),
    });
    let coordinator = coordinator_with(&store, writer.clone());

    coordinator.start().unwrap();
    eventually(|| store.locked_count() == 1).await;

    within(coordinator.pre_stop()).await;
    let finished = writer.finished.load(Ordering::SeqCst);
    assert!(finished >= 1);
    // the batch that was in flight is fully finalized
    assert_eq!(store.locked_count(), 0);
    assert_eq!(store.len(), 10 - finished);
    assert!(coordinator
        .processors()
        .iter()
        .all(|p| p.status() == Status::Stopped));

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(writer.finished.load(Ordering::SeqCst), finished);

    coordinator.stop().await.unwrap();
}

// ============================================================================
// Restarting after a pre-stop resumes draining
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn restart_after_pre_stop_resumes_draining() {
    let store = InMemoryOutboxStore::new();
    let writer = RecordingWriter::new();
    let coordinator = coordinator_with(&store, writer.clone());

    coordinator.start().unwrap();
    within(coordinator.pre_stop()).await;

    seed_books(&store, 3);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(store.len(), 3);

    coordinator.start().unwrap();
    within(coordinator.completion()).await;
    assert!(store.is_empty());

    within(coordinator.pre_stop()).await;
    coordinator.stop().await.unwrap();
}

// ============================================================================
// Stop without pre-stop, and stop of a never started coordinator
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn stop_returns_per_shard_stats() {
    let store = InMemoryOutboxStore::new();
    store.append(book("1", ChangePayload::add("x"))).unwrap();
    let writer = RecordingWriter::new();
    let coordinator = OutboxCoordinator::new(
        fast_config().with_shards(2, [0, 1]),
        Arc::new(store.clone()),
        writer.clone(),
        Arc::new(LogFailureHandler::new()),
    )
    .unwrap();

    coordinator.start().unwrap();
    eventually(|| store.is_empty()).await;
    coordinator.stop().await.unwrap();

    let stats = coordinator.stats();
    assert_eq!(stats.iter().map(|(shard, _)| *shard).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(
        stats.iter().map(|(_, s)| s.events_processed).sum::<usize>(),
        1
    );
}

#[tokio::test]
async fn never_started_coordinator_stops_cleanly() {
    let store = InMemoryOutboxStore::new();
    let coordinator = coordinator_with(&store, RecordingWriter::new());

    within(coordinator.completion()).await;
    within(coordinator.pre_stop()).await;
    coordinator.stop().await.unwrap();
}

// ============================================================================
// A closed store turns runs into no-ops
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn closed_store_stops_draining() {
    let store = InMemoryOutboxStore::new();
    store.close();
    seed_books(&store, 2);
    let writer = RecordingWriter::new();
    let coordinator = coordinator_with(&store, writer.clone());

    coordinator.start().unwrap();
    within(coordinator.completion()).await;

    assert_eq!(store.len(), 2);
    assert!(writer.executed().is_empty());
    within(coordinator.pre_stop()).await;
    coordinator.stop().await.unwrap();
}

// ============================================================================
// Restart after a hard stop never overlaps the run left executing
// ============================================================================

#[derive(Default)]
struct PeakWriter {
    active: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicUsize,
}

impl IndexWriter for PeakWriter {
    fn execute(&self, _work: &EntityWork) -> Result<(), BoxError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_after_stop_keeps_one_run_per_shard() {
    let store = InMemoryOutboxStore::new();
    seed_books(&store, 4);
    let writer = Arc::new(PeakWriter::default());
    let coordinator = coordinator_with(&store, writer.clone());

    coordinator.start().unwrap();
    eventually(|| writer.active.load(Ordering::SeqCst) == 1).await;
    coordinator.stop().await.unwrap();
    coordinator.start().unwrap();

    eventually(|| store.is_empty()).await;
    assert_eq!(writer.peak.load(Ordering::SeqCst), 1);

    within(coordinator.pre_stop()).await;
    coordinator.stop().await.unwrap();
}
