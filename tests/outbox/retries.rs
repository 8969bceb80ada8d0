//! Retry accounting and permanent failure reporting.

use std::sync::Arc;
use std::time::Duration;

use outbox_polling::{
    ChangePayload, InMemoryOutboxStore, OutboxConfig, OutboxCoordinator, RunOutcome, ShardFilter,
    ShardProcessor,
};

use crate::support::{
    book, failure_buffer, fast_config, init_tracing, seed_books, within, RecordingWriter,
};

// ============================================================================
// Retry bound: exactly max_retries attempts, then delete and report once
// ============================================================================

#[test]
fn poison_event_is_attempted_max_retries_times() {
    let store = InMemoryOutboxStore::new();
    store.append(book("poison", ChangePayload::add("x"))).unwrap();
    let writer = RecordingWriter::failing(&["poison"]);
    let (handler, failures) = failure_buffer();
    let processor = ShardProcessor::new(
        0,
        ShardFilter::All,
        OutboxConfig::default(),
        Arc::new(store.clone()),
        writer.clone(),
        handler,
    );

    for expected_retries in 1..3 {
        processor.poll().unwrap();
        assert_eq!(store.events().unwrap()[0].retries, expected_retries);
        assert!(failures.lock().unwrap().is_empty());
    }

    processor.poll().unwrap();
    assert!(store.is_empty());
    assert_eq!(processor.poll().unwrap(), RunOutcome::Empty);

    assert_eq!(writer.attempts("poison"), 3);
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].attempts, 3);
    assert_eq!(failures[0].entity.to_string(), "Book#poison");
    assert_eq!(failures[0].operation, "add Book#poison");
    assert_eq!(failures[0].cause.to_string(), "index rejected Book#poison");

    let stats = processor.stats();
    assert_eq!(stats.events_retried, 2);
    assert_eq!(stats.events_failed, 1);
}

#[test]
fn single_attempt_policy_reports_on_first_failure() {
    let store = InMemoryOutboxStore::new();
    store.append(book("poison", ChangePayload::update("x"))).unwrap();
    let writer = RecordingWriter::failing(&["poison"]);
    let (handler, failures) = failure_buffer();
    let processor = ShardProcessor::new(
        0,
        ShardFilter::All,
        OutboxConfig::default().with_max_retries(1),
        Arc::new(store.clone()),
        writer.clone(),
        handler,
    );

    processor.poll().unwrap();

    assert!(store.is_empty());
    assert_eq!(failures.lock().unwrap().len(), 1);
    assert_eq!(failures.lock().unwrap()[0].attempts, 1);
}

#[test]
fn recovered_entity_is_deleted_without_a_report() {
    let store = InMemoryOutboxStore::new();
    store.append(book("flaky", ChangePayload::add("x"))).unwrap();
    let writer = RecordingWriter::failing(&["flaky"]);
    let (handler, failures) = failure_buffer();
    let processor = ShardProcessor::new(
        0,
        ShardFilter::All,
        OutboxConfig::default(),
        Arc::new(store.clone()),
        writer.clone(),
        handler,
    );

    processor.poll().unwrap();
    writer.heal("flaky");
    processor.poll().unwrap();

    assert!(store.is_empty());
    assert!(failures.lock().unwrap().is_empty());
    assert_eq!(writer.attempts("flaky"), 2);
}

#[test]
fn undecodable_payload_follows_the_retry_policy() {
    let store = InMemoryOutboxStore::new();
    store
        .append(outbox_polling::NewOutboxEvent::new("Book", "garbled", Vec::new()))
        .unwrap();
    let writer = RecordingWriter::new();
    let (handler, failures) = failure_buffer();
    let processor = ShardProcessor::new(
        0,
        ShardFilter::All,
        OutboxConfig::default(),
        Arc::new(store.clone()),
        writer.clone(),
        handler,
    );

    for _ in 0..3 {
        processor.poll().unwrap();
    }

    assert!(store.is_empty());
    assert!(writer.executed().is_empty());
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].operation, "decode payload of Book#garbled");
}

// ============================================================================
// A poison event never blocks the rest of the pipeline
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn poison_event_does_not_block_other_entities() {
    init_tracing();
    let store = InMemoryOutboxStore::new();
    store.append(book("poison", ChangePayload::add("x"))).unwrap();
    seed_books(&store, 10);
    let writer = RecordingWriter::failing(&["poison"]);
    let (handler, failures) = failure_buffer();

    let coordinator = OutboxCoordinator::new(
        fast_config().with_batch_size(3),
        Arc::new(store.clone()),
        writer.clone(),
        handler,
    )
    .unwrap();
    coordinator.start().unwrap();
    within(coordinator.completion()).await;

    assert!(store.is_empty());
    assert_eq!(failures.lock().unwrap().len(), 1);
    assert_eq!(writer.attempts("poison"), 3);
    for i in 0..10 {
        assert_eq!(writer.attempts(&format!("book-{}", i)), 1);
    }

    // nothing is left to attempt a fourth time
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(writer.attempts("poison"), 3);

    within(coordinator.pre_stop()).await;
    coordinator.stop().await.unwrap();
}
