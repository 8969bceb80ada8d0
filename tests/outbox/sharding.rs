//! Static sharding across processors and nodes.

use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, Barrier};

use outbox_polling::{
    entity_id_hash, ChangePayload, ConfigurationError, InMemoryOutboxStore, LogFailureHandler,
    OutboxConfig, OutboxCoordinator, OutboxStore, OutboxTransaction, RangeTable, ShardFilter,
};

use crate::support::{book, fast_config, init_tracing, within, RecordingWriter};

// ============================================================================
// Range table
// ============================================================================

#[test]
fn every_hash_belongs_to_exactly_one_shard() {
    for size in [1, 2, 3, 7, 16] {
        let table = RangeTable::new(size).unwrap();
        let ranges: Vec<_> = table.ranges().collect();
        let samples = [i32::MIN, -1, 0, 1, i32::MAX]
            .into_iter()
            .chain((0..500).map(|i| entity_id_hash(&format!("entity-{}", i))));

        for hash in samples {
            let owners: Vec<u32> = (0..size as u32)
                .filter(|&shard| ranges[shard as usize].contains(hash))
                .collect();
            assert_eq!(owners, vec![table.shard_for_hash(hash)], "hash {}", hash);
        }
    }
}

#[test]
fn hashes_are_stable_for_stored_rows() {
    // rows already written must keep routing to the same shard
    assert_eq!(entity_id_hash(""), 0);
    assert_eq!(entity_id_hash("abc"), 0xb3dd93fa_u32 as i32);
    assert_eq!(entity_id_hash("Hello, world!"), 0xc0363e43_u32 as i32);
}

// ============================================================================
// Skip-locked: concurrent finders never share a row
// ============================================================================

#[test]
fn concurrent_finders_return_disjoint_batches() {
    let store = InMemoryOutboxStore::new();
    for i in 0..60 {
        store
            .append(book(&i.to_string(), ChangePayload::add("x")))
            .unwrap();
    }
    let ready = Barrier::new(4);
    let found = Barrier::new(4);

    let batches: Vec<Vec<u64>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    let mut tx = store.begin(None).unwrap();
                    ready.wait();
                    let ids: Vec<u64> = tx
                        .find_and_lock(&ShardFilter::All, 20)
                        .unwrap()
                        .iter()
                        .map(|e| e.id)
                        .collect();
                    // keep the locks until every finder is done
                    found.wait();
                    ids
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen = HashSet::new();
    for batch in &batches {
        for id in batch {
            assert!(seen.insert(*id), "event {} returned twice", id);
        }
    }
    assert_eq!(seen.len(), 60);
}

// ============================================================================
// Two nodes splitting four shards
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn nodes_only_process_their_own_shards() {
    init_tracing();
    let store = InMemoryOutboxStore::new();
    let ids: Vec<String> = (0..80).map(|i| format!("order-{}", i)).collect();
    for id in &ids {
        store.append(book(id, ChangePayload::add("x"))).unwrap();
    }

    let node = |assigned: [i64; 2], writer: Arc<RecordingWriter>| {
        OutboxCoordinator::new(
            fast_config().with_shards(4, assigned).with_batch_size(5),
            Arc::new(store.clone()),
            writer,
            Arc::new(LogFailureHandler::new()),
        )
        .unwrap()
    };
    let left_writer = RecordingWriter::new();
    let right_writer = RecordingWriter::new();
    let left = node([0, 1], left_writer.clone());
    let right = node([2, 3], right_writer.clone());
    assert_eq!(left.processors().len(), 2);

    left.start().unwrap();
    right.start().unwrap();
    within(left.completion()).await;
    within(right.completion()).await;
    assert!(store.is_empty());

    let table = RangeTable::new(4).unwrap();
    for id in left_writer.entity_ids() {
        assert!(table.shard_for_hash(entity_id_hash(&id)) < 2, "{} on left", id);
    }
    for id in right_writer.entity_ids() {
        assert!(table.shard_for_hash(entity_id_hash(&id)) >= 2, "{} on right", id);
    }
    assert_eq!(
        left_writer.executed().len() + right_writer.executed().len(),
        ids.len()
    );

    for coordinator in [&left, &right] {
        within(coordinator.pre_stop()).await;
        coordinator.stop().await.unwrap();
    }
}

// ============================================================================
// Configuration errors fail fast
// ============================================================================

#[test]
fn loaded_shard_configuration_is_validated() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "total_shard_count = 3\nassigned_shards = [1, 3]").unwrap();

    assert!(matches!(
        OutboxConfig::load(Some(file.path())),
        Err(ConfigurationError::ShardIndexOutOfRange { index: 3, total: 3 })
    ));
}

#[test]
fn duplicate_and_missing_assignments_are_rejected() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let build = |config: OutboxConfig| {
        OutboxCoordinator::new(
            config,
            store.clone(),
            RecordingWriter::new(),
            Arc::new(LogFailureHandler::new()),
        )
        .err()
    };

    assert!(matches!(
        build(OutboxConfig::default().with_shards(4, [1, 1])),
        Some(ConfigurationError::DuplicateShardIndex(1))
    ));
    assert!(matches!(
        build(OutboxConfig::default().with_shards(4, [])),
        Some(ConfigurationError::MissingAssignedShards(4))
    ));
}
