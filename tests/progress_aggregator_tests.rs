//! Progress aggregation driven by raw JSON message bodies

use crawlsync::progress::{AggregatorConfig, ItemCache, ProgressAggregator};
use crawlsync::protocol::{ItemId, JobState};
use proptest::prelude::*;
use serde_json::json;

fn collection(work_id: i64, id: u64) -> serde_json::Value {
    json!({"type": "COLLECTION", "workId": work_id, "row": {"id": id, "url": format!("https://example.com/{id}")}})
}

#[test]
fn test_progress_then_collections_then_duplicate() {
    let mut aggregator = ProgressAggregator::default();
    aggregator
        .ingest_value(json!({"type": "PROGRESS", "workId": 7, "totalCount": 50}))
        .unwrap();

    for id in 1..=5 {
        aggregator.ingest_value(collection(7, id)).unwrap();
    }
    let record = aggregator.record(7).unwrap();
    assert_eq!(record.collect_count, 5);
    assert_eq!(record.progress, 10.0);
    assert_eq!(record.state, JobState::Running);

    let record = aggregator.ingest_value(collection(7, 3)).unwrap();
    assert_eq!(record.collect_count, 5);
    assert_eq!(record.progress, 10.0);
}

#[test]
fn test_complete_forces_full_progress_and_keeps_total() {
    let mut aggregator = ProgressAggregator::default();
    aggregator
        .ingest_value(json!({"type": "PROGRESS", "workId": 7, "totalCount": 50}))
        .unwrap();
    for id in 1..=5 {
        aggregator.ingest_value(collection(7, id)).unwrap();
    }

    let record = aggregator
        .ingest_value(json!({"type": "COMPLETE", "workId": 7}))
        .unwrap();
    assert_eq!(record.state, JobState::Complete);
    assert_eq!(record.progress, 100.0);
    assert_eq!(record.total_count, 50);
    assert_eq!(record.collect_count, 5);
    assert!(record.end_at.is_some());
}

#[test]
fn test_complete_is_terminal_until_reset() {
    let mut aggregator = ProgressAggregator::default();
    aggregator
        .ingest_value(json!({"type": "COMPLETE", "workId": 3, "endAt": "2024-05-01T10:00:00Z"}))
        .unwrap();

    let record = aggregator
        .ingest_value(json!({"type": "PROGRESS", "workId": 3, "totalCount": 10}))
        .unwrap();
    assert_eq!(record.state, JobState::Complete);
    assert_eq!(record.progress, 100.0);
    assert_eq!(record.end_at.as_deref(), Some("2024-05-01T10:00:00Z"));

    assert_eq!(aggregator.reset(Some(3)), 1);
    let record = aggregator
        .ingest_value(json!({"type": "PROGRESS", "workId": 3, "totalCount": 10}))
        .unwrap();
    assert_eq!(record.state, JobState::Running);
    assert_eq!(record.progress, 0.0);
}

#[test]
fn test_progress_overwrites_total_and_estimate_only() {
    let mut aggregator = ProgressAggregator::default();
    aggregator.ingest_value(collection(1, 1)).unwrap();
    aggregator
        .ingest_value(json!({"type": "FAILURE", "workId": 1, "failure": {"id": 2}}))
        .unwrap();

    let record = aggregator
        .ingest_value(json!({
            "type": "PROGRESS",
            "workId": 1,
            "totalCount": 4,
            "estimatedTime": "2024-05-01T12:00:00Z"
        }))
        .unwrap();
    assert_eq!(record.total_count, 4);
    assert_eq!(record.expect_end_at.as_deref(), Some("2024-05-01T12:00:00Z"));
    assert_eq!(record.collect_count, 1);
    assert_eq!(record.fail_count, 1);
    assert_eq!(record.progress, 25.0);
}

#[test]
fn test_failures_do_not_move_progress() {
    let mut aggregator = ProgressAggregator::default();
    aggregator
        .ingest_value(json!({"type": "PROGRESS", "workId": 2, "totalCount": 10}))
        .unwrap();
    let record = aggregator
        .ingest_value(json!({"type": "FAILURE", "workId": 2, "rows": [{"id": 1}, {"id": 2}, {"id": 2}]}))
        .unwrap();

    assert_eq!(record.fail_count, 2);
    assert_eq!(record.progress, 0.0);
    assert_eq!(aggregator.failed_items(2).len(), 2);
}

#[test]
fn test_batch_collection_counts_rows() {
    let mut aggregator = ProgressAggregator::default();
    aggregator
        .ingest_value(json!({"type": "PROGRESS", "workId": 4, "totalCount": 8}))
        .unwrap();
    let record = aggregator
        .ingest_value(json!({"type": "COLLECTION", "workId": 4, "rows": [{"id": "a"}, {"id": "b"}, {"title": "no id"}]}))
        .unwrap();

    assert_eq!(record.collect_count, 3);
    assert_eq!(record.progress, 37.5);
    // Rows without an id are counted but not cached
    assert_eq!(aggregator.collected_items(4).len(), 2);
}

#[test]
fn test_collect_update_snapshot_merges_with_record() {
    let mut aggregator = ProgressAggregator::default();
    let record = aggregator
        .ingest_value(json!({
            "type": "COLLECT_UPDATE",
            "workId": 9,
            "data": {"state": "RUNNING", "totalCount": 50, "collectCount": 10},
            "result": {"id": 11}
        }))
        .unwrap();

    assert_eq!(record.state, JobState::Running);
    assert_eq!(record.total_count, 50);
    assert_eq!(record.collect_count, 10);
    assert_eq!(record.progress, 20.0);

    // Stale snapshot never moves counts backwards
    let record = aggregator
        .ingest_value(json!({
            "type": "COLLECT_UPDATE",
            "workId": 9,
            "data": {"collectCount": 4}
        }))
        .unwrap();
    assert_eq!(record.collect_count, 10);

    let record = aggregator
        .ingest_value(json!({
            "type": "COLLECT_UPDATE",
            "workId": 9,
            "data": {"state": "COMPLETED", "endAt": "2024-05-01T13:00:00Z"}
        }))
        .unwrap();
    assert_eq!(record.state, JobState::Complete);
    assert_eq!(record.progress, 100.0);
    assert_eq!(record.end_at.as_deref(), Some("2024-05-01T13:00:00Z"));
}

#[test]
fn test_collect_update_progress_kept_until_total_known() {
    let mut aggregator = ProgressAggregator::default();
    let record = aggregator
        .ingest_value(json!({
            "type": "COLLECT_UPDATE",
            "workId": 3,
            "data": {"state": "RUNNING", "progress": 40.0}
        }))
        .unwrap();
    assert_eq!(record.state, JobState::Running);
    assert_eq!(record.total_count, 0);
    assert_eq!(record.progress, 40.0);

    let record = aggregator
        .ingest_value(json!({
            "type": "COLLECT_UPDATE",
            "workId": 3,
            "data": {"progress": 250}
        }))
        .unwrap();
    assert_eq!(record.progress, 100.0);

    let record = aggregator
        .ingest_value(json!({
            "type": "COLLECT_UPDATE",
            "workId": 3,
            "data": {"totalCount": 8, "collectCount": 2, "progress": 99.0}
        }))
        .unwrap();
    assert_eq!(record.progress, 25.0);
}

#[test]
fn test_records_are_independent_per_job() {
    let mut aggregator = ProgressAggregator::default();
    aggregator.ingest_value(collection(1, 1)).unwrap();
    aggregator.ingest_value(collection(2, 1)).unwrap();
    aggregator.ingest_value(collection(2, 2)).unwrap();

    assert_eq!(aggregator.len(), 2);
    assert_eq!(aggregator.record(1).unwrap().collect_count, 1);
    assert_eq!(aggregator.record(2).unwrap().collect_count, 2);

    let ids: Vec<i64> = aggregator.records().map(|record| record.work_id).collect();
    assert_eq!(ids, vec![1, 2]);

    assert_eq!(aggregator.reset(None), 2);
    assert!(aggregator.is_empty());
    assert!(aggregator.collected_items(2).is_empty());
}

#[test]
fn test_unknown_message_is_rejected_without_side_effects() {
    let mut aggregator = ProgressAggregator::default();
    assert!(aggregator
        .ingest_value(json!({"type": "HEARTBEAT", "workId": 1}))
        .is_err());
    assert!(aggregator.ingest_value(json!({"workId": 1})).is_err());
    assert!(aggregator.is_empty());
}

#[test]
fn test_cache_keeps_newest_thousand_items() {
    let mut aggregator = ProgressAggregator::default();
    for id in 0..1001 {
        aggregator.ingest_value(collection(5, id)).unwrap();
    }

    let items = aggregator.collected_items(5);
    assert_eq!(items.len(), 1000);
    assert_eq!(items[0].id, Some(ItemId::from(1u64)));
    assert_eq!(aggregator.record(5).unwrap().collect_count, 1001);

    // The evicted id is no longer recognized as a duplicate
    let record = aggregator.ingest_value(collection(5, 0)).unwrap();
    assert_eq!(record.collect_count, 1002);
    // A retained id still is
    let record = aggregator.ingest_value(collection(5, 500)).unwrap();
    assert_eq!(record.collect_count, 1002);
}

#[test]
fn test_item_cache_evicts_oldest_first() {
    let mut cache = ItemCache::new(ItemCache::DEFAULT_CAPACITY);
    for id in 0..1001u64 {
        cache.insert(ItemId::from(id), Default::default());
    }

    assert_eq!(cache.len(), 1000);
    assert!(!cache.contains(&ItemId::from(0u64)));
    assert!(cache.contains(&ItemId::from(1u64)));
    assert!(cache.contains(&ItemId::from(1000u64)));
}

#[test]
fn test_untracked_items_always_count() {
    let mut aggregator = ProgressAggregator::new(AggregatorConfig {
        track_items: false,
        ..AggregatorConfig::default()
    });
    aggregator.ingest_value(collection(6, 1)).unwrap();
    let record = aggregator.ingest_value(collection(6, 1)).unwrap();

    assert_eq!(record.collect_count, 2);
    assert!(aggregator.collected_items(6).is_empty());
}

proptest! {
    #[test]
    fn progress_stays_within_bounds(total in 0u64..200, collected in 0u64..400) {
        let mut aggregator = ProgressAggregator::default();
        aggregator
            .ingest_value(json!({"type": "PROGRESS", "workId": 1, "totalCount": total}))
            .unwrap();
        let rows: Vec<_> = (0..collected).map(|id| json!({"id": id})).collect();
        let record = aggregator
            .ingest_value(json!({"type": "COLLECTION", "workId": 1, "rows": rows}))
            .unwrap();

        prop_assert!(record.progress >= 0.0);
        prop_assert!(record.progress <= 100.0);
        prop_assert_eq!(record.collect_count, collected);
        if total > 0 && collected >= total {
            prop_assert_eq!(record.progress, 100.0);
        }
    }

    #[test]
    fn redelivery_never_double_counts(ids in proptest::collection::vec(0u64..50, 1..100)) {
        let mut aggregator = ProgressAggregator::default();
        for id in &ids {
            aggregator.ingest_value(collection(1, *id)).unwrap();
        }
        let distinct: std::collections::BTreeSet<_> = ids.iter().collect();
        prop_assert_eq!(aggregator.record(1).unwrap().collect_count, distinct.len() as u64);
    }
}
