//! Folds progress events into per-job records
//!
//! The aggregator is plain synchronous state with no networking; the
//! subscription layer feeds it through [`super::feed`], and tests drive it
//! directly.

use super::item_cache::{Insertion, ItemCache};
use super::record::ProgressRecord;
use crate::config::ProgressSection;
use crate::protocol::{
    CrawlRow, DecodeError, JobState, PartialAggregate, ProgressEvent, WorkId, decode_progress,
};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Aggregator settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Keep per-job item caches for duplicate suppression
    pub track_items: bool,
    pub item_cache_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            track_items: true,
            item_cache_capacity: ItemCache::DEFAULT_CAPACITY,
        }
    }
}

impl From<&ProgressSection> for AggregatorConfig {
    fn from(section: &ProgressSection) -> Self {
        Self {
            track_items: section.track_items,
            item_cache_capacity: section.item_cache_capacity,
        }
    }
}

#[derive(Debug)]
struct JobEntry {
    record: ProgressRecord,
    collected: Option<ItemCache>,
    failed: Option<ItemCache>,
}

impl JobEntry {
    fn new(work_id: WorkId, config: &AggregatorConfig) -> Self {
        let cache = || {
            config
                .track_items
                .then(|| ItemCache::new(config.item_cache_capacity))
        };
        Self {
            record: ProgressRecord::new(work_id),
            collected: cache(),
            failed: cache(),
        }
    }
}

/// In-memory progress state for every job seen since the last reset
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    config: AggregatorConfig,
    jobs: BTreeMap<WorkId, JobEntry>,
}

impl ProgressAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            jobs: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Apply one event and return the updated record
    pub fn ingest(&mut self, event: ProgressEvent) -> &ProgressRecord {
        let work_id = event.work_id();
        let kind = event.kind();
        let config = &self.config;
        let entry = self
            .jobs
            .entry(work_id)
            .or_insert_with(|| JobEntry::new(work_id, config));

        match event {
            ProgressEvent::Progress {
                total_count,
                expect_end_at,
                ..
            } => {
                entry.record.total_count = total_count;
                entry.record.expect_end_at = expect_end_at;
                entry.record.mark_running();
                entry.record.recompute_progress();
            }
            ProgressEvent::Collection { rows, .. } => {
                let added = admit(work_id, &mut entry.collected, rows);
                entry.record.collect_count = entry.record.collect_count.saturating_add(added);
                entry.record.mark_running();
                entry.record.recompute_progress();
            }
            ProgressEvent::Failure { rows, .. } => {
                let added = admit(work_id, &mut entry.failed, rows);
                entry.record.fail_count = entry.record.fail_count.saturating_add(added);
                entry.record.mark_running();
            }
            ProgressEvent::Complete { end_at, .. } => {
                let end_at = end_at
                    .or_else(|| entry.record.end_at.take())
                    .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
                entry.record.end_at = Some(end_at);
                entry.record.mark_complete();
            }
            ProgressEvent::Snapshot {
                aggregate, item, ..
            } => {
                let added = match item {
                    Some(row) => admit(work_id, &mut entry.collected, vec![row]),
                    None => 0,
                };
                merge_snapshot(&mut entry.record, aggregate, added);
            }
        }

        debug!(
            work_id,
            event = kind,
            state = %entry.record.state,
            collected = entry.record.collect_count,
            failed = entry.record.fail_count,
            total = entry.record.total_count,
            "Progress event applied"
        );
        &entry.record
    }

    /// Decode a JSON message body and ingest it
    pub fn ingest_value(&mut self, value: Value) -> Result<&ProgressRecord, DecodeError> {
        let event = decode_progress(value)?;
        Ok(self.ingest(event))
    }

    pub fn record(&self, work_id: WorkId) -> Option<&ProgressRecord> {
        self.jobs.get(&work_id).map(|entry| &entry.record)
    }

    /// All records ordered by work id
    pub fn records(&self) -> impl Iterator<Item = &ProgressRecord> {
        self.jobs.values().map(|entry| &entry.record)
    }

    /// Most recent collected rows of a job, oldest first
    pub fn collected_items(&self, work_id: WorkId) -> Vec<&CrawlRow> {
        self.jobs
            .get(&work_id)
            .and_then(|entry| entry.collected.as_ref())
            .map(|cache| cache.rows().collect())
            .unwrap_or_default()
    }

    pub fn failed_items(&self, work_id: WorkId) -> Vec<&CrawlRow> {
        self.jobs
            .get(&work_id)
            .and_then(|entry| entry.failed.as_ref())
            .map(|cache| cache.rows().collect())
            .unwrap_or_default()
    }

    /// Drop one job, or every job when `work_id` is `None`. Returns how
    /// many records were removed.
    pub fn reset(&mut self, work_id: Option<WorkId>) -> usize {
        match work_id {
            Some(work_id) => usize::from(self.jobs.remove(&work_id).is_some()),
            None => {
                let removed = self.jobs.len();
                self.jobs.clear();
                removed
            }
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Count rows not seen before. Rows without an id, or jobs without a cache,
/// always count.
fn admit(work_id: WorkId, cache: &mut Option<ItemCache>, rows: Vec<CrawlRow>) -> u64 {
    let mut added = 0u64;
    for row in rows {
        let (Some(cache), Some(id)) = (cache.as_mut(), row.id.clone()) else {
            added += 1;
            continue;
        };
        match cache.insert(id, row) {
            Insertion::Inserted { evicted } => {
                if let Some(evicted) = evicted {
                    trace!(work_id, %evicted, "Item evicted from cache");
                }
                added += 1;
            }
            Insertion::Duplicate => {
                debug!(work_id, "Duplicate item ignored");
            }
        }
    }
    added
}

/// Totals and timestamps overwrite and counts never move backwards. Progress
/// is recomputed from the counts, or taken from the snapshot while no total
/// is known.
fn merge_snapshot(record: &mut ProgressRecord, aggregate: PartialAggregate, item_added: u64) {
    let reported = aggregate.progress.filter(|p| p.is_finite());
    if let Some(total) = aggregate.total_count {
        record.total_count = total;
    }
    match aggregate.collect_count {
        Some(collected) => record.collect_count = record.collect_count.max(collected),
        None => record.collect_count = record.collect_count.saturating_add(item_added),
    }
    if let Some(failed) = aggregate.fail_count {
        record.fail_count = record.fail_count.max(failed);
    }
    if aggregate.expect_end_at.is_some() {
        record.expect_end_at = aggregate.expect_end_at;
    }
    if aggregate.end_at.is_some() {
        record.end_at = aggregate.end_at;
    }

    match aggregate.state {
        Some(JobState::Complete) => record.mark_complete(),
        Some(JobState::Pending) if record.state == JobState::Pending => {}
        _ => record.mark_running(),
    }
    match reported {
        Some(progress) if record.total_count == 0 && !record.is_complete() => {
            record.progress = progress.clamp(0.0, 100.0);
        }
        _ => record.recompute_progress(),
    }
}
