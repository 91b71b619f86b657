//! Progress message types for the crawl progress feeds
//!
//! The broker publishes two envelope shapes. The event envelope carries one
//! of `PROGRESS`, `COLLECTION`, `FAILURE` or `COMPLETE`; the aggregate
//! envelope (`COLLECT_UPDATE`) carries a partial snapshot of a job. Both are
//! normalized here into a single [`ProgressEvent`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Crawl job identifier
pub type WorkId = i64;

/// Envelope type tags understood by [`decode_progress`]
pub const KNOWN_TYPES: [&str; 5] = [
    "PROGRESS",
    "COLLECTION",
    "FAILURE",
    "COMPLETE",
    "COLLECT_UPDATE",
];

/// Lifecycle of a crawl job as seen by the progress feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    #[default]
    Pending,
    Running,
    #[serde(alias = "COMPLETED")]
    Complete,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Complete => "COMPLETE",
        };
        f.write_str(label)
    }
}

/// Item identifier. The backend sends numbers or strings; both become a string key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawItemId", into = "String")]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for ItemId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawItemId {
    Number(serde_json::Number),
    Text(String),
}

impl From<RawItemId> for ItemId {
    fn from(raw: RawItemId) -> Self {
        match raw {
            RawItemId::Number(n) => Self(n.to_string()),
            RawItemId::Text(s) => Self(s),
        }
    }
}

/// One crawled item: an optional id plus whatever columns the crawler produced
///
/// # Examples
/// ```
/// use crawlsync::protocol::CrawlRow;
/// use serde_json::json;
///
/// let row: CrawlRow = serde_json::from_value(json!({"id": 3, "title": "Home"})).unwrap();
/// assert_eq!(row.id.as_ref().map(|id| id.as_str()), Some("3"));
/// assert_eq!(row.fields["title"], json!("Home"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ItemId>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CrawlRow {
    pub fn with_id(id: impl Into<ItemId>) -> Self {
        Self {
            id: Some(id.into()),
            fields: Map::new(),
        }
    }
}

/// Partial job aggregate carried by `COLLECT_UPDATE`; any field may be absent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialAggregate {
    #[serde(default)]
    pub state: Option<JobState>,
    #[serde(default)]
    pub total_count: Option<u64>,
    #[serde(default)]
    pub collect_count: Option<u64>,
    #[serde(default)]
    pub fail_count: Option<u64>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub expect_end_at: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub end_at: Option<String>,
}

/// Envelopes exactly as they appear on the wire
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum WireMessage {
    #[serde(rename = "PROGRESS", rename_all = "camelCase")]
    Progress {
        work_id: WorkId,
        #[serde(default)]
        total_count: u64,
        #[serde(default, deserialize_with = "lenient_text")]
        estimated_time: Option<String>,
    },
    #[serde(rename = "COLLECTION", rename_all = "camelCase")]
    Collection {
        work_id: WorkId,
        #[serde(default)]
        row: Option<CrawlRow>,
        #[serde(default)]
        rows: Option<Vec<CrawlRow>>,
    },
    #[serde(rename = "FAILURE", rename_all = "camelCase")]
    Failure {
        work_id: WorkId,
        #[serde(default)]
        failure: Option<CrawlRow>,
        #[serde(default)]
        rows: Option<Vec<CrawlRow>>,
    },
    #[serde(rename = "COMPLETE", rename_all = "camelCase")]
    Complete {
        work_id: WorkId,
        #[serde(default, deserialize_with = "lenient_text")]
        end_at: Option<String>,
    },
    #[serde(rename = "COLLECT_UPDATE", rename_all = "camelCase")]
    CollectUpdate {
        work_id: WorkId,
        #[serde(default)]
        data: PartialAggregate,
        #[serde(default, alias = "item")]
        result: Option<CrawlRow>,
    },
}

/// Normalized progress event consumed by the aggregator
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress {
        work_id: WorkId,
        total_count: u64,
        expect_end_at: Option<String>,
    },
    Collection {
        work_id: WorkId,
        rows: Vec<CrawlRow>,
    },
    Failure {
        work_id: WorkId,
        rows: Vec<CrawlRow>,
    },
    Complete {
        work_id: WorkId,
        end_at: Option<String>,
    },
    Snapshot {
        work_id: WorkId,
        aggregate: PartialAggregate,
        item: Option<CrawlRow>,
    },
}

impl ProgressEvent {
    pub fn work_id(&self) -> WorkId {
        match self {
            ProgressEvent::Progress { work_id, .. }
            | ProgressEvent::Collection { work_id, .. }
            | ProgressEvent::Failure { work_id, .. }
            | ProgressEvent::Complete { work_id, .. }
            | ProgressEvent::Snapshot { work_id, .. } => *work_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Collection { .. } => "collection",
            ProgressEvent::Failure { .. } => "failure",
            ProgressEvent::Complete { .. } => "complete",
            ProgressEvent::Snapshot { .. } => "snapshot",
        }
    }
}

impl From<WireMessage> for ProgressEvent {
    fn from(message: WireMessage) -> Self {
        match message {
            WireMessage::Progress {
                work_id,
                total_count,
                estimated_time,
            } => ProgressEvent::Progress {
                work_id,
                total_count,
                expect_end_at: estimated_time,
            },
            WireMessage::Collection { work_id, row, rows } => ProgressEvent::Collection {
                work_id,
                rows: batch(row, rows),
            },
            WireMessage::Failure {
                work_id,
                failure,
                rows,
            } => ProgressEvent::Failure {
                work_id,
                rows: batch(failure, rows),
            },
            WireMessage::Complete { work_id, end_at } => ProgressEvent::Complete { work_id, end_at },
            WireMessage::CollectUpdate {
                work_id,
                data,
                result,
            } => ProgressEvent::Snapshot {
                work_id,
                aggregate: data,
                item: result,
            },
        }
    }
}

/// A bare event without row payload still stands for one item
fn batch(single: Option<CrawlRow>, many: Option<Vec<CrawlRow>>) -> Vec<CrawlRow> {
    match (many, single) {
        (Some(rows), _) => rows,
        (None, Some(row)) => vec![row],
        (None, None) => vec![CrawlRow::default()],
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) => Some(text),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    })
}

/// Progress message decode errors
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Progress message is not a valid envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Progress message has no type field")]
    MissingType,
    #[error("Unknown progress message type: {0}")]
    UnknownType(String),
}

/// Decode a JSON body into a normalized event
pub fn decode_progress(value: Value) -> Result<ProgressEvent, DecodeError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;
    if !KNOWN_TYPES.contains(&kind) {
        return Err(DecodeError::UnknownType(kind.to_string()));
    }
    let message: WireMessage = serde_json::from_value(value)?;
    Ok(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_progress_message() {
        let event = decode_progress(json!({
            "type": "PROGRESS",
            "workId": 7,
            "totalCount": 50,
            "estimatedTime": "2024-05-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(
            event,
            ProgressEvent::Progress {
                work_id: 7,
                total_count: 50,
                expect_end_at: Some("2024-05-01T10:00:00Z".to_string()),
            }
        );
        assert_eq!(event.kind(), "progress");
    }

    #[test]
    fn test_numeric_estimated_time_is_kept_as_text() {
        let event = decode_progress(json!({
            "type": "PROGRESS", "workId": 1, "totalCount": 3, "estimatedTime": 120
        }))
        .unwrap();
        match event {
            ProgressEvent::Progress { expect_end_at, .. } => {
                assert_eq!(expect_end_at.as_deref(), Some("120"))
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_single_row_and_batch_collection() {
        let single = decode_progress(json!({
            "type": "COLLECTION", "workId": 7, "row": {"id": 1, "url": "https://a.example"}
        }))
        .unwrap();
        let ProgressEvent::Collection { rows, .. } = single else {
            panic!("expected collection");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, Some(ItemId::from("1")));
        assert_eq!(rows[0].fields["url"], json!("https://a.example"));

        let batch = decode_progress(json!({
            "type": "COLLECTION", "workId": 7, "rows": [{"id": "a"}, {"id": "b"}, {"id": 3}]
        }))
        .unwrap();
        let ProgressEvent::Collection { rows, .. } = batch else {
            panic!("expected collection");
        };
        let ids: Vec<_> = rows.iter().filter_map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![ItemId::from("a"), ItemId::from("b"), ItemId::from("3")]);
    }

    #[test]
    fn test_bare_collection_counts_as_one_anonymous_row() {
        let event = decode_progress(json!({"type": "COLLECTION", "workId": 9})).unwrap();
        assert_eq!(
            event,
            ProgressEvent::Collection {
                work_id: 9,
                rows: vec![CrawlRow::default()],
            }
        );
    }

    #[test]
    fn test_failure_uses_failure_field() {
        let event = decode_progress(json!({
            "type": "FAILURE", "workId": 2, "failure": {"id": 5, "reason": "timeout"}
        }))
        .unwrap();
        let ProgressEvent::Failure { work_id, rows } = event else {
            panic!("expected failure");
        };
        assert_eq!(work_id, 2);
        assert_eq!(rows[0].fields["reason"], json!("timeout"));
    }

    #[test]
    fn test_collect_update_normalizes_to_snapshot() {
        let event = decode_progress(json!({
            "type": "COLLECT_UPDATE",
            "workId": 4,
            "data": {"state": "RUNNING", "totalCount": 10, "collectCount": 3},
            "result": {"id": 77}
        }))
        .unwrap();

        let ProgressEvent::Snapshot {
            work_id,
            aggregate,
            item,
        } = event
        else {
            panic!("expected snapshot");
        };
        assert_eq!(work_id, 4);
        assert_eq!(aggregate.state, Some(JobState::Running));
        assert_eq!(aggregate.total_count, Some(10));
        assert_eq!(aggregate.collect_count, Some(3));
        assert_eq!(aggregate.fail_count, None);
        assert_eq!(item.and_then(|row| row.id), Some(ItemId::from("77")));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            decode_progress(json!({"workId": 1})),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(
            decode_progress(json!({"type": "PAUSED", "workId": 1})),
            Err(DecodeError::UnknownType(kind)) if kind == "PAUSED"
        ));
        assert!(matches!(
            decode_progress(json!({"type": "PROGRESS"})),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode_progress(json!("just a string")),
            Err(DecodeError::MissingType)
        ));
    }

    #[test]
    fn test_job_state_wire_names() {
        assert_eq!(serde_json::to_value(JobState::Running).unwrap(), json!("RUNNING"));
        let state: JobState = serde_json::from_value(json!("COMPLETED")).unwrap();
        assert_eq!(state, JobState::Complete);
        assert_eq!(JobState::default().to_string(), "PENDING");
    }
}
