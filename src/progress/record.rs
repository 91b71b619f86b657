//! Per-job progress record

use crate::protocol::{JobState, WorkId};
use serde::{Deserialize, Serialize};

/// Aggregated progress of one crawl job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub work_id: WorkId,
    pub state: JobState,
    pub total_count: u64,
    pub collect_count: u64,
    pub fail_count: u64,
    /// Percentage of collected items, always within `[0, 100]`
    pub progress: f64,
    pub expect_end_at: Option<String>,
    pub end_at: Option<String>,
}

impl ProgressRecord {
    pub fn new(work_id: WorkId) -> Self {
        Self {
            work_id,
            state: JobState::Pending,
            total_count: 0,
            collect_count: 0,
            fail_count: 0,
            progress: 0.0,
            expect_end_at: None,
            end_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == JobState::Complete
    }

    /// Items seen so far, successful or not
    pub fn processed_count(&self) -> u64 {
        self.collect_count.saturating_add(self.fail_count)
    }

    /// COMPLETE is terminal until the record is reset
    pub(crate) fn mark_running(&mut self) {
        if self.state != JobState::Complete {
            self.state = JobState::Running;
        }
    }

    pub(crate) fn mark_complete(&mut self) {
        self.state = JobState::Complete;
        self.progress = 100.0;
    }

    pub(crate) fn recompute_progress(&mut self) {
        self.progress = if self.is_complete() {
            100.0
        } else {
            compute_progress(self.collect_count, self.total_count)
        };
    }
}

/// `min(100, 100 * collected / total)`, or 0 when the total is unknown
pub fn compute_progress(collected: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (100.0 * collected as f64 / total as f64).min(100.0)
}
