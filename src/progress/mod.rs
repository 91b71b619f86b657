//! Crawl progress aggregation
//!
//! [`ProgressAggregator`] folds a possibly duplicated, possibly out-of-order
//! stream of progress events into one [`ProgressRecord`] per job. The
//! [`feed`] adapters turn a shared aggregator into a subscription handler.

use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

pub mod aggregator;
pub mod item_cache;
pub mod record;

pub use aggregator::{AggregatorConfig, ProgressAggregator};
pub use item_cache::{Insertion, ItemCache};
pub use record::{ProgressRecord, compute_progress};

use crate::protocol::decode_progress;

/// Aggregator shared between the subscription handler and readers
pub type SharedAggregator = Arc<Mutex<ProgressAggregator>>;

pub fn shared(config: AggregatorConfig) -> SharedAggregator {
    Arc::new(Mutex::new(ProgressAggregator::new(config)))
}

/// Subscription handler that decodes each body and ingests it
pub fn feed(aggregator: SharedAggregator) -> impl Fn(Value) + Send + Sync + 'static {
    feed_with(aggregator, |_| {})
}

/// Like [`feed`], also passing every updated record to `on_update`.
/// `on_update` runs while the aggregator is locked.
pub fn feed_with<F>(aggregator: SharedAggregator, on_update: F) -> impl Fn(Value) + Send + Sync + 'static
where
    F: Fn(&ProgressRecord) + Send + Sync + 'static,
{
    move |body| {
        let event = match decode_progress(body) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable progress message");
                return;
            }
        };
        let mut guard = aggregator.lock().unwrap_or_else(PoisonError::into_inner);
        on_update(guard.ingest(event));
    }
}
