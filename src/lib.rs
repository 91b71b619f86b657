//! crawlsync - real-time crawl progress synchronization
//!
//! A client for the crawl pipeline's progress broker. It keeps one STOMP
//! session open over a WebSocket, reconnects with bounded exponential
//! backoff, multiplexes per-job subscriptions over that session and folds
//! the incoming progress events into a bounded in-memory aggregate.
//!
//! # Overview
//!
//! - [`connection::ConnectionManager`] - one logical connection and its reconnect policy
//! - [`subscription::SubscriptionRegistry`] - at most one subscription per destination
//! - [`progress::ProgressAggregator`] - per-job progress records with duplicate suppression
//! - [`session::SyncSession`] - owns all three for one application session
//!
//! # Quick Start
//!
//! The aggregator needs no network and can be driven directly:
//!
//! ```rust
//! use crawlsync::progress::ProgressAggregator;
//! use crawlsync::protocol::JobState;
//! use serde_json::json;
//!
//! let mut aggregator = ProgressAggregator::default();
//! aggregator
//!     .ingest_value(json!({"type": "PROGRESS", "workId": 7, "totalCount": 50}))
//!     .unwrap();
//! let record = aggregator
//!     .ingest_value(json!({"type": "COLLECTION", "workId": 7, "rows": [{"id": 1}, {"id": 2}]}))
//!     .unwrap();
//!
//! assert_eq!(record.state, JobState::Running);
//! assert_eq!(record.collect_count, 2);
//! assert_eq!(record.progress, 4.0);
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod observability;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod subscription;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, SyncConfig};
pub use connection::{ConnectionManager, ConnectionState, ReconnectConfig};
pub use error::{SyncError, SyncResult};
pub use progress::{ProgressAggregator, ProgressRecord, SharedAggregator};
pub use protocol::{JobState, ProgressEvent, WorkId};
pub use session::SyncSession;
pub use subscription::{SubscriptionHandle, SubscriptionRegistry};
pub use transport::{Connector, TokenProvider, TransportError, WsConnector};
