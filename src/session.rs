//! Per-application sync session
//!
//! Owns the connection manager, subscription registry and progress
//! aggregator for one application session. Construct it once and pass it
//! by reference; nothing here is global.

use crate::config::SyncConfig;
use crate::connection::ConnectionManager;
use crate::progress::{self, ProgressRecord, SharedAggregator};
use crate::protocol::{DestinationBuilder, WorkId};
use crate::subscription::{SubscriptionHandle, SubscriptionRegistry};
use crate::transport::{Connector, EnvToken, StaticToken, TokenProvider, WsConnector};
use std::sync::{Arc, PoisonError};
use tracing::info;

pub struct SyncSession {
    url: String,
    connection: ConnectionManager,
    registry: SubscriptionRegistry,
    aggregator: SharedAggregator,
    destinations: DestinationBuilder,
}

impl SyncSession {
    /// Build a session over any connector
    pub fn new(
        config: &SyncConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let connection = ConnectionManager::new(connector, tokens, config.reconnect_config());
        let registry = SubscriptionRegistry::new(connection.clone());
        Self {
            url: config.broker.url.clone(),
            connection,
            registry,
            aggregator: progress::shared(config.aggregator_config()),
            destinations: DestinationBuilder::from(&config.destinations),
        }
    }

    /// Build a session that talks to the configured WebSocket broker
    pub fn from_config(config: &SyncConfig) -> Self {
        let tokens: Arc<dyn TokenProvider> = match &config.broker.token_env {
            Some(var) => Arc::new(EnvToken::new(var.clone())),
            None => Arc::new(StaticToken::none()),
        };
        Self::new(
            config,
            Arc::new(WsConnector::from_config(&config.broker)),
            tokens,
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn aggregator(&self) -> &SharedAggregator {
        &self.aggregator
    }

    pub fn destinations(&self) -> &DestinationBuilder {
        &self.destinations
    }

    pub fn connect(&self) {
        self.connection.connect(&self.url);
    }

    /// Manual reconnect after the automatic attempts gave up
    pub fn reconnect(&self) {
        self.connection.reconnect(&self.url);
    }

    /// Feed the per-user progress destination into the aggregator
    pub fn watch_user_feed(&self) -> Option<SubscriptionHandle> {
        self.watch(self.destinations.user_feed(), |_| {})
    }

    /// Feed one job's destination into the aggregator
    pub fn watch_job(&self, work_id: WorkId) -> Option<SubscriptionHandle> {
        self.watch(&self.destinations.job_feed(work_id), |_| {})
    }

    /// Feed `destination` into the aggregator, calling `on_update` with each
    /// updated record
    pub fn watch<F>(&self, destination: &str, on_update: F) -> Option<SubscriptionHandle>
    where
        F: Fn(&ProgressRecord) + Send + Sync + 'static,
    {
        self.registry.subscribe(
            destination,
            progress::feed_with(Arc::clone(&self.aggregator), on_update),
        )
    }

    /// Stop following a job and drop its record and item caches
    pub fn unwatch_job(&self, work_id: WorkId) -> bool {
        let unsubscribed = self.registry.unsubscribe(&self.destinations.job_feed(work_id));
        self.aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset(Some(work_id));
        unsubscribed
    }

    /// Jobs with a live per-job subscription, in ascending order
    pub fn watched_jobs(&self) -> Vec<WorkId> {
        let mut jobs: Vec<WorkId> = self
            .registry
            .destinations()
            .iter()
            .filter_map(|destination| self.destinations.parse_job_feed(destination))
            .collect();
        jobs.sort_unstable();
        jobs
    }

    /// Copy of the current record for a job
    pub fn snapshot(&self, work_id: WorkId) -> Option<ProgressRecord> {
        self.aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(work_id)
            .cloned()
    }

    /// Unsubscribe everything, disconnect and clear all progress state
    pub fn shutdown(&self) {
        let unsubscribed = self.registry.unsubscribe_all();
        self.connection.disconnect();
        let cleared = self
            .aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset(None);
        info!(unsubscribed, cleared, "Sync session shut down");
    }
}
