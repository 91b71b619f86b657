//! Destination subscriptions multiplexed over the shared connection
//!
//! At most one subscription exists per canonical destination. The registry
//! listens on the connection manager: MESSAGE frames are routed to the
//! owning handler in arrival order, and every (re)open re-sends SUBSCRIBE for
//! all registered destinations with their original ids. Each entry remembers
//! the session it was last subscribed on, so no id is sent twice per session.
//!
//! Destinations are keyed by their canonical form, but SUBSCRIBE carries the
//! caller's destination (trimmed) so broker names without a leading slash
//! are subscribed as given.

use crate::connection::{ConnectionListener, ConnectionManager, SessionId};
use crate::protocol::{Command, Frame, canonicalize_destination};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Callback receiving decoded message bodies
pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Identifies one live subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: String,
    destination: String,
}

impl SubscriptionHandle {
    /// STOMP subscription id, `sub-<n>`
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Destination as sent to the broker
    pub fn destination(&self) -> &str {
        &self.destination
    }
}

struct Entry {
    handle: SubscriptionHandle,
    on_message: MessageHandler,
    sent_on: Option<SessionId>,
}

struct RegistryInner {
    connection: ConnectionManager,
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
}

/// Subscription registry over one [`ConnectionManager`]
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(connection: ConnectionManager) -> Self {
        let inner = Arc::new(RegistryInner {
            connection,
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });
        let listener: Arc<dyn ConnectionListener> = inner.clone();
        inner.connection.add_listener(Arc::downgrade(&listener));
        Self { inner }
    }

    /// Subscribe `on_message` to a destination.
    ///
    /// Returns `None` while the connection is not open. A destination that is
    /// already subscribed keeps its first handler and returns the same handle.
    pub fn subscribe<F>(&self, destination: &str, on_message: F) -> Option<SubscriptionHandle>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let destination = destination.trim();
        let key = canonicalize_destination(destination);
        let state = self.inner.connection.state();
        if !state.is_open() {
            warn!(%destination, %state, "Cannot subscribe while broker connection is not open");
            return None;
        }

        let mut entries = self.inner.lock_entries();
        if let Some(existing) = entries.get(&key) {
            debug!(%destination, id = existing.handle.id(), "Destination already subscribed");
            return Some(existing.handle.clone());
        }

        let id = format!("sub-{}", self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let session = match self
            .inner
            .connection
            .send(Frame::subscribe(&id, destination))
        {
            Ok(session) => session,
            Err(e) => {
                warn!(%destination, error = %e, "Failed to send SUBSCRIBE");
                return None;
            }
        };

        let handle = SubscriptionHandle {
            id,
            destination: destination.to_string(),
        };
        entries.insert(
            key,
            Entry {
                handle: handle.clone(),
                on_message: Arc::new(on_message),
                sent_on: Some(session),
            },
        );
        info!(%destination, id = handle.id(), "Subscribed");
        Some(handle)
    }

    /// Remove a subscription. Returns false if the destination was not subscribed.
    pub fn unsubscribe(&self, destination: &str) -> bool {
        let destination = canonicalize_destination(destination);
        let Some(entry) = self.inner.lock_entries().remove(&destination) else {
            debug!(%destination, "Unsubscribe for unknown destination ignored");
            return false;
        };

        if self.inner.connection.is_open() {
            if let Err(e) = self
                .inner
                .connection
                .send(Frame::unsubscribe(entry.handle.id()))
            {
                debug!(%destination, error = %e, "Failed to send UNSUBSCRIBE");
            }
        }
        info!(%destination, id = entry.handle.id(), "Unsubscribed");
        true
    }

    /// Remove every subscription
    pub fn unsubscribe_all(&self) -> usize {
        let destinations = self.destinations();
        destinations
            .iter()
            .filter(|destination| self.unsubscribe(destination))
            .count()
    }

    pub fn is_subscribed(&self, destination: &str) -> bool {
        self.inner
            .lock_entries()
            .contains_key(&canonicalize_destination(destination))
    }

    pub fn handle(&self, destination: &str) -> Option<SubscriptionHandle> {
        self.inner
            .lock_entries()
            .get(&canonicalize_destination(destination))
            .map(|entry| entry.handle.clone())
    }

    /// Subscribed destinations in sorted order
    pub fn destinations(&self) -> Vec<String> {
        let mut destinations: Vec<String> = self.inner.lock_entries().keys().cloned().collect();
        destinations.sort();
        destinations
    }

    pub fn len(&self) -> usize {
        self.inner.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegistryInner {
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Frames with a subscription header are matched by id only, so a frame
    /// for a cancelled subscription never reaches its successor
    fn route(&self, frame: &Frame) -> Option<(String, MessageHandler)> {
        let entries = self.lock_entries();
        let entry = match frame.header("subscription") {
            Some(id) => entries.values().find(|entry| entry.handle.id == id),
            None => frame
                .header("destination")
                .and_then(|destination| entries.get(&canonicalize_destination(destination))),
        }?;
        Some((
            entry.handle.destination.clone(),
            Arc::clone(&entry.on_message),
        ))
    }
}

impl ConnectionListener for RegistryInner {
    fn on_open(&self) {
        let mut entries = self.lock_entries();
        let current = self.connection.session_id();
        for entry in entries.values_mut() {
            let span = crate::subscription_span!(
                destination = %entry.handle.destination,
                id = %entry.handle.id
            );
            let _guard = span.enter();
            if current.is_some() && entry.sent_on == current {
                debug!("Already subscribed on this session");
                continue;
            }
            match self.connection.send(Frame::subscribe(
                entry.handle.id(),
                entry.handle.destination(),
            )) {
                Ok(session) => {
                    entry.sent_on = Some(session);
                    info!("Resubscribed after reconnect");
                }
                Err(e) => warn!(error = %e, "Failed to resubscribe"),
            }
        }
    }

    fn on_frame(&self, frame: &Frame) {
        if frame.command != Command::Message {
            return;
        }
        let Some((destination, on_message)) = self.route(frame) else {
            debug!(
                subscription = frame.header("subscription").unwrap_or(""),
                destination = frame.header("destination").unwrap_or(""),
                "MESSAGE for unknown subscription dropped"
            );
            return;
        };

        match serde_json::from_slice::<Value>(&frame.body) {
            Ok(body) => on_message(body),
            Err(e) => warn!(%destination, error = %e, "Dropping undecodable message body"),
        }
    }
}
