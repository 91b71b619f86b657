//! Mock implementations for testing
//!
//! [`MockConnector`] stands in for the WebSocket connector. Each accepted
//! connection yields a [`MockBroker`] that plays the broker side of the link:
//! it records frames the client sends and publishes MESSAGE frames back.

use crate::protocol::{Command, Frame};
use crate::subscription::SubscriptionHandle;
use crate::transport::{ConnectHeaders, Connector, Link, RemoteEnd, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// Scripted result of one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Accept,
    Refuse(String),
}

/// One recorded call to [`Connector::open`]
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub url: String,
    pub headers: ConnectHeaders,
    pub at: Instant,
}

#[derive(Debug)]
struct MockState {
    script: VecDeque<MockOutcome>,
    fallback: MockOutcome,
    attempts: Vec<ConnectAttempt>,
    brokers: VecDeque<MockBroker>,
}

/// Mock connector for testing
#[derive(Debug, Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::with_fallback(MockOutcome::Accept)
    }
}

impl MockConnector {
    /// Accepts every attempt
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses every attempt
    pub fn with_failure() -> Self {
        Self::with_fallback(MockOutcome::Refuse("broker unavailable".to_string()))
    }

    /// Plays `outcomes` in order, then accepts
    pub fn with_script(outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        let connector = Self::new();
        connector.lock().script.extend(outcomes);
        connector
    }

    fn with_fallback(fallback: MockOutcome) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                script: VecDeque::new(),
                fallback,
                attempts: Vec::new(),
                brokers: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_outcome(&self, outcome: MockOutcome) {
        self.lock().script.push_back(outcome);
    }

    /// Outcome used once the script is exhausted
    pub fn set_fallback(&self, outcome: MockOutcome) {
        self.lock().fallback = outcome;
    }

    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        self.lock().attempts.clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.lock().attempts.len()
    }

    /// Broker side of the oldest accepted connection not yet taken
    pub fn take_broker(&self) -> Option<MockBroker> {
        self.lock().brokers.pop_front()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, url: &str, headers: &ConnectHeaders) -> Result<Link, TransportError> {
        // Behave like a real connector: the attempt completes asynchronously
        tokio::task::yield_now().await;

        let mut state = self.lock();
        state.attempts.push(ConnectAttempt {
            url: url.to_string(),
            headers: headers.clone(),
            at: Instant::now(),
        });
        let outcome = state
            .script
            .pop_front()
            .unwrap_or_else(|| state.fallback.clone());

        match outcome {
            MockOutcome::Accept => {
                let (link, remote) = Link::channel();
                state.brokers.push_back(MockBroker::new(remote));
                Ok(link)
            }
            MockOutcome::Refuse(reason) => Err(TransportError::Rejected(reason)),
        }
    }
}

/// Broker side of one mock session. Dropping it closes the session.
#[derive(Debug)]
pub struct MockBroker {
    remote: RemoteEnd,
    next_message_id: AtomicU64,
}

impl MockBroker {
    fn new(remote: RemoteEnd) -> Self {
        Self {
            remote,
            next_message_id: AtomicU64::new(1),
        }
    }

    /// Push any frame to the client. Returns false once the client is gone.
    pub fn deliver(&self, frame: Frame) -> bool {
        self.remote.to_client.send(frame).is_ok()
    }

    /// Publish a MESSAGE frame with a raw body
    pub fn publish(&self, subscription_id: &str, destination: &str, body: &str) -> bool {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        self.deliver(Frame::message(
            subscription_id,
            destination,
            &message_id.to_string(),
            body,
        ))
    }

    /// Publish a JSON body to a subscription
    pub fn publish_json(&self, handle: &SubscriptionHandle, body: &Value) -> bool {
        self.publish(handle.id(), handle.destination(), &body.to_string())
    }

    /// Frames the client has sent so far
    pub fn received(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.remote.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Frames of one command the client has sent so far
    pub fn received_commands(&mut self, command: Command) -> Vec<Frame> {
        self.received()
            .into_iter()
            .filter(|frame| frame.command == command)
            .collect()
    }

    /// End the session from the broker side: an ERROR frame, then the
    /// socket goes away
    pub fn close(self, reason: &str) {
        self.deliver(Frame::new(Command::Error).with_header("message", reason));
    }
}
