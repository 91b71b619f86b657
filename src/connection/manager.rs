//! Connection manager: one logical broker connection with bounded reconnection
//!
//! Public operations never block. `connect` spawns the attempt, a failed
//! attempt (or a dropped session) schedules exactly one backoff timer, and
//! an inbound reader task forwards frames to registered listeners in arrival
//! order. Every attempt carries a generation number so results that arrive
//! after `disconnect` or a newer `connect` are discarded.

use super::state::{
    ConnectionState, ReconnectConfig, ReconnectPolicy, ReconnectStatus, ReconnectionDecision,
    log_state_transition,
};
use crate::error::redact_secrets;
use crate::protocol::{Command, Frame};
use crate::transport::{ConnectHeaders, Connector, Link, TokenProvider, TransportError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

/// Identifies one established broker session. A reconnect yields a new id.
pub type SessionId = u64;

/// Receives connection events. Callbacks run on runtime tasks with no
/// manager lock held, so they may call back into the manager.
pub trait ConnectionListener: Send + Sync {
    fn on_open(&self) {}
    fn on_frame(&self, frame: &Frame);
    fn on_closed(&self) {}
}

/// Owner of the single broker connection
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    state_tx: watch::Sender<ConnectionState>,
    core: Mutex<Core>,
    listeners: Mutex<Vec<Weak<dyn ConnectionListener>>>,
}

struct Core {
    url: Option<String>,
    policy: ReconnectPolicy,
    generation: u64,
    attempt: Option<JoinHandle<()>>,
    live: Option<LiveTransport>,
}

struct LiveTransport {
    outbound: mpsc::UnboundedSender<Frame>,
    reader: JoinHandle<()>,
}

impl LiveTransport {
    /// Dropping the sender closes the session after queued frames are written
    fn close(self, graceful: bool) {
        if graceful {
            let _ = self.outbound.send(Frame::disconnect());
        }
        self.reader.abort();
    }
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
        config: ReconnectConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Uninstantiated);
        Self {
            shared: Arc::new(Shared {
                connector,
                tokens,
                state_tx,
                core: Mutex::new(Core {
                    url: None,
                    policy: ReconnectPolicy::new(config),
                    generation: 0,
                    attempt: None,
                    live: None,
                }),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Observe state changes, e.g. to show a disconnected indicator
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn reconnect_status(&self) -> ReconnectStatus {
        self.shared.lock_core().policy.status()
    }

    /// URL of the most recent `connect` call
    pub fn url(&self) -> Option<String> {
        self.shared.lock_core().url.clone()
    }

    /// Register a listener. The manager keeps only a weak reference.
    pub fn add_listener(&self, listener: Weak<dyn ConnectionListener>) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Start connecting unless already open or connecting. Failures are
    /// handled by the backoff policy and never reported to the caller.
    pub fn connect(&self, url: &str) {
        self.shared.connect(url);
    }

    /// Clear the failure counter so a connection that gave up may try again
    pub fn reset_attempts(&self) {
        let mut core = self.shared.lock_core();
        if core.policy.attempts() > 0 {
            info!(
                attempts = core.policy.attempts(),
                "Reconnect attempt counter reset"
            );
        }
        core.policy.reset();
    }

    /// Manual reconnect: reset the counter and connect
    pub fn reconnect(&self, url: &str) {
        self.reset_attempts();
        self.connect(url);
    }

    /// Cancel any pending timer or attempt and close the live session
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Id of the live session, if any
    pub fn session_id(&self) -> Option<SessionId> {
        let core = self.shared.lock_core();
        core.live.as_ref().map(|_| core.generation)
    }

    /// Queue a frame on the live session and return that session's id
    pub fn send(&self, frame: Frame) -> Result<SessionId, TransportError> {
        let core = self.shared.lock_core();
        let state = self.state();
        match (&core.live, state) {
            (Some(live), ConnectionState::Open) => live
                .outbound
                .send(frame)
                .map(|()| core.generation)
                .map_err(|_| TransportError::ConnectionClosed),
            _ => Err(TransportError::NotConnected { state }),
        }
    }
}

impl Shared {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Callers hold the core lock so state and core never disagree
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            log_state_transition(previous, next);
        }
    }

    fn connect(self: &Arc<Self>, url: &str) {
        let mut core = self.lock_core();
        let state = self.state();
        if !state.accepts_connect() {
            debug!(%state, "connect() ignored while connection is {}", state);
            return;
        }
        if core.policy.is_exhausted() {
            warn!(
                attempts = core.policy.attempts(),
                "Reconnect attempts exhausted; reset attempts to try again"
            );
            core.policy.cancel_pending();
            self.set_state(ConnectionState::Closed);
            return;
        }

        core.policy.cancel_pending();
        if let Some(stale) = core.live.take() {
            stale.close(false);
        }
        if let Some(attempt) = core.attempt.take() {
            attempt.abort();
        }
        core.generation += 1;
        core.url = Some(url.to_string());
        self.set_state(ConnectionState::Connecting);

        let headers = ConnectHeaders::from_token(self.tokens.bearer_token());
        let generation = core.generation;
        let connector = Arc::clone(&self.connector);
        let weak = Arc::downgrade(self);
        let url = url.to_string();
        let span = crate::connection_span!(url = %url, attempt = core.policy.attempts() + 1);

        core.attempt = Some(tokio::spawn(
            async move {
                info!(
                    authenticated = headers.is_authenticated(),
                    "Opening broker connection"
                );
                let result = connector.open(&url, &headers).await;
                if let Some(shared) = weak.upgrade() {
                    shared.complete_attempt(generation, result);
                }
            }
            .instrument(span),
        ));
    }

    fn complete_attempt(self: &Arc<Self>, generation: u64, result: Result<Link, TransportError>) {
        let mut core = self.lock_core();
        if core.generation != generation {
            debug!(generation, "Discarding result of superseded connection attempt");
            return;
        }
        core.attempt = None;

        match result {
            Ok(Link { outbound, inbound }) => {
                let reader = tokio::spawn(read_frames(Arc::downgrade(self), generation, inbound));
                core.live = Some(LiveTransport { outbound, reader });
                core.policy.record_success();
                self.set_state(ConnectionState::Open);
                drop(core);
                self.notify(|listener| listener.on_open());
            }
            Err(e) => {
                warn!(
                    error = %redact_secrets(&e.to_string()),
                    "Broker connection attempt failed"
                );
                self.handle_failure(&mut core);
            }
        }
    }

    /// Route a failed attempt or lost session into the backoff path
    fn handle_failure(self: &Arc<Self>, core: &mut Core) {
        self.set_state(ConnectionState::Closed);
        match core.policy.record_failure() {
            ReconnectionDecision::Retry { failures, delay } => {
                let Some(url) = core.url.clone() else {
                    return;
                };
                let timer_id = core.generation;
                let weak = Arc::downgrade(self);
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.fire_reconnect(timer_id, &url);
                    }
                });
                core.policy.schedule(timer_id, timer.abort_handle(), delay);
                info!(
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduled broker reconnect"
                );
            }
            ReconnectionDecision::GiveUp { failures } => {
                let backoff = core.policy.config().calculate_max_total_time();
                error!(
                    failures,
                    backoff_ms = backoff.as_millis() as u64,
                    "Broker unreachable after {} attempts; automatic reconnection stopped", failures
                );
            }
        }
    }

    fn fire_reconnect(self: &Arc<Self>, timer_id: u64, url: &str) {
        if !self.lock_core().policy.take_fired(timer_id) {
            return;
        }
        debug!("Reconnect timer fired");
        self.connect(url);
    }

    fn connection_lost(self: &Arc<Self>, generation: u64) {
        let mut core = self.lock_core();
        if core.generation != generation || core.live.is_none() {
            return;
        }
        core.live = None;
        self.handle_failure(&mut core);
        drop(core);
        self.notify(|listener| listener.on_closed());
    }

    fn disconnect(&self) {
        let mut core = self.lock_core();
        if core.policy.cancel_pending() {
            debug!("Cancelled pending reconnect timer");
        }
        if let Some(attempt) = core.attempt.take() {
            attempt.abort();
        }
        core.generation += 1;

        let was_live = match core.live.take() {
            Some(live) => {
                self.set_state(ConnectionState::Closing);
                live.close(true);
                core.policy.reset();
                true
            }
            None => false,
        };
        self.set_state(ConnectionState::Closed);
        drop(core);

        if was_live {
            info!("Disconnected from broker");
            self.notify(|listener| listener.on_closed());
        }
    }

    /// Call every live listener outside all locks
    fn notify(&self, event: impl Fn(&dyn ConnectionListener)) {
        let listeners: Vec<Arc<dyn ConnectionListener>> = {
            let mut registered = self
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            registered.retain(|listener| listener.strong_count() > 0);
            registered.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in &listeners {
            event(listener.as_ref());
        }
    }
}

async fn read_frames(
    weak: Weak<Shared>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = inbound.recv().await {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        if frame.command == Command::Error {
            warn!(
                message = frame.header("message").unwrap_or(""),
                "Broker sent ERROR frame"
            );
        }
        debug!(command = %frame.command, "Inbound frame");
        shared.notify(|listener| listener.on_frame(&frame));
    }
    if let Some(shared) = weak.upgrade() {
        shared.connection_lost(generation);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        core.policy.cancel_pending();
        if let Some(attempt) = core.attempt.take() {
            attempt.abort();
        }
        if let Some(live) = core.live.take() {
            live.close(false);
        }
    }
}
