//! Pure connection state and reconnection bookkeeping
//!
//! Everything here is synchronous and side-effect free apart from aborting a
//! timer task handed in by the manager, so the backoff rules can be tested
//! without a runtime.

use std::fmt;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of the shared broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection has been attempted yet
    Uninstantiated,
    /// A connection attempt is in flight
    Connecting,
    /// Session established; frames flow
    Open,
    /// Graceful shutdown in progress
    Closing,
    /// Not connected; a reconnect may be scheduled
    Closed,
}

impl ConnectionState {
    /// Only a fresh or closed connection may start a new attempt
    pub fn accepts_connect(&self) -> bool {
        matches!(self, ConnectionState::Uninstantiated | ConnectionState::Closed)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Uninstantiated => "UNINSTANTIATED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(label)
    }
}

/// Log connection state transition
pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Open) => {
            info!("Broker connection established");
        }
        (ConnectionState::Open, ConnectionState::Closed) => {
            warn!("Broker connection lost");
        }
        (ConnectionState::Closing, ConnectionState::Closed) => {
            info!("Broker connection closed");
        }
        _ => {
            debug!("Broker connection state: {} -> {}", from, to);
        }
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectConfig {
    /// Delay before the next attempt after `failures` consecutive failures:
    /// `min(base_delay * 2^failures, max_delay)`
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Total time spent waiting on timers before the policy gives up
    pub fn calculate_max_total_time(&self) -> Duration {
        (1..self.max_attempts)
            .map(|failures| self.delay_for(failures))
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if self.base_delay.is_zero() {
            return Err("base_delay must be greater than 0".to_string());
        }
        if self.max_delay < self.base_delay {
            return Err("max_delay must not be smaller than base_delay".to_string());
        }
        Ok(())
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Schedule one retry after `delay`
    Retry { failures: u32, delay: Duration },
    /// Ceiling reached; stay closed until the counter is reset
    GiveUp { failures: u32 },
}

#[derive(Debug)]
struct PendingTimer {
    id: u64,
    handle: AbortHandle,
    delay: Duration,
    due: Instant,
}

/// Attempt counter plus the single pending reconnect timer
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
    pending: Option<PendingTimer>,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
            pending: None,
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.config.max_attempts
    }

    pub fn record_success(&mut self) {
        self.attempts = 0;
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn record_failure(&mut self) -> ReconnectionDecision {
        self.attempts = self.attempts.saturating_add(1);
        if self.is_exhausted() {
            ReconnectionDecision::GiveUp {
                failures: self.attempts,
            }
        } else {
            ReconnectionDecision::Retry {
                failures: self.attempts,
                delay: self.config.delay_for(self.attempts),
            }
        }
    }

    /// Track a newly spawned timer, aborting any previous one
    pub fn schedule(&mut self, id: u64, handle: AbortHandle, delay: Duration) {
        self.cancel_pending();
        self.pending = Some(PendingTimer {
            id,
            handle,
            delay,
            due: Instant::now() + delay,
        });
    }

    /// Abort the pending timer. Returns whether one was pending.
    pub fn cancel_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Called by a timer that has fired. Returns false if the timer was
    /// superseded and must not reconnect.
    pub fn take_fired(&mut self, id: u64) -> bool {
        match &self.pending {
            Some(timer) if timer.id == id => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn status(&self) -> ReconnectStatus {
        ReconnectStatus {
            attempts: self.attempts,
            max_attempts: self.config.max_attempts,
            pending_delay: self.pending.as_ref().map(|t| t.delay),
            pending_due: self.pending.as_ref().map(|t| t.due),
            exhausted: self.is_exhausted(),
        }
    }
}

/// Point-in-time view of the reconnect policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectStatus {
    pub attempts: u32,
    pub max_attempts: u32,
    pub pending_delay: Option<Duration>,
    pub pending_due: Option<Instant>,
    pub exhausted: bool,
}
