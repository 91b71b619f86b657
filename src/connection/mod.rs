//! Shared broker connection with bounded exponential-backoff reconnection
//!
//! - [`state`] - pure connection state and reconnect policy
//! - [`manager`] - the [`ConnectionManager`] that owns the live session

pub mod manager;
pub mod state;

pub use manager::{ConnectionListener, ConnectionManager, SessionId};
pub use state::{
    ConnectionState, ReconnectConfig, ReconnectPolicy, ReconnectStatus, ReconnectionDecision,
};
