//! Transport layer for broker communication
//!
//! A [`Connector`] opens one authenticated broker session and hands back a
//! [`Link`]: a pair of frame channels. The connection manager owns the link
//! and never sees the socket underneath, so tests substitute an in-memory
//! connector for the WebSocket one.

use crate::connection::ConnectionState;
use crate::protocol::{Frame, FrameError};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod websocket;

pub use websocket::WsConnector;

/// Broker transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Broker rejected connection: {0}")]
    Rejected(String),
    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection closed by broker")]
    ConnectionClosed,
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Headers attached to the broker CONNECT frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectHeaders {
    /// Full `Authorization` value, e.g. `Bearer <token>`
    pub authorization: Option<String>,
}

impl ConnectHeaders {
    /// Blank tokens are treated as absent
    pub fn from_token(token: Option<String>) -> Self {
        let authorization = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(|t| format!("Bearer {t}"));
        Self { authorization }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authorization.is_some()
    }
}

/// Live frame pipe to the broker. Dropping `outbound` closes the session.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

/// Far side of a [`Link`], driven by a connector's I/O task
#[derive(Debug)]
pub struct RemoteEnd {
    pub to_client: mpsc::UnboundedSender<Frame>,
    pub from_client: mpsc::UnboundedReceiver<Frame>,
}

impl Link {
    pub fn channel() -> (Link, RemoteEnd) {
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        (
            Link { outbound, inbound },
            RemoteEnd {
                to_client,
                from_client,
            },
        )
    }
}

/// Opens broker sessions
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &str, headers: &ConnectHeaders) -> Result<Link, TransportError>;
}

/// Source of the current bearer token, read on every connection attempt
pub trait TokenProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed token, or none at all
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl TokenProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Token read from an environment variable at connect time
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenProvider for EnvToken {
    fn bearer_token(&self) -> Option<String> {
        std::env::var(&self.var).ok()
    }
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn bearer_token(&self) -> Option<String> {
        self()
    }
}
