//! STOMP over WebSocket connector
//!
//! Opens the raw WebSocket endpoint, performs the STOMP CONNECT/CONNECTED
//! handshake and then runs one I/O task per session that pumps frames
//! between the socket and the [`Link`] channels. Heart-beats are exchanged
//! both ways; a broker silent for two negotiated intervals ends the session.

use super::{ConnectHeaders, Connector, Link, RemoteEnd, TransportError};
use crate::config::BrokerSection;
use crate::protocol::frame::{Command, Frame, FrameError, HEARTBEAT};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Subprotocol offered during the WebSocket upgrade
pub const STOMP_SUBPROTOCOL: &str = "v12.stomp";

/// Connector for brokers that speak STOMP 1.2 over a WebSocket endpoint
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
    heartbeat: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat: Duration::from_secs(10),
        }
    }
}

impl WsConnector {
    pub fn new(connect_timeout: Duration, heartbeat: Duration) -> Self {
        Self {
            connect_timeout,
            heartbeat,
        }
    }

    pub fn from_config(broker: &BrokerSection) -> Self {
        Self::new(
            Duration::from_secs(broker.connect_timeout_secs),
            Duration::from_millis(broker.heartbeat_ms),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    async fn handshake(
        &self,
        url: &str,
        host: &str,
        headers: &ConnectHeaders,
    ) -> Result<(WsStream, Frame), TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Handshake(Box::new(e)))?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(STOMP_SUBPROTOCOL),
        );

        let (mut ws, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Handshake(Box::new(e)))?;

        let heartbeat_ms = self.heartbeat.as_millis() as u64;
        let connect = Frame::connect(host, heartbeat_ms, heartbeat_ms, headers);
        ws.send(to_ws_message(&connect))
            .await
            .map_err(|e| TransportError::Handshake(Box::new(e)))?;

        let connected = await_connected(&mut ws).await?;
        Ok((ws, connected))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str, headers: &ConnectHeaders) -> Result<Link, TransportError> {
        let host = broker_host(url)?;

        let (ws, connected) = timeout(self.connect_timeout, self.handshake(url, &host, headers))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))??;

        let server_heartbeat = connected.header("heart-beat");
        let send_every = negotiate_heartbeat(self.heartbeat, server_heartbeat);
        let expect_every = negotiate_receive(self.heartbeat, server_heartbeat);
        info!(
            %host,
            version = connected.header("version").unwrap_or("unknown"),
            heartbeat_ms = send_every.map(|d| d.as_millis() as u64),
            broker_heartbeat_ms = expect_every.map(|d| d.as_millis() as u64),
            "STOMP session established"
        );

        let (link, remote) = Link::channel();
        tokio::spawn(pump(ws, remote, send_every, expect_every.map(|every| every * 2)));
        Ok(link)
    }
}

fn broker_host(url: &str) -> Result<String, TransportError> {
    let parsed = Url::parse(url).map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(TransportError::InvalidUrl(url.to_string()));
    }
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| TransportError::InvalidUrl(url.to_string()))
}

async fn await_connected(ws: &mut WsStream) -> Result<Frame, TransportError> {
    while let Some(message) = ws.next().await {
        let message = message.map_err(|e| TransportError::Handshake(Box::new(e)))?;
        let Some(frame) = frame_from_ws(&message)? else {
            continue;
        };
        match frame.command {
            Command::Connected => return Ok(frame),
            Command::Error => {
                let reason = frame.header("message").unwrap_or("no reason given");
                return Err(TransportError::Rejected(reason.to_string()));
            }
            other => debug!(command = %other, "Ignoring frame received before CONNECTED"),
        }
    }
    Err(TransportError::ConnectionClosed)
}

/// Client heart-beat interval: the larger of ours and what the broker wants,
/// or none when either side opts out
pub fn negotiate_heartbeat(client_every: Duration, server_header: Option<&str>) -> Option<Duration> {
    let wanted_ms: u64 = server_header?.split(',').nth(1)?.trim().parse().ok()?;
    if client_every.is_zero() || wanted_ms == 0 {
        return None;
    }
    Some(client_every.max(Duration::from_millis(wanted_ms)))
}

/// How often the broker will heart-beat us: the larger of what we asked for
/// and what it can do, or none when either side opts out
pub fn negotiate_receive(client_every: Duration, server_header: Option<&str>) -> Option<Duration> {
    let offered_ms: u64 = server_header?.split(',').next()?.trim().parse().ok()?;
    if client_every.is_zero() || offered_ms == 0 {
        return None;
    }
    Some(client_every.max(Duration::from_millis(offered_ms)))
}

fn frame_from_ws(message: &Message) -> Result<Option<Frame>, FrameError> {
    match message {
        Message::Text(text) => Frame::decode(text.as_bytes()),
        Message::Binary(data) => Frame::decode(data),
        _ => Ok(None),
    }
}

fn to_ws_message(frame: &Frame) -> Message {
    match String::from_utf8(frame.encode()) {
        Ok(text) => Message::Text(text.into()),
        Err(raw) => Message::Binary(raw.into_bytes().into()),
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn silence(last_seen: Instant, limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep_until(last_seen + limit).await,
        None => std::future::pending().await,
    }
}

/// Session I/O loop. Ends when either the socket or the client side closes,
/// or when nothing arrives from the broker within `silence_limit`; dropping
/// `remote.to_client` tells the reader the link is gone.
async fn pump<S>(
    ws: WebSocketStream<S>,
    mut remote: RemoteEnd,
    heartbeat: Option<Duration>,
    silence_limit: Option<Duration>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut ticker = heartbeat.map(|every| tokio::time::interval_at(Instant::now() + every, every));
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                last_seen = Instant::now();
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket read failed");
                        break;
                    }
                    None => break,
                };
                if message.is_close() {
                    debug!("Broker closed the WebSocket");
                    break;
                }
                match frame_from_ws(&message) {
                    Ok(Some(frame)) => {
                        if remote.to_client.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Dropping undecodable broker frame"),
                }
            }
            outgoing = remote.from_client.recv() => {
                let Some(frame) = outgoing else {
                    let _ = ws_tx.close().await;
                    break;
                };
                debug!(command = %frame.command, "Outbound frame");
                if let Err(e) = ws_tx.send(to_ws_message(&frame)).await {
                    warn!(error = %e, "WebSocket write failed");
                    break;
                }
            }
            _ = tick(&mut ticker) => {
                if ws_tx.send(Message::Text(HEARTBEAT.to_string().into())).await.is_err() {
                    break;
                }
            }
            _ = silence(last_seen, silence_limit) => {
                warn!(
                    silent_ms = last_seen.elapsed().as_millis() as u64,
                    "Broker heart-beats missed, dropping session"
                );
                break;
            }
        }
    }
    debug!("STOMP session I/O task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    #[test]
    fn test_negotiate_heartbeat() {
        let ten = Duration::from_secs(10);
        assert_eq!(negotiate_heartbeat(ten, Some("0,20000")), Some(Duration::from_secs(20)));
        assert_eq!(negotiate_heartbeat(ten, Some("0,5000")), Some(ten));
        assert_eq!(negotiate_heartbeat(ten, Some("10000,0")), None);
        assert_eq!(negotiate_heartbeat(Duration::ZERO, Some("0,5000")), None);
        assert_eq!(negotiate_heartbeat(ten, None), None);
        assert_eq!(negotiate_heartbeat(ten, Some("garbage")), None);
    }

    #[test]
    fn test_negotiate_receive() {
        let ten = Duration::from_secs(10);
        assert_eq!(negotiate_receive(ten, Some("20000,0")), Some(Duration::from_secs(20)));
        assert_eq!(negotiate_receive(ten, Some("5000,5000")), Some(ten));
        assert_eq!(negotiate_receive(ten, Some("0,10000")), None);
        assert_eq!(negotiate_receive(Duration::ZERO, Some("5000,0")), None);
        assert_eq!(negotiate_receive(ten, None), None);
        assert_eq!(negotiate_receive(ten, Some("x,y")), None);
    }

    #[test]
    fn test_broker_host_requires_websocket_scheme() {
        assert_eq!(broker_host("ws://localhost:8080/ws").unwrap(), "localhost");
        assert_eq!(broker_host("wss://crawl.example.com/ws").unwrap(), "crawl.example.com");
        assert!(matches!(
            broker_host("http://localhost:8080/ws"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(broker_host("not a url"), Err(TransportError::InvalidUrl(_))));
    }

    #[test]
    fn test_frames_become_text_messages() {
        let message = to_ws_message(&Frame::unsubscribe("sub-3"));
        let Message::Text(text) = &message else {
            panic!("expected a text message");
        };
        assert_eq!(text.as_str(), "UNSUBSCRIBE\nid:sub-3\n\n\0");
        assert_eq!(
            frame_from_ws(&message).unwrap(),
            Some(Frame::unsubscribe("sub-3"))
        );
    }

    #[test]
    fn test_from_config() {
        let broker = BrokerSection {
            url: "ws://localhost/ws".to_string(),
            token_env: None,
            connect_timeout_secs: 3,
            heartbeat_ms: 2500,
        };
        let connector = WsConnector::from_config(&broker);
        assert_eq!(connector.connect_timeout(), Duration::from_secs(3));
        assert_eq!(connector.heartbeat, Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_open_rejects_non_websocket_url() {
        let connector = WsConnector::default();
        let result = connector
            .open("http://localhost:1/ws", &ConnectHeaders::default())
            .await;
        assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
    }

    /// Client and broker ends of an in-memory WebSocket
    async fn socket_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (client, broker) = tokio::io::duplex(4096);
        (
            WebSocketStream::from_raw_socket(client, Role::Client, None).await,
            WebSocketStream::from_raw_socket(broker, Role::Server, None).await,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_broker_ends_session() {
        let (client, _broker) = socket_pair().await;
        let (mut link, remote) = Link::channel();
        let started = Instant::now();
        tokio::spawn(pump(client, remote, None, Some(Duration::from_millis(200))));

        let ended = timeout(Duration::from_secs(5), link.inbound.recv()).await;
        assert!(matches!(ended, Ok(None)));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(link.outbound.send(Frame::disconnect()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_heartbeats_keep_session_alive() {
        let (client, mut broker) = socket_pair().await;
        let (mut link, remote) = Link::channel();
        tokio::spawn(pump(client, remote, None, Some(Duration::from_millis(200))));

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            broker.send(Message::Text(HEARTBEAT.to_string().into())).await.unwrap();
        }
        let message = Frame::message("sub-0", "/topic/progress/1", "1", "{}");
        broker.send(to_ws_message(&message)).await.unwrap();

        let received = timeout(Duration::from_secs(1), link.inbound.recv()).await;
        assert_eq!(received.unwrap(), Some(message));

        // Silence after the last frame
        let ended = timeout(Duration::from_secs(5), link.inbound.recv()).await;
        assert!(matches!(ended, Ok(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_silence_limit_without_heartbeats() {
        let (client, _broker) = socket_pair().await;
        let (mut link, remote) = Link::channel();
        tokio::spawn(pump(client, remote, None, None));

        let waited = timeout(Duration::from_secs(60), link.inbound.recv()).await;
        assert!(waited.is_err());
    }
}
