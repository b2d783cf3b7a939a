//! Production WebSocket transport over `tokio-tungstenite`.
//!
//! Each [`WsConnection`] owns one TLS WebSocket stream split into a sink and
//! a stream half, each behind its own async mutex:
//! 1. `recv` reads frames until a text message arrives or the timeout elapses.
//! 2. Inbound pings are answered with pongs; close frames surface as
//!    [`TransportError::Closed`].
//! 3. A keep-alive task sends ping frames at a fixed interval until close.
//!
//! There is no reconnect logic here; the streaming client owns that.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::transport::{ConnState, Connection, Connector, Headers};
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Keep-alive cadence when none is configured.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

/// Handshake deadline when none is configured.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared, lock-free connection state.
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> ConnState {
        match self.0.load(Ordering::Acquire) {
            0 => ConnState::Connecting,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }

    fn set(&self, state: ConnState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// One live WebSocket connection.
pub struct WsConnection {
    id: usize,
    writer: Arc<Mutex<SplitSink<WsStream, Message>>>,
    reader: Mutex<SplitStream<WsStream>>,
    state: Arc<StateCell>,
    keepalive: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsConnection {
    fn new(id: usize, stream: WsStream, ping_interval: Option<Duration>) -> Self {
        let (sink, stream) = stream.split();
        let writer = Arc::new(Mutex::new(sink));
        let state = Arc::new(StateCell::new(ConnState::Open));

        let keepalive = ping_interval
            .filter(|d| !d.is_zero())
            .map(|interval| spawn_keepalive(id, interval, Arc::clone(&writer), Arc::clone(&state)));

        Self {
            id,
            writer,
            reader: Mutex::new(stream),
            state,
            keepalive: std::sync::Mutex::new(keepalive),
        }
    }

    fn mark_closed(&self) {
        self.state.set(ConnState::Closed);
        self.stop_keepalive();
    }

    fn stop_keepalive(&self) {
        let handle = match self.keepalive.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&self, text: &str) -> Result<(), TransportError> {
        if self.state.get() != ConnState::Open {
            return Err(TransportError::NotOpen);
        }
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(text.to_owned().into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<String>, TransportError> {
        match self.state.get() {
            ConnState::Open => {}
            ConnState::Closed => return Err(TransportError::Closed("connection already closed".into())),
            _ => return Err(TransportError::NotOpen),
        }

        let conn_id = self.id;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut reader = self.reader.lock().await;

        loop {
            let next = match tokio::time::timeout_at(deadline, reader.next()).await {
                Ok(next) => next,
                Err(_) => return Ok(None),
            };

            match next {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => debug!("[ws-{conn_id}] skipping non-UTF-8 binary frame ({} bytes)", data.len()),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.writer.lock().await.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!("[ws-{conn_id}] received close frame");
                    self.mark_closed();
                    let reason = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                        .unwrap_or_else(|| "close frame".into());
                    return Err(TransportError::Closed(reason));
                }
                Some(Ok(_)) => {} // Pong, Frame: ignore
                Some(Err(e)) => {
                    warn!("[ws-{conn_id}] read error: {e}");
                    self.mark_closed();
                    return Err(TransportError::Closed(e.to_string()));
                }
                None => {
                    warn!("[ws-{conn_id}] stream ended");
                    self.mark_closed();
                    return Err(TransportError::Closed("stream ended".into()));
                }
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if matches!(self.state.get(), ConnState::Closed | ConnState::Closing) {
            return Ok(());
        }
        self.state.set(ConnState::Closing);
        self.stop_keepalive();
        let result = self.writer.lock().await.close().await;
        self.state.set(ConnState::Closed);
        debug!("[ws-{}] closed", self.id);
        result.map_err(|e| TransportError::Send(e.to_string()))
    }

    fn state(&self) -> ConnState {
        self.state.get()
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.stop_keepalive();
    }
}

/// Send websocket ping frames every `interval` until the connection leaves `Open`.
fn spawn_keepalive(
    conn_id: usize,
    interval: Duration,
    writer: Arc<Mutex<SplitSink<WsStream, Message>>>,
    state: Arc<StateCell>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // skip the immediate first tick

        loop {
            ticker.tick().await;
            if state.get() != ConnState::Open {
                break;
            }
            if let Err(e) = writer.lock().await.send(Message::Ping(Vec::new().into())).await {
                warn!("[ws-{conn_id}] ping send error: {e}");
                break;
            }
        }
    })
}

/// Connector for real WebSocket endpoints (TLS via `native-tls`).
#[derive(Debug)]
pub struct WsConnector {
    ping_interval: Option<Duration>,
    connect_timeout: Duration,
    enable_compression: bool,
    next_id: AtomicUsize,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WsConnector {
    pub fn new() -> Self {
        Self {
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            enable_compression: true,
            next_id: AtomicUsize::new(0),
        }
    }

    /// Keep-alive cadence; `None` keeps the default.
    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        if let Some(interval) = interval {
            self.ping_interval = Some(interval);
        }
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Request per-message compression.
    ///
    /// `tokio-tungstenite` cannot negotiate permessage-deflate, so the flag
    /// is only recorded; frames are always exchanged uncompressed.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    pub fn compression_requested(&self) -> bool {
        self.enable_compression
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, headers: &Headers) -> Result<Arc<dyn Connection>, TransportError> {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let host = extract_host(url)?;

        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("invalid request for {url}: {e}")))?;
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| TransportError::Connect(format!("invalid header name {key}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Connect(format!("invalid header value for {key}: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        if self.enable_compression {
            debug!("[ws-{conn_id}] compression requested; transport negotiates uncompressed frames");
        }

        info!("[ws-{conn_id}] connecting to {host}");
        let (stream, _response) = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| TransportError::Connect(format!("handshake with {host} timed out")))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!("[ws-{conn_id}] connected");

        Ok(Arc::new(WsConnection::new(conn_id, stream, self.ping_interval)))
    }
}

/// Extract the host from a URL string.
fn extract_host(url: &str) -> Result<String, TransportError> {
    let parsed = url::Url::parse(url).map_err(|e| TransportError::Connect(format!("invalid url {url}: {e}")))?;
    parsed
        .host_str()
        .map(str::to_owned)
        .ok_or_else(|| TransportError::Connect(format!("url has no host: {url}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(extract_host("wss://ws.api.testnet.paradex.trade/v1").unwrap(), "ws.api.testnet.paradex.trade");
        assert!(extract_host("not a url").is_err());
    }

    #[tokio::test]
    async fn connect_refused_is_transport_error() {
        // Port 9 (discard) on localhost is closed on CI hosts.
        let connector = WsConnector::new().with_connect_timeout(Duration::from_secs(2));
        let err = connector.connect("ws://127.0.0.1:9/v1", &Headers::new()).await.err();
        assert!(matches!(err, Some(TransportError::Connect(_))));
    }

    #[test]
    fn compression_flag_is_recorded() {
        assert!(WsConnector::new().compression_requested());
        assert!(!WsConnector::new().with_compression(false).compression_requested());
    }

    #[tokio::test]
    async fn invalid_header_is_rejected() {
        let connector = WsConnector::new();
        let mut headers = Headers::new();
        headers.insert("bad header".into(), "x".into());
        let err = connector.connect("ws://127.0.0.1:9/v1", &headers).await.err();
        assert!(matches!(err, Some(TransportError::Connect(_))));
    }
}
