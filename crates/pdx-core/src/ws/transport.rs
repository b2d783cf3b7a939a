//! Transport contract.
//!
//! A [`Connector`] turns `(url, headers)` into a live [`Connection`]. It never
//! retries; retry policy belongs to the streaming client. All `Connection`
//! methods take `&self` so one connection can be shared behind an `Arc`
//! while readers and writers are serialized by separate locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

/// Extra HTTP headers sent with the handshake.
pub type Headers = HashMap<String, String>;

/// Observable state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// A full-duplex text message connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one text frame. Fails with [`TransportError::NotOpen`] unless open.
    async fn send(&self, text: &str) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next text message.
    ///
    /// Returns `Ok(None)` when the window elapsed without a message and
    /// [`TransportError::Closed`] when the peer closed the stream.
    async fn recv(&self, timeout: Duration) -> Result<Option<String>, TransportError>;

    /// Close the connection. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    /// Current connection state.
    fn state(&self) -> ConnState;

    fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }
}

/// Factory for connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, headers: &Headers) -> Result<Arc<dyn Connection>, TransportError>;
}
