//! Typed error definitions for the streaming SDK.
//!
//! [`TransportError`] covers everything a [`Connection`](crate::ws::Connection)
//! can fail with. [`PdxError`] is the error returned by the higher layers. All
//! variants implement `std::error::Error` via `thiserror`, so they integrate
//! with `anyhow::Result` at binary boundaries.
//!
//! A receive timeout is deliberately not an error: `Connection::recv` reports
//! it as `Ok(None)`.

use thiserror::Error;

/// Failures of the underlying duplex connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Handshake or TCP/TLS setup failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// The peer closed the stream (or it ended).
    #[error("connection closed: {0}")]
    Closed(String),

    /// The connection is not in the `Open` state.
    #[error("connection is not open")]
    NotOpen,
}

impl TransportError {
    /// `true` when the peer went away, as opposed to a local send/connect failure.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// Domain-specific errors for the streaming SDK.
#[derive(Debug, Error)]
pub enum PdxError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Transport-level failure (always retryable by policy).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An inbound frame could not be decoded into an envelope.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The server rejected our bearer credential.
    #[error("auth rejected ({code}): {message}")]
    AuthRejected { code: i64, message: String },

    /// The auth collaborator failed to produce a token.
    #[error("auth error: {0}")]
    Auth(String),

    /// A runtime or worker thread could not be started.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl From<serde_json::Error> for PdxError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}
