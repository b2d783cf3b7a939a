//! Events emitted by a [`StreamClient`](crate::StreamClient) to an injected observer.
//!
//! Callers that want to react to lifecycle changes pass a [`StreamEventSender`]
//! to the builder and poll the matching [`StreamEventReceiver`].

use crate::client::ConnectionState;

/// A typed lifecycle or diagnostics event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The connection state changed.
    StateChanged { from: ConnectionState, to: ConnectionState },

    /// A reconnect attempt succeeded and the registry was replayed.
    Reconnected {
        /// 1-based number of the attempt that succeeded.
        attempt: u32,
    },

    /// A reconnect attempt failed; another one follows unless exhausted.
    ReconnectFailed { attempt: u32 },

    /// The server rejected the bearer token.
    AuthRejected { code: i64, message: String },

    /// An inbound frame could not be decoded and was dropped.
    MessageDropped { reason: String },

    /// A payload failed validation. It was still delivered.
    ValidationFailed { channel: String, reason: String },

    /// The server refused a subscribe or unsubscribe request.
    SubscriptionRejected { channel: String, code: i64, message: String },
}

/// Sender half of the event channel.
pub type StreamEventSender = tokio::sync::mpsc::UnboundedSender<StreamEvent>;

/// Receiver half of the event channel.
pub type StreamEventReceiver = tokio::sync::mpsc::UnboundedReceiver<StreamEvent>;

/// Create a connected sender/receiver pair.
pub fn event_channel() -> (StreamEventSender, StreamEventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
