//! # pdx-stream
//!
//! Resilient real-time streaming client for the Paradex WebSocket API.
//!
//! ## Architecture
//!
//! A [`StreamClient`] keeps one authenticated connection open, multiplexes
//! every registered channel over it, and rebuilds the session after
//! transport failures or token rejections. Transports are injected through
//! [`pdx_core::ws::Connector`], so tests and simulators run against
//! [`pdx_core::ws::SimConnector`] without a network.
//!
//! ## Modules
//!
//! - [`client`]: state machine, reader task, manual pump
//! - [`registry`]: channel to callback table replayed on reconnect
//! - [`envelope`]: JSON-RPC codec
//! - [`auth`]: bearer token sources
//! - [`channel`]: venue channel names
//! - [`validate`]: optional payload validation
//! - [`event`]: lifecycle events for an injected observer
//! - [`threaded`]: blocking facade on a dedicated thread

pub mod auth;
pub mod channel;
pub mod client;
pub mod envelope;
pub mod event;
pub mod registry;
pub mod threaded;
pub mod validate;

pub use auth::{LeasedToken, StaticToken, TokenLease, TokenMinter, TokenSource};
pub use channel::{Channel, ChannelFamily};
pub use client::{ConnectionState, StreamClient, StreamClientBuilder};
pub use event::{StreamEvent, StreamEventReceiver, StreamEventSender, event_channel};
pub use registry::{ChannelCallback, SubscriptionRegistry};
pub use threaded::{BlockingStreamClient, StreamMessage};
pub use validate::{ValidatedPayload, ValidatorSet};
