//! Pluggable duplex transport for the streaming client.
//!
//! - [`transport`]: the [`Connection`] / [`Connector`] seam
//! - [`client`]: production transport over `tokio-tungstenite`
//! - [`sim`]: scripted / hand-driven transport for tests and simulators

pub mod client;
pub mod sim;
pub mod transport;

pub use client::{WsConnection, WsConnector};
pub use sim::{SimBehavior, SimConnection, SimConnector, SimStep};
pub use transport::{ConnState, Connection, Connector, Headers};
