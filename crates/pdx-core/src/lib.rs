//! # pdx-core
//!
//! Core crate for the Paradex streaming SDK, providing:
//!
//! - **Configuration** (`config`): environment endpoints and `StreamConfig` deserialization
//! - **Error types** (`error`): `TransportError` and `PdxError` via thiserror
//! - **Logging** (`logging`): tracing-based structured logging
//! - **Time utilities** (`time_util`): wall-clock timestamps
//! - **WebSocket** (`ws`): pluggable transport: traits, tungstenite transport, simulated transport

pub mod config;
pub mod error;
pub mod logging;
pub mod time_util;
pub mod ws;

pub use error::{PdxError, TransportError};
