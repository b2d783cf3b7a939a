//! Thread-backed blocking facade over [`StreamClient`].
//!
//! The async client runs inside a current-thread Tokio runtime on a dedicated
//! OS thread. Commands flow in over a Tokio mpsc queue; data notifications
//! flow out over a bounded crossbeam channel that the caller drains with
//! [`BlockingStreamClient::get_updates`]. When the caller falls behind and the
//! queue is full, new updates are dropped with a warning.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use pdx_core::{PdxError, TransportError};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::client::{ConnectionState, StreamClient, StreamClientBuilder};
use crate::envelope::Notification;

/// Capacity of the outbound update queue.
pub const UPDATE_QUEUE_CAPACITY: usize = 1000;

/// A data notification handed to the blocking caller.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub channel: String,
    /// `params.data` (or top-level `data`) of the envelope.
    pub data: Value,
    pub envelope: Value,
}

#[derive(Debug)]
enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Close,
}

/// Synchronous streaming client for callers outside an async runtime.
pub struct BlockingStreamClient {
    client: StreamClient,
    commands: mpsc::UnboundedSender<Command>,
    updates: Receiver<StreamMessage>,
    thread: Option<JoinHandle<()>>,
}

impl BlockingStreamClient {
    /// Start the runtime thread and connect.
    ///
    /// Fails if the configuration is invalid, the thread cannot start, or
    /// the client is not connected within `connect_timeout`.
    pub fn spawn(builder: StreamClientBuilder, connect_timeout: Duration) -> Result<Self, PdxError> {
        let client = builder.build()?;
        let label = client.label().to_owned();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = crossbeam_channel::bounded(UPDATE_QUEUE_CAPACITY);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let worker = client.clone();
        let thread = std::thread::Builder::new()
            .name(format!("{label}-rt"))
            .spawn(move || run_runtime(worker, cmd_rx, update_tx, ready_tx))
            .map_err(|e| PdxError::Runtime(format!("failed to spawn {label} thread: {e}")))?;

        let mut this = Self { client, commands: cmd_tx, updates: update_rx, thread: Some(thread) };
        match ready_rx.recv_timeout(connect_timeout) {
            Ok(true) => {
                info!("[{label}] blocking client connected");
                Ok(this)
            }
            Ok(false) | Err(_) => {
                this.close();
                Err(TransportError::Connect(format!("[{label}] not connected within {connect_timeout:?}")).into())
            }
        }
    }

    fn send(&self, command: Command) -> Result<(), PdxError> {
        self.commands.send(command).map_err(|_| PdxError::Transport(TransportError::NotOpen))
    }

    /// Queue a subscription; notifications arrive through [`get_updates`](Self::get_updates).
    pub fn subscribe(&self, channel: &str) -> Result<(), PdxError> {
        self.send(Command::Subscribe(channel.to_owned()))
    }

    pub fn subscribe_channel(&self, channel: Channel) -> Result<(), PdxError> {
        self.send(Command::Subscribe(channel.name()))
    }

    pub fn unsubscribe(&self, channel: &str) -> Result<(), PdxError> {
        self.send(Command::Unsubscribe(channel.to_owned()))
    }

    /// Block up to `timeout` for the next update.
    pub fn get_updates(&self, timeout: Duration) -> Option<StreamMessage> {
        match self.updates.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Updates queued and not yet taken.
    pub fn pending_updates(&self) -> usize {
        self.updates.len()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn subscriptions(&self) -> std::collections::HashMap<String, bool> {
        self.client.get_subscriptions()
    }

    /// Close the async client and join the runtime thread. Idempotent.
    pub fn close(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.commands.send(Command::Close);
        if thread.join().is_err() {
            error!("[{}] runtime thread panicked", self.client.label());
        }
        debug!("[{}] blocking client closed", self.client.label());
    }
}

impl Drop for BlockingStreamClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_runtime(
    client: StreamClient,
    mut commands: mpsc::UnboundedReceiver<Command>,
    updates: Sender<StreamMessage>,
    ready: Sender<bool>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("[{}] failed to build runtime: {e}", client.label());
            let _ = ready.send(false);
            return;
        }
    };

    runtime.block_on(async move {
        let connected = client.connect().await;
        let _ = ready.send(connected);
        if !connected {
            client.close().await;
            return;
        }

        while let Some(command) = commands.recv().await {
            match command {
                Command::Subscribe(channel) => {
                    let tx = updates.clone();
                    client.subscribe(&channel, move |ch, envelope| forward(&tx, ch, envelope)).await;
                }
                Command::Unsubscribe(channel) => {
                    client.unsubscribe(&channel).await;
                }
                Command::Close => break,
            }
        }
        client.close().await;
    });
}

fn forward(updates: &Sender<StreamMessage>, channel: &str, envelope: &Value) {
    let notification = Notification { channel: channel.to_owned(), envelope: envelope.clone() };
    let data = notification.data().clone();
    let msg = StreamMessage { channel: notification.channel, data, envelope: notification.envelope };
    match updates.try_send(msg) {
        Ok(()) => {}
        Err(TrySendError::Full(msg)) => warn!("update queue full, dropping {} update", msg.channel),
        Err(TrySendError::Disconnected(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use pdx_core::config::{Environment, StreamConfig};
    use pdx_core::ws::{SimBehavior, SimConnection, SimConnector};
    use serde_json::json;

    use super::*;
    use crate::envelope::data_message;

    const WAIT: Duration = Duration::from_secs(5);

    fn builder(connector: &Arc<SimConnector>) -> StreamClientBuilder {
        StreamClientBuilder::new(Environment::Testnet)
            .config(StreamConfig::simulation())
            .connector(connector.clone())
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }

    fn subscribed(sim: &SimConnection, n: usize) -> bool {
        sim.sent_requests("subscribe").len() >= n
    }

    #[test]
    fn forwards_updates_to_blocking_caller() {
        let behavior = SimBehavior { ack_subscriptions: true, ..SimBehavior::default() };
        let connector = Arc::new(SimConnector::new().with_behavior(behavior));
        let mut ws = BlockingStreamClient::spawn(builder(&connector), WAIT).unwrap();
        assert!(ws.is_connected());

        ws.subscribe("trades.BTC-USD-PERP").unwrap();
        let sim = connector.latest().unwrap();
        assert!(wait_until(|| subscribed(&sim, 1)));
        assert!(wait_until(|| ws.subscriptions().get("trades.BTC-USD-PERP") == Some(&true)));

        sim.push(data_message("trades.BTC-USD-PERP", json!({"price": "50000"})));
        let msg = ws.get_updates(WAIT).unwrap();
        assert_eq!(msg.channel, "trades.BTC-USD-PERP");
        assert_eq!(msg.data, json!({"price": "50000"}));
        assert_eq!(msg.envelope["method"], "subscription");

        assert_eq!(ws.get_updates(Duration::from_millis(20)), None);
        ws.close();
        assert_eq!(ws.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn unsubscribe_stops_updates() {
        let connector = Arc::new(SimConnector::new());
        let ws = BlockingStreamClient::spawn(builder(&connector), WAIT).unwrap();
        let sim = connector.latest().unwrap();

        ws.subscribe_channel(Channel::Bbo { market: "ETH-USD-PERP".into() }).unwrap();
        assert!(wait_until(|| subscribed(&sim, 1)));
        ws.unsubscribe("bbo.ETH-USD-PERP").unwrap();
        assert!(wait_until(|| sim.sent_requests("unsubscribe").len() == 1));

        sim.push(data_message("bbo.ETH-USD-PERP", json!({})));
        assert_eq!(ws.get_updates(Duration::from_millis(100)), None);
    }

    #[test]
    fn full_queue_drops_new_updates() {
        let connector = Arc::new(SimConnector::new());
        let ws = BlockingStreamClient::spawn(builder(&connector), WAIT).unwrap();
        let sim = connector.latest().unwrap();

        ws.subscribe("account").unwrap();
        assert!(wait_until(|| subscribed(&sim, 1)));
        for seq in 0..UPDATE_QUEUE_CAPACITY + 5 {
            sim.push(data_message("account", json!({"seq": seq})));
        }
        assert!(wait_until(|| ws.pending_updates() == UPDATE_QUEUE_CAPACITY));
        std::thread::sleep(Duration::from_millis(50));

        let first = ws.get_updates(WAIT).unwrap();
        assert_eq!(first.data["seq"], 0);
        let mut drained = 1;
        while ws.get_updates(Duration::from_millis(20)).is_some() {
            drained += 1;
        }
        assert_eq!(drained, UPDATE_QUEUE_CAPACITY);
    }

    #[test]
    fn connect_failure_is_reported() {
        let connector = Arc::new(SimConnector::new());
        connector.refuse_next(1);
        let err = BlockingStreamClient::spawn(builder(&connector), WAIT).err();
        assert!(matches!(err, Some(PdxError::Transport(TransportError::Connect(_)))));
    }

    #[test]
    fn close_is_idempotent() {
        let connector = Arc::new(SimConnector::new());
        let mut ws = BlockingStreamClient::spawn(builder(&connector), WAIT).unwrap();
        ws.close();
        ws.close();
        assert!(!ws.is_connected());
        assert!(ws.subscribe("account").is_err());
    }
}
