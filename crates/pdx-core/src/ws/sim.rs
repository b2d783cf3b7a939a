//! Simulated transport for tests and market simulators.
//!
//! [`SimConnector`] hands out [`SimConnection`]s. Each connection replays a
//! queued script of [`SimStep`]s and accepts further steps injected while it
//! is live. Everything the client sends is recorded, as is the highest number
//! of concurrent `recv` calls ever seen on a connection.
//!
//! An exhausted script does not return immediately: `recv` waits (bounded by
//! its timeout) for injected steps, so reader loops driven by a simulator
//! never spin.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::debug;

use super::transport::{ConnState, Connection, Connector, Headers};
use crate::error::TransportError;

/// One scripted inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimStep {
    /// Deliver a text frame.
    Message(String),
    /// Peer closes the stream cleanly.
    Close,
    /// Abrupt transport failure with a reason (e.g. `"1006 abnormal closure"`).
    Error(String),
}

/// Server-side reactions to outbound requests.
#[derive(Debug, Clone, Default)]
pub struct SimBehavior {
    /// Answer `auth` requests with a success response.
    pub ack_auth: bool,
    /// Answer `subscribe`/`unsubscribe` requests with `{"result":{"channel":..}}`.
    pub ack_subscriptions: bool,
    /// Answer `auth` requests with this error `(code, message)` instead.
    pub reject_auth: Option<(i64, String)>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decrements the in-flight recv counter even if the recv future is dropped.
struct RecvGuard<'a>(&'a AtomicUsize);

impl Drop for RecvGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A simulated connection.
pub struct SimConnection {
    id: usize,
    url: String,
    headers: Headers,
    behavior: SimBehavior,
    inbox: Mutex<VecDeque<SimStep>>,
    notify: Notify,
    sent: Mutex<Vec<String>>,
    state: Mutex<ConnState>,
    fail_sends: AtomicBool,
    in_recv: AtomicUsize,
    max_in_recv: AtomicUsize,
}

impl SimConnection {
    fn new(id: usize, url: &str, headers: &Headers, script: Vec<SimStep>, behavior: SimBehavior) -> Self {
        Self {
            id,
            url: url.to_owned(),
            headers: headers.clone(),
            behavior,
            inbox: Mutex::new(script.into()),
            notify: Notify::new(),
            sent: Mutex::new(Vec::new()),
            state: Mutex::new(ConnState::Open),
            fail_sends: AtomicBool::new(false),
            in_recv: AtomicUsize::new(0),
            max_in_recv: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Headers passed to the connector for this connection.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Queue an inbound text frame.
    pub fn push(&self, text: impl Into<String>) {
        self.push_step(SimStep::Message(text.into()));
    }

    pub fn push_step(&self, step: SimStep) {
        lock(&self.inbox).push_back(step);
        self.notify.notify_one();
    }

    /// Simulate the peer closing the stream after already queued frames.
    pub fn close_from_peer(&self) {
        self.push_step(SimStep::Close);
    }

    /// Make every following `send` fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Release);
    }

    /// Every frame sent on this connection, in order.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    /// Sent frames parsed as JSON (unparseable frames are skipped).
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent().iter().filter_map(|s| serde_json::from_str(s).ok()).collect()
    }

    /// Sent requests with the given `method`.
    pub fn sent_requests(&self, method: &str) -> Vec<Value> {
        self.sent_json()
            .into_iter()
            .filter(|v| v.get("method").and_then(Value::as_str) == Some(method))
            .collect()
    }

    /// Highest number of `recv` calls that were in flight at the same time.
    pub fn max_concurrent_recv(&self) -> usize {
        self.max_in_recv.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConnState) {
        *lock(&self.state) = state;
    }

    /// Generate the server's reply to an outbound request, if any.
    fn react(&self, text: &str) {
        let Ok(req) = serde_json::from_str::<Value>(text) else {
            return;
        };
        let id = req.get("id").cloned().unwrap_or(Value::Null);
        let method = req.get("method").and_then(Value::as_str).unwrap_or_default();
        let reply = match method {
            "auth" => match &self.behavior.reject_auth {
                Some((code, message)) => Some(json!({
                    "jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}
                })),
                None if self.behavior.ack_auth => Some(json!({
                    "jsonrpc": "2.0", "id": id, "result": {"node_id": format!("sim-{}", self.id)}
                })),
                None => None,
            },
            "subscribe" | "unsubscribe" if self.behavior.ack_subscriptions => {
                let channel = req.pointer("/params/channel").cloned().unwrap_or(Value::Null);
                Some(json!({"jsonrpc": "2.0", "id": id, "result": {"channel": channel}}))
            }
            _ => None,
        };
        if let Some(reply) = reply {
            self.push(reply.to_string());
        }
    }
}

#[async_trait]
impl Connection for SimConnection {
    async fn send(&self, text: &str) -> Result<(), TransportError> {
        if self.state() != ConnState::Open {
            return Err(TransportError::NotOpen);
        }
        if self.fail_sends.load(Ordering::Acquire) {
            return Err(TransportError::Send("simulated send failure".into()));
        }
        lock(&self.sent).push(text.to_owned());
        self.react(text);
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<String>, TransportError> {
        let now = self.in_recv.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_recv.fetch_max(now, Ordering::AcqRel);
        let _guard = RecvGuard(&self.in_recv);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.state() == ConnState::Closed {
                return Err(TransportError::Closed("connection closed".into()));
            }

            let notified = self.notify.notified();
            let step = lock(&self.inbox).pop_front();
            match step {
                Some(SimStep::Message(text)) => return Ok(Some(text)),
                Some(SimStep::Close) => {
                    self.set_state(ConnState::Closed);
                    return Err(TransportError::Closed("1000 normal closure".into()));
                }
                Some(SimStep::Error(reason)) => {
                    self.set_state(ConnState::Closed);
                    return Err(TransportError::Closed(reason));
                }
                None => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.set_state(ConnState::Closed);
        self.notify.notify_one();
        debug!("[sim-{}] closed", self.id);
        Ok(())
    }

    fn state(&self) -> ConnState {
        *lock(&self.state)
    }
}

/// Connector handing out [`SimConnection`]s.
#[derive(Default)]
pub struct SimConnector {
    scripts: Mutex<VecDeque<Vec<SimStep>>>,
    connections: Mutex<Vec<Arc<SimConnection>>>,
    behavior: SimBehavior,
    refuse: AtomicUsize,
    attempts: AtomicUsize,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server reactions applied to every connection handed out from now on.
    pub fn with_behavior(mut self, behavior: SimBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Queue a script for the next connect that has none yet.
    pub fn with_script(self, steps: Vec<SimStep>) -> Self {
        self.push_script(steps);
        self
    }

    pub fn push_script(&self, steps: Vec<SimStep>) {
        lock(&self.scripts).push_back(steps);
    }

    /// Fail the next `n` connect attempts.
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::Release);
    }

    /// Connections handed out so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<SimConnection>> {
        lock(&self.connections).clone()
    }

    /// Most recent connection.
    pub fn latest(&self) -> Option<Arc<SimConnection>> {
        lock(&self.connections).last().cloned()
    }

    /// Number of connect calls, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    /// Poll until at least `n` connections were handed out or `timeout` elapses.
    pub async fn wait_for_connections(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while lock(&self.connections).len() < n {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        true
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(&self, url: &str, headers: &Headers) -> Result<Arc<dyn Connection>, TransportError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);

        let refused = self
            .refuse
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("connection refused by simulator".into()));
        }

        let script = lock(&self.scripts).pop_front().unwrap_or_default();
        let mut connections = lock(&self.connections);
        let conn = Arc::new(SimConnection::new(connections.len(), url, headers, script, self.behavior.clone()));
        connections.push(Arc::clone(&conn));
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn replays_script_then_times_out() {
        let connector = SimConnector::new().with_script(vec![SimStep::Message("a".into()), SimStep::Message("b".into())]);
        let conn = connector.connect("ws://sim", &Headers::new()).await.unwrap();

        assert_eq!(conn.recv(WINDOW).await.unwrap().as_deref(), Some("a"));
        assert_eq!(conn.recv(WINDOW).await.unwrap().as_deref(), Some("b"));
        assert_eq!(conn.recv(WINDOW).await.unwrap(), None);
    }

    #[tokio::test]
    async fn injected_message_wakes_waiting_recv() {
        let connector = Arc::new(SimConnector::new());
        let conn = connector.connect("ws://sim", &Headers::new()).await.unwrap();
        let sim = connector.latest().unwrap();

        let reader = tokio::spawn(async move { conn.recv(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        sim.push("hello");

        assert_eq!(reader.await.unwrap().unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn close_step_closes_connection() {
        let connector = SimConnector::new().with_script(vec![SimStep::Close]);
        let conn = connector.connect("ws://sim", &Headers::new()).await.unwrap();

        let err = conn.recv(WINDOW).await.unwrap_err();
        assert!(err.is_closed());
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(conn.send("x").await.unwrap_err(), TransportError::NotOpen);
    }

    #[tokio::test]
    async fn refuses_then_connects() {
        let connector = SimConnector::new();
        connector.refuse_next(2);

        assert!(connector.connect("ws://sim", &Headers::new()).await.is_err());
        assert!(connector.connect("ws://sim", &Headers::new()).await.is_err());
        assert!(connector.connect("ws://sim", &Headers::new()).await.is_ok());
        assert_eq!(connector.connect_attempts(), 3);
        assert_eq!(connector.connections().len(), 1);
    }

    #[tokio::test]
    async fn acks_requests_when_configured() {
        let connector = SimConnector::new().with_behavior(SimBehavior {
            ack_auth: true,
            ack_subscriptions: true,
            reject_auth: None,
        });
        let conn = connector.connect("ws://sim", &Headers::new()).await.unwrap();

        conn.send(r#"{"id":7,"jsonrpc":"2.0","method":"subscribe","params":{"channel":"trades.BTC-USD-PERP"}}"#)
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&conn.recv(WINDOW).await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"]["channel"], "trades.BTC-USD-PERP");

        let sim = connector.latest().unwrap();
        assert_eq!(sim.sent_requests("subscribe").len(), 1);
    }
}
