//! Resilient streaming client.
//!
//! A [`StreamClient`] owns at most one transport connection at a time and
//! multiplexes every registered channel over it. It:
//! 1. Connects through the injected [`Connector`], authenticates with the
//!    current bearer token and replays the subscription registry.
//! 2. Receives and dispatches frames, either from a background reader task
//!    or one cycle at a time through [`StreamClient::pump_once`].
//! 3. Detects transport failures and auth rejections and reconnects with
//!    exponential backoff, forcing a token refresh when the server rejected
//!    the token.
//!
//! Every path that calls `recv` on the connection goes through one receive
//! lock, held for a single receive-and-dispatch cycle. Sends go through a
//! separate send lock, and connect/reconnect/close through a lifecycle lock.
//!
//! Messages in flight when a connection drops are lost. Callers that keep
//! derived state (order books) must resynchronize after a reconnect.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use ahash::AHashMap;
use pdx_core::config::{Environment, StreamConfig};
use pdx_core::time_util::{now_ms, now_us};
use pdx_core::ws::{Connection, Connector, Headers, WsConnector};
use pdx_core::{PdxError, TransportError};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::{TokenSource, lease_is_stale};
use crate::channel::Channel;
use crate::envelope::{self, Inbound, Notification, PendingRequest, RequestId, RpcMethod, RpcRequest};
use crate::event::{StreamEvent, StreamEventSender};
use crate::registry::{ChannelCallback, SubscriptionRegistry};
use crate::validate::ValidatorSet;

/// Log prefix when none is configured.
pub const DEFAULT_LABEL: &str = "pdx-ws";

/// Pause between `pump_until` polls while no message or connection is available.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Lifecycle state of a [`StreamClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Open,
    Closing,
    /// Reconnection is disabled or was exhausted.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Compare connections by address; vtable pointers may differ for one object.
fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Outcome of dispatching one inbound frame.
enum Dispatch {
    Data(Notification),
    AuthAck,
    AuthRejected { code: i64, message: String },
    Control,
    Dropped,
}

/// Outcome of one receive cycle.
enum Received {
    Message(Dispatch),
    Timeout,
    NoConnection,
    Failed { conn: Arc<dyn Connection>, error: TransportError },
}

/// Sleep for `duration` unless shutdown is signalled first.
///
/// Returns `false` on shutdown. A zero duration only yields.
async fn sleep_unless_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    if duration.is_zero() {
        tokio::task::yield_now().await;
        return !*shutdown.borrow();
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => !*shutdown.borrow(),
        _ = shutdown.changed() => !*shutdown.borrow(),
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`StreamClient`].
pub struct StreamClientBuilder {
    env: Environment,
    config: StreamConfig,
    connector: Option<Arc<dyn Connector>>,
    auth: Option<Arc<dyn TokenSource>>,
    events: Option<StreamEventSender>,
    label: String,
    validators: Option<ValidatorSet>,
}

impl StreamClientBuilder {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            config: StreamConfig::default(),
            connector: None,
            auth: None,
            events: None,
            label: DEFAULT_LABEL.to_owned(),
            validators: None,
        }
    }

    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Transport factory. Defaults to [`WsConnector`].
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Bearer token source. Without one the connection is unauthenticated.
    pub fn auth(mut self, auth: Arc<dyn TokenSource>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Observer for lifecycle and diagnostics events.
    pub fn events(mut self, events: StreamEventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Log prefix of this client.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Payload validators. Defaults to [`ValidatorSet::with_defaults`].
    pub fn validators(mut self, validators: ValidatorSet) -> Self {
        self.validators = Some(validators);
        self
    }

    /// Fails only on an invalid configuration.
    pub fn build(self) -> Result<StreamClient, PdxError> {
        self.config.validate()?;

        let url = self.config.resolve_url(self.env);
        let connector = self.connector.unwrap_or_else(|| {
            let ws: Arc<dyn Connector> = Arc::new(
                WsConnector::new()
                    .with_ping_interval(self.config.ping_interval())
                    .with_compression(self.config.enable_compression),
            );
            ws
        });
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        debug!("[{}] client built for {url}", self.label);
        Ok(StreamClient {
            inner: Arc::new(Inner {
                label: self.label,
                url,
                config: self.config,
                connector,
                auth: self.auth,
                events: self.events,
                validators: self.validators.unwrap_or_else(ValidatorSet::with_defaults),
                registry: Mutex::new(SubscriptionRegistry::new()),
                pending: Mutex::new(AHashMap::new()),
                conn: Mutex::new(None),
                recv_lock: tokio::sync::Mutex::new(()),
                send_lock: tokio::sync::Mutex::new(()),
                lifecycle: tokio::sync::Mutex::new(()),
                state_tx,
                shutdown_tx,
                reader: Mutex::new(None),
                next_id: AtomicU64::new(now_us()),
                reconnect_requested: AtomicBool::new(false),
                force_refresh: AtomicBool::new(false),
                reconnect_count: AtomicU32::new(0),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Handle to a streaming session. Clones share the same session.
#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<Inner>,
}

struct Inner {
    label: String,
    url: String,
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    auth: Option<Arc<dyn TokenSource>>,
    events: Option<StreamEventSender>,
    validators: ValidatorSet,

    registry: Mutex<SubscriptionRegistry>,
    pending: Mutex<AHashMap<RequestId, PendingRequest>>,
    conn: Mutex<Option<Arc<dyn Connection>>>,

    recv_lock: tokio::sync::Mutex<()>,
    send_lock: tokio::sync::Mutex<()>,
    lifecycle: tokio::sync::Mutex<()>,

    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,

    next_id: AtomicU64,
    reconnect_requested: AtomicBool,
    force_refresh: AtomicBool,
    reconnect_count: AtomicU32,
}

impl fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient")
            .field("label", &self.inner.label)
            .field("url", &self.inner.url)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl StreamClient {
    pub fn builder(env: Environment) -> StreamClientBuilder {
        StreamClientBuilder::new(env)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state() == ConnectionState::Open && self.inner.open_connection().is_some()
    }

    /// Copy of the `channel → acknowledged` map.
    pub fn get_subscriptions(&self) -> HashMap<String, bool> {
        lock(&self.inner.registry).get_subscriptions()
    }

    /// Successful reconnects since the client was built.
    pub fn reconnect_count(&self) -> u32 {
        self.inner.reconnect_count.load(Ordering::Acquire)
    }

    pub fn reconnected(&self) -> bool {
        self.reconnect_count() > 0
    }

    /// A transport failure or auth rejection is waiting for [`reconnect`](Self::reconnect).
    ///
    /// The background reader handles this itself; manual pump users check it.
    pub fn reconnect_pending(&self) -> bool {
        self.inner.reconnect_requested.load(Ordering::Acquire)
    }

    /// Whether the token lease reached the staleness threshold.
    ///
    /// `false` without a token source or when no token was ever issued.
    pub fn is_token_expired(&self) -> bool {
        self.inner.is_token_expired()
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Open a connection, authenticate, and replay the registry.
    ///
    /// Returns `false` on connectivity or auth failure and leaves the client
    /// in `Failed`; calling `connect` again retries. Starts the background
    /// reader when `auto_start_reader` is set.
    pub async fn connect(&self) -> bool {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        if inner.state() == ConnectionState::Open && inner.open_connection().is_some() {
            debug!("[{}] already connected", inner.label);
            return true;
        }

        inner.shutdown_tx.send_replace(false);
        inner.drop_connection().await;

        let forced = inner.force_refresh.swap(false, Ordering::AcqRel);
        if !inner.establish(forced).await {
            inner.set_state(ConnectionState::Failed);
            return false;
        }
        if inner.config.auto_start_reader {
            inner.start_reader();
        }
        true
    }

    /// Run the reconnect procedure now.
    ///
    /// Retries with backoff until a connection is established, reconnection
    /// is exhausted, or the client is closed.
    pub async fn reconnect(&self) -> bool {
        self.inner.reconnect().await
    }

    /// Stop the reader, close the transport, and move to `Disconnected`.
    ///
    /// A second call is a no-op. The client can be connected again.
    pub async fn close(&self) {
        let inner = &self.inner;
        let already_closed = inner.shutdown_tx.send_replace(true);
        let _lifecycle = inner.lifecycle.lock().await;
        // A connect queued ahead of us may have cleared the flag.
        inner.shutdown_tx.send_replace(true);

        let reader = lock(&inner.reader).take();
        let has_conn = lock(&inner.conn).is_some();
        if already_closed && reader.is_none() && !has_conn {
            debug!("[{}] already closed", inner.label);
            return;
        }

        inner.set_state(ConnectionState::Closing);
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                if e.is_panic() {
                    error!("[{}] reader task panicked", inner.label);
                }
            }
        }
        inner.drop_connection().await;
        lock(&inner.pending).clear();
        inner.reconnect_requested.store(false, Ordering::Release);
        inner.set_state(ConnectionState::Disconnected);
        info!("[{}] closed", inner.label);
    }

    /// Register `callback` for `channel` and send the subscribe request if open.
    pub async fn subscribe<F>(&self, channel: &str, callback: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.subscribe_with(channel, Arc::new(callback)).await;
    }

    pub async fn subscribe_with(&self, channel: &str, callback: ChannelCallback) {
        lock(&self.inner.registry).subscribe(channel, callback);
        debug!("[{}] registered {channel}", self.inner.label);
        self.inner.request_channel(RpcMethod::Subscribe, channel).await;
    }

    pub async fn subscribe_channel<F>(&self, channel: Channel, callback: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.subscribe(&channel.name(), callback).await;
    }

    /// Remove `channel` and send the unsubscribe request if open.
    ///
    /// The request goes out even for unregistered channels so server-side
    /// subscriptions made elsewhere can be cancelled. Returns `false` when
    /// the channel was not registered.
    pub async fn unsubscribe(&self, channel: &str) -> bool {
        let removed = lock(&self.inner.registry).unsubscribe(channel);
        if !removed {
            debug!("[{}] unsubscribe: {channel} not registered", self.inner.label);
        }
        self.inner.request_channel(RpcMethod::Unsubscribe, channel).await;
        removed
    }

    /// One receive-and-dispatch cycle bounded by `pump_timeout`.
    ///
    /// Returns `true` if a message was processed. Timeouts, a missing
    /// connection and transport failures return `false`; a failure also
    /// marks a reconnect as pending.
    pub async fn pump_once(&self) -> bool {
        match self.inner.receive_once(self.inner.config.pump_timeout()).await {
            Received::Message(_) => true,
            Received::Timeout | Received::NoConnection => false,
            Received::Failed { conn, error } => {
                self.inner.on_transport_error(&conn, error).await;
                false
            }
        }
    }

    /// Pump until `predicate` accepts a data notification or `timeout` elapses.
    ///
    /// `predicate` receives `(channel, envelope)` of each delivered
    /// notification. Keeps polling through timeouts and reconnects until the
    /// deadline. Returns the number of processed messages.
    pub async fn pump_until<P>(&self, mut predicate: P, timeout: Duration) -> usize
    where
        P: FnMut(&str, &Value) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut processed = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return processed;
            }
            match self.inner.receive_once(remaining).await {
                Received::Message(dispatch) => {
                    processed += 1;
                    if let Dispatch::Data(n) = &dispatch {
                        if predicate(&n.channel, &n.envelope) {
                            return processed;
                        }
                    }
                }
                Received::Timeout => {}
                Received::NoConnection => tokio::time::sleep(remaining.min(IDLE_POLL)).await,
                Received::Failed { conn, error } => {
                    self.inner.on_transport_error(&conn, error).await;
                    tokio::time::sleep(remaining.min(IDLE_POLL)).await;
                }
            }
        }
    }

    /// Feed `text` straight into dispatch, bypassing the transport.
    ///
    /// Returns `false` if the frame was malformed and dropped.
    pub fn inject(&self, text: &str) -> bool {
        !matches!(self.inner.process_text(text), Dispatch::Dropped)
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, to: ConnectionState) {
        let from = self.state_tx.send_replace(to);
        if from != to {
            debug!("[{}] {from} -> {to}", self.label);
            self.emit(StreamEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: StreamEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn open_connection(&self) -> Option<Arc<dyn Connection>> {
        lock(&self.conn).clone().filter(|c| c.is_open())
    }

    fn is_current(&self, conn: &Arc<dyn Connection>) -> bool {
        lock(&self.conn).as_ref().is_some_and(|c| same_connection(c, conn))
    }

    /// Detach and close the current connection, ignoring close errors.
    async fn drop_connection(&self) {
        let old = lock(&self.conn).take();
        if let Some(conn) = old {
            if let Err(e) = conn.close().await {
                debug!("[{}] ignoring close error: {e}", self.label);
            }
        }
    }

    fn is_token_expired(&self) -> bool {
        match &self.auth {
            Some(auth) => lease_is_stale(auth.issued_at_ms(), now_ms(), self.config.token_expiry_threshold()),
            None => false,
        }
    }

    /// Token for the next connection, refreshed first if forced, stale or missing.
    async fn current_token(&self, force: bool) -> Option<String> {
        let auth = self.auth.as_ref()?;
        let stale = self.is_token_expired();
        if force || stale || auth.token().is_none() {
            match auth.refresh_if_needed(force || stale).await {
                Ok(Some(token)) => return Some(token),
                Ok(None) => {}
                Err(e) => warn!("[{}] token refresh failed, keeping current token: {e}", self.label),
            }
        }
        auth.token()
    }

    // -- connection setup -------------------------------------------------

    /// Connect, authenticate, go `Open`, replay the registry.
    async fn establish(&self, force_refresh: bool) -> bool {
        self.set_state(ConnectionState::Connecting);
        lock(&self.pending).clear();

        let token = self.current_token(force_refresh).await;
        if self.auth.is_some() && token.is_none() {
            warn!("[{}] no bearer token available, connecting unauthenticated", self.label);
        }
        let mut headers = Headers::new();
        if let Some(token) = &token {
            headers.insert("Authorization".into(), format!("Bearer {token}"));
        }

        let conn = match self.connector.connect(&self.url, &headers).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("[{}] connect to {} failed: {e}", self.label, self.url);
                return false;
            }
        };
        *lock(&self.conn) = Some(Arc::clone(&conn));

        if let Some(token) = token {
            self.set_state(ConnectionState::Authenticating);
            if let Err(e) = self.authenticate(&conn, &token).await {
                warn!("[{}] authentication failed: {e}", self.label);
                self.drop_connection().await;
                return false;
            }
        }

        self.reconnect_requested.store(false, Ordering::Release);
        self.set_state(ConnectionState::Open);
        info!("[{}] connected to {}", self.label, self.url);
        self.resubscribe(&conn).await;
        true
    }

    /// Send the auth request and wait for its acknowledgment.
    ///
    /// Frames that arrive before the ack are dispatched normally.
    async fn authenticate(&self, conn: &Arc<dyn Connection>, token: &str) -> Result<(), PdxError> {
        let request = RpcRequest::auth(self.next_id(), token);
        self.send_request(conn, &request, PendingRequest::Auth).await?;

        let _reading = self.recv_lock.lock().await;
        let timeout = self.config.auth_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PdxError::Auth(format!("no auth acknowledgment within {timeout:?}")));
            }
            let Some(text) = conn.recv(remaining).await? else {
                continue;
            };
            match self.process_text(&text) {
                Dispatch::AuthAck => {
                    debug!("[{}] authenticated", self.label);
                    return Ok(());
                }
                Dispatch::AuthRejected { code, message } => return Err(PdxError::AuthRejected { code, message }),
                _ => {}
            }
        }
    }

    /// Re-send every registered channel; acks are reset until the server re-confirms.
    async fn resubscribe(&self, conn: &Arc<dyn Connection>) {
        let channels = lock(&self.registry).reset_for_resubscribe();
        if channels.is_empty() {
            return;
        }
        for channel in &channels {
            let request = RpcRequest::subscribe(self.next_id(), channel);
            if let Err(e) = self.send_request(conn, &request, PendingRequest::Subscribe(channel.clone())).await {
                warn!("[{}] resubscribe {channel} failed: {e}", self.label);
                if let PdxError::Transport(e) = e {
                    self.on_transport_error(conn, e).await;
                }
                return;
            }
        }
        info!("[{}] subscribed to {} channel(s)", self.label, channels.len());
    }

    // -- sending ----------------------------------------------------------

    async fn send_on(&self, conn: &Arc<dyn Connection>, frame: &str) -> Result<(), TransportError> {
        let _sending = self.send_lock.lock().await;
        conn.send(frame).await
    }

    async fn send_request(
        &self,
        conn: &Arc<dyn Connection>,
        request: &RpcRequest<'_>,
        pending: PendingRequest,
    ) -> Result<(), PdxError> {
        let frame = request.encode()?;
        lock(&self.pending).insert(request.id(), pending);
        if let Err(e) = self.send_on(conn, &frame).await {
            lock(&self.pending).remove(&request.id());
            return Err(e.into());
        }
        Ok(())
    }

    /// Send a subscribe/unsubscribe request if the session is open.
    async fn request_channel(&self, method: RpcMethod, channel: &str) {
        if self.state() != ConnectionState::Open {
            debug!("[{}] not open, {} {channel} deferred", self.label, method.as_str());
            return;
        }
        let Some(conn) = self.open_connection() else {
            return;
        };
        let id = self.next_id();
        let (request, pending) = match method {
            RpcMethod::Subscribe => (RpcRequest::subscribe(id, channel), PendingRequest::Subscribe(channel.to_owned())),
            RpcMethod::Unsubscribe => {
                (RpcRequest::unsubscribe(id, channel), PendingRequest::Unsubscribe(channel.to_owned()))
            }
            RpcMethod::Auth => return,
        };
        match self.send_request(&conn, &request, pending).await {
            Ok(()) => debug!("[{}] {} {channel} sent (id={id})", self.label, method.as_str()),
            Err(PdxError::Transport(e)) => self.on_transport_error(&conn, e).await,
            Err(e) => warn!("[{}] {} {channel} failed: {e}", self.label, method.as_str()),
        }
    }

    // -- receiving --------------------------------------------------------

    /// One receive-and-dispatch cycle under the receive lock.
    async fn receive_once(&self, timeout: Duration) -> Received {
        let _reading = self.recv_lock.lock().await;
        let Some(conn) = self.open_connection() else {
            return Received::NoConnection;
        };
        match conn.recv(timeout).await {
            Ok(Some(text)) => Received::Message(self.process_text(&text)),
            Ok(None) => Received::Timeout,
            Err(error) => Received::Failed { conn, error },
        }
    }

    /// React to a failed connection: schedule a reconnect, or fail for good.
    async fn on_transport_error(&self, conn: &Arc<dyn Connection>, error: TransportError) {
        if !self.is_current(conn) || self.is_shut_down() {
            return;
        }
        if self.config.disable_reconnect {
            error!("[{}] transport failure, reconnect disabled: {error}", self.label);
            self.drop_connection().await;
            self.set_state(ConnectionState::Failed);
        } else {
            warn!("[{}] transport failure, reconnect scheduled: {error}", self.label);
            self.reconnect_requested.store(true, Ordering::Release);
            self.set_state(ConnectionState::Connecting);
        }
    }

    // -- dispatch ---------------------------------------------------------

    fn process_text(&self, text: &str) -> Dispatch {
        let inbound = match envelope::decode(text, |id| lock(&self.pending).remove(&id)) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("[{}] dropping message: {e}", self.label);
                self.emit(StreamEvent::MessageDropped { reason: e.to_string() });
                return Dispatch::Dropped;
            }
        };

        match inbound {
            Inbound::AuthAck { id } => {
                debug!("[{}] auth acknowledged (id={id})", self.label);
                Dispatch::AuthAck
            }
            Inbound::SubAck { channel, .. } => {
                if lock(&self.registry).mark_acknowledged(&channel) {
                    debug!("[{}] subscribed to {channel}", self.label);
                } else {
                    debug!("[{}] ack for unregistered channel {channel}", self.label);
                }
                Dispatch::Control
            }
            Inbound::UnsubAck { channel, .. } => {
                debug!("[{}] unsubscribed from {channel}", self.label);
                Dispatch::Control
            }
            Inbound::ErrorResponse { code, message, request, .. } => self.handle_error(code, message, request),
            Inbound::Data(notification) => {
                self.deliver(&notification);
                Dispatch::Data(notification)
            }
            Inbound::Response { id, .. } => {
                debug!("[{}] uncorrelated response (id={id:?})", self.label);
                Dispatch::Control
            }
        }
    }

    fn handle_error(&self, code: i64, message: String, request: Option<PendingRequest>) -> Dispatch {
        if self.config.is_auth_error(code) {
            warn!("[{}] bearer token rejected ({code}): {message}; refresh forced on reconnect", self.label);
            self.force_refresh.store(true, Ordering::Release);
            self.reconnect_requested.store(true, Ordering::Release);
            self.emit(StreamEvent::AuthRejected { code, message: message.clone() });
            return Dispatch::AuthRejected { code, message };
        }

        match request {
            Some(PendingRequest::Auth) => {
                warn!("[{}] auth request failed ({code}): {message}", self.label);
                Dispatch::AuthRejected { code, message }
            }
            Some(PendingRequest::Subscribe(channel) | PendingRequest::Unsubscribe(channel)) => {
                warn!("[{}] request for {channel} rejected ({code}): {message}", self.label);
                self.emit(StreamEvent::SubscriptionRejected { channel, code, message });
                Dispatch::Control
            }
            None => {
                warn!("[{}] server error ({code}): {message}", self.label);
                Dispatch::Control
            }
        }
    }

    fn deliver(&self, n: &Notification) {
        if self.config.validate_messages {
            match self.validators.validate(&n.channel, n.data()) {
                Some(Ok(_)) => debug!("[{}] {} payload validated", self.label, n.channel),
                Some(Err(reason)) => {
                    warn!("[{}] {} payload failed validation: {reason}", self.label, n.channel);
                    self.emit(StreamEvent::ValidationFailed { channel: n.channel.clone(), reason });
                }
                None => {}
            }
        }

        // Missing callback: unsubscribed while the message was in flight.
        let Some(callback) = lock(&self.registry).callback(&n.channel) else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| callback(&n.channel, &n.envelope))).is_err() {
            error!("[{}] callback for {} panicked", self.label, n.channel);
        }
    }

    // -- reconnect --------------------------------------------------------

    /// `reader_sleep_on_error * 2^(attempt-1)`, capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.config
            .reader_sleep_on_error()
            .saturating_mul(factor)
            .min(self.config.max_reconnect_backoff())
    }

    async fn reconnect(&self) -> bool {
        if self.is_shut_down() {
            return false;
        }
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_shut_down() {
            return false;
        }

        self.reconnect_requested.store(false, Ordering::Release);
        self.drop_connection().await;

        if self.config.disable_reconnect {
            warn!("[{}] reconnect disabled", self.label);
            self.set_state(ConnectionState::Failed);
            return false;
        }
        self.set_state(ConnectionState::Connecting);

        let mut shutdown = self.shutdown_tx.subscribe();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if !sleep_unless_shutdown(&mut shutdown, self.backoff(attempt)).await {
                return false;
            }

            let forced = self.force_refresh.swap(false, Ordering::AcqRel);
            info!("[{}] reconnect attempt {attempt} (forced refresh: {forced})", self.label);
            if self.establish(forced).await {
                self.reconnect_count.fetch_add(1, Ordering::AcqRel);
                self.emit(StreamEvent::Reconnected { attempt });
                return true;
            }

            self.emit(StreamEvent::ReconnectFailed { attempt });
            if self.config.max_reconnect_attempts.is_some_and(|max| attempt >= max) {
                error!("[{}] giving up after {attempt} reconnect attempt(s)", self.label);
                self.set_state(ConnectionState::Failed);
                return false;
            }
            // Stay on the reconnect path; Disconnected is reserved for close().
            self.set_state(ConnectionState::Connecting);
        }
    }

    // -- background reader -------------------------------------------------

    fn start_reader(self: &Arc<Self>) {
        let mut slot = lock(&self.reader);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let shutdown = self.shutdown_tx.subscribe();
        *slot = Some(tokio::spawn(run_reader(Arc::downgrade(self), shutdown)));
        debug!("[{}] reader started", self.label);
    }
}

/// Background reader: receive and dispatch until shutdown or `Failed`.
async fn run_reader(weak: Weak<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let Some(client) = weak.upgrade() else {
            break;
        };
        if client.state() == ConnectionState::Failed {
            break;
        }

        if client.reconnect_requested.load(Ordering::Acquire) {
            tokio::select! {
                _ = shutdown.changed() => break,
                ok = client.reconnect() => {
                    if !ok && client.state() == ConnectionState::Failed {
                        break;
                    }
                }
            }
            continue;
        }

        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = client.receive_once(client.config.ws_timeout()) => received,
        };
        match received {
            Received::Message(_) | Received::Timeout => {}
            Received::NoConnection => {
                let idle = client.config.reader_sleep_on_no_connection();
                if !sleep_unless_shutdown(&mut shutdown, idle).await {
                    break;
                }
            }
            Received::Failed { conn, error } => client.on_transport_error(&conn, error).await,
        }
    }
    debug!("background reader stopped");
}
