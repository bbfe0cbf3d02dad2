//! Polymarket CLOB websocket connection manager.
//!
//! Owns one streaming connection, the caller-declared set of desired
//! subscriptions, and the reconnect loop. Frames sent while disconnected are
//! queued and flushed in order on the next successful open; after the queue
//! is flushed every tracked `pending`/`active` subscription that the queue did
//! not already cover is re-sent exactly once.
//!
//! Connection failures never reach subscription callers. They are logged,
//! broadcast as `WsEvent::Disconnected`, and drive the reconnect state
//! machine until the attempt ceiling is exceeded.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use poly_common::Channel;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as TungsteniteError, protocol::Message},
};
use tracing::{debug, error, info, warn};

use crate::rest::endpoints;
use crate::types::{ApiCreds, GenericMessage, SubscriptionFrame, SubscriptionOp, WsAuth};

/// Precondition violations returned synchronously to callers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WsError {
    #[error("Subscription requires at least one instrument id")]
    EmptyInstrumentSet,

    #[error("Authenticated subscription requires API credentials")]
    MissingCredentials,

    #[error("No matching subscription on channel {channel}")]
    NoMatchingSubscription { channel: Channel },

    #[error("Failed to encode frame: {0}")]
    Encode(String),
}

/// Transport failures inside the connection loop. Never surfaced to callers.
#[derive(Debug, Error)]
enum ConnectionError {
    #[error("WebSocket connection failed: {0}")]
    Connect(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] TungsteniteError),

    #[error("Connection timeout")]
    Timeout,

    #[error("Stream ended unexpectedly")]
    StreamEnded,
}

/// Source of API credentials for authenticated channels.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self) -> Option<ApiCreds>;
}

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Websocket endpoint.
    pub url: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Keep-alive ping interval.
    pub ping_interval: Duration,
    /// Delay before the first reconnect attempt.
    pub reconnect_delay: Duration,
    /// Upper bound for the doubling reconnect delay.
    pub max_reconnect_delay: Duration,
    /// Attempts allowed before settling into `Error`.
    pub max_reconnect_attempts: u32,
    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: endpoints::CLOB_WS.to_string(),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            event_buffer: 1024,
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Error,
}

/// Identity of a subscription: identical requests collapse onto one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionKey {
    pub channel: Channel,
    pub authenticated: bool,
    pub instrument_ids: Vec<String>,
}

impl SubscriptionKey {
    pub fn new<I, S>(channel: Channel, instrument_ids: I, authenticated: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: BTreeSet<String> = instrument_ids.into_iter().map(Into::into).collect();
        Self {
            channel,
            authenticated,
            instrument_ids: ids.into_iter().collect(),
        }
    }
}

/// A desired subscription, as passed to `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub channel: Channel,
    pub instrument_ids: Vec<String>,
    pub authenticated: bool,
}

impl SubscriptionRequest {
    pub fn new<I, S>(channel: Channel, instrument_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channel,
            instrument_ids: instrument_ids.into_iter().map(Into::into).collect(),
            authenticated: false,
        }
    }

    pub fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }
}

/// Tracked subscription as reported by `status_snapshot`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsocketSubscription {
    pub channel: Channel,
    pub instrument_ids: BTreeSet<String>,
    pub authenticated: bool,
    pub status: SubscriptionStatus,
    pub last_updated_at: DateTime<Utc>,
    #[serde(skip)]
    auth: Option<WsAuth>,
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WsStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub reconnect_enabled: bool,
    pub last_error: Option<String>,
    pub queued_frames: usize,
    pub subscriptions: Vec<WebsocketSubscription>,
}

impl WsStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Events broadcast to consumers.
#[derive(Debug, Clone)]
pub enum WsEvent {
    /// Connection established and subscriptions replayed.
    Connected,
    /// Connection lost; the reason is the transport error.
    Disconnected(String),
    /// A parsed inbound payload.
    Message {
        event_type: Option<String>,
        payload: serde_json::Value,
    },
}

/// Outbound text frame, tagged with the subscription it establishes.
#[derive(Debug, Clone)]
struct OutboundFrame {
    subscribes: Option<SubscriptionKey>,
    text: String,
}

/// Synchronous state machine behind the manager.
///
/// All transitions happen under one lock so the writer, the queue and the
/// subscription table never disagree.
#[derive(Debug)]
struct ConnectionCore {
    config: WsConfig,
    state: ConnectionState,
    subscriptions: BTreeMap<SubscriptionKey, WebsocketSubscription>,
    queue: VecDeque<OutboundFrame>,
    writer: Option<mpsc::UnboundedSender<OutboundFrame>>,
    reconnect_attempts: u32,
    reconnect_enabled: bool,
    last_error: Option<String>,
}

impl ConnectionCore {
    fn new(config: WsConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            subscriptions: BTreeMap::new(),
            queue: VecDeque::new(),
            writer: None,
            reconnect_attempts: 0,
            reconnect_enabled: true,
            last_error: None,
        }
    }

    /// Whether a subscribe frame for `key` is already queued with no
    /// unsubscribe behind it.
    fn is_queued(&self, key: &SubscriptionKey) -> bool {
        for frame in self.queue.iter().rev() {
            match &frame.subscribes {
                Some(queued) if queued == key => return true,
                Some(_) => continue,
                None => return false,
            }
        }
        false
    }

    /// Send now if connected, otherwise queue.
    fn dispatch(&mut self, frame: OutboundFrame) {
        if self.state == ConnectionState::Connected
            && let Some(writer) = &self.writer
        {
            match writer.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(frame)) => {
                    // Writer side already gone; keep the frame for the next open
                    self.queue.push_back(frame);
                    return;
                }
            }
        }
        if let Some(key) = &frame.subscribes
            && self.is_queued(key)
        {
            return;
        }
        self.queue.push_back(frame);
    }

    /// Record a subscription as pending (idempotent) and return its frame.
    fn track(&mut self, key: SubscriptionKey, auth: Option<WsAuth>) -> OutboundFrame {
        let now = Utc::now();
        let entry = self
            .subscriptions
            .entry(key.clone())
            .or_insert_with(|| WebsocketSubscription {
                channel: key.channel,
                instrument_ids: key.instrument_ids.iter().cloned().collect(),
                authenticated: key.authenticated,
                status: SubscriptionStatus::Pending,
                last_updated_at: now,
                auth: None,
            });
        if entry.status == SubscriptionStatus::Error {
            entry.status = SubscriptionStatus::Pending;
        }
        if auth.is_some() {
            entry.auth = auth;
        }
        entry.last_updated_at = now;
        subscribe_frame(&key, entry.auth.clone())
    }

    fn mark_failed(&mut self, key: SubscriptionKey) {
        let now = Utc::now();
        self.subscriptions
            .entry(key.clone())
            .and_modify(|s| {
                s.status = SubscriptionStatus::Error;
                s.last_updated_at = now;
            })
            .or_insert_with(|| WebsocketSubscription {
                channel: key.channel,
                instrument_ids: key.instrument_ids.iter().cloned().collect(),
                authenticated: key.authenticated,
                status: SubscriptionStatus::Error,
                last_updated_at: now,
                auth: None,
            });
    }

    /// Remove matching subscriptions. Empty `instrument_ids` means the whole
    /// channel. Returns how many were removed.
    fn untrack(&mut self, channel: Channel, instrument_ids: &BTreeSet<String>) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|key, _| {
            if key.channel != channel {
                return true;
            }
            if instrument_ids.is_empty() {
                return false;
            }
            !key.instrument_ids.iter().eq(instrument_ids.iter())
        });
        before - self.subscriptions.len()
    }

    fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// Connection opened: flush the queue, then replay what it missed.
    fn on_open(&mut self, writer: mpsc::UnboundedSender<OutboundFrame>) -> usize {
        self.state = ConnectionState::Connected;
        self.reconnect_attempts = 0;
        self.last_error = None;

        let mut sent = 0;
        let mut flushed: HashSet<SubscriptionKey> = HashSet::new();

        while let Some(frame) = self.queue.pop_front() {
            if let Some(key) = &frame.subscribes {
                flushed.insert(key.clone());
            }
            if let Err(mpsc::error::SendError(frame)) = writer.send(frame) {
                self.queue.push_front(frame);
                return sent;
            }
            sent += 1;
        }

        let now = Utc::now();
        for (key, sub) in self.subscriptions.iter_mut() {
            if sub.status == SubscriptionStatus::Error {
                continue;
            }
            if !flushed.contains(key) {
                if writer.send(subscribe_frame(key, sub.auth.clone())).is_err() {
                    break;
                }
                sent += 1;
            }
            sub.status = SubscriptionStatus::Active;
            sub.last_updated_at = now;
        }

        self.writer = Some(writer);
        sent
    }

    /// Detach the writer and put frames it never delivered back at the head
    /// of the queue.
    fn detach_writer(&mut self, undelivered: Vec<OutboundFrame>) {
        self.writer = None;
        for frame in undelivered.into_iter().rev() {
            self.queue.push_front(frame);
        }
    }

    /// Connection closed. Returns the delay before the next attempt, or
    /// `None` if the manager should stop retrying.
    fn on_close(&mut self, reason: &str) -> Option<Duration> {
        self.writer = None;
        self.last_error = Some(reason.to_string());

        if !self.reconnect_enabled {
            self.state = ConnectionState::Disconnected;
            return None;
        }

        self.reconnect_attempts += 1;
        if self.reconnect_attempts > self.config.max_reconnect_attempts {
            self.state = ConnectionState::Error;
            return None;
        }

        self.state = ConnectionState::Disconnected;
        let exponent = (self.reconnect_attempts - 1).min(16);
        let delay = self.config.reconnect_delay.saturating_mul(1 << exponent);
        Some(delay.min(self.config.max_reconnect_delay.max(self.config.reconnect_delay)))
    }

    fn enable(&mut self) {
        self.reconnect_enabled = true;
        self.reconnect_attempts = 0;
        if self.state == ConnectionState::Error {
            self.state = ConnectionState::Disconnected;
        }
    }

    fn disable(&mut self) {
        self.reconnect_enabled = false;
        self.writer = None;
        self.state = ConnectionState::Disconnected;
    }

    fn snapshot(&self) -> WsStatus {
        WsStatus {
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            reconnect_enabled: self.reconnect_enabled,
            last_error: self.last_error.clone(),
            queued_frames: self.queue.len(),
            subscriptions: self.subscriptions.values().cloned().collect(),
        }
    }
}

fn encode_frame(
    op: SubscriptionOp,
    channel: Channel,
    instrument_ids: Vec<String>,
    auth: Option<WsAuth>,
) -> Result<String, WsError> {
    let frame = SubscriptionFrame {
        op,
        channel,
        assets_ids: instrument_ids,
        auth,
    };
    serde_json::to_string(&frame).map_err(|e| WsError::Encode(e.to_string()))
}

fn subscribe_frame(key: &SubscriptionKey, auth: Option<WsAuth>) -> OutboundFrame {
    // Frame holds only strings; encoding cannot fail.
    let text = encode_frame(
        SubscriptionOp::Subscribe,
        key.channel,
        key.instrument_ids.clone(),
        auth,
    )
    .unwrap_or_default();
    OutboundFrame {
        subscribes: Some(key.clone()),
        text,
    }
}

struct RunningTask {
    handle: JoinHandle<()>,
    shutdown: broadcast::Sender<()>,
}

struct Shared {
    config: WsConfig,
    core: Mutex<ConnectionCore>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    events: broadcast::Sender<WsEvent>,
}

/// Resilient websocket connection with subscription replay.
pub struct WebsocketConnectionManager {
    shared: Arc<Shared>,
    task: tokio::sync::Mutex<Option<RunningTask>>,
}

impl WebsocketConnectionManager {
    pub fn new(config: WsConfig, credentials: Option<Arc<dyn CredentialProvider>>) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(ConnectionCore::new(config.clone())),
                config,
                credentials,
                events,
            }),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Subscribe to inbound events.
    pub fn events(&self) -> broadcast::Receiver<WsEvent> {
        self.shared.events.subscribe()
    }

    /// Record desired subscriptions and open the connection if not already
    /// open. Re-enables reconnection after `stop` or after the attempt
    /// ceiling was hit.
    ///
    /// Invalid requests are logged and marked `error`; they do not prevent
    /// the connection from starting.
    pub async fn start(&self, subscriptions: Vec<SubscriptionRequest>) {
        let exhausted = {
            let mut core = self.shared.core.lock();
            let exhausted = core.state == ConnectionState::Error;
            core.enable();
            exhausted
        };

        for request in subscriptions {
            let channel = request.channel;
            if let Err(e) = self
                .subscribe(channel, request.instrument_ids, request.authenticated)
                .await
            {
                warn!(channel = %channel, error = %e, "Skipping invalid subscription");
            }
        }

        let mut task = self.task.lock().await;
        if let Some(running) = task.take()
            && !running.handle.is_finished()
        {
            if !exhausted {
                debug!("Websocket already running");
                *task = Some(running);
                return;
            }
            // Loop has given up and is on its way out
            let _ = running.handle.await;
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            run(shared, shutdown_rx).await;
        });
        *task = Some(RunningTask {
            handle,
            shutdown: shutdown_tx,
        });
        info!(url = %self.shared.config.url, "Websocket manager started");
    }

    /// Disable reconnection and close any open connection.
    pub async fn stop(&self) {
        self.shared.core.lock().disable();

        let running = self.task.lock().await.take();
        if let Some(running) = running {
            let _ = running.shutdown.send(());
            let mut handle = running.handle;
            if timeout(Duration::from_secs(5), &mut handle).await.is_err() {
                warn!("Websocket task did not stop in time, aborting");
                handle.abort();
            }
        }
        info!("Websocket manager stopped");
    }

    /// Track a subscription and send (or queue) its frame.
    pub async fn subscribe<I, S>(
        &self,
        channel: Channel,
        instrument_ids: I,
        authenticated: bool,
    ) -> Result<SubscriptionKey, WsError>
    where
        I: IntoIterator<Item = S> + Send,
        S: Into<String>,
    {
        let key = SubscriptionKey::new(channel, instrument_ids, authenticated);
        if key.instrument_ids.is_empty() {
            return Err(WsError::EmptyInstrumentSet);
        }

        let auth = if authenticated {
            let creds = match &self.shared.credentials {
                Some(provider) => provider.credentials().await,
                None => None,
            };
            match creds {
                Some(creds) => Some(WsAuth::from(&creds)),
                None => {
                    self.shared.core.lock().mark_failed(key);
                    return Err(WsError::MissingCredentials);
                }
            }
        } else {
            None
        };

        let mut core = self.shared.core.lock();
        let frame = core.track(key.clone(), auth);
        core.dispatch(frame);
        debug!(channel = %channel, ids = key.instrument_ids.len(), "Subscription tracked");
        Ok(key)
    }

    /// Remove subscriptions and send the unsubscribe frame. An empty id set
    /// removes every subscription on the channel.
    pub fn unsubscribe<I, S>(&self, channel: Channel, instrument_ids: I) -> Result<usize, WsError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: BTreeSet<String> = instrument_ids.into_iter().map(Into::into).collect();
        let mut core = self.shared.core.lock();
        let removed = core.untrack(channel, &ids);
        if removed == 0 {
            return Err(WsError::NoMatchingSubscription { channel });
        }
        let text = encode_frame(SubscriptionOp::Unsubscribe, channel, ids.into_iter().collect(), None)?;
        core.dispatch(OutboundFrame {
            subscribes: None,
            text,
        });
        debug!(channel = %channel, removed, "Unsubscribed");
        Ok(removed)
    }

    pub fn status_snapshot(&self) -> WsStatus {
        self.shared.core.lock().snapshot()
    }
}

/// Reconnect loop. Exits on shutdown, when reconnection is disabled, or when
/// the attempt ceiling is exceeded.
async fn run(shared: Arc<Shared>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        if shutdown.try_recv().is_ok() {
            info!("Websocket: shutdown signal received");
            return;
        }

        shared.core.lock().begin_connect();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = run_connection(&shared, tx, &mut rx, &mut shutdown).await;

        let reason = match result {
            Ok(()) => {
                let mut core = shared.core.lock();
                core.detach_writer(drain_undelivered(&mut rx));
                core.state = ConnectionState::Disconnected;
                info!("Websocket: clean shutdown");
                return;
            }
            Err(e) => e.to_string(),
        };

        let delay = {
            let mut core = shared.core.lock();
            core.detach_writer(drain_undelivered(&mut rx));
            core.on_close(&reason)
        };
        let _ = shared.events.send(WsEvent::Disconnected(reason.clone()));

        let Some(delay) = delay else {
            let status = shared.core.lock().snapshot();
            if status.reconnect_enabled {
                error!(
                    attempts = status.reconnect_attempts,
                    error = %reason,
                    "Websocket: reconnect attempts exhausted"
                );
            }
            return;
        };

        warn!(error = %reason, "Websocket error, reconnecting in {delay:?}");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => {
                info!("Websocket: shutdown during reconnect delay");
                return;
            }
        }
    }
}

/// Frames the connection accepted but never wrote. Call with the core lock
/// held so nothing is dispatched between the drain and the detach.
fn drain_undelivered(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Vec<OutboundFrame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

/// Run a single connection until it fails or shutdown is requested.
async fn run_connection(
    shared: &Shared,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), ConnectionError> {
    let url = &shared.config.url;
    debug!("Connecting to CLOB websocket at {url}");

    let (ws_stream, _response) = match timeout(shared.config.connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(ConnectionError::Connect(e.to_string())),
        Err(_) => return Err(ConnectionError::Timeout),
    };

    let sent = shared.core.lock().on_open(tx);
    info!(replayed = sent, "Connected to CLOB websocket");
    let _ = shared.events.send(WsEvent::Connected);

    let (mut write, mut read) = ws_stream.split();
    let ping_every = shared.config.ping_interval;
    let mut ping_timer = interval_at(Instant::now() + ping_every, ping_every);

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_message(shared, &text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("Received pong");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("WebSocket closed by server: {:?}", frame);
                        return Err(ConnectionError::StreamEnded);
                    }
                    Some(Err(e)) => {
                        return Err(ConnectionError::WebSocket(e));
                    }
                    None => {
                        return Err(ConnectionError::StreamEnded);
                    }
                    _ => {}
                }
            }

            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        write.send(Message::Text(frame.text.into())).await?;
                    }
                    // Writer detached by stop()
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }

            _ = ping_timer.tick() => {
                debug!("Sending PING");
                write.send(Message::Text("PING".into())).await?;
            }

            _ = shutdown.recv() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

/// Parse an inbound frame and broadcast it. Non-JSON frames such as `PONG`
/// are ignored.
fn handle_message(shared: &Shared, text: &str) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            debug!("Non-JSON message: {}", text);
            return;
        }
    };

    let items = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    for payload in items {
        let event_type = serde_json::from_value::<GenericMessage>(payload.clone())
            .ok()
            .and_then(|m| m.event_type.or(m.channel));
        let _ = shared.events.send(WsEvent::Message {
            event_type,
            payload,
        });
    }
}
