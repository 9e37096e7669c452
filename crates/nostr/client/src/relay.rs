//! Single relay connection management.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nostr::{Event, Filter, TaggedEvent};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::duration_ms;
use crate::error::{ClientError, Result};
use crate::lock;
use crate::pool::PoolEvent;
use crate::transport::{RelayTransport, TransportChannels, TransportEvent};

const LISTENER_CAPACITY: usize = 1024;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    /// Dropped or never reached; the supervisor may be retrying.
    Down,
    /// Closed on purpose. No reconnects.
    Closed,
}

/// What a connection may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
    pub read: bool,
    pub write: bool,
}

impl RelaySettings {
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };

    pub fn merge(self, other: Self) -> Self {
        Self {
            read: self.read || other.read,
            write: self.write || other.write,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

/// Outcome of publishing one event to one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkResponse {
    pub id: String,
    pub relay: String,
    pub ok: bool,
    pub message: String,
    pub event: Option<Event>,
}

impl OkResponse {
    pub(crate) fn failed(event: &Event, relay: &str, message: impl Into<String>) -> Self {
        Self {
            id: event.id.clone(),
            relay: relay.to_string(),
            ok: false,
            message: message.into(),
            event: Some(event.clone()),
        }
    }
}

/// Relay message received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event(String, Event),
    Ok(String, bool, String),
    Eose(String),
    Closed(String, String),
    Notice(String),
    Auth(String),
    /// Any other message kind, kept raw (`NEG-MSG`, `NEG-ERR`, ...).
    Unknown(Vec<Value>),
}

/// Events delivered to session-scoped listeners of one connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Event {
        subscription_id: String,
        event: Event,
    },
    Eose(String),
    Closed {
        subscription_id: String,
        message: String,
    },
    Notice(String),
    Auth(String),
    Ok(OkResponse),
    UnknownMessage(Vec<Value>),
    Connected {
        was_reconnect: bool,
    },
    Disconnected {
        code: Option<u16>,
    },
}

/// Relay connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// How long `publish` waits for the relay's `OK`.
    #[serde(with = "duration_ms")]
    pub publish_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_min: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_max: Duration,
    #[serde(with = "duration_ms")]
    pub ephemeral_idle_timeout: Duration,
    pub negentropy_frame_size_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            ephemeral_idle_timeout: Duration::from_secs(30),
            negentropy_frame_size_limit: 50_000,
        }
    }
}

/// Relay connection.
///
/// Once connected a supervisor task owns the inbound side: it parses frames,
/// fans them out to listeners and the pool, and reconnects with exponential
/// backoff when the session drops.
pub struct RelayConnection {
    id: String,
    address: String,
    config: RelayConfig,
    transport: Arc<dyn RelayTransport>,
    status: RwLock<ConnectionStatus>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    settings: std::sync::Mutex<RelaySettings>,
    ephemeral: AtomicBool,
    closed: AtomicBool,
    listeners: broadcast::Sender<ConnectionEvent>,
    pool_tx: Option<mpsc::UnboundedSender<PoolEvent>>,
    pending_ok: std::sync::Mutex<HashMap<String, oneshot::Sender<OkResponse>>>,
    active_requests: std::sync::Mutex<HashSet<String>>,
    last_activity: std::sync::Mutex<Instant>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConnection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("ephemeral", &self.is_ephemeral())
            .finish_non_exhaustive()
    }
}

impl RelayConnection {
    /// `address` must already be normalized. Without `pool_tx` the connection
    /// only reports to its own listeners.
    pub fn new(
        address: impl Into<String>,
        settings: RelaySettings,
        ephemeral: bool,
        config: RelayConfig,
        transport: Arc<dyn RelayTransport>,
        pool_tx: Option<mpsc::UnboundedSender<PoolEvent>>,
    ) -> Self {
        let (listeners, _) = broadcast::channel(LISTENER_CAPACITY);
        Self {
            id: Uuid::new_v4().to_string(),
            address: address.into(),
            config,
            transport,
            status: RwLock::new(ConnectionStatus::Down),
            writer: Mutex::new(None),
            settings: std::sync::Mutex::new(settings),
            ephemeral: AtomicBool::new(ephemeral),
            closed: AtomicBool::new(false),
            listeners,
            pool_tx,
            pending_ok: std::sync::Mutex::new(HashMap::new()),
            active_requests: std::sync::Mutex::new(HashSet::new()),
            last_activity: std::sync::Mutex::new(Instant::now()),
            supervisor: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn settings(&self) -> RelaySettings {
        *lock(&self.settings)
    }

    pub fn merge_settings(&self, settings: RelaySettings) {
        let mut current = lock(&self.settings);
        *current = current.merge(settings);
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral.load(Ordering::SeqCst)
    }

    pub fn set_ephemeral(&self, ephemeral: bool) {
        self.ephemeral.store(ephemeral, Ordering::SeqCst);
    }

    pub async fn status(&self) -> ConnectionStatus {
        *self.status.read().await
    }

    pub async fn is_open(&self) -> bool {
        self.status().await == ConnectionStatus::Open
    }

    /// Subscriptions sent with `request` and not yet closed.
    pub fn active_request_count(&self) -> usize {
        lock(&self.active_requests).len()
    }

    /// Time since the last frame in either direction.
    pub fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    /// Session-scoped listener. Dropping the receiver deregisters it.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.listeners.subscribe()
    }

    /// Connect and start the supervisor. Connecting an open connection is a no-op.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let mut status = self.status.write().await;
            if matches!(
                *status,
                ConnectionStatus::Open | ConnectionStatus::Connecting
            ) {
                return Ok(());
            }
            *status = ConnectionStatus::Connecting;
        }
        self.closed.store(false, Ordering::SeqCst);

        match self
            .transport
            .open(&self.address, self.config.connect_timeout)
            .await
        {
            Ok(channels) => {
                let inbound = self.install(channels).await;
                info!(relay = %self.address, "relay connected");
                self.emit_connected(false);
                self.spawn_supervisor(Some(inbound)).await;
                Ok(())
            }
            Err(error) => {
                *self.status.write().await = ConnectionStatus::Down;
                warn!(relay = %self.address, %error, "relay connect failed");
                if !self.is_ephemeral() {
                    self.spawn_supervisor(None).await;
                }
                Err(error)
            }
        }
    }

    /// Close the session and stop reconnecting.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.supervisor.lock().await.take() {
            task.abort();
        }
        let was_open = self.writer.lock().await.take().is_some();
        *self.status.write().await = ConnectionStatus::Closed;
        lock(&self.active_requests).clear();
        lock(&self.pending_ok).clear();
        if was_open {
            info!(relay = %self.address, "relay closed");
            self.emit(ConnectionEvent::Disconnected { code: None });
            self.to_pool(PoolEvent::Disconnect {
                connection_id: self.id.clone(),
                address: self.address.clone(),
                code: None,
            });
        }
    }

    /// Publish an event and wait for the relay's `OK`.
    ///
    /// Never fails: send errors and a missing `OK` come back as `ok = false`.
    pub async fn publish(&self, event: &Event) -> OkResponse {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending_ok).insert(event.id.clone(), tx);

        if let Err(error) = self.send_json(&json!(["EVENT", event])).await {
            lock(&self.pending_ok).remove(&event.id);
            return OkResponse::failed(event, &self.address, error.to_string());
        }

        let mut response = match timeout(self.config.publish_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => OkResponse::failed(event, &self.address, "connection closed"),
            Err(_) => {
                lock(&self.pending_ok).remove(&event.id);
                warn!(relay = %self.address, event = %event.id, "publish timed out");
                OkResponse::failed(event, &self.address, "timeout")
            }
        };
        response.event = Some(event.clone());
        response
    }

    /// Send `["REQ", id, filter...]`.
    pub async fn request(&self, subscription_id: &str, filters: &[Filter]) -> Result<()> {
        let mut frame = vec![json!("REQ"), json!(subscription_id)];
        for filter in filters {
            frame.push(serde_json::to_value(filter)?);
        }
        self.send_json(&Value::Array(frame)).await?;
        lock(&self.active_requests).insert(subscription_id.to_string());
        debug!(
            relay = %self.address,
            subscription = subscription_id,
            filters = filters.len(),
            "sent REQ"
        );
        Ok(())
    }

    /// Send `["CLOSE", id]`.
    pub async fn close_request(&self, subscription_id: &str) -> Result<()> {
        lock(&self.active_requests).remove(subscription_id);
        self.send_json(&json!(["CLOSE", subscription_id])).await
    }

    /// NIP-42 response.
    pub async fn authenticate(&self, event: &Event) -> Result<()> {
        self.send_json(&json!(["AUTH", event])).await
    }

    pub async fn send_raw(&self, value: &Value) -> Result<()> {
        self.send_json(value).await
    }

    async fn send_json(&self, value: &Value) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.send_text(text).await
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_ref().ok_or(ClientError::NotConnected)?;
        writer.send(text).map_err(|_| ClientError::NotConnected)?;
        self.touch();
        Ok(())
    }

    async fn install(&self, channels: TransportChannels) -> mpsc::UnboundedReceiver<TransportEvent> {
        *self.writer.lock().await = Some(channels.outbound);
        *self.status.write().await = ConnectionStatus::Open;
        self.touch();
        channels.inbound
    }

    async fn spawn_supervisor(
        self: &Arc<Self>,
        inbound: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    ) {
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.supervise(inbound).await });
        if let Some(previous) = self.supervisor.lock().await.replace(task) {
            previous.abort();
        }
    }

    async fn supervise(self: Arc<Self>, mut inbound: Option<mpsc::UnboundedReceiver<TransportEvent>>) {
        let mut delay = self.config.reconnect_min;
        loop {
            if let Some(rx) = inbound.take() {
                let code = self.pump(rx).await;
                self.mark_down(code).await;
                delay = self.config.reconnect_min;
            }
            if self.closed.load(Ordering::SeqCst) || self.is_ephemeral() {
                break;
            }

            debug!(relay = %self.address, ?delay, "reconnecting");
            tokio::time::sleep(delay).await;
            if self.closed.load(Ordering::SeqCst) {
                break;
            }

            *self.status.write().await = ConnectionStatus::Connecting;
            match self
                .transport
                .open(&self.address, self.config.connect_timeout)
                .await
            {
                Ok(channels) => {
                    inbound = Some(self.install(channels).await);
                    info!(relay = %self.address, "relay reconnected");
                    self.emit_connected(true);
                }
                Err(error) => {
                    *self.status.write().await = ConnectionStatus::Down;
                    warn!(relay = %self.address, %error, "reconnect failed");
                    delay = (delay * 2).min(self.config.reconnect_max);
                }
            }
        }
    }

    async fn pump(&self, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) -> Option<u16> {
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Text(text) => self.handle_text(&text),
                TransportEvent::Closed(code) => return code,
            }
        }
        None
    }

    async fn mark_down(&self, code: Option<u16>) {
        self.writer.lock().await.take();
        *self.status.write().await = if self.closed.load(Ordering::SeqCst) {
            ConnectionStatus::Closed
        } else {
            ConnectionStatus::Down
        };
        lock(&self.active_requests).clear();
        lock(&self.pending_ok).clear();

        info!(relay = %self.address, ?code, "relay disconnected");
        self.emit(ConnectionEvent::Disconnected { code });
        self.to_pool(PoolEvent::Disconnect {
            connection_id: self.id.clone(),
            address: self.address.clone(),
            code,
        });
    }

    fn handle_text(&self, text: &str) {
        self.touch();
        let message = match parse_relay_message(text) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(error) => {
                warn!(relay = %self.address, %error, "protocol parse error");
                return;
            }
        };

        match message {
            RelayMessage::Event(subscription_id, event) => {
                if self.listeners.receiver_count() > 0 {
                    self.emit(ConnectionEvent::Event {
                        subscription_id: subscription_id.clone(),
                        event: event.clone(),
                    });
                }
                self.to_pool(PoolEvent::Event {
                    connection_id: self.id.clone(),
                    subscription_id,
                    event: TaggedEvent::new(event, Some(&self.address)),
                });
            }
            RelayMessage::Eose(subscription_id) => {
                self.emit(ConnectionEvent::Eose(subscription_id.clone()));
                self.to_pool(PoolEvent::Eose {
                    connection_id: self.id.clone(),
                    subscription_id,
                });
            }
            RelayMessage::Closed(subscription_id, message) => {
                lock(&self.active_requests).remove(&subscription_id);
                self.emit(ConnectionEvent::Closed {
                    subscription_id: subscription_id.clone(),
                    message: message.clone(),
                });
                self.to_pool(PoolEvent::Closed {
                    connection_id: self.id.clone(),
                    subscription_id,
                    message,
                });
            }
            RelayMessage::Ok(id, ok, message) => {
                let response = OkResponse {
                    id,
                    relay: self.address.clone(),
                    ok,
                    message,
                    event: None,
                };
                if let Some(waiter) = lock(&self.pending_ok).remove(&response.id) {
                    let _ = waiter.send(response.clone());
                }
                self.emit(ConnectionEvent::Ok(response));
            }
            RelayMessage::Notice(message) => {
                warn!(relay = %self.address, notice = %message, "relay notice");
                self.emit(ConnectionEvent::Notice(message.clone()));
                self.to_pool(PoolEvent::Notice {
                    address: self.address.clone(),
                    message,
                });
            }
            RelayMessage::Auth(challenge) => {
                self.emit(ConnectionEvent::Auth(challenge.clone()));
                self.to_pool(PoolEvent::Auth {
                    connection_id: self.id.clone(),
                    address: self.address.clone(),
                    challenge,
                });
            }
            RelayMessage::Unknown(raw) => self.emit(ConnectionEvent::UnknownMessage(raw)),
        }
    }

    fn emit_connected(&self, was_reconnect: bool) {
        self.emit(ConnectionEvent::Connected { was_reconnect });
        self.to_pool(PoolEvent::Connected {
            connection_id: self.id.clone(),
            address: self.address.clone(),
            was_reconnect,
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        // No listeners is the normal case.
        let _ = self.listeners.send(event);
    }

    fn to_pool(&self, event: PoolEvent) {
        if let Some(pool_tx) = &self.pool_tx
            && pool_tx.send(event).is_err()
        {
            debug!(relay = %self.address, "pool event receiver dropped");
        }
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }
}

/// Parse relay protocol JSON text message into typed relay message.
pub fn parse_relay_message(text: &str) -> Result<Option<RelayMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let array = value
        .as_array()
        .ok_or_else(|| ClientError::Protocol("expected JSON array relay message".to_string()))?;
    if array.is_empty() {
        return Ok(None);
    }

    let kind = array[0]
        .as_str()
        .ok_or_else(|| ClientError::Protocol("missing relay message kind".to_string()))?;

    match kind {
        "EVENT" => {
            if array.len() < 3 {
                return Err(ClientError::Protocol("invalid EVENT message".to_string()));
            }
            let subscription_id = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid EVENT subscription id".to_string()))?
                .to_string();
            let event: Event = serde_json::from_value(array[2].clone()).map_err(|error| {
                ClientError::Protocol(format!("invalid EVENT payload: {}", error))
            })?;
            Ok(Some(RelayMessage::Event(subscription_id, event)))
        }
        "OK" => {
            if array.len() < 4 {
                return Err(ClientError::Protocol("invalid OK message".to_string()));
            }
            let event_id = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid OK event id".to_string()))?
                .to_string();
            let accepted = array[2]
                .as_bool()
                .ok_or_else(|| ClientError::Protocol("invalid OK accepted flag".to_string()))?;
            let message = array[3]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid OK message text".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Ok(event_id, accepted, message)))
        }
        "EOSE" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid EOSE message".to_string()));
            }
            let subscription_id = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid EOSE subscription id".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Eose(subscription_id)))
        }
        "CLOSED" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid CLOSED message".to_string()));
            }
            let subscription_id = array[1]
                .as_str()
                .ok_or_else(|| {
                    ClientError::Protocol("invalid CLOSED subscription id".to_string())
                })?
                .to_string();
            let message = match array.get(2) {
                None => String::new(),
                Some(value) => value
                    .as_str()
                    .ok_or_else(|| ClientError::Protocol("invalid CLOSED message text".to_string()))?
                    .to_string(),
            };
            Ok(Some(RelayMessage::Closed(subscription_id, message)))
        }
        "NOTICE" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid NOTICE message".to_string()));
            }
            let message = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid NOTICE message text".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Notice(message)))
        }
        "AUTH" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid AUTH message".to_string()));
            }
            let challenge = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid AUTH challenge".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Auth(challenge)))
        }
        _ => Ok(Some(RelayMessage::Unknown(array.clone()))),
    }
}
