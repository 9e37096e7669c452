//! Relay pool: owns every connection and funnels their events into one stream.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use nostr::{Event, TaggedEvent, normalize_relay_url};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::relay::{OkResponse, RelayConfig, RelayConnection, RelaySettings};
use crate::transport::RelayTransport;

/// Relay pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_connections: usize,
    /// Relay configuration template.
    pub relay: RelayConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            relay: RelayConfig::default(),
        }
    }
}

/// Pool-level events, drained with [`RelayPool::recv`].
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Connected {
        connection_id: String,
        address: String,
        was_reconnect: bool,
    },
    ConnectFailed {
        address: String,
    },
    Event {
        connection_id: String,
        subscription_id: String,
        event: TaggedEvent,
    },
    Eose {
        connection_id: String,
        subscription_id: String,
    },
    Closed {
        connection_id: String,
        subscription_id: String,
        message: String,
    },
    Disconnect {
        connection_id: String,
        address: String,
        code: Option<u16>,
    },
    Auth {
        connection_id: String,
        address: String,
        challenge: String,
    },
    Notice {
        address: String,
        message: String,
    },
}

/// Callback invoked once per relay as `broadcast` results come in.
pub type OkCallback<'a> = &'a (dyn Fn(&OkResponse) + Send + Sync);

/// Multi-relay pool keyed by normalized address.
pub struct RelayPool {
    relays: Arc<RwLock<HashMap<String, Arc<RelayConnection>>>>,
    config: PoolConfig,
    transport: Arc<dyn RelayTransport>,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<PoolEvent>>,
}

impl RelayPool {
    pub fn new(config: PoolConfig, transport: Arc<dyn RelayTransport>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            relays: Arc::new(RwLock::new(HashMap::new())),
            config,
            transport,
            events_tx,
            events_rx: Mutex::new(events_rx),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Connect to a relay, reusing an existing connection for the same address.
    ///
    /// A reused connection gets the union of both settings and stays
    /// ephemeral only if both callers asked for that. Returns `None` when the
    /// address is invalid, the pool is full or a fresh connect fails.
    pub async fn connect(
        &self,
        address: &str,
        settings: RelaySettings,
        ephemeral: bool,
    ) -> Option<Arc<RelayConnection>> {
        let Some(address) = normalize_relay_url(address) else {
            warn!(relay = address, "invalid relay address");
            return None;
        };

        let connection = {
            let mut relays = self.relays.write().await;
            if let Some(existing) = relays.get(&address) {
                existing.merge_settings(settings);
                if !ephemeral {
                    existing.set_ephemeral(false);
                }
                return Some(Arc::clone(existing));
            }
            if relays.len() >= self.config.max_connections {
                warn!(
                    relay = %address,
                    max = self.config.max_connections,
                    "maximum connection limit reached"
                );
                drop(relays);
                self.emit(PoolEvent::ConnectFailed { address });
                return None;
            }
            let connection = Arc::new(RelayConnection::new(
                address.clone(),
                settings,
                ephemeral,
                self.config.relay.clone(),
                Arc::clone(&self.transport),
                Some(self.events_tx.clone()),
            ));
            relays.insert(address.clone(), Arc::clone(&connection));
            connection
        };

        match connection.connect().await {
            Ok(()) => Some(connection),
            Err(error) => {
                warn!(relay = %address, %error, ephemeral, "failed to connect");
                if connection.is_ephemeral() {
                    self.relays.write().await.remove(&address);
                    connection.close().await;
                }
                self.emit(PoolEvent::ConnectFailed { address });
                None
            }
        }
    }

    /// Close and forget a connection.
    pub async fn disconnect(&self, address: &str) {
        let Some(address) = normalize_relay_url(address) else {
            return;
        };
        let removed = self.relays.write().await.remove(&address);
        if let Some(connection) = removed {
            info!(relay = %address, "disconnecting relay");
            connection.close().await;
        }
    }

    pub async fn get_connection(&self, id: &str) -> Option<Arc<RelayConnection>> {
        self.relays
            .read()
            .await
            .values()
            .find(|connection| connection.id() == id)
            .cloned()
    }

    /// Connection already open to `address`, if any.
    pub async fn get_by_address(&self, address: &str) -> Option<Arc<RelayConnection>> {
        let address = normalize_relay_url(address)?;
        self.relays.read().await.get(&address).cloned()
    }

    /// Snapshot of `(address, connection)` pairs.
    pub async fn connections(&self) -> Vec<(String, Arc<RelayConnection>)> {
        self.relays
            .read()
            .await
            .iter()
            .map(|(address, connection)| (address.clone(), Arc::clone(connection)))
            .collect()
    }

    /// Publish to every non-ephemeral writable connection at once.
    ///
    /// One response per relay attempted; failures do not affect other relays.
    pub async fn broadcast(&self, event: &Event, on_ok: Option<OkCallback<'_>>) -> Vec<OkResponse> {
        let targets: Vec<Arc<RelayConnection>> = self
            .relays
            .read()
            .await
            .values()
            .filter(|connection| !connection.is_ephemeral() && connection.settings().write)
            .cloned()
            .collect();

        debug!(event = %event.id, relays = targets.len(), "broadcasting event");
        join_all(targets.iter().map(|connection| async move {
            let response = connection.publish(event).await;
            if let Some(callback) = on_ok {
                callback(&response);
            }
            response
        }))
        .await
    }

    /// Publish to one relay over an ephemeral connection.
    pub async fn broadcast_to(&self, address: &str, event: &Event) -> OkResponse {
        match self
            .connect(address, RelaySettings::READ_WRITE, true)
            .await
        {
            Some(connection) => connection.publish(event).await,
            None => OkResponse::failed(event, address, "failed to connect"),
        }
    }

    /// Next pool event. `None` only if every sender is gone.
    pub async fn recv(&self) -> Option<PoolEvent> {
        self.events_rx.lock().await.recv().await
    }

    /// Close ephemeral connections that have no open requests and have been
    /// quiet for longer than `ephemeral_idle_timeout`.
    pub async fn evict_idle_ephemeral(&self) -> usize {
        let idle_timeout = self.config.relay.ephemeral_idle_timeout;
        let evicted: Vec<(String, Arc<RelayConnection>)> = {
            let mut relays = self.relays.write().await;
            let idle: Vec<String> = relays
                .iter()
                .filter(|(_, connection)| {
                    connection.is_ephemeral()
                        && connection.active_request_count() == 0
                        && connection.idle_for() >= idle_timeout
                })
                .map(|(address, _)| address.clone())
                .collect();
            idle.into_iter()
                .filter_map(|address| relays.remove(&address).map(|c| (address, c)))
                .collect()
        };

        for (address, connection) in &evicted {
            debug!(relay = %address, "evicting idle ephemeral connection");
            connection.close().await;
        }
        evicted.len()
    }

    /// Close every connection.
    pub async fn close_all(&self) {
        let relays: Vec<Arc<RelayConnection>> =
            self.relays.write().await.drain().map(|(_, c)| c).collect();
        for relay in relays {
            relay.close().await;
        }
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::error::{ClientError, Result};
    use crate::transport::{ChannelPeer, ChannelTransport};

    fn event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "pubkey".to_string(),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "sig".to_string(),
        }
    }

    fn quiet_config() -> PoolConfig {
        PoolConfig {
            max_connections: 3,
            relay: RelayConfig {
                publish_timeout: Duration::from_millis(200),
                reconnect_min: Duration::from_secs(60),
                ephemeral_idle_timeout: Duration::ZERO,
                ..RelayConfig::default()
            },
        }
    }

    /// Acknowledge every published event.
    fn spawn_acking_relays(mut accepted: mpsc::UnboundedReceiver<ChannelPeer>) {
        tokio::spawn(async move {
            while let Some(mut peer) = accepted.recv().await {
                tokio::spawn(async move {
                    while let Some(frame) = peer.recv_json().await {
                        if frame[0] == "EVENT" {
                            peer.send_json(&json!(["OK", frame[1]["id"], true, ""]));
                        }
                    }
                });
            }
        });
    }

    fn pool() -> (RelayPool, Arc<ChannelTransport>) {
        let (transport, accepted) = ChannelTransport::new();
        let transport = Arc::new(transport);
        spawn_acking_relays(accepted);
        (RelayPool::new(quiet_config(), transport.clone()), transport)
    }

    #[tokio::test]
    async fn connect_is_idempotent_per_address() -> Result<()> {
        let (pool, _transport) = pool();
        let read_only = RelaySettings {
            read: true,
            write: false,
        };
        let first = pool
            .connect("wss://Relay.Example.com", read_only, true)
            .await
            .ok_or_else(|| ClientError::Internal("connect failed".to_string()))?;
        let second = pool
            .connect("wss://relay.example.com/", RelaySettings::READ_WRITE, false)
            .await
            .ok_or_else(|| ClientError::Internal("connect failed".to_string()))?;

        assert_eq!(first.id(), second.id());
        assert_eq!(pool.connections().await.len(), 1);
        assert_eq!(first.settings(), RelaySettings::READ_WRITE);
        assert!(!first.is_ephemeral());
        assert!(pool.get_connection(first.id()).await.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn failed_connect_returns_none_and_reports() -> Result<()> {
        let (pool, transport) = pool();
        transport.refuse("wss://down.example.com/");

        let result = pool
            .connect("wss://down.example.com", RelaySettings::READ_WRITE, true)
            .await;
        assert!(result.is_none());
        assert!(pool.connections().await.is_empty());

        let result = pool
            .connect("wss://down.example.com", RelaySettings::READ_WRITE, false)
            .await;
        assert!(result.is_none());
        assert_eq!(pool.connections().await.len(), 1);

        let mut failures = 0;
        while let Ok(Some(event)) = timeout(Duration::from_millis(50), pool.recv()).await {
            if matches!(event, PoolEvent::ConnectFailed { ref address } if address == "wss://down.example.com/")
            {
                failures += 1;
            }
        }
        assert_eq!(failures, 2);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_address_and_limit_are_rejected() {
        let (pool, _transport) = pool();
        assert!(
            pool.connect("https://relay.example.com", RelaySettings::READ_WRITE, false)
                .await
                .is_none()
        );
        for n in 0..3 {
            let address = format!("wss://relay{n}.example.com");
            assert!(
                pool.connect(&address, RelaySettings::READ_WRITE, false)
                    .await
                    .is_some()
            );
        }
        assert!(
            pool.connect("wss://relay3.example.com", RelaySettings::READ_WRITE, false)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn broadcast_reports_each_relay() -> Result<()> {
        let (pool, transport) = pool();
        transport.refuse("wss://down.example.com/");
        pool.connect("wss://up.example.com", RelaySettings::READ_WRITE, false)
            .await
            .ok_or_else(|| ClientError::Internal("connect failed".to_string()))?;
        let _ = pool
            .connect("wss://down.example.com", RelaySettings::READ_WRITE, false)
            .await;
        pool.connect(
            "wss://readonly.example.com",
            RelaySettings {
                read: true,
                write: false,
            },
            false,
        )
        .await
        .ok_or_else(|| ClientError::Internal("connect failed".to_string()))?;

        let seen = std::sync::Mutex::new(Vec::new());
        let record = |response: &OkResponse| {
            crate::lock(&seen).push(response.relay.clone());
        };
        let mut responses = pool.broadcast(&event("e1"), Some(&record)).await;
        responses.sort_by(|a, b| a.relay.cmp(&b.relay));

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].relay, "wss://down.example.com/");
        assert!(!responses[0].ok);
        assert_eq!(responses[1].relay, "wss://up.example.com/");
        assert!(responses[1].ok);
        assert_eq!(crate::lock(&seen).len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn broadcast_to_uses_an_ephemeral_connection() {
        let (pool, transport) = pool();
        let response = pool
            .broadcast_to("wss://one.example.com", &event("e2"))
            .await;
        assert!(response.ok);

        transport.refuse("wss://two.example.com/");
        let response = pool
            .broadcast_to("wss://two.example.com", &event("e3"))
            .await;
        assert!(!response.ok);
        assert_eq!(response.id, "e3");

        assert_eq!(pool.evict_idle_ephemeral().await, 1);
        assert!(pool.connections().await.is_empty());
    }
}
