//! `NostrSystem`: pool, query manager and the loop that connects them.

use std::sync::{Arc, Weak};
use std::time::Duration;

use nostr::{DefaultOptimizer, Event, EventBuilder, Optimizer, Signer, TaggedEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::{
    CacheRelay, CachedTable, FilterCacheLayer, MemoryTable, RELAY_LIST_KIND, RelayMetadataLoader,
    RelayMetrics, RelayMetricsHandler, UserRelaysLoader, UsersRelays,
};
use crate::clock::{Clock, SystemClock};
use crate::config::SystemConfig;
use crate::lock;
use crate::pool::{OkCallback, PoolEvent, RelayPool};
use crate::query::{Query, QueryStatus};
use crate::query_manager::{BatchCallback, ManagerOptions, QueryManager, QueryManagerEvent};
use crate::relay::{ConnectionStatus, OkResponse, RelayConnection, RelaySettings};
use crate::request_builder::RequestBuilder;
use crate::router::OutboxRouter;
use crate::transport::{RelayTransport, WebSocketTransport};

/// NIP-42 client authentication kind.
pub const AUTH_KIND: u16 = 22242;

/// Query id used to fetch missing relay lists.
pub const RELAY_LIST_QUERY: &str = "relay-lists";

/// Pluggable parts of a [`NostrSystem`].
pub struct SystemDeps {
    pub transport: Arc<dyn RelayTransport>,
    pub optimizer: Arc<dyn Optimizer>,
    pub clock: Arc<dyn Clock>,
    /// Answers NIP-42 challenges when set.
    pub signer: Option<Arc<dyn Signer>>,
    pub cache_relay: Option<Arc<dyn CacheRelay>>,
    pub cache_layers: Vec<Arc<dyn FilterCacheLayer>>,
    /// Relay list table for the outbox router. An in-memory one is used when
    /// the outbox model is on and none is given.
    pub user_relays: Option<Arc<dyn CachedTable<UsersRelays>>>,
    /// Relay metrics table. In-memory when not given.
    pub relay_metrics: Option<Arc<dyn CachedTable<RelayMetrics>>>,
}

impl Default for SystemDeps {
    fn default() -> Self {
        Self {
            transport: Arc::new(WebSocketTransport),
            optimizer: Arc::new(DefaultOptimizer),
            clock: Arc::new(SystemClock),
            signer: None,
            cache_relay: None,
            cache_layers: Vec::new(),
            user_relays: None,
            relay_metrics: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuerySummary {
    pub id: String,
    pub status: QueryStatus,
    pub progress: f64,
    pub traces: usize,
    pub events: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub id: String,
    pub address: String,
    pub status: ConnectionStatus,
    pub settings: RelaySettings,
    pub ephemeral: bool,
    pub active_requests: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemSnapshot {
    pub queries: Vec<QuerySummary>,
    pub connections: Vec<ConnectionSummary>,
}

pub struct NostrSystem {
    config: SystemConfig,
    pool: Arc<RelayPool>,
    manager: Arc<QueryManager>,
    optimizer: Arc<dyn Optimizer>,
    clock: Arc<dyn Clock>,
    signer: Option<Arc<dyn Signer>>,
    cache_relay: Option<Arc<dyn CacheRelay>>,
    relay_loader: Option<Arc<UserRelaysLoader>>,
    metrics: RelayMetricsHandler,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl NostrSystem {
    /// Build the system and start its background tasks. Must be called
    /// inside a tokio runtime.
    pub fn new(config: SystemConfig, deps: SystemDeps) -> Arc<Self> {
        let pool = Arc::new(RelayPool::new(config.pool.clone(), deps.transport));

        let mut manager = QueryManager::new(
            Arc::clone(&pool),
            Arc::clone(&deps.optimizer),
            Arc::clone(&deps.clock),
            ManagerOptions::from(&config),
        );
        for layer in deps.cache_layers {
            manager = manager.with_cache_layer(layer);
        }
        if let Some(cache_relay) = &deps.cache_relay {
            manager = manager.with_cache_relay(Arc::clone(cache_relay));
        }

        let relay_loader = if config.automatic_outbox_model {
            let table: Arc<dyn CachedTable<UsersRelays>> = match deps.user_relays {
                Some(table) => table,
                None => Arc::new(MemoryTable::<UsersRelays>::new()),
            };
            let loader = Arc::new(UserRelaysLoader::new(Arc::clone(&table)));
            manager = manager
                .with_router(Arc::new(OutboxRouter::new(table)))
                .with_relay_loader(loader.clone());
            Some(loader)
        } else {
            None
        };

        let manager = Arc::new(manager);
        manager.start();
        let manager_events = manager.subscribe();
        let metrics_table: Arc<dyn CachedTable<RelayMetrics>> = match deps.relay_metrics {
            Some(table) => table,
            None => Arc::new(MemoryTable::<RelayMetrics>::new()),
        };
        let metrics = RelayMetricsHandler::new(metrics_table, Arc::clone(&deps.clock));

        let system = Arc::new(Self {
            config,
            pool: Arc::clone(&pool),
            manager,
            optimizer: deps.optimizer,
            clock: deps.clock,
            signer: deps.signer,
            cache_relay: deps.cache_relay,
            relay_loader,
            metrics,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&system);
        let mut tasks = vec![
            tokio::spawn(event_loop(weak.clone(), pool)),
            tokio::spawn(trace_loop(weak.clone(), manager_events)),
        ];
        if system.relay_loader.is_some() {
            let period = system.config.cleanup_interval;
            tasks.push(tokio::spawn(relay_list_loop(weak, period)));
        }
        lock(&system.tasks).extend(tasks);
        info!(
            max_connections = system.config.pool.max_connections,
            outbox = system.config.automatic_outbox_model,
            negentropy = system.config.negentropy,
            "nostr system started"
        );
        system
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.pool
    }

    pub fn manager(&self) -> &Arc<QueryManager> {
        &self.manager
    }

    pub fn relay_metrics(&self) -> &Arc<dyn CachedTable<RelayMetrics>> {
        self.metrics.table()
    }

    pub async fn connect_to_relay(
        &self,
        address: &str,
        settings: RelaySettings,
    ) -> Option<Arc<RelayConnection>> {
        self.pool.connect(address, settings, false).await
    }

    pub async fn disconnect_relay(&self, address: &str) {
        self.pool.disconnect(address).await;
    }

    pub async fn connect_ephemeral_relay(&self, address: &str) -> Option<Arc<RelayConnection>> {
        self.pool
            .connect(address, RelaySettings::READ_WRITE, true)
            .await
    }

    pub async fn query(&self, request: RequestBuilder) -> Query {
        self.manager.query(request).await
    }

    pub async fn fetch(
        &self,
        request: RequestBuilder,
        on_batch: Option<BatchCallback<'_>>,
    ) -> Vec<TaggedEvent> {
        self.manager.fetch(request, on_batch).await
    }

    pub fn get_query(&self, id: &str) -> Option<Query> {
        self.manager.get(id)
    }

    /// Offer an event to live queries as if a relay had sent it.
    pub fn handle_event(&self, subscription_id: &str, event: &TaggedEvent) -> bool {
        self.manager.handle_event(subscription_id, event)
    }

    /// Show the event to local queries, then publish it to every writable relay.
    pub async fn broadcast_event(
        &self,
        event: &Event,
        on_ok: Option<OkCallback<'_>>,
    ) -> Vec<OkResponse> {
        self.manager
            .handle_event("*", &TaggedEvent::from(event.clone()));
        self.pool.broadcast(event, on_ok).await
    }

    /// Publish to one relay over a temporary connection.
    pub async fn write_once_to_relay(&self, address: &str, event: &Event) -> OkResponse {
        self.pool.broadcast_to(address, event).await
    }

    pub async fn snapshot(&self) -> SystemSnapshot {
        let mut queries: Vec<QuerySummary> = self
            .manager
            .iter()
            .into_iter()
            .map(|(id, query)| {
                let progress = query.progress_state();
                QuerySummary {
                    id,
                    status: progress.status,
                    progress: progress.ratio(),
                    traces: progress.total,
                    events: query.event_count(),
                }
            })
            .collect();
        queries.sort_by(|a, b| a.id.cmp(&b.id));

        let mut connections = Vec::new();
        for (address, connection) in self.pool.connections().await {
            connections.push(ConnectionSummary {
                id: connection.id().to_string(),
                address,
                status: connection.status().await,
                settings: connection.settings(),
                ephemeral: connection.is_ephemeral(),
                active_requests: connection.active_request_count(),
            });
        }
        connections.sort_by(|a, b| a.address.cmp(&b.address));

        SystemSnapshot {
            queries,
            connections,
        }
    }

    /// Stop every task, close queries and connections.
    pub async fn shutdown(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.manager.shutdown().await;
        self.pool.close_all().await;
        info!("nostr system stopped");
    }

    async fn handle_pool_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::Event {
                subscription_id,
                event,
                ..
            } => {
                if let Some(relay) = event.relays.first() {
                    self.metrics.on_event(relay).await;
                }
                self.on_event(&subscription_id, event).await;
            }
            PoolEvent::Eose {
                connection_id,
                subscription_id,
            } => {
                self.manager
                    .handle_eose(&subscription_id, &connection_id)
                    .await;
            }
            PoolEvent::Closed {
                connection_id,
                subscription_id,
                message,
            } => {
                self.manager
                    .handle_closed(&subscription_id, &connection_id, &message);
            }
            PoolEvent::Connected {
                connection_id,
                address,
                was_reconnect,
            } => {
                debug!(relay = %address, was_reconnect, "relay connected");
                self.metrics.on_connect(&address).await;
                if let Some(connection) = self.pool.get_connection(&connection_id).await {
                    self.manager.connection_restored(&connection).await;
                }
            }
            PoolEvent::ConnectFailed { address } => {
                debug!(relay = %address, "relay unavailable");
                self.metrics.on_disconnect(&address).await;
            }
            PoolEvent::Disconnect {
                connection_id,
                address,
                code,
            } => {
                debug!(relay = %address, ?code, "relay disconnected");
                self.metrics.on_disconnect(&address).await;
                self.manager.connection_lost(&connection_id);
            }
            PoolEvent::Auth {
                connection_id,
                address,
                challenge,
            } => self.authenticate(&connection_id, &address, &challenge).await,
            PoolEvent::Notice { address, message } => {
                debug!(relay = %address, notice = %message, "notice");
            }
        }
    }

    async fn on_event(&self, subscription_id: &str, event: TaggedEvent) {
        if self.config.check_sigs && !self.optimizer.schnorr_verify(&event.event) {
            warn!(
                event = %event.id(),
                relays = ?event.relays,
                "dropping event with invalid signature"
            );
            return;
        }

        if let Some(loader) = &self.relay_loader
            && event.event.kind == RELAY_LIST_KIND
        {
            match loader.ingest(&event.event).await {
                Ok(update) => debug!(author = %event.event.pubkey, ?update, "relay list stored"),
                Err(error) => warn!(%error, "failed to store relay list"),
            }
            loader.on_event(&event.event);
        }

        let store = self.manager.handle_event(subscription_id, &event);
        if store && let Some(cache_relay) = &self.cache_relay {
            let cache_relay = Arc::clone(cache_relay);
            let stored = event.event;
            tokio::spawn(async move {
                let response = cache_relay.event(&stored).await;
                if !response.ok {
                    debug!(event = %stored.id, message = %response.message, "cache relay refused event");
                }
            });
        }
    }

    async fn authenticate(&self, connection_id: &str, address: &str, challenge: &str) {
        let Some(signer) = &self.signer else {
            debug!(relay = %address, "AUTH challenge ignored, no signer");
            return;
        };
        let Some(connection) = self.pool.get_connection(connection_id).await else {
            return;
        };

        let signed = EventBuilder::new()
            .kind(AUTH_KIND)
            .created_at(self.clock.unix_now())
            .tag(["relay", address])
            .tag(["challenge", challenge])
            .build_and_sign(signer.as_ref())
            .await;
        match signed {
            Ok(event) => match connection.authenticate(&event).await {
                Ok(()) => info!(relay = %address, "answered AUTH challenge"),
                Err(error) => warn!(relay = %address, %error, "failed to send AUTH"),
            },
            Err(error) => warn!(relay = %address, %error, "failed to sign AUTH"),
        }
    }

    async fn request_relay_lists(&self) {
        let Some(loader) = &self.relay_loader else {
            return;
        };
        let pending = loader.take_pending();
        if pending.is_empty() {
            return;
        }
        debug!(authors = pending.len(), "fetching relay lists");
        let mut request = RequestBuilder::new(RELAY_LIST_QUERY);
        request
            .with_filter()
            .kinds([RELAY_LIST_KIND])
            .authors(pending);
        request.options_mut().skip_diff = true;
        self.manager.query(request).await;
    }
}

async fn event_loop(system: Weak<NostrSystem>, pool: Arc<RelayPool>) {
    while let Some(event) = pool.recv().await {
        let Some(system) = system.upgrade() else {
            break;
        };
        system.handle_pool_event(event).await;
    }
}

async fn trace_loop(
    system: Weak<NostrSystem>,
    mut events: broadcast::Receiver<QueryManagerEvent>,
) {
    loop {
        let report = match events.recv().await {
            Ok(QueryManagerEvent::Trace(report)) => report,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "trace reports lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(system) = system.upgrade() else {
            break;
        };
        system.metrics.on_trace(&report).await;
    }
}

async fn relay_list_loop(system: Weak<NostrSystem>, period: Duration) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(system) = system.upgrade() else {
            break;
        };
        system.request_relay_lists().await;
    }
}
