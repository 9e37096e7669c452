//! Cache hooks consulted before a request goes to the network.
//!
//! - [`CachedTable`]: keyed entity tables (relay lists, relay metrics, events)
//! - [`FilterCacheLayer`]: rewrites a request using what is already cached
//! - [`CacheRelay`]: a local relay queried first and filled with results
//! - [`RelayMetadataLoader`]: tracks authors whose relay lists are unknown
//! - [`RelayMetricsHandler`]: keeps per-relay counters up to date

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use nostr::{Event, Filter, TaggedEvent, event_matches_filter};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::lock;
use crate::query::{Query, TraceReport, TraceState};
use crate::relay::{ConnectionEvent, OkResponse, RelayConfig, RelayConnection, RelaySettings};
use crate::request_builder::BuiltRequest;
use crate::router::parse_relay_tags;
use crate::transport::RelayTransport;

/// Relay list metadata kind (NIP-65).
pub const RELAY_LIST_KIND: u16 = 10002;

/// Latency samples kept per relay.
pub const MAX_LATENCY_SAMPLES: usize = 50;

/// Event ids remembered as already written to a cache relay.
pub const DEFAULT_SENT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(10_000) {
    Some(capacity) => capacity,
    None => NonZeroUsize::MIN,
};

/// Outcome of [`CachedTable::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    New,
    Updated,
    /// Same content, loaded again later.
    Refresh,
    NoChange,
}

pub trait CacheEntity: Clone + Send + Sync + 'static {
    fn key(&self) -> String;

    /// Content timestamp (seconds).
    fn created(&self) -> u64;

    /// When this copy was fetched (seconds).
    fn loaded(&self) -> u64 {
        0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayListEntry {
    pub url: String,
    pub settings: RelaySettings,
}

/// Relay list of one author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsersRelays {
    pub pubkey: String,
    pub created: u64,
    pub loaded: u64,
    pub relays: Vec<RelayListEntry>,
}

impl UsersRelays {
    /// Relays the author publishes to.
    pub fn write_relays(&self) -> impl Iterator<Item = &str> {
        self.relays
            .iter()
            .filter(|entry| entry.settings.write)
            .map(|entry| entry.url.as_str())
    }
}

impl CacheEntity for UsersRelays {
    fn key(&self) -> String {
        self.pubkey.clone()
    }

    fn created(&self) -> u64 {
        self.created
    }

    fn loaded(&self) -> u64 {
        self.loaded
    }
}

/// Per-relay counters. `latency` holds the most recent EOSE round trips in
/// milliseconds, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayMetrics {
    pub addr: String,
    pub events: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub last_seen: u64,
    pub latency: Vec<u64>,
}

impl CacheEntity for RelayMetrics {
    fn key(&self) -> String {
        self.addr.clone()
    }

    fn created(&self) -> u64 {
        self.last_seen
    }
}

impl CacheEntity for Event {
    fn key(&self) -> String {
        self.id.clone()
    }

    fn created(&self) -> u64 {
        self.created_at
    }
}

#[async_trait]
pub trait CachedTable<T: CacheEntity>: Send + Sync {
    /// Synchronous lookup of the in-memory copy.
    fn get_from_cache(&self, key: &str) -> Option<T>;

    async fn bulk_get(&self, keys: &[String]) -> Vec<T>;

    async fn update(&self, entity: T) -> Result<CacheUpdate>;

    async fn bulk_set(&self, entities: Vec<T>) -> Result<()>;

    /// Keys from `keys` that are not cached.
    async fn buffer(&self, keys: &[String]) -> Vec<String>;

    async fn preload(&self) -> Result<()>;
}

/// [`CachedTable`] held entirely in memory.
#[derive(Debug)]
pub struct MemoryTable<T> {
    items: std::sync::Mutex<HashMap<String, T>>,
}

impl<T> Default for MemoryTable<T> {
    fn default() -> Self {
        Self {
            items: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

impl<T: CacheEntity> MemoryTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<T> {
        lock(&self.items).values().cloned().collect()
    }
}

#[async_trait]
impl<T: CacheEntity> CachedTable<T> for MemoryTable<T> {
    fn get_from_cache(&self, key: &str) -> Option<T> {
        lock(&self.items).get(key).cloned()
    }

    async fn bulk_get(&self, keys: &[String]) -> Vec<T> {
        let items = lock(&self.items);
        keys.iter().filter_map(|key| items.get(key).cloned()).collect()
    }

    async fn update(&self, entity: T) -> Result<CacheUpdate> {
        let mut items = lock(&self.items);
        let outcome = match items.get(&entity.key()) {
            None => CacheUpdate::New,
            Some(existing) if entity.created() > existing.created() => CacheUpdate::Updated,
            Some(existing) if entity.loaded() > existing.loaded() => CacheUpdate::Refresh,
            Some(_) => CacheUpdate::NoChange,
        };
        if outcome != CacheUpdate::NoChange {
            items.insert(entity.key(), entity);
        }
        Ok(outcome)
    }

    async fn bulk_set(&self, entities: Vec<T>) -> Result<()> {
        let mut items = lock(&self.items);
        for entity in entities {
            items.insert(entity.key(), entity);
        }
        Ok(())
    }

    async fn buffer(&self, keys: &[String]) -> Vec<String> {
        let items = lock(&self.items);
        keys.iter()
            .filter(|key| !items.contains_key(*key))
            .cloned()
            .collect()
    }

    async fn preload(&self) -> Result<()> {
        Ok(())
    }
}

/// Event lookup by id.
#[async_trait]
pub trait EventCache: Send + Sync {
    async fn get_events(&self, ids: &[String]) -> Vec<Event>;
}

#[async_trait]
impl EventCache for MemoryTable<Event> {
    async fn get_events(&self, ids: &[String]) -> Vec<Event> {
        CachedTable::bulk_get(self, ids).await
    }
}

/// Rewrites a request before it is sent, answering part of it locally.
#[async_trait]
pub trait FilterCacheLayer: Send + Sync {
    async fn process_filter(&self, query: &Query, request: BuiltRequest) -> BuiltRequest;
}

/// Answers `ids` lookups from an [`EventCache`].
///
/// Hits go straight into the query and their ids are removed from the
/// filter. A filter left with no ids is trimmed before dispatch.
pub struct IdsCacheLayer {
    cache: Arc<dyn EventCache>,
}

impl IdsCacheLayer {
    pub fn new(cache: Arc<dyn EventCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl FilterCacheLayer for IdsCacheLayer {
    async fn process_filter(&self, query: &Query, mut request: BuiltRequest) -> BuiltRequest {
        for filter in &mut request.filters {
            let Some(ids) = &filter.ids else {
                continue;
            };
            let wanted: Vec<String> = ids.iter().cloned().collect();
            let lookup = filter.without_internal();
            let hits: Vec<Event> = self
                .cache
                .get_events(&wanted)
                .await
                .into_iter()
                .filter(|event| event_matches_filter(event, &lookup))
                .collect();
            if hits.is_empty() {
                continue;
            }

            debug!(query = %query.id(), hits = hits.len(), "answered ids from cache");
            if let Some(ids) = filter.ids.as_mut() {
                for event in &hits {
                    ids.remove(&event.id);
                }
            }
            query.add_events(hits.into_iter().map(TaggedEvent::from).collect());
        }
        request
    }
}

/// A local relay consulted before the network.
#[async_trait]
pub trait CacheRelay: Send + Sync {
    async fn event(&self, event: &Event) -> OkResponse;

    async fn query(&self, subscription_id: &str, filters: &[Filter]) -> Result<Vec<Event>>;

    async fn delete(&self, subscription_id: &str, filters: &[Filter]) -> Result<Vec<String>>;
}

/// [`CacheRelay`] backed by a dedicated relay connection.
#[derive(Debug)]
pub struct ConnectionCacheRelay {
    connection: Arc<RelayConnection>,
    sent: std::sync::Mutex<LruCache<String, ()>>,
}

impl ConnectionCacheRelay {
    pub fn new(connection: Arc<RelayConnection>) -> Self {
        Self::with_capacity(connection, DEFAULT_SENT_CAPACITY)
    }

    /// Remember at most `capacity` written ids; older ones may be sent again.
    pub fn with_capacity(connection: Arc<RelayConnection>, capacity: NonZeroUsize) -> Self {
        Self {
            connection,
            sent: std::sync::Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Open a standalone connection outside any pool.
    pub async fn connect(
        address: &str,
        config: RelayConfig,
        transport: Arc<dyn RelayTransport>,
    ) -> Result<Self> {
        let connection = Arc::new(RelayConnection::new(
            address,
            RelaySettings::READ_WRITE,
            false,
            config,
            transport,
            None,
        ));
        connection.connect().await?;
        Ok(Self::new(connection))
    }

    pub fn connection(&self) -> &Arc<RelayConnection> {
        &self.connection
    }

    fn wait_limit(&self) -> Duration {
        self.connection.config().publish_timeout
    }
}

#[async_trait]
impl CacheRelay for ConnectionCacheRelay {
    async fn event(&self, event: &Event) -> OkResponse {
        if lock(&self.sent).put(event.id.clone(), ()).is_some() {
            return OkResponse {
                id: event.id.clone(),
                relay: self.connection.address().to_string(),
                ok: true,
                message: "duplicate".to_string(),
                event: Some(event.clone()),
            };
        }

        let response = self.connection.publish(event).await;
        if !response.ok {
            lock(&self.sent).pop(&event.id);
        }
        response
    }

    async fn query(&self, subscription_id: &str, filters: &[Filter]) -> Result<Vec<Event>> {
        let mut listener = self.connection.subscribe();
        self.connection.request(subscription_id, filters).await?;

        let mut events = Vec::new();
        let collect = async {
            loop {
                match listener.recv().await {
                    Ok(ConnectionEvent::Event {
                        subscription_id: sub,
                        event,
                    }) if sub == subscription_id => events.push(event),
                    Ok(ConnectionEvent::Eose(sub)) if sub == subscription_id => break,
                    Ok(ConnectionEvent::Closed {
                        subscription_id: sub,
                        ..
                    }) if sub == subscription_id => break,
                    Ok(ConnectionEvent::Disconnected { .. }) => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(relay = %self.connection.address(), skipped, "cache relay listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };
        if timeout(self.wait_limit(), collect).await.is_err() {
            warn!(
                relay = %self.connection.address(),
                subscription = subscription_id,
                "cache relay query timed out"
            );
        }

        if let Err(error) = self.connection.close_request(subscription_id).await {
            debug!(relay = %self.connection.address(), %error, "cache relay CLOSE failed");
        }
        Ok(events)
    }

    async fn delete(&self, _subscription_id: &str, _filters: &[Filter]) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Tracks authors whose relay lists should be fetched.
pub trait RelayMetadataLoader: Send + Sync {
    fn track_keys(&self, keys: &[String]);

    /// Offered every incoming event.
    fn on_event(&self, _event: &Event) {}

    /// Keys waiting to be fetched. Draining.
    fn take_pending(&self) -> Vec<String>;
}

/// [`RelayMetadataLoader`] that fills a [`CachedTable<UsersRelays>`] from
/// kind 10002 events.
///
/// Each unknown author is handed out by `take_pending` once.
pub struct UserRelaysLoader {
    table: Arc<dyn CachedTable<UsersRelays>>,
    pending: std::sync::Mutex<HashSet<String>>,
    requested: std::sync::Mutex<HashSet<String>>,
}

impl UserRelaysLoader {
    pub fn new(table: Arc<dyn CachedTable<UsersRelays>>) -> Self {
        Self {
            table,
            pending: std::sync::Mutex::new(HashSet::new()),
            requested: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn table(&self) -> &Arc<dyn CachedTable<UsersRelays>> {
        &self.table
    }

    /// Store a relay list event. Returns what the table did with it.
    pub async fn ingest(&self, event: &Event) -> Result<Option<CacheUpdate>> {
        if event.kind != RELAY_LIST_KIND {
            return Ok(None);
        }
        lock(&self.pending).remove(&event.pubkey);
        let entry = UsersRelays {
            pubkey: event.pubkey.clone(),
            created: event.created_at,
            loaded: 0,
            relays: parse_relay_tags(&event.tags),
        };
        self.table.update(entry).await.map(Some)
    }
}

impl RelayMetadataLoader for UserRelaysLoader {
    fn track_keys(&self, keys: &[String]) {
        let missing: Vec<String> = {
            let requested = lock(&self.requested);
            keys.iter()
                .filter(|key| !requested.contains(*key))
                .filter(|key| self.table.get_from_cache(key).is_none())
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return;
        }
        lock(&self.pending).extend(missing);
    }

    fn on_event(&self, event: &Event) {
        if event.kind == RELAY_LIST_KIND {
            lock(&self.pending).remove(&event.pubkey);
        }
    }

    fn take_pending(&self) -> Vec<String> {
        let taken: Vec<String> = lock(&self.pending).drain().collect();
        lock(&self.requested).extend(taken.iter().cloned());
        taken
    }
}

/// Records connects, disconnects, events and EOSE latency per relay into a
/// [`CachedTable<RelayMetrics>`].
pub struct RelayMetricsHandler {
    table: Arc<dyn CachedTable<RelayMetrics>>,
    clock: Arc<dyn Clock>,
    write: tokio::sync::Mutex<()>,
}

impl RelayMetricsHandler {
    pub fn new(table: Arc<dyn CachedTable<RelayMetrics>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            table,
            clock,
            write: tokio::sync::Mutex::new(()),
        }
    }

    pub fn table(&self) -> &Arc<dyn CachedTable<RelayMetrics>> {
        &self.table
    }

    pub async fn on_connect(&self, address: &str) {
        self.record(address, |metrics| metrics.connects += 1).await;
    }

    /// Also used for connection attempts that failed.
    pub async fn on_disconnect(&self, address: &str) {
        self.record(address, |metrics| metrics.disconnects += 1).await;
    }

    pub async fn on_event(&self, address: &str) {
        self.record(address, |metrics| metrics.events += 1).await;
    }

    /// Only EOSE reports carry a latency sample.
    pub async fn on_trace(&self, report: &TraceReport) {
        if report.state != TraceState::Eose {
            return;
        }
        let elapsed = report.elapsed_ms;
        self.record(&report.relay, |metrics| {
            metrics.latency.push(elapsed);
            if metrics.latency.len() > MAX_LATENCY_SAMPLES {
                metrics.latency.remove(0);
            }
        })
        .await;
    }

    async fn record(&self, address: &str, apply: impl FnOnce(&mut RelayMetrics) + Send) {
        let _guard = self.write.lock().await;
        let mut metrics = self
            .table
            .get_from_cache(address)
            .unwrap_or_else(|| RelayMetrics {
                addr: address.to_string(),
                ..RelayMetrics::default()
            });
        apply(&mut metrics);
        metrics.last_seen = self.clock.unix_now();
        if let Err(error) = self.table.bulk_set(vec![metrics]).await {
            warn!(relay = address, %error, "failed to store relay metrics");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::clock::SystemClock;
    use crate::error::ClientError;
    use crate::transport::ChannelTransport;

    fn event(id: &str, pubkey: &str, kind: u16, created_at: u64, tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at,
            kind,
            tags: tags
                .into_iter()
                .map(|tag| tag.into_iter().map(str::to_string).collect())
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[tokio::test]
    async fn memory_table_update_outcomes() -> Result<()> {
        let table = MemoryTable::<UsersRelays>::new();
        let mut list = UsersRelays {
            pubkey: "alice".to_string(),
            created: 10,
            loaded: 100,
            relays: Vec::new(),
        };

        assert_eq!(table.update(list.clone()).await?, CacheUpdate::New);
        assert_eq!(table.update(list.clone()).await?, CacheUpdate::NoChange);
        list.loaded = 200;
        assert_eq!(table.update(list.clone()).await?, CacheUpdate::Refresh);
        list.created = 11;
        assert_eq!(table.update(list.clone()).await?, CacheUpdate::Updated);

        let missing = table
            .buffer(&["alice".to_string(), "bob".to_string()])
            .await;
        assert_eq!(missing, vec!["bob".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn ids_layer_answers_from_cache_and_strips_hits() -> Result<()> {
        let cache = Arc::new(MemoryTable::<Event>::new());
        cache
            .bulk_set(vec![event("e1", "pk", 1, 10, Vec::new())])
            .await?;
        let layer = IdsCacheLayer::new(cache);
        let query = Query::new("ids", Arc::new(SystemClock), Duration::from_secs(5));

        let request = BuiltRequest::new(None, vec![Filter::new().ids(["e1", "e2"])]);
        let processed = layer.process_filter(&query, request).await;

        assert_eq!(processed.filters, vec![Filter::new().ids(["e2"])]);
        let feed = query.snapshot();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].id(), "e1");
        Ok(())
    }

    #[tokio::test]
    async fn loader_tracks_unknown_authors_until_their_list_arrives() -> Result<()> {
        let table = Arc::new(MemoryTable::<UsersRelays>::new());
        let loader = UserRelaysLoader::new(table.clone());

        loader.track_keys(&["alice".to_string(), "bob".to_string()]);
        let list = event(
            "r1",
            "alice",
            RELAY_LIST_KIND,
            5,
            vec![vec!["r", "wss://alice.relay", "write"]],
        );
        assert_eq!(loader.ingest(&list).await?, Some(CacheUpdate::New));
        assert_eq!(loader.take_pending(), vec!["bob".to_string()]);
        loader.track_keys(&["bob".to_string()]);
        assert!(loader.take_pending().is_empty());

        let stored = table
            .get_from_cache("alice")
            .ok_or_else(|| ClientError::Internal("missing list".to_string()))?;
        assert_eq!(stored.write_relays().collect::<Vec<_>>(), vec!["wss://alice.relay/"]);

        loader.track_keys(&["alice".to_string()]);
        assert!(loader.take_pending().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn metrics_count_activity_and_keep_recent_latency() -> Result<()> {
        let table = Arc::new(MemoryTable::<RelayMetrics>::new());
        let clock = Arc::new(crate::clock::ManualClock::new(5_000));
        let handler = RelayMetricsHandler::new(table.clone(), clock.clone());
        let relay = "wss://relay.test/";

        handler.on_connect(relay).await;
        handler.on_event(relay).await;
        handler.on_event(relay).await;
        handler.on_disconnect(relay).await;
        clock.advance(Duration::from_secs(3));
        for elapsed_ms in 0..=MAX_LATENCY_SAMPLES as u64 {
            for state in [TraceState::Sent, TraceState::Eose] {
                handler
                    .on_trace(&TraceReport {
                        query_id: "q".to_string(),
                        trace_id: "t".to_string(),
                        relay: relay.to_string(),
                        state,
                        elapsed_ms,
                    })
                    .await;
            }
        }

        let metrics = table
            .get_from_cache(relay)
            .ok_or_else(|| ClientError::Internal("no metrics".to_string()))?;
        assert_eq!((metrics.connects, metrics.events, metrics.disconnects), (1, 2, 1));
        assert_eq!(metrics.last_seen, 8);
        assert_eq!(metrics.latency.len(), MAX_LATENCY_SAMPLES);
        assert_eq!(metrics.latency.first(), Some(&1));
        assert_eq!(metrics.latency.last(), Some(&(MAX_LATENCY_SAMPLES as u64)));
        Ok(())
    }

    #[tokio::test]
    async fn cache_relay_second_write_is_duplicate_without_a_frame() -> Result<()> {
        let (transport, mut accepted) = ChannelTransport::new();
        let cache_relay = ConnectionCacheRelay::connect(
            "ws://cache.test/",
            RelayConfig {
                publish_timeout: Duration::from_millis(200),
                ..RelayConfig::default()
            },
            Arc::new(transport),
        )
        .await?;
        let mut peer = accepted
            .recv()
            .await
            .ok_or_else(|| ClientError::Internal("no peer".to_string()))?;

        let stored = event("e1", "pk", 1, 10, Vec::new());
        let publish = cache_relay.event(&stored);
        let relay_side = async {
            let frame = peer.recv_json().await;
            peer.send_json(&json!(["OK", "e1", true, ""]));
            frame
        };
        let (first, frame) = tokio::join!(publish, relay_side);
        assert!(first.ok);
        assert_eq!(frame.as_ref().and_then(|f| f.get(0)), Some(&json!("EVENT")));

        let second = cache_relay.event(&stored).await;
        assert!(second.ok);
        assert_eq!(second.message, "duplicate");

        let nothing = timeout(Duration::from_millis(50), peer.recv()).await;
        assert!(nothing.is_err(), "duplicate write reached the transport");
        Ok(())
    }

    #[tokio::test]
    async fn cache_relay_forgets_the_oldest_written_ids() -> Result<()> {
        let (transport, mut accepted) = ChannelTransport::new();
        let connection = Arc::new(RelayConnection::new(
            "ws://cache.test/",
            RelaySettings::READ_WRITE,
            false,
            RelayConfig {
                publish_timeout: Duration::from_millis(200),
                ..RelayConfig::default()
            },
            Arc::new(transport),
            None,
        ));
        connection.connect().await?;
        let cache_relay = ConnectionCacheRelay::with_capacity(connection, NonZeroUsize::MIN);
        let mut peer = accepted
            .recv()
            .await
            .ok_or_else(|| ClientError::Internal("no peer".to_string()))?;

        for id in ["e1", "e2", "e1"] {
            let stored = event(id, "pk", 1, 10, Vec::new());
            let relay_side = async {
                let frame = peer.recv_json().await;
                peer.send_json(&json!(["OK", id, true, ""]));
                frame
            };
            let (response, frame) = tokio::join!(cache_relay.event(&stored), relay_side);
            assert!(response.ok);
            assert_eq!(response.message, "");
            let sent_id = frame.as_ref().and_then(|f| f.get(1)).and_then(|e| e.get("id"));
            assert_eq!(sent_id, Some(&json!(id)));
        }
        Ok(())
    }

    #[tokio::test]
    async fn cache_relay_query_collects_until_eose_then_closes() -> Result<()> {
        let (transport, mut accepted) = ChannelTransport::new();
        let cache_relay = ConnectionCacheRelay::connect(
            "ws://cache.test/",
            RelayConfig::default(),
            Arc::new(transport),
        )
        .await?;
        let mut peer = accepted
            .recv()
            .await
            .ok_or_else(|| ClientError::Internal("no peer".to_string()))?;

        let cached = event("e1", "pk", 1, 10, Vec::new());
        let relay_side = async {
            let req = peer.recv_json().await;
            peer.send_json(&json!(["EVENT", "local", cached]));
            peer.send_json(&json!(["EOSE", "local"]));
            let close = peer.recv_json().await;
            (req, close)
        };
        let filters = [Filter::new().kinds([1])];
        let (events, (req, close)) = tokio::join!(
            cache_relay.query("local", &filters),
            relay_side
        );

        assert_eq!(events?, vec![cached.clone()]);
        assert_eq!(req, Some(json!(["REQ", "local", {"kinds": [1]}])));
        assert_eq!(close, Some(json!(["CLOSE", "local"])));
        Ok(())
    }
}
