//! Query manager: owns live queries and turns requests into relay traffic.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use nostr::{Filter, Optimizer, TaggedEvent, event_matches_filter, trim_filters};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheRelay, FilterCacheLayer, RelayMetadataLoader};
use crate::clock::Clock;
use crate::config::{FallbackSync, SystemConfig};
use crate::lock;
use crate::negentropy::NegentropyFlow;
use crate::pool::RelayPool;
use crate::query::{Query, TraceReport};
use crate::relay::{RelayConnection, RelaySettings};
use crate::request_builder::{BuiltRequest, RequestBuilder};
use crate::router::RequestRouter;

const EVENT_CAPACITY: usize = 1024;
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(10);

/// Manager settings, usually derived from [`SystemConfig`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub cleanup_interval: Duration,
    pub cancel_grace: Duration,
    pub negentropy: bool,
    pub fallback_sync: FallbackSync,
    pub negentropy_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from(&SystemConfig::default())
    }
}

impl From<&SystemConfig> for ManagerOptions {
    fn from(config: &SystemConfig) -> Self {
        Self {
            cleanup_interval: config.cleanup_interval,
            cancel_grace: config.cancel_grace,
            negentropy: config.negentropy,
            fallback_sync: config.fallback_sync,
            negentropy_timeout: config.negentropy_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub enum QueryManagerEvent {
    /// Queries were added or removed.
    Change,
    Trace(TraceReport),
    /// A built request is about to be sent.
    Request {
        subscription_id: String,
        request: BuiltRequest,
    },
}

/// Called with each batch of new events during [`QueryManager::fetch`].
pub type BatchCallback<'a> = &'a (dyn Fn(&[TaggedEvent]) + Send + Sync);

pub struct QueryManager {
    queries: std::sync::Mutex<HashMap<String, Query>>,
    pool: Arc<RelayPool>,
    optimizer: Arc<dyn Optimizer>,
    router: Option<Arc<dyn RequestRouter>>,
    cache_layers: Vec<Arc<dyn FilterCacheLayer>>,
    cache_relay: Option<Arc<dyn CacheRelay>>,
    relay_loader: Option<Arc<dyn RelayMetadataLoader>>,
    clock: Arc<dyn Clock>,
    options: ManagerOptions,
    events: broadcast::Sender<QueryManagerEvent>,
    grouping: std::sync::Mutex<HashMap<String, RequestBuilder>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl QueryManager {
    pub fn new(
        pool: Arc<RelayPool>,
        optimizer: Arc<dyn Optimizer>,
        clock: Arc<dyn Clock>,
        options: ManagerOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            queries: std::sync::Mutex::new(HashMap::new()),
            pool,
            optimizer,
            router: None,
            cache_layers: Vec::new(),
            cache_relay: None,
            relay_loader: None,
            clock,
            options,
            events,
            grouping: std::sync::Mutex::new(HashMap::new()),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_router(mut self, router: Arc<dyn RequestRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_cache_layer(mut self, layer: Arc<dyn FilterCacheLayer>) -> Self {
        self.cache_layers.push(layer);
        self
    }

    pub fn with_cache_relay(mut self, cache_relay: Arc<dyn CacheRelay>) -> Self {
        self.cache_relay = Some(cache_relay);
        self
    }

    pub fn with_relay_loader(mut self, loader: Arc<dyn RelayMetadataLoader>) -> Self {
        self.relay_loader = Some(loader);
        self
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.pool
    }

    /// Start the periodic cleanup task.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.options.cleanup_interval.max(MIN_CLEANUP_INTERVAL);
        self.track(tokio::spawn(cleanup_loop(weak, period)));
    }

    /// Stop background tasks and close every open subscription.
    pub async fn shutdown(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        lock(&self.grouping).clear();
        let queries: Vec<Query> = lock(&self.queries).drain().map(|(_, q)| q).collect();
        for query in &queries {
            query.cancel();
            query.send_close().await;
        }
        if !queries.is_empty() {
            self.emit(QueryManagerEvent::Change);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueryManagerEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Query> {
        lock(&self.queries).get(id).cloned()
    }

    /// Snapshot of `(id, query)` pairs.
    pub fn iter(&self) -> Vec<(String, Query)> {
        lock(&self.queries)
            .iter()
            .map(|(id, query)| (id.clone(), query.clone()))
            .collect()
    }

    /// Start or extend the query named by `request.id()`.
    ///
    /// An existing query only sends what it has not asked for yet. A new
    /// query with a grouping delay waits that long so requests arriving in
    /// the meantime go out together.
    pub async fn query(self: &Arc<Self>, mut request: RequestBuilder) -> Query {
        let id = request.id().to_string();

        {
            let mut grouping = lock(&self.grouping);
            if let Some(pending) = grouping.get_mut(&id)
                && let Some(query) = self.get(&id)
            {
                pending.add(&request);
                pending.options_mut().leave_open |= request.options().leave_open;
                debug!(query = %id, "request joined grouping window");
                return query;
            }
        }

        let (query, created) = {
            let mut queries = lock(&self.queries);
            match queries.get(&id) {
                Some(query) => (query.clone(), false),
                None => {
                    let query = self.new_query(&id);
                    queries.insert(id.clone(), query.clone());
                    (query, true)
                }
            }
        };

        if !created {
            if query.is_cancelled() {
                query.uncancel();
            }
            let built = query.add_request(&mut request, &*self.optimizer, self.router.as_deref());
            if built.is_empty() {
                debug!(query = %id, "request adds nothing");
                return query;
            }
            self.dispatch(&query, built).await;
            return query;
        }

        info!(query = %id, "query created");
        self.emit(QueryManagerEvent::Change);
        let grouping_delay = request.options().grouping_delay.filter(|d| !d.is_zero());
        match grouping_delay {
            Some(delay) => {
                lock(&self.grouping).insert(id.clone(), request);
                let weak = Arc::downgrade(self);
                self.track(tokio::spawn(async move {
                    sleep(delay).await;
                    if let Some(manager) = weak.upgrade() {
                        manager.flush_group(&id).await;
                    }
                }));
            }
            None => {
                let built =
                    query.add_request(&mut request, &*self.optimizer, self.router.as_deref());
                self.dispatch(&query, built).await;
            }
        }
        query
    }

    /// One-shot query: resolves when every relay finished or the request
    /// timeout passed, with whatever arrived by then.
    ///
    /// Only events matching the request's own filters are returned or
    /// handed to `on_batch`.
    pub async fn fetch(
        self: &Arc<Self>,
        mut request: RequestBuilder,
        on_batch: Option<BatchCallback<'_>>,
    ) -> Vec<TaggedEvent> {
        let raw = request.build_raw(&*self.optimizer);
        let limit = request.options().timeout;
        let query = self.query(request).await;

        let mut batches = query.subscribe_events();
        let wanted = |tagged: &TaggedEvent| {
            raw.iter()
                .any(|filter| event_matches_filter(&tagged.event, filter))
        };
        let mut delivered = HashSet::new();
        let mut deliver = |events: Vec<TaggedEvent>| {
            let fresh: Vec<TaggedEvent> = events
                .into_iter()
                .filter(|event| wanted(event) && delivered.insert(event.id().to_string()))
                .collect();
            if let Some(callback) = on_batch
                && !fresh.is_empty()
            {
                callback(&fresh);
            }
        };
        deliver(query.snapshot());

        let wait = async {
            let done = query.wait_done();
            tokio::pin!(done);
            loop {
                tokio::select! {
                    _ = &mut done => break,
                    batch = batches.recv() => match batch {
                        Ok(batch) => deliver(batch),
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(query = %query.id(), skipped, "fetch lagged behind batches");
                        }
                        Err(RecvError::Closed) => {
                            (&mut done).await;
                            break;
                        }
                    },
                }
            }
        };
        let timed_out = match limit {
            Some(limit) => timeout(limit, wait).await.is_err(),
            None => {
                wait.await;
                false
            }
        };
        if timed_out {
            warn!(query = %query.id(), "fetch timed out, returning partial results");
            query.cancel();
        }
        deliver(query.snapshot());

        query.snapshot().into_iter().filter(|tagged| wanted(tagged)).collect()
    }

    /// Offer an event to every query. Returns true when a query that fills
    /// the store took it.
    pub fn handle_event(&self, subscription_id: &str, event: &TaggedEvent) -> bool {
        let mut store = false;
        for query in self.live() {
            if query.handle_event(subscription_id, event) && query.fill_store() {
                store = true;
            }
        }
        store
    }

    pub async fn handle_eose(&self, subscription_id: &str, connection_id: &str) {
        if let Some(query) = self.owner(subscription_id) {
            query.eose(subscription_id, connection_id).await;
        }
    }

    pub fn handle_closed(&self, subscription_id: &str, connection_id: &str, message: &str) {
        if let Some(query) = self.owner(subscription_id) {
            debug!(query = %query.id(), subscription = subscription_id, message, "relay closed subscription");
            query.closed(subscription_id, connection_id);
        }
    }

    pub fn connection_lost(&self, connection_id: &str) {
        for query in self.live() {
            query.connection_lost(connection_id);
        }
    }

    pub async fn connection_restored(&self, connection: &Arc<RelayConnection>) {
        for query in self.live() {
            query.connection_restored(connection).await;
        }
    }

    /// Drop removable queries and idle ephemeral connections.
    pub async fn cleanup(&self) {
        let removed: Vec<Query> = {
            let mut queries = lock(&self.queries);
            let ids: Vec<String> = queries
                .iter()
                .filter(|(_, query)| query.can_remove())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| queries.remove(id)).collect()
        };

        if !removed.is_empty() {
            let mut grouping = lock(&self.grouping);
            for query in &removed {
                grouping.remove(query.id());
            }
        }
        for query in &removed {
            query.send_close().await;
            debug!(query = %query.id(), "query removed");
        }
        if !removed.is_empty() {
            self.emit(QueryManagerEvent::Change);
        }

        let evicted = self.pool.evict_idle_ephemeral().await;
        if evicted > 0 {
            debug!(evicted, "closed idle ephemeral relays");
        }
        lock(&self.tasks).retain(|task| !task.is_finished());
    }

    fn new_query(&self, id: &str) -> Query {
        let query = Query::new(id, Arc::clone(&self.clock), self.options.cancel_grace);
        let events = self.events.clone();
        query.set_trace_callback(Arc::new(move |report| {
            let _ = events.send(QueryManagerEvent::Trace(report));
        }));
        query
    }

    async fn flush_group(&self, id: &str) {
        let Some(mut request) = lock(&self.grouping).remove(id) else {
            return;
        };
        let Some(query) = self.get(id) else {
            return;
        };
        debug!(query = %id, "grouping window closed");
        let built = query.add_request(&mut request, &*self.optimizer, self.router.as_deref());
        self.dispatch(&query, built).await;
    }

    async fn dispatch(&self, query: &Query, built: Vec<BuiltRequest>) {
        for request in built {
            self.emit(QueryManagerEvent::Request {
                subscription_id: query.id().to_string(),
                request: request.clone(),
            });
            self.send(query, request).await;
        }
        query.mark_dispatched();
    }

    async fn send(&self, query: &Query, mut request: BuiltRequest) {
        for layer in &self.cache_layers {
            request = layer.process_filter(query, request).await;
        }

        if let Some(cache_relay) = &self.cache_relay {
            let filters = trim_filters(request.filters.clone());
            if !filters.is_empty() {
                let subscription_id = Uuid::new_v4().to_string();
                match cache_relay.query(&subscription_id, &filters).await {
                    Ok(events) if !events.is_empty() => {
                        debug!(query = %query.id(), hits = events.len(), "cache relay hits");
                        let tagged: Vec<TaggedEvent> =
                            events.into_iter().map(TaggedEvent::from).collect();
                        query.add_events(tagged.clone());
                        request.sync_from = Some(tagged);
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(query = %query.id(), %error, "cache relay query failed");
                    }
                }
            }
        }

        if let Some(loader) = &self.relay_loader {
            let authors: Vec<String> = request
                .filters
                .iter()
                .filter_map(|filter| filter.authors.as_ref())
                .flatten()
                .cloned()
                .collect();
            if !authors.is_empty() {
                loader.track_keys(&authors);
            }
        }

        request.filters = trim_filters(request.filters);
        if request.filters.is_empty() {
            debug!(query = %query.id(), "request trimmed to nothing, not sending");
            return;
        }

        let targets: Vec<Arc<RelayConnection>> = match &request.relay {
            Some(relay) => match self.pool.get_by_address(relay).await {
                Some(existing) => vec![existing],
                None => self
                    .pool
                    .connect(relay, RelaySettings::READ_WRITE, true)
                    .await
                    .into_iter()
                    .collect(),
            },
            None => self
                .pool
                .connections()
                .await
                .into_iter()
                .map(|(_, connection)| connection)
                .filter(|connection| !connection.is_ephemeral())
                .collect(),
        };
        if targets.is_empty() {
            debug!(query = %query.id(), relay = ?request.relay, "no relay to send to");
        }
        for connection in targets {
            self.send_to_connection(query, &connection, &request).await;
        }
    }

    async fn send_to_connection(
        &self,
        query: &Query,
        connection: &Arc<RelayConnection>,
        request: &BuiltRequest,
    ) {
        let Some(cached) = request.sync_from.as_ref().filter(|events| !events.is_empty()) else {
            query.send_to_relay(connection, request).await;
            return;
        };

        if self.options.negentropy && connection.settings().read {
            match NegentropyFlow::new(
                Uuid::new_v4().to_string(),
                Arc::clone(connection),
                cached,
                request.filters.clone(),
            ) {
                Ok(flow) => {
                    let outcome = flow.sync(Some(self.options.negentropy_timeout)).await;
                    if !outcome.is_error() {
                        let missing = BuiltRequest::new(request.relay.clone(), outcome.filters());
                        if !missing.filters.is_empty() {
                            query.send_to_relay(connection, &missing).await;
                        }
                        if query.leave_open() {
                            let live = with_since(&request.filters, self.clock.unix_now());
                            query
                                .send_to_relay(connection, &BuiltRequest::new(request.relay.clone(), live))
                                .await;
                        }
                        return;
                    }
                    warn!(
                        query = %query.id(),
                        relay = %connection.address(),
                        error = outcome.error.as_deref().unwrap_or(""),
                        "negentropy failed, falling back"
                    );
                }
                Err(error) => {
                    warn!(query = %query.id(), %error, "negentropy setup failed, falling back");
                }
            }
        }

        let fallback = match self.options.fallback_sync {
            FallbackSync::None => BuiltRequest::new(request.relay.clone(), request.filters.clone()),
            FallbackSync::Since => {
                let newest = cached
                    .iter()
                    .map(|tagged| tagged.event.created_at)
                    .max()
                    .unwrap_or_default();
                BuiltRequest::new(request.relay.clone(), with_since(&request.filters, newest))
            }
        };
        query.send_to_relay(connection, &fallback).await;
    }

    fn owner(&self, subscription_id: &str) -> Option<Query> {
        lock(&self.queries)
            .values()
            .find(|query| query.has_trace(subscription_id))
            .cloned()
    }

    fn live(&self) -> Vec<Query> {
        lock(&self.queries).values().cloned().collect()
    }

    fn track(&self, task: JoinHandle<()>) {
        lock(&self.tasks).push(task);
    }

    fn emit(&self, event: QueryManagerEvent) {
        let _ = self.events.send(event);
    }
}

/// Raise `since` to at least `since`, keeping a later one.
fn with_since(filters: &[Filter], since: u64) -> Vec<Filter> {
    filters
        .iter()
        .map(|filter| Filter {
            since: Some(filter.since.map_or(since, |current| current.max(since))),
            ..filter.clone()
        })
        .collect()
}

async fn cleanup_loop(manager: Weak<QueryManager>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.cleanup().await;
    }
}
