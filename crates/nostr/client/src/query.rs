//! A live query: the subscriptions sent for it and the events they returned.
//!
//! A [`Query`] is a cheap handle. The manager keeps one per query id and
//! callers get clones to watch progress and read the deduplicated feed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use nostr::{Filter, Optimizer, TaggedEvent, event_matches_filter};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::lock;
use crate::relay::RelayConnection;
use crate::request_builder::{BuiltRequest, RequestBuilder};
use crate::router::RequestRouter;

const BATCH_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Nothing dispatched yet.
    Pending,
    InFlight,
    /// Every trace finished.
    Done,
    Cancelled,
}

/// One REQ sent to one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTrace {
    /// Subscription id on the wire.
    pub id: String,
    pub connection_id: String,
    pub relay: String,
    pub filters: Vec<Filter>,
    pub sent_at: u64,
    pub eose_at: Option<u64>,
    pub closed: bool,
    /// The connection dropped before the trace finished.
    pub lost: bool,
}

impl QueryTrace {
    pub fn is_finished(&self) -> bool {
        self.eose_at.is_some() || self.closed || self.lost
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Sent,
    Eose,
    Closed,
    Lost,
}

/// Trace lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceReport {
    pub query_id: String,
    pub trace_id: String,
    pub relay: String,
    pub state: TraceState,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryProgress {
    pub status: QueryStatus,
    pub completed: usize,
    pub total: usize,
}

impl QueryProgress {
    /// Finished share of traces. A dispatched query with no traces is complete.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return match self.status {
                QueryStatus::Pending => 0.0,
                _ => 1.0,
            };
        }
        self.completed as f64 / self.total as f64
    }
}

pub type TraceCallback = Arc<dyn Fn(TraceReport) + Send + Sync>;

#[derive(Default)]
struct QueryState {
    filters: Vec<Filter>,
    traces: Vec<QueryTrace>,
    connections: HashMap<String, Arc<RelayConnection>>,
    events: HashMap<String, TaggedEvent>,
    order: Vec<String>,
    leave_open: bool,
    fill_store: bool,
    dispatched: bool,
    cancel_at: Option<u64>,
    done_at: Option<u64>,
}

impl QueryState {
    fn progress(&self) -> QueryProgress {
        let total = self.traces.len();
        let completed = self.traces.iter().filter(|t| t.is_finished()).count();
        let status = if self.cancel_at.is_some() {
            QueryStatus::Cancelled
        } else if !self.dispatched && total == 0 {
            QueryStatus::Pending
        } else if completed == total {
            QueryStatus::Done
        } else {
            QueryStatus::InFlight
        };
        QueryProgress {
            status,
            completed,
            total,
        }
    }

    /// Returns only the events not seen before.
    fn insert(&mut self, events: impl IntoIterator<Item = TaggedEvent>) -> Vec<TaggedEvent> {
        let mut fresh = Vec::new();
        for event in events {
            match self.events.get_mut(event.id()) {
                Some(existing) => {
                    existing.merge_relays(&event);
                }
                None => {
                    self.order.push(event.id().to_string());
                    self.events.insert(event.id().to_string(), event.clone());
                    fresh.push(event);
                }
            }
        }
        fresh
    }
}

struct QueryInner {
    id: String,
    clock: Arc<dyn Clock>,
    cancel_grace: Duration,
    state: std::sync::Mutex<QueryState>,
    progress: watch::Sender<QueryProgress>,
    batches: broadcast::Sender<Vec<TaggedEvent>>,
    on_trace: std::sync::Mutex<Option<TraceCallback>>,
}

#[derive(Clone)]
pub struct Query {
    inner: Arc<QueryInner>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.inner.id)
            .field("progress", &self.progress_state())
            .finish_non_exhaustive()
    }
}

impl Query {
    pub fn new(id: impl Into<String>, clock: Arc<dyn Clock>, cancel_grace: Duration) -> Self {
        let state = QueryState {
            fill_store: true,
            ..QueryState::default()
        };
        let (progress, _) = watch::channel(state.progress());
        let (batches, _) = broadcast::channel(BATCH_CAPACITY);
        Self {
            inner: Arc::new(QueryInner {
                id: id.into(),
                clock,
                cancel_grace,
                state: std::sync::Mutex::new(state),
                progress,
                batches,
                on_trace: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn set_trace_callback(&self, callback: TraceCallback) {
        *lock(&self.inner.on_trace) = Some(callback);
    }

    /// Everything requested so far, compressed.
    pub fn filters(&self) -> Vec<Filter> {
        lock(&self.inner.state).filters.clone()
    }

    pub fn traces(&self) -> Vec<QueryTrace> {
        lock(&self.inner.state).traces.clone()
    }

    pub fn leave_open(&self) -> bool {
        lock(&self.inner.state).leave_open
    }

    pub fn fill_store(&self) -> bool {
        lock(&self.inner.state).fill_store
    }

    /// Fold a request into this query and return what still has to be sent.
    ///
    /// Unless `skip_diff` is set, only the part not covered by earlier
    /// requests is returned. An unchanged request yields nothing.
    pub fn add_request(
        &self,
        request: &mut RequestBuilder,
        optimizer: &dyn Optimizer,
        router: Option<&dyn RequestRouter>,
    ) -> Vec<BuiltRequest> {
        let prev = self.filters();
        let built = if request.options().skip_diff || prev.is_empty() {
            request.build(optimizer, router)
        } else {
            request.build_diff(optimizer, router, &prev)
        };
        let raw = request.build_raw_routed(optimizer, router);

        let mut state = lock(&self.inner.state);
        let mut combined = std::mem::take(&mut state.filters);
        combined.extend(raw);
        state.filters = optimizer.compress(combined);
        state.leave_open |= request.options().leave_open;
        state.fill_store = request.options().fill_store;
        built
    }

    /// Send one built request to a connection and start tracing it.
    ///
    /// Skipped (returns `None`) for relays without read permission and once
    /// the query is cancelled. A failed send comes back as a lost trace.
    pub async fn send_to_relay(
        &self,
        connection: &Arc<RelayConnection>,
        request: &BuiltRequest,
    ) -> Option<QueryTrace> {
        if !connection.settings().read {
            debug!(query = %self.id(), relay = %connection.address(), "relay is not readable");
            return None;
        }

        let mut trace = {
            let mut state = lock(&self.inner.state);
            if state.cancel_at.is_some() {
                return None;
            }
            let trace = QueryTrace {
                id: Uuid::new_v4().to_string(),
                connection_id: connection.id().to_string(),
                relay: connection.address().to_string(),
                filters: request.filters.clone(),
                sent_at: self.inner.clock.now_ms(),
                eose_at: None,
                closed: false,
                lost: false,
            };
            state.traces.push(trace.clone());
            state
                .connections
                .insert(connection.id().to_string(), Arc::clone(connection));
            trace
        };
        self.publish_progress();

        match connection.request(&trace.id, &trace.filters).await {
            Ok(()) => self.report(&trace, TraceState::Sent),
            Err(error) => {
                warn!(query = %self.id(), relay = %trace.relay, %error, "REQ failed");
                self.update_trace(&trace.id, |t| t.lost = true);
                trace.lost = true;
                self.report(&trace, TraceState::Lost);
                self.publish_progress();
            }
        }
        Some(trace)
    }

    /// Offer an event received for `subscription_id`. `"*"` matches any
    /// event that fits the query's filters.
    ///
    /// Returns true when the event was new to this query.
    pub fn handle_event(&self, subscription_id: &str, event: &TaggedEvent) -> bool {
        let fresh = {
            let mut state = lock(&self.inner.state);
            if state.cancel_at.is_some() {
                return false;
            }
            let accepted = if subscription_id == "*" {
                state
                    .filters
                    .iter()
                    .any(|filter| event_matches_filter(&event.event, filter))
            } else {
                state
                    .traces
                    .iter()
                    .find(|trace| trace.id == subscription_id)
                    .is_some_and(|trace| {
                        trace
                            .filters
                            .iter()
                            .any(|filter| event_matches_filter(&event.event, filter))
                    })
            };
            if !accepted {
                return false;
            }
            state.insert([event.clone()])
        };
        self.emit_batch(fresh)
    }

    /// Inject events found locally. Duplicates only merge relay sets.
    pub fn add_events(&self, events: Vec<TaggedEvent>) {
        let fresh = lock(&self.inner.state).insert(events);
        self.emit_batch(fresh);
    }

    /// Whether a subscription id belongs to this query.
    pub fn has_trace(&self, subscription_id: &str) -> bool {
        lock(&self.inner.state)
            .traces
            .iter()
            .any(|trace| trace.id == subscription_id)
    }

    /// Relay finished stored events. Closes the subscription unless the
    /// query stays open.
    pub async fn eose(&self, subscription_id: &str, connection_id: &str) {
        let now = self.inner.clock.now_ms();
        let (trace, connection) = {
            let mut state = lock(&self.inner.state);
            let leave_open = state.leave_open;
            let Some(trace) = state
                .traces
                .iter_mut()
                .find(|t| t.id == subscription_id && t.connection_id == connection_id)
            else {
                return;
            };
            if trace.eose_at.is_none() {
                trace.eose_at = Some(now);
            }
            if !leave_open {
                trace.closed = true;
            }
            let trace = trace.clone();
            let connection = (!leave_open)
                .then(|| state.connections.get(connection_id).cloned())
                .flatten();
            (trace, connection)
        };

        self.report(&trace, TraceState::Eose);
        self.publish_progress();
        if let Some(connection) = connection
            && let Err(error) = connection.close_request(subscription_id).await
        {
            debug!(query = %self.id(), relay = %trace.relay, %error, "CLOSE after EOSE failed");
        }
    }

    /// Relay closed the subscription on its side.
    pub fn closed(&self, subscription_id: &str, connection_id: &str) {
        let trace = {
            let mut state = lock(&self.inner.state);
            let Some(trace) = state
                .traces
                .iter_mut()
                .find(|t| t.id == subscription_id && t.connection_id == connection_id)
            else {
                return;
            };
            trace.closed = true;
            trace.clone()
        };
        self.report(&trace, TraceState::Closed);
        self.publish_progress();
    }

    /// Mark every open trace on a dropped connection as lost.
    pub fn connection_lost(&self, connection_id: &str) {
        let lost: Vec<QueryTrace> = {
            let mut state = lock(&self.inner.state);
            state
                .traces
                .iter_mut()
                .filter(|t| t.connection_id == connection_id && !t.closed && !t.lost)
                .map(|t| {
                    t.lost = true;
                    t.clone()
                })
                .collect()
        };
        if lost.is_empty() {
            return;
        }
        for trace in &lost {
            self.report(trace, TraceState::Lost);
        }
        self.publish_progress();
    }

    /// Re-send lost traces after a reconnect.
    ///
    /// A trace is re-sent while the query is not cancelled and the trace had
    /// not seen EOSE yet, or the query stays open.
    pub async fn connection_restored(&self, connection: &Arc<RelayConnection>) {
        let resend: Vec<QueryTrace> = {
            let mut state = lock(&self.inner.state);
            if state.cancel_at.is_some() {
                return;
            }
            let leave_open = state.leave_open;
            let resend: Vec<QueryTrace> = state
                .traces
                .iter_mut()
                .filter(|t| {
                    t.connection_id == connection.id()
                        && t.lost
                        && (t.eose_at.is_none() || leave_open)
                })
                .map(|t| {
                    t.lost = false;
                    t.clone()
                })
                .collect();
            if !resend.is_empty() {
                state
                    .connections
                    .insert(connection.id().to_string(), Arc::clone(connection));
            }
            resend
        };
        if resend.is_empty() {
            return;
        }

        debug!(query = %self.id(), relay = %connection.address(), traces = resend.len(), "re-sending after reconnect");
        self.publish_progress();
        for mut trace in resend {
            match connection.request(&trace.id, &trace.filters).await {
                Ok(()) => self.report(&trace, TraceState::Sent),
                Err(error) => {
                    warn!(query = %self.id(), relay = %trace.relay, %error, "re-send failed");
                    self.update_trace(&trace.id, |t| t.lost = true);
                    trace.lost = true;
                    self.report(&trace, TraceState::Lost);
                }
            }
        }
        self.publish_progress();
    }

    /// Stop accepting events. The query lingers for the grace period so a
    /// new request with the same id can revive it.
    pub fn cancel(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.cancel_at.is_some() {
                return;
            }
            state.cancel_at = Some(self.inner.clock.now_ms() + grace_ms(self.inner.cancel_grace));
        }
        debug!(query = %self.id(), "query cancelled");
        self.publish_progress();
    }

    pub fn uncancel(&self) {
        lock(&self.inner.state).cancel_at = None;
        self.publish_progress();
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.inner.state).cancel_at.is_some()
    }

    /// Cancelled past its grace period, or done (and not left open) for at
    /// least that long.
    pub fn can_remove(&self) -> bool {
        let now = self.inner.clock.now_ms();
        let state = lock(&self.inner.state);
        match state.cancel_at {
            Some(at) => now >= at,
            None => {
                !state.leave_open
                    && state
                        .done_at
                        .is_some_and(|at| now >= at + grace_ms(self.inner.cancel_grace))
            }
        }
    }

    /// Send CLOSE for every subscription still open.
    pub async fn send_close(&self) {
        let open: Vec<(String, Option<Arc<RelayConnection>>)> = {
            let mut state = lock(&self.inner.state);
            let ids: Vec<(String, String)> = state
                .traces
                .iter_mut()
                .filter(|t| !t.closed)
                .map(|t| {
                    t.closed = true;
                    (t.id.clone(), t.connection_id.clone())
                })
                .collect();
            ids.into_iter()
                .map(|(id, connection_id)| (id, state.connections.get(&connection_id).cloned()))
                .collect()
        };
        for (id, connection) in open {
            if let Some(connection) = connection
                && let Err(error) = connection.close_request(&id).await
            {
                debug!(query = %self.id(), relay = %connection.address(), %error, "CLOSE failed");
            }
        }
        self.publish_progress();
    }

    /// Built requests have been handed to relays (possibly none).
    pub fn mark_dispatched(&self) {
        lock(&self.inner.state).dispatched = true;
        self.publish_progress();
    }

    pub fn progress_state(&self) -> QueryProgress {
        lock(&self.inner.state).progress()
    }

    pub fn progress(&self) -> f64 {
        self.progress_state().ratio()
    }

    pub fn status(&self) -> QueryStatus {
        self.progress_state().status
    }

    /// Deduplicated feed in arrival order.
    pub fn snapshot(&self) -> Vec<TaggedEvent> {
        let state = lock(&self.inner.state);
        state
            .order
            .iter()
            .filter_map(|id| state.events.get(id).cloned())
            .collect()
    }

    pub fn event_count(&self) -> usize {
        lock(&self.inner.state).order.len()
    }

    /// Batches of events new to this query.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Vec<TaggedEvent>> {
        self.inner.batches.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<QueryProgress> {
        self.inner.progress.subscribe()
    }

    /// Resolves once the query is done or cancelled.
    pub async fn wait_done(&self) -> QueryProgress {
        let mut progress = self.watch();
        match progress
            .wait_for(|p| matches!(p.status, QueryStatus::Done | QueryStatus::Cancelled))
            .await
        {
            Ok(reached) => *reached,
            Err(_) => self.progress_state(),
        }
    }

    fn update_trace(&self, trace_id: &str, apply: impl FnOnce(&mut QueryTrace)) {
        let mut state = lock(&self.inner.state);
        if let Some(trace) = state.traces.iter_mut().find(|t| t.id == trace_id) {
            apply(trace);
        }
    }

    fn emit_batch(&self, fresh: Vec<TaggedEvent>) -> bool {
        if fresh.is_empty() {
            return false;
        }
        // Nobody listening is fine; the feed keeps everything.
        let _ = self.inner.batches.send(fresh);
        true
    }

    fn report(&self, trace: &QueryTrace, state: TraceState) {
        let callback = lock(&self.inner.on_trace).clone();
        if let Some(callback) = callback {
            callback(TraceReport {
                query_id: self.inner.id.clone(),
                trace_id: trace.id.clone(),
                relay: trace.relay.clone(),
                state,
                elapsed_ms: self.inner.clock.now_ms().saturating_sub(trace.sent_at),
            });
        }
    }

    fn publish_progress(&self) {
        let next = {
            let mut state = lock(&self.inner.state);
            let next = state.progress();
            if next.status == QueryStatus::Done {
                if state.done_at.is_none() {
                    state.done_at = Some(self.inner.clock.now_ms());
                }
            } else {
                state.done_at = None;
            }
            next
        };
        self.inner.progress.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

fn grace_ms(grace: Duration) -> u64 {
    u64::try_from(grace.as_millis()).unwrap_or(u64::MAX)
}
