//! Request builder: filter fragments in, per-relay REQ payloads out.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use nostr::{Filter, FlatFilter, Optimizer, TagKey, TaggedEvent, normalize_relay_url};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::router::RequestRouter;

const SLOW_DIFF: Duration = Duration::from_millis(100);

/// Per-request knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    /// Keep subscriptions open after EOSE.
    pub leave_open: bool,
    /// Re-send full filters instead of diffing against the previous request.
    pub skip_diff: bool,
    /// Relays per author when the outbox router splits filters.
    pub outbox_pick_n: Option<usize>,
    /// Upper bound on `fetch`.
    pub timeout: Option<Duration>,
    /// Hold back the first dispatch so more requests can join it.
    pub grouping_delay: Option<Duration>,
    /// Write received events to the cache relay.
    pub fill_store: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            leave_open: false,
            skip_diff: false,
            outbox_pick_n: None,
            timeout: None,
            grouping_delay: None,
            fill_store: true,
        }
    }
}

/// One REQ payload bound to a relay. `relay: None` means every read relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltRequest {
    pub relay: Option<String>,
    pub filters: Vec<Filter>,
    /// Locally cached result set to reconcile against before sending.
    pub sync_from: Option<Vec<TaggedEvent>>,
}

impl BuiltRequest {
    pub fn new(relay: Option<String>, filters: Vec<Filter>) -> Self {
        Self {
            relay,
            filters,
            sync_from: None,
        }
    }
}

/// One filter fragment of a [`RequestBuilder`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilterBuilder {
    filter: Filter,
}

impl RequestFilterBuilder {
    /// Relay hints. Invalid addresses are dropped.
    pub fn relay<I, S>(&mut self, urls: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut relays = self.filter.relays.take().unwrap_or_default();
        relays.extend(
            urls.into_iter()
                .filter_map(|url| normalize_relay_url(url.as_ref())),
        );
        self.filter.relays = (!relays.is_empty()).then_some(relays);
        self
    }

    pub fn ids<I, S>(&mut self, ids: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter
            .ids
            .get_or_insert_with(BTreeSet::new)
            .extend(ids.into_iter().map(Into::into));
        self
    }

    /// Only 64-char hex keys are kept. A fragment whose authors were all
    /// rejected matches nothing and is trimmed before dispatch.
    pub fn authors<I, S>(&mut self, authors: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = self.filter.authors.get_or_insert_with(BTreeSet::new);
        for author in authors.into_iter().map(Into::into) {
            if is_hex_key(&author) {
                set.insert(author);
            } else {
                debug!(author = %author, "dropping invalid author key");
            }
        }
        self
    }

    pub fn kinds(&mut self, kinds: impl IntoIterator<Item = u16>) -> &mut Self {
        self.filter
            .kinds
            .get_or_insert_with(BTreeSet::new)
            .extend(kinds);
        self
    }

    pub fn since(&mut self, since: u64) -> &mut Self {
        self.filter.since = Some(since);
        self
    }

    pub fn until(&mut self, until: u64) -> &mut Self {
        self.filter.until = Some(until);
        self
    }

    pub fn limit(&mut self, limit: usize) -> &mut Self {
        self.filter.limit = Some(limit);
        self
    }

    pub fn search(&mut self, search: impl Into<String>) -> &mut Self {
        self.filter.search = Some(search.into());
        self
    }

    pub fn tag<I, S>(&mut self, key: TagKey, values: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter
            .tags
            .entry(key)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn result_set(&mut self, id: impl Into<String>) -> &mut Self {
        self.filter.result_set_id = Some(id.into());
        self
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }
}

fn is_hex_key(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Builds the REQ payloads for one query id.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    id: String,
    instance: String,
    builders: Vec<RequestFilterBuilder>,
    options: RequestOptions,
    raw: Option<Vec<Filter>>,
}

impl RequestBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instance: Uuid::new_v4().to_string(),
            builders: Vec::new(),
            options: RequestOptions::default(),
            raw: None,
        }
    }

    /// Query id shared by every builder that should feed the same query.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Unique per builder instance.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut RequestOptions {
        &mut self.options
    }

    pub fn with_options(&mut self, options: RequestOptions) -> &mut Self {
        self.options = options;
        self
    }

    /// Start a new filter fragment.
    pub fn with_filter(&mut self) -> &mut RequestFilterBuilder {
        self.raw = None;
        let index = self.builders.len();
        self.builders.push(RequestFilterBuilder::default());
        &mut self.builders[index]
    }

    pub fn with_bare_filter(&mut self, filter: Filter) -> &mut Self {
        self.raw = None;
        self.builders.push(RequestFilterBuilder { filter });
        self
    }

    /// Append every fragment of `other`.
    pub fn add(&mut self, other: &RequestBuilder) -> &mut Self {
        self.raw = None;
        self.builders.extend(other.builders.iter().cloned());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    /// Compressed fragments. Cached until another fragment is added.
    pub fn build_raw(&mut self, optimizer: &dyn Optimizer) -> Vec<Filter> {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        let raw = optimizer.compress(
            self.builders
                .iter()
                .map(|builder| builder.filter.clone())
                .collect(),
        );
        self.raw = Some(raw.clone());
        raw
    }

    /// Raw filters after the router has attached relay hints.
    pub fn build_raw_routed(
        &mut self,
        optimizer: &dyn Optimizer,
        router: Option<&dyn RequestRouter>,
    ) -> Vec<Filter> {
        let raw = self.build_raw(optimizer);
        match router {
            Some(router) => router.for_all_request(raw, self.options.outbox_pick_n),
            None => raw,
        }
    }

    /// Full request, one entry per relay hint.
    pub fn build(
        &mut self,
        optimizer: &dyn Optimizer,
        router: Option<&dyn RequestRouter>,
    ) -> Vec<BuiltRequest> {
        let rows = self
            .build_raw_routed(optimizer, router)
            .iter()
            .flat_map(|filter| optimizer.expand_filter(filter))
            .collect();
        group_by_relay(optimizer, rows)
    }

    /// Only what `prev` does not already cover. Empty when nothing changed.
    pub fn build_diff(
        &mut self,
        optimizer: &dyn Optimizer,
        router: Option<&dyn RequestRouter>,
        prev: &[Filter],
    ) -> Vec<BuiltRequest> {
        let started = Instant::now();
        let next = self.build_raw_routed(optimizer, router);
        let rows = optimizer.get_diff(prev, &next);
        let elapsed = started.elapsed();
        if elapsed >= SLOW_DIFF {
            warn!(
                query = %self.id,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow filter diff, consider skip_diff for this request"
            );
        }
        if rows.is_empty() {
            debug!(query = %self.id, "request unchanged, nothing to send");
            return Vec::new();
        }
        group_by_relay(optimizer, rows)
    }
}

fn group_by_relay(optimizer: &dyn Optimizer, rows: Vec<FlatFilter>) -> Vec<BuiltRequest> {
    let mut groups: BTreeMap<Option<String>, Vec<FlatFilter>> = BTreeMap::new();
    for mut row in rows {
        let relay = row.relay.take();
        if row.keys > 0 && relay.is_some() {
            row.keys -= 1;
        }
        groups.entry(relay).or_default().push(row);
    }
    groups
        .into_iter()
        .map(|(relay, rows)| BuiltRequest::new(relay, optimizer.flat_merge(rows)))
        .collect()
}
