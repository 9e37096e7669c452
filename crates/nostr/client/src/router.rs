//! Outbox routing: send author queries to the relays those authors write to.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use nostr::{Filter, normalize_relay_url};
use tracing::debug;

use crate::cache::{CachedTable, RelayListEntry, UsersRelays};
use crate::relay::RelaySettings;

/// Relays picked per author when a request does not say otherwise.
pub const DEFAULT_PICK_N: usize = 2;

/// Attaches relay hints to filters.
pub trait RequestRouter: Send + Sync {
    fn for_request(&self, filter: Filter, pick_n: Option<usize>) -> Vec<Filter>;

    fn for_all_request(&self, filters: Vec<Filter>, pick_n: Option<usize>) -> Vec<Filter> {
        filters
            .into_iter()
            .flat_map(|filter| self.for_request(filter, pick_n))
            .collect()
    }
}

/// Splits author filters by the authors' write relays.
pub struct OutboxRouter {
    relays: Arc<dyn CachedTable<UsersRelays>>,
}

impl OutboxRouter {
    pub fn new(relays: Arc<dyn CachedTable<UsersRelays>>) -> Self {
        Self { relays }
    }
}

impl RequestRouter for OutboxRouter {
    fn for_request(&self, filter: Filter, pick_n: Option<usize>) -> Vec<Filter> {
        if filter.relays.is_some() {
            return vec![filter];
        }
        let Some(authors) = filter.authors.as_ref().filter(|authors| !authors.is_empty()) else {
            return vec![filter];
        };

        let pick_n = pick_n.unwrap_or(DEFAULT_PICK_N);
        let mut by_relay: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut unrouted = BTreeSet::new();
        for author in authors {
            let picked: Vec<String> = self
                .relays
                .get_from_cache(author)
                .map(|list| list.write_relays().take(pick_n).map(str::to_string).collect())
                .unwrap_or_default();
            if picked.is_empty() {
                unrouted.insert(author.clone());
                continue;
            }
            for relay in picked {
                by_relay.entry(relay).or_default().insert(author.clone());
            }
        }

        debug!(
            relays = by_relay.len(),
            unrouted = unrouted.len(),
            "routed author filter"
        );
        let mut out: Vec<Filter> = by_relay
            .into_iter()
            .map(|(relay, authors)| Filter {
                authors: Some(authors),
                relays: Some(BTreeSet::from([relay])),
                ..filter.clone()
            })
            .collect();
        if !unrouted.is_empty() {
            out.push(Filter {
                authors: Some(unrouted),
                ..filter
            });
        }
        out
    }
}

/// Parse the `r` tags of a relay list event.
///
/// A `read` or `write` marker limits the entry to that direction, no marker
/// means both. Invalid addresses are skipped.
pub fn parse_relay_tags(tags: &[Vec<String>]) -> Vec<RelayListEntry> {
    tags.iter()
        .filter(|tag| tag.first().map(String::as_str) == Some("r"))
        .filter_map(|tag| {
            let url = normalize_relay_url(tag.get(1)?)?;
            let settings = match tag.get(2).map(String::as_str) {
                Some("read") => RelaySettings {
                    read: true,
                    write: false,
                },
                Some("write") => RelaySettings {
                    read: false,
                    write: true,
                },
                _ => RelaySettings::READ_WRITE,
            };
            Some(RelayListEntry { url, settings })
        })
        .collect()
}
