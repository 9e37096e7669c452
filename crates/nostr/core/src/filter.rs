//! Sparse query descriptors and client-side matching.
//!
//! A [`Filter`] maps to the JSON object relays accept in `REQ` frames. Tag
//! constraints live in one uniform map keyed by [`TagKey`] so `#e`, `#p`, `#t`
//! and any other single-letter tag share the same code paths. The `relays`
//! hint and `result_set_id` are client-side bookkeeping and never serialize.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::de::{self, IgnoredAny, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::nip01::Event;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid tag key: {0:?}")]
    InvalidTagKey(String),
}

/// Single-letter tag name, `e` for `#e`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagKey(char);

impl TagKey {
    pub const A: TagKey = TagKey('a');
    pub const D: TagKey = TagKey('d');
    pub const E: TagKey = TagKey('e');
    pub const P: TagKey = TagKey('p');
    pub const R: TagKey = TagKey('r');
    pub const T: TagKey = TagKey('t');

    pub fn new(c: char) -> Result<Self, FilterError> {
        if c.is_ascii_alphabetic() {
            Ok(Self(c))
        } else {
            Err(FilterError::InvalidTagKey(c.to_string()))
        }
    }

    pub fn as_char(&self) -> char {
        self.0
    }

    /// Key used in the wire object, e.g. `#e`.
    pub fn wire_key(&self) -> String {
        format!("#{}", self.0)
    }
}

impl FromStr for TagKey {
    type Err = FilterError;

    /// Accepts both `e` and `#e`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix('#').unwrap_or(s);
        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::new(c),
            _ => Err(FilterError::InvalidTagKey(s.to_string())),
        }
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A sparse query descriptor.
///
/// A set field that is `Some` but empty matches nothing. Such filters are
/// removed by [`trim_filters`] before dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Filter {
    pub ids: Option<BTreeSet<String>>,
    pub authors: Option<BTreeSet<String>>,
    pub kinds: Option<BTreeSet<u16>>,
    pub tags: BTreeMap<TagKey, BTreeSet<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
    pub search: Option<String>,
    /// Relay hints. Never serialized.
    pub relays: Option<BTreeSet<String>>,
    /// Logical grouping key. Filters with different values never merge.
    pub result_set_id: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids
            .get_or_insert_with(BTreeSet::new)
            .extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors
            .get_or_insert_with(BTreeSet::new)
            .extend(authors.into_iter().map(Into::into));
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).extend(kinds);
        self
    }

    pub fn tag<I, S>(mut self, key: TagKey, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(key)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn relay(mut self, relay: impl Into<String>) -> Self {
        self.relays
            .get_or_insert_with(BTreeSet::new)
            .insert(relay.into());
        self
    }

    pub fn result_set(mut self, id: impl Into<String>) -> Self {
        self.result_set_id = Some(id.into());
        self
    }

    /// True when a set field is present but holds no values.
    pub fn has_empty_set(&self) -> bool {
        self.ids.as_ref().is_some_and(BTreeSet::is_empty)
            || self.authors.as_ref().is_some_and(BTreeSet::is_empty)
            || self.kinds.as_ref().is_some_and(BTreeSet::is_empty)
            || self.tags.values().any(BTreeSet::is_empty)
            || self.relays.as_ref().is_some_and(BTreeSet::is_empty)
    }

    /// Copy without the client-side bookkeeping fields.
    pub fn without_internal(&self) -> Filter {
        Filter {
            relays: None,
            result_set_id: None,
            ..self.clone()
        }
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ids) = &self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(authors) = &self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        for (key, values) in &self.tags {
            map.serialize_entry(&key.wire_key(), values)?;
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since)?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until)?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        }
        if let Some(search) = &self.search {
            map.serialize_entry("search", search)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FilterVisitor;

        impl<'de> Visitor<'de> for FilterVisitor {
            type Value = Filter;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a filter object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Filter, A::Error> {
                let mut filter = Filter::default();
                while let Some(key) = access.next_key::<String>()? {
                    match key.as_str() {
                        "ids" => filter.ids = Some(access.next_value()?),
                        "authors" => filter.authors = Some(access.next_value()?),
                        "kinds" => filter.kinds = Some(access.next_value()?),
                        "since" => filter.since = access.next_value()?,
                        "until" => filter.until = access.next_value()?,
                        "limit" => filter.limit = access.next_value()?,
                        "search" => filter.search = access.next_value()?,
                        k if k.starts_with('#') => {
                            let tag = k.parse::<TagKey>().map_err(de::Error::custom)?;
                            filter.tags.insert(tag, access.next_value()?);
                        }
                        _ => {
                            access.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                Ok(filter)
            }
        }

        deserializer.deserialize_map(FilterVisitor)
    }
}

/// Fully expanded form of a [`Filter`]: every set field holds at most one value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FlatFilter {
    /// Number of set-valued fields present in the source filter.
    pub keys: usize,
    pub ids: Option<String>,
    pub authors: Option<String>,
    pub kinds: Option<u16>,
    pub tags: BTreeMap<TagKey, String>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
    pub search: Option<String>,
    pub relay: Option<String>,
    pub result_set_id: Option<String>,
}

/// Client-side membership test. `search` and `limit` are left to the relay.
pub fn event_matches_filter(event: &Event, filter: &Filter) -> bool {
    if let Some(ids) = &filter.ids
        && !ids.contains(&event.id)
    {
        return false;
    }
    if let Some(authors) = &filter.authors
        && !authors.contains(&event.pubkey)
    {
        return false;
    }
    if let Some(kinds) = &filter.kinds
        && !kinds.contains(&event.kind)
    {
        return false;
    }
    if let Some(since) = filter.since
        && event.created_at < since
    {
        return false;
    }
    if let Some(until) = filter.until
        && event.created_at > until
    {
        return false;
    }

    filter.tags.iter().all(|(key, values)| {
        let name = key.as_char().to_string();
        event.tags.iter().any(|tag| {
            tag.first() == Some(&name) && tag.get(1).is_some_and(|v| values.contains(v))
        })
    })
}

/// Drop filters that cannot match anything.
pub fn trim_filters(filters: Vec<Filter>) -> Vec<Filter> {
    filters.into_iter().filter(|f| !f.has_empty_set()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: u16, created_at: u64, tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: "e1".to_string(),
            pubkey: "pk1".to_string(),
            created_at,
            kind,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(str::to_string).collect())
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn serializes_tags_with_hash_prefix_and_skips_internal_fields() -> Result<(), serde_json::Error> {
        let filter = Filter::new()
            .kinds([1, 7])
            .tag(TagKey::E, ["abc"])
            .since(10)
            .limit(5)
            .relay("wss://relay.example/")
            .result_set("rs");

        let value = serde_json::to_value(&filter)?;
        assert_eq!(
            value,
            json!({"kinds": [1, 7], "#e": ["abc"], "since": 10, "limit": 5})
        );
        Ok(())
    }

    #[test]
    fn deserializes_wire_object() -> Result<(), serde_json::Error> {
        let filter: Filter = serde_json::from_value(json!({
            "authors": ["a", "a", "b"],
            "#p": ["x"],
            "until": 99,
            "unknown": {"nested": true}
        }))?;

        assert_eq!(filter.authors.as_ref().map(BTreeSet::len), Some(2));
        assert_eq!(
            filter.tags.get(&TagKey::P),
            Some(&BTreeSet::from(["x".to_string()]))
        );
        assert_eq!(filter.until, Some(99));
        Ok(())
    }

    #[test]
    fn tag_key_parsing() {
        struct Case {
            input: &'static str,
            ok: bool,
        }
        let cases = [
            Case { input: "#e", ok: true },
            Case { input: "p", ok: true },
            Case { input: "#", ok: false },
            Case { input: "#ee", ok: false },
            Case { input: "#1", ok: false },
        ];
        for case in cases {
            assert_eq!(case.input.parse::<TagKey>().is_ok(), case.ok, "{}", case.input);
        }
    }

    #[test]
    fn matching_checks_every_constraint() {
        let ev = event(1, 100, vec![vec!["e", "root"], vec!["t", "nostr"]]);

        assert!(event_matches_filter(&ev, &Filter::new()));
        assert!(event_matches_filter(&ev, &Filter::new().kinds([1]).since(100).until(100)));
        assert!(event_matches_filter(&ev, &Filter::new().tag(TagKey::T, ["nostr", "rust"])));
        assert!(!event_matches_filter(&ev, &Filter::new().kinds([2])));
        assert!(!event_matches_filter(&ev, &Filter::new().since(101)));
        assert!(!event_matches_filter(&ev, &Filter::new().until(99)));
        assert!(!event_matches_filter(&ev, &Filter::new().tag(TagKey::P, ["root"])));
        assert!(!event_matches_filter(&ev, &Filter::new().authors(Vec::<String>::new())));
    }

    #[test]
    fn trim_drops_filters_with_empty_sets() {
        let filters = vec![
            Filter::new().kinds([1]),
            Filter::new().kinds([1]).authors(Vec::<String>::new()),
            Filter::new().tag(TagKey::E, Vec::<String>::new()),
        ];
        let trimmed = trim_filters(filters);
        assert_eq!(trimmed, vec![Filter::new().kinds([1])]);
    }
}
