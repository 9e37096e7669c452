use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::filter::{Filter, FlatFilter, TagKey};

/// Cost of a position present on only one side, or of unequal scalars.
const UNMERGEABLE: u32 = 10;

/// Types the greedy merger can compare.
pub trait Mergeable {
    /// Sum of per-position differences. Each set field counts as one position.
    fn distance_to(&self, other: &Self) -> u32;

    fn result_set_id(&self) -> Option<&str>;
}

fn set_position<T: PartialEq>(a: Option<&T>, b: Option<&T>) -> u32 {
    match (a, b) {
        (None, None) => 0,
        (Some(a), Some(b)) if a == b => 0,
        (Some(_), Some(_)) => 1,
        _ => UNMERGEABLE,
    }
}

fn scalar_position<T: PartialEq>(a: Option<&T>, b: Option<&T>) -> u32 {
    if a == b { 0 } else { UNMERGEABLE }
}

fn presence_position<T>(a: Option<&T>, b: Option<&T>) -> u32 {
    if a.is_some() == b.is_some() {
        0
    } else {
        UNMERGEABLE
    }
}

fn tag_positions<V: PartialEq>(a: &BTreeMap<TagKey, V>, b: &BTreeMap<TagKey, V>) -> u32 {
    let shared: u32 = a.iter().map(|(k, v)| set_position(Some(v), b.get(k))).sum();
    let only_b = b.keys().filter(|k| !a.contains_key(*k)).count() as u32;
    shared + only_b * UNMERGEABLE
}

impl Mergeable for Filter {
    fn distance_to(&self, other: &Self) -> u32 {
        set_position(self.ids.as_ref(), other.ids.as_ref())
            + set_position(self.authors.as_ref(), other.authors.as_ref())
            + set_position(self.kinds.as_ref(), other.kinds.as_ref())
            + tag_positions(&self.tags, &other.tags)
            + set_position(self.relays.as_ref(), other.relays.as_ref())
            + scalar_position(self.since.as_ref(), other.since.as_ref())
            + scalar_position(self.until.as_ref(), other.until.as_ref())
            + scalar_position(self.search.as_ref(), other.search.as_ref())
            + presence_position(self.limit.as_ref(), other.limit.as_ref())
    }

    fn result_set_id(&self) -> Option<&str> {
        self.result_set_id.as_deref()
    }
}

impl Mergeable for FlatFilter {
    fn distance_to(&self, other: &Self) -> u32 {
        set_position(self.ids.as_ref(), other.ids.as_ref())
            + set_position(self.authors.as_ref(), other.authors.as_ref())
            + set_position(self.kinds.as_ref(), other.kinds.as_ref())
            + tag_positions(&self.tags, &other.tags)
            + scalar_position(self.relay.as_ref(), other.relay.as_ref())
            + scalar_position(self.since.as_ref(), other.since.as_ref())
            + scalar_position(self.until.as_ref(), other.until.as_ref())
            + scalar_position(self.search.as_ref(), other.search.as_ref())
            + presence_position(self.limit.as_ref(), other.limit.as_ref())
    }

    fn result_set_id(&self) -> Option<&str> {
        self.result_set_id.as_deref()
    }
}

pub fn distance<T: Mergeable>(a: &T, b: &T) -> u32 {
    a.distance_to(b)
}

/// Same result set and at most one differing position.
pub fn can_merge<T: Mergeable>(a: &T, b: &T) -> bool {
    a.result_set_id() == b.result_set_id() && distance(a, b) <= 1
}

/// Partition `items` greedily; an item joins a set only if it can merge with every member.
fn merge_sets<T: Mergeable>(items: Vec<T>) -> Vec<Vec<T>> {
    let mut pending: VecDeque<T> = items.into();
    let mut sets = Vec::new();
    while let Some(current) = pending.pop_front() {
        let mut set = vec![current];
        let mut rest = VecDeque::with_capacity(pending.len());
        for item in pending.drain(..) {
            if set.iter().all(|member| can_merge(member, &item)) {
                set.push(item);
            } else {
                rest.push_back(item);
            }
        }
        pending = rest;
        sets.push(set);
    }
    sets
}

fn union_into<T: Ord + Clone>(target: &mut Option<BTreeSet<T>>, source: Option<&BTreeSet<T>>) {
    if let Some(source) = source {
        target
            .get_or_insert_with(BTreeSet::new)
            .extend(source.iter().cloned());
    }
}

fn union_filters(set: Vec<Filter>) -> Filter {
    let mut iter = set.into_iter();
    let mut merged = iter.next().unwrap_or_default();
    for filter in iter {
        union_into(&mut merged.ids, filter.ids.as_ref());
        union_into(&mut merged.authors, filter.authors.as_ref());
        union_into(&mut merged.kinds, filter.kinds.as_ref());
        union_into(&mut merged.relays, filter.relays.as_ref());
        for (key, values) in filter.tags {
            merged.tags.entry(key).or_default().extend(values);
        }
        merged.limit = merged.limit.max(filter.limit);
    }
    merged
}

fn collapse_rows(set: Vec<FlatFilter>) -> Filter {
    let mut merged = Filter::default();
    for row in set {
        if let Some(id) = row.ids {
            merged.ids.get_or_insert_with(BTreeSet::new).insert(id);
        }
        if let Some(author) = row.authors {
            merged.authors.get_or_insert_with(BTreeSet::new).insert(author);
        }
        if let Some(kind) = row.kinds {
            merged.kinds.get_or_insert_with(BTreeSet::new).insert(kind);
        }
        for (key, value) in row.tags {
            merged.tags.entry(key).or_default().insert(value);
        }
        if let Some(relay) = row.relay {
            merged.relays.get_or_insert_with(BTreeSet::new).insert(relay);
        }
        merged.since = row.since;
        merged.until = row.until;
        merged.search = row.search;
        merged.limit = merged.limit.max(row.limit);
        merged.result_set_id = row.result_set_id;
    }
    merged
}

/// One greedy merge pass over filters.
pub fn merge_similar(filters: Vec<Filter>) -> Vec<Filter> {
    merge_sets(filters).into_iter().map(union_filters).collect()
}

/// Merge passes until a pass no longer reduces the count.
pub fn compress(filters: Vec<Filter>) -> Vec<Filter> {
    let mut current = merge_similar(filters);
    loop {
        let before = current.len();
        current = merge_similar(current);
        if current.len() == before {
            return current;
        }
    }
}

/// Collapse flat rows into compact filters. The output carries no `result_set_id`.
pub fn flat_merge(rows: Vec<FlatFilter>) -> Vec<Filter> {
    let collapsed = merge_sets(rows).into_iter().map(collapse_rows).collect();
    compress(collapsed)
        .into_iter()
        .map(|mut f| {
            f.result_set_id = None;
            f
        })
        .collect()
}

fn set_includes<T: Ord>(bigger: Option<&BTreeSet<T>>, smaller: Option<&BTreeSet<T>>) -> bool {
    match (bigger, smaller) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(b), Some(s)) => s.is_subset(b),
    }
}

/// True when every event matched by `smaller` is also matched by `bigger`.
///
/// `limit` and relay hints are not considered.
pub fn filter_includes(bigger: &Filter, smaller: &Filter) -> bool {
    let since_ok = match bigger.since {
        None => true,
        Some(b) => smaller.since.is_some_and(|s| s >= b),
    };
    let until_ok = match bigger.until {
        None => true,
        Some(b) => smaller.until.is_some_and(|s| s <= b),
    };
    let search_ok = bigger.search.is_none() || bigger.search == smaller.search;

    since_ok
        && until_ok
        && search_ok
        && set_includes(bigger.ids.as_ref(), smaller.ids.as_ref())
        && set_includes(bigger.authors.as_ref(), smaller.authors.as_ref())
        && set_includes(bigger.kinds.as_ref(), smaller.kinds.as_ref())
        && bigger
            .tags
            .iter()
            .all(|(key, values)| set_includes(Some(values), smaller.tags.get(key)))
}
