use std::collections::BTreeSet;

use crate::filter::{Filter, FlatFilter};

/// Expand a filter into one [`FlatFilter`] per combination of set values.
///
/// Scalars are copied onto every row. A filter without set fields yields one
/// row, a present but empty set field yields none.
pub fn expand_filter(filter: &Filter) -> Vec<FlatFilter> {
    let keys = usize::from(filter.ids.is_some())
        + usize::from(filter.authors.is_some())
        + usize::from(filter.kinds.is_some())
        + filter.tags.len()
        + usize::from(filter.relays.is_some());

    let mut rows = vec![FlatFilter {
        keys,
        since: filter.since,
        until: filter.until,
        limit: filter.limit,
        search: filter.search.clone(),
        result_set_id: filter.result_set_id.clone(),
        ..FlatFilter::default()
    }];

    if let Some(ids) = &filter.ids {
        rows = product(rows, ids, |row, id| row.ids = Some(id.clone()));
    }
    if let Some(authors) = &filter.authors {
        rows = product(rows, authors, |row, author| {
            row.authors = Some(author.clone())
        });
    }
    if let Some(kinds) = &filter.kinds {
        rows = product(rows, kinds, |row, kind| row.kinds = Some(*kind));
    }
    for (key, values) in &filter.tags {
        rows = product(rows, values, |row, value| {
            row.tags.insert(*key, value.clone());
        });
    }
    if let Some(relays) = &filter.relays {
        rows = product(rows, relays, |row, relay| row.relay = Some(relay.clone()));
    }
    rows
}

fn product<T>(
    rows: Vec<FlatFilter>,
    values: &BTreeSet<T>,
    mut apply: impl FnMut(&mut FlatFilter, &T),
) -> Vec<FlatFilter> {
    let mut out = Vec::with_capacity(rows.len() * values.len());
    for row in rows {
        for value in values {
            let mut next = row.clone();
            apply(&mut next, value);
            out.push(next);
        }
    }
    out
}
