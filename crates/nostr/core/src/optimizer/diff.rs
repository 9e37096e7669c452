use std::collections::HashSet;

use super::expand::expand_filter;
use crate::filter::{Filter, FlatFilter};

/// Flat rows of `next` that do not appear in `prev`, in `next` order.
pub fn get_diff(prev: &[Filter], next: &[Filter]) -> Vec<FlatFilter> {
    let mut seen: HashSet<FlatFilter> = prev.iter().flat_map(expand_filter).collect();
    next.iter()
        .flat_map(expand_filter)
        .filter(|row| seen.insert(row.clone()))
        .collect()
}
