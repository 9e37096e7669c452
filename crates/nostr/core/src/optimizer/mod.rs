//! Filter algebra.
//!
//! Internal module boundaries:
//! - `expand`: cartesian expansion of a filter into flat rows
//! - `merge`: merge distance, greedy merging and containment
//! - `diff`: flat-row set subtraction between two filter sets
//!
//! Everything here is pure. The [`Optimizer`] trait lets the client swap the
//! implementation, [`DefaultOptimizer`] forwards to the free functions.

mod diff;
mod expand;
mod merge;


pub use diff::get_diff;
pub use expand::expand_filter;
pub use merge::{
    Mergeable, can_merge, compress, distance, filter_includes, flat_merge, merge_similar,
};

use crate::filter::{Filter, FlatFilter};
use crate::nip01::{Event, verify_event};

pub trait Optimizer: Send + Sync {
    fn expand_filter(&self, filter: &Filter) -> Vec<FlatFilter>;

    fn get_diff(&self, prev: &[Filter], next: &[Filter]) -> Vec<FlatFilter>;

    fn flat_merge(&self, rows: Vec<FlatFilter>) -> Vec<Filter>;

    fn compress(&self, filters: Vec<Filter>) -> Vec<Filter>;

    fn schnorr_verify(&self, event: &Event) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOptimizer;

impl Optimizer for DefaultOptimizer {
    fn expand_filter(&self, filter: &Filter) -> Vec<FlatFilter> {
        expand_filter(filter)
    }

    fn get_diff(&self, prev: &[Filter], next: &[Filter]) -> Vec<FlatFilter> {
        get_diff(prev, next)
    }

    fn flat_merge(&self, rows: Vec<FlatFilter>) -> Vec<Filter> {
        flat_merge(rows)
    }

    fn compress(&self, filters: Vec<Filter>) -> Vec<Filter> {
        compress(filters)
    }

    fn schnorr_verify(&self, event: &Event) -> bool {
        verify_event(event).is_ok()
    }
}
