use std::cmp::Ordering;

use super::error::{Nip77Error, Result};
use super::model::{Bound, EventId, FINGERPRINT_SIZE, Item, calculate_fingerprint};

/// Sorted in-memory item set used by both sides of a reconciliation.
///
/// Items are inserted unsorted, then [`seal`](Self::seal) sorts them. Lookups
/// are only valid on a sealed vector.
#[derive(Debug, Clone, Default)]
pub struct NegentropyStorageVector {
    items: Vec<Item>,
    sealed: bool,
}

impl NegentropyStorageVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            sealed: false,
        }
    }

    pub fn insert(&mut self, timestamp: u64, id: EventId) -> Result<()> {
        if self.sealed {
            return Err(Nip77Error::AlreadySealed);
        }
        self.items.push(Item::new(timestamp, id));
        Ok(())
    }

    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Err(Nip77Error::AlreadySealed);
        }
        self.items.sort_unstable();
        if self.items.windows(2).any(|w| w[0] == w[1]) {
            return Err(Nip77Error::DuplicateItem);
        }
        self.sealed = true;
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    fn check_sealed(&self) -> Result<()> {
        if self.sealed {
            Ok(())
        } else {
            Err(Nip77Error::NotSealed)
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Item> {
        self.items.get(index)
    }

    /// Items in `[begin, end)`. Out-of-range indices are clamped.
    pub fn slice(&self, begin: usize, end: usize) -> Result<&[Item]> {
        self.check_sealed()?;
        let end = end.min(self.items.len());
        Ok(self.items.get(begin.min(end)..end).unwrap_or_default())
    }

    /// First index in `[first, last)` whose item is not below `bound`, or `last`.
    pub fn find_lower_bound(&self, first: usize, last: usize, bound: &Bound) -> Result<usize> {
        let window = self.slice(first, last)?;
        let start = first.min(last.min(self.items.len()));
        Ok(start + window.partition_point(|item| item.cmp_bound(bound) == Ordering::Less))
    }

    pub fn fingerprint(&self, begin: usize, end: usize) -> Result<[u8; FINGERPRINT_SIZE]> {
        let ids = self.slice(begin, end)?.iter().map(|item| &item.id);
        Ok(calculate_fingerprint(ids))
    }
}
