//! Multiplicity table for the argument of `remove_all`.

use std::collections::HashMap;
use std::hash::Hash;

#[cfg(feature = "ahash")]
use ahash::RandomState;

#[cfg(all(feature = "foldhash", not(feature = "ahash")))]
use foldhash::fast::RandomState;

#[cfg(all(not(feature = "ahash"), not(feature = "foldhash")))]
use std::collections::hash_map::RandomState;

/// How many times each distinct element appears in a collection.
///
/// The chain walks of `remove_all` look every node up here once, rather than
/// rescanning the collection per node.
pub(crate) struct Tally<'a, T> {
    freq: HashMap<&'a T, usize, RandomState>,
}

impl<'a, T> Tally<'a, T>
where
    T: Hash + Eq,
{
    pub(crate) fn new(collection: &'a [T]) -> Self {
        let mut freq = HashMap::with_capacity_and_hasher(collection.len(), RandomState::default());
        for e in collection {
            *freq.entry(e).or_insert(0) += 1;
        }
        Tally { freq }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.freq.is_empty()
    }

    pub(crate) fn frequency(&self, element: &T) -> usize {
        self.freq.get(element).copied().unwrap_or(0)
    }

    /// Apply the tally to a node holding `count` occurrences of `element`.
    /// Returns how many occurrences go and how many survive.
    pub(crate) fn split(&self, element: &T, count: usize) -> (usize, usize) {
        let taken = self.frequency(element).min(count);
        (taken, count - taken)
    }
}
