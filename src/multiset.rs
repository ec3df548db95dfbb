//! The multiset contract shared by every concurrency strategy in this crate,
//! and the builder used to construct any of them.

use std::fmt;
use std::hash::Hash;

use crate::coarse::CoarseGrainedMultiset;
use crate::error::MultisetError;
use crate::finegrained::FineGrainedMultiset;
#[cfg(feature = "ebr")]
use crate::lazy::LazyMultiset;
#[cfg(feature = "ebr")]
use crate::lockfree::LockFreeMultiset;

/// A concurrently accessible multiset: a set that permits repeated elements,
/// tracking each with an occurrence count.
///
/// Every method takes `&self`, an instance is shared between threads by
/// reference (or `Arc`). The trait is object safe so the backing strategy can
/// be chosen at runtime, see [`MultisetBuilder::build`].
pub trait Multiset<T> {
    /// Add `occurrences` occurrences of `element`, returning how many were
    /// present before this call (zero if the element was absent).
    ///
    /// Fails with [`MultisetError::InvalidArgument`] if `occurrences` is zero,
    /// and with [`MultisetError::CapacityExceeded`] if the multiset would grow
    /// beyond its capacity. In both cases the multiset is left unmodified.
    fn add(&self, element: T, occurrences: usize) -> Result<usize, MultisetError>;

    /// Remove up to `occurrences` occurrences of `element`, returning how many
    /// were present before this call. If `occurrences` reaches the current
    /// count, the element is removed entirely. Removing an absent element is
    /// not an error, it returns zero.
    ///
    /// Fails with [`MultisetError::InvalidArgument`] if `occurrences` is zero.
    fn remove(&self, element: &T, occurrences: usize) -> Result<usize, MultisetError>;

    /// The number of occurrences of `element`, zero if it is absent.
    fn count(&self, element: &T) -> usize;

    /// For every distinct element appearing `n` times in `collection`, remove
    /// `n` occurrences of it, clamped at the number currently present. Returns
    /// `true` if at least one occurrence was removed.
    fn remove_all(&self, collection: &[T]) -> bool;

    /// The total number of occurrences held, counting repetitions.
    fn size(&self) -> usize;

    /// The configured capacity, `None` if unbounded.
    fn capacity(&self) -> Option<usize>;

    /// Add a single occurrence of `element`.
    fn add_one(&self, element: T) -> Result<(), MultisetError> {
        self.add(element, 1).map(|_| ())
    }

    /// Remove a single occurrence of `element`, returning `true` if one was
    /// present.
    fn remove_one(&self, element: &T) -> Result<bool, MultisetError> {
        self.remove(element, 1).map(|prev| prev > 0)
    }

    /// `true` if at least one occurrence of `element` is present.
    fn contains(&self, element: &T) -> bool {
        self.count(element) > 0
    }

    /// `true` if the multiset holds no occurrences at all.
    fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

#[inline]
pub(crate) fn check_occurrences(occurrences: usize) -> Result<(), MultisetError> {
    if occurrences == 0 {
        Err(MultisetError::InvalidArgument(
            "occurrences must be a positive number",
        ))
    } else {
        Ok(())
    }
}

/// Writes the live entries of a chain as `[(e: n); (e: n)]`, one entry at a
/// time, so it can be fed from inside a locked or pinned walk.
pub(crate) struct EntryList<'a, 'b> {
    f: &'a mut fmt::Formatter<'b>,
    first: bool,
}

impl<'a, 'b> EntryList<'a, 'b> {
    pub(crate) fn new(f: &'a mut fmt::Formatter<'b>) -> Result<Self, fmt::Error> {
        f.write_str("[")?;
        Ok(EntryList { f, first: true })
    }

    pub(crate) fn entry<T: fmt::Display>(&mut self, element: &T, count: usize) -> fmt::Result {
        if !self.first {
            self.f.write_str("; ")?;
        }
        self.first = false;
        write!(self.f, "({}: {})", element, count)
    }

    pub(crate) fn finish(self) -> fmt::Result {
        self.f.write_str("]")
    }
}

/// The concurrency strategy backing a multiset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// A single lock around the whole chain.
    CoarseGrained,
    /// Hand-over-hand locking of adjacent nodes.
    FineGrained,
    /// Unsynchronised traversal, locking and validation at the mutation site.
    #[cfg(feature = "ebr")]
    Lazy,
    /// Compare-and-swap on markable successor pointers.
    #[cfg(feature = "ebr")]
    LockFree,
}

impl Strategy {
    /// Every strategy available in this build, from the simplest to the most
    /// concurrent.
    #[cfg(feature = "ebr")]
    pub const ALL: &'static [Strategy] = &[
        Strategy::CoarseGrained,
        Strategy::FineGrained,
        Strategy::Lazy,
        Strategy::LockFree,
    ];

    /// Every strategy available in this build, from the simplest to the most
    /// concurrent.
    #[cfg(not(feature = "ebr"))]
    pub const ALL: &'static [Strategy] = &[Strategy::CoarseGrained, Strategy::FineGrained];
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::CoarseGrained => "COARSE-G",
            Strategy::FineGrained => "FINE-G",
            #[cfg(feature = "ebr")]
            Strategy::Lazy => "LAZY",
            #[cfg(feature = "ebr")]
            Strategy::LockFree => "LOCKFREE",
        })
    }
}

/// A builder for multisets, allowing the capacity to be configured before the
/// strategy is chosen.
///
/// ```
/// use conmultiset::{Multiset, MultisetBuilder, Strategy};
///
/// let ms = MultisetBuilder::new()
///     .set_capacity(4)
///     .build::<u32>(Strategy::FineGrained);
///
/// assert_eq!(ms.add(7, 3), Ok(0));
/// assert!(ms.add(7, 2).is_err());
/// assert_eq!(ms.count(&7), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MultisetBuilder {
    capacity: Option<usize>,
}

impl MultisetBuilder {
    /// Create a new builder for an unbounded multiset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the multiset's `size()` to `capacity` occurrences. A capacity of
    /// zero means unbounded.
    #[must_use]
    pub fn set_capacity(self, capacity: usize) -> Self {
        MultisetBuilder {
            capacity: Some(capacity),
        }
    }

    fn capacity(&self) -> usize {
        self.capacity.unwrap_or(0)
    }

    /// Consume this builder, returning a coarse-grained multiset.
    pub fn build_coarse<T>(self) -> CoarseGrainedMultiset<T>
    where
        T: Hash + Eq + Clone,
    {
        CoarseGrainedMultiset::with_capacity(self.capacity())
    }

    /// Consume this builder, returning a fine-grained multiset.
    pub fn build_fine_grained<T>(self) -> FineGrainedMultiset<T>
    where
        T: Hash + Eq + Clone,
    {
        FineGrainedMultiset::with_capacity(self.capacity())
    }

    /// Consume this builder, returning a lazy multiset.
    #[cfg(feature = "ebr")]
    pub fn build_lazy<T>(self) -> LazyMultiset<T>
    where
        T: Hash + Eq + Clone,
    {
        LazyMultiset::with_capacity(self.capacity())
    }

    /// Consume this builder, returning a lock-free multiset.
    #[cfg(feature = "ebr")]
    pub fn build_lock_free<T>(self) -> LockFreeMultiset<T>
    where
        T: Hash + Eq + Clone,
    {
        LockFreeMultiset::with_capacity(self.capacity())
    }

    /// Consume this builder, returning a multiset backed by `strategy` behind
    /// the common [`Multiset`] interface.
    pub fn build<T>(self, strategy: Strategy) -> Box<dyn Multiset<T> + Send + Sync>
    where
        T: Hash + Eq + Clone + Send + Sync + 'static,
    {
        match strategy {
            Strategy::CoarseGrained => Box::new(self.build_coarse::<T>()),
            Strategy::FineGrained => Box::new(self.build_fine_grained::<T>()),
            #[cfg(feature = "ebr")]
            Strategy::Lazy => Box::new(self.build_lazy::<T>()),
            #[cfg(feature = "ebr")]
            Strategy::LockFree => Box::new(self.build_lock_free::<T>()),
        }
    }
}
