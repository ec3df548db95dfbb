//! Conmultiset - Concurrent Multisets
//!
//! A multiset is a set that permits repeated elements: each distinct element is
//! stored once, with a count of its occurrences. This crate provides the same
//! [`Multiset`] contract over four synchronisation strategies for a sentinel
//! bounded linked list, from the simplest to the most concurrent:
//!
//! * [`CoarseGrainedMultiset`] - one lock around the whole chain.
//! * [`FineGrainedMultiset`] - a lock per node, taken hand over hand.
//! * [`LazyMultiset`] - lock-free reads, validated locking at the mutation site.
//! * [`LockFreeMultiset`] - compare-and-swap on markable successor links.
//!
//! All of them may be bounded to a maximum number of occurrences, and all of
//! them support `remove_all`, which removes a whole collection's worth of
//! occurrences as one atomic step. The three finer strategies coordinate
//! `remove_all` against single element mutators through an [`AdmissionGate`].
//!
//! Use [`MultisetBuilder`] to construct any of them, including choosing the
//! strategy at runtime behind a `Box<dyn Multiset<T>>`.
//!
//! # Features
//!
//! * `ebr` - the epoch reclaimed variants, lazy and lock-free
//! * `foldhash` - use foldhash to tally `remove_all` arguments
//! * `ahash` - use the cpu accelerated ahash crate instead
//!
//! By default `ebr` and `foldhash` are enabled.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![warn(missing_docs)]
#![allow(clippy::needless_lifetimes)]

pub mod admission;
pub mod error;
pub mod multiset;

// This is where the shared bookkeeping lives.
pub(crate) mod internals;

pub mod coarse;
pub mod finegrained;
#[cfg(feature = "ebr")]
pub mod lazy;
#[cfg(feature = "ebr")]
pub mod lockfree;

pub use admission::AdmissionGate;
pub use coarse::CoarseGrainedMultiset;
pub use error::MultisetError;
pub use finegrained::FineGrainedMultiset;
#[cfg(feature = "ebr")]
pub use lazy::LazyMultiset;
#[cfg(feature = "ebr")]
pub use lockfree::LockFreeMultiset;
pub use multiset::{Multiset, MultisetBuilder, Strategy};
