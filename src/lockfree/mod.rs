//! LockFreeMultiset - compare-and-swap on markable successor links.
//!
//! The chain follows the Harris-Michael list: a node is logically deleted by
//! setting the `DELETED` tag on its own successor link, and physically
//! unlinked later by a CAS on its predecessor's link, done either by the
//! deleter or by any traversal that passes it. Unlinked nodes are retired to
//! the epoch collector.
//!
//! Counts live in the node and change by CAS as well. A count that reaches
//! zero is a claim: the claimer owns the deletion and is the only one to
//! release its occurrences. Anyone who finds a claimed node helps by tagging
//! it `DELETED`, so an `add` never revives a node that is on its way out.
//!
//! `remove_all` freezes the chain instead of locking it. It sets a `FROZEN`
//! tag on the head link, then on every link along the chain, and a frozen bit
//! on every count. A frozen link fails every CAS that expects it untagged and
//! a frozen count refuses every update, so once the walk reaches the end the
//! whole chain is immutable. The survivors are copied into a fresh chain,
//! which is published with a single store to the head, and the frozen nodes
//! are retired. Mutators that run into a frozen node back off and retry until
//! the new chain is in place.

use crossbeam_epoch as epoch;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::Backoff;
use std::fmt;
use std::hash::Hash;
use std::mem;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crate::admission::AdmissionGate;
use crate::error::MultisetError;
use crate::internals::size::SizeCounter;
use crate::internals::tally::Tally;
use crate::multiset::{check_occurrences, EntryList, Multiset};

// Link tags.
const DELETED: usize = 0b01;
const FROZEN: usize = 0b10;

// Count word.
const FROZEN_COUNT: usize = 1 << (usize::BITS - 1);
const COUNT_MASK: usize = !FROZEN_COUNT;

struct Entry<T> {
    element: T,
    count: AtomicUsize,
    next: Atomic<Entry<T>>,
}

impl<T> Entry<T> {
    fn new(element: T, count: usize) -> Self {
        Entry {
            element,
            count: AtomicUsize::new(count),
            next: Atomic::null(),
        }
    }
}

/// A lock-free concurrent multiset.
///
/// `add`, `remove` and `count` never block. `remove_all` goes through the
/// bulk side of the [`AdmissionGate`](crate::AdmissionGate), and while it runs
/// the other operations spin on the nodes it has frozen.
///
/// # Examples
/// ```
/// use conmultiset::{LockFreeMultiset, Multiset};
/// use std::sync::Arc;
///
/// let ms = Arc::new(LockFreeMultiset::new());
/// let handles: Vec<_> = (0..4)
///     .map(|_| {
///         let ms = ms.clone();
///         std::thread::spawn(move || ms.add(7u8, 2).unwrap())
///     })
///     .collect();
/// for h in handles {
///     h.join().unwrap();
/// }
/// assert_eq!(ms.count(&7), 8);
/// ```
pub struct LockFreeMultiset<T> {
    // The null pointer is the tail.
    head: Atomic<Entry<T>>,
    size: SizeCounter,
    gate: AdmissionGate,
}

impl<T> LockFreeMultiset<T>
where
    T: Hash + Eq + Clone,
{
    /// Create a new, unbounded multiset.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a new multiset holding at most `capacity` occurrences. A
    /// capacity of zero means unbounded.
    pub fn with_capacity(capacity: usize) -> Self {
        LockFreeMultiset {
            head: Atomic::null(),
            size: SizeCounter::new(capacity),
            gate: AdmissionGate::new(),
        }
    }

    /// Returns the link to the first live node holding `element`, and that
    /// node, or the last link and null if there is none. Deleted nodes are
    /// unlinked on the way unless their predecessor link is frozen.
    fn find<'g>(
        &'g self,
        element: &T,
        guard: &'g Guard,
    ) -> (&'g Atomic<Entry<T>>, Shared<'g, Entry<T>>) {
        'restart: loop {
            let mut prev = &self.head;
            let mut curr = prev.load(Acquire, guard);
            let mut frozen = curr.tag() & FROZEN != 0;
            curr = curr.with_tag(0);

            // SAFETY: we are pinned, and nodes are retired only once unlinked.
            while let Some(entry) = unsafe { curr.as_ref() } {
                let next = entry.next.load(Acquire, guard);

                if next.tag() & DELETED != 0 {
                    if !frozen {
                        if prev
                            .compare_exchange(curr, next.with_tag(0), Release, Relaxed, guard)
                            .is_err()
                        {
                            tracing::trace!("lock-free unlink lost a race, restarting find");
                            continue 'restart;
                        }
                        // SAFETY: we won the unlink.
                        unsafe { guard.defer_destroy(curr) };
                    }
                    curr = next.with_tag(0);
                    continue;
                }

                if entry.element == *element {
                    return (prev, curr);
                }

                prev = &entry.next;
                frozen = next.tag() & FROZEN != 0;
                curr = next.with_tag(0);
            }
            return (prev, curr);
        }
    }

    /// The most occurrences one element can hold: the configured capacity,
    /// clamped to what fits in a count word beside the frozen bit.
    fn node_limit(&self) -> usize {
        self.size
            .capacity()
            .map_or(COUNT_MASK, |capacity| capacity.min(COUNT_MASK))
    }

    fn for_each_live<F>(&self, mut visit: F) -> fmt::Result
    where
        F: FnMut(&T, usize) -> fmt::Result,
    {
        let guard = &epoch::pin();
        let mut curr = self.head.load(Acquire, guard).with_tag(0);
        // SAFETY: as in `find`.
        while let Some(entry) = unsafe { curr.as_ref() } {
            let next = entry.next.load(Acquire, guard);
            let count = entry.count.load(Acquire) & COUNT_MASK;
            if next.tag() & DELETED == 0 && count > 0 {
                visit(&entry.element, count)?;
            }
            curr = next.with_tag(0);
        }
        Ok(())
    }
}

impl<T> Default for LockFreeMultiset<T>
where
    T: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeMultiset<T> {
    fn drop(&mut self) {
        let mut o_curr = mem::take(&mut self.head);
        // SAFETY: with `&mut self` nobody else can hold a pointer into the
        // chain. Deleted nodes still linked here were never retired.
        while let Some(curr) = unsafe { o_curr.try_into_owned() }.map(Owned::into_box) {
            o_curr = curr.next;
        }
    }
}

impl<T> Multiset<T> for LockFreeMultiset<T>
where
    T: Hash + Eq + Clone,
{
    fn add(&self, element: T, occurrences: usize) -> Result<usize, MultisetError> {
        check_occurrences(occurrences)?;
        let _pass = self.gate.try_enter_mutator();
        self.size.reserve(occurrences)?;
        let guard = &epoch::pin();
        let backoff = Backoff::new();
        let mut node = Owned::new(Entry::new(element, occurrences));

        loop {
            let (prev, curr) = self.find(&node.element, guard);

            // SAFETY: as in `find`.
            let Some(entry) = (unsafe { curr.as_ref() }) else {
                match prev.compare_exchange(curr, node, Release, Relaxed, guard) {
                    Ok(_) => return Ok(0),
                    Err(e) => {
                        node = e.new;
                        backoff.spin();
                        continue;
                    }
                }
            };

            let bumped = entry.count.fetch_update(AcqRel, Acquire, |c| {
                if c == 0 || c & FROZEN_COUNT != 0 {
                    None
                } else {
                    c.checked_add(occurrences).filter(|n| n & FROZEN_COUNT == 0)
                }
            });
            match bumped {
                Ok(prev_count) => return Ok(prev_count),
                Err(0) => {
                    // Claimed by a remover. Help it along, then look again.
                    entry.next.fetch_or(DELETED, AcqRel, guard);
                }
                Err(c) if c & FROZEN_COUNT != 0 => {
                    tracing::trace!("lock-free add met a frozen node, retrying");
                    backoff.snooze();
                }
                Err(_) => {
                    // The node's count word is full. Only reachable with a
                    // capacity above the count range, or none at all.
                    self.size.release(occurrences);
                    return Err(MultisetError::CapacityExceeded {
                        requested: occurrences,
                        capacity: self.node_limit(),
                    });
                }
            }
        }
    }

    fn remove(&self, element: &T, occurrences: usize) -> Result<usize, MultisetError> {
        check_occurrences(occurrences)?;
        let _pass = self.gate.try_enter_mutator();
        let guard = &epoch::pin();
        let backoff = Backoff::new();

        loop {
            let (prev, curr) = self.find(element, guard);
            // SAFETY: as in `find`.
            let Some(entry) = (unsafe { curr.as_ref() }) else {
                return Ok(0);
            };

            let taken = entry.count.fetch_update(AcqRel, Acquire, |c| {
                if c == 0 || c & FROZEN_COUNT != 0 {
                    None
                } else {
                    Some(c.saturating_sub(occurrences))
                }
            });
            match taken {
                Ok(prev_count) if prev_count > occurrences => {
                    self.size.release(occurrences);
                    return Ok(prev_count);
                }
                Ok(prev_count) => {
                    // We claimed the node, delete it and try to unlink.
                    let next = entry.next.fetch_or(DELETED, AcqRel, guard);
                    if next.tag() & FROZEN == 0
                        && prev
                            .compare_exchange(curr, next.with_tag(0), Release, Relaxed, guard)
                            .is_ok()
                    {
                        // SAFETY: we won the unlink.
                        unsafe { guard.defer_destroy(curr) };
                    }
                    self.size.release(prev_count);
                    return Ok(prev_count);
                }
                // Claimed by someone else first.
                Err(0) => return Ok(0),
                Err(_) => {
                    tracing::trace!("lock-free remove met a frozen node, retrying");
                    backoff.snooze();
                }
            }
        }
    }

    fn count(&self, element: &T) -> usize {
        let guard = &epoch::pin();
        let (_, curr) = self.find(element, guard);
        // SAFETY: as in `find`.
        unsafe { curr.as_ref() }.map_or(0, |entry| entry.count.load(Acquire) & COUNT_MASK)
    }

    fn remove_all(&self, collection: &[T]) -> bool {
        let tally = Tally::new(collection);
        if tally.is_empty() {
            return false;
        }
        let _bulk = self.gate.enter_bulk();
        let guard = &epoch::pin();

        // Only a bulk pass holder freezes, so the head can't already be.
        let mut curr = self.head.fetch_or(FROZEN, AcqRel, guard).with_tag(0);
        if curr.is_null() {
            self.head.store(Shared::null(), Release);
            return false;
        }

        let mut frozen = Vec::new();
        let mut survivors = Vec::new();
        let mut removed = 0;

        // SAFETY: as in `find`. Every node here is reached through a frozen
        // link, which no CAS can move.
        while let Some(entry) = unsafe { curr.as_ref() } {
            let next = entry.next.fetch_or(FROZEN, AcqRel, guard);
            let count = entry.count.fetch_or(FROZEN_COUNT, AcqRel) & COUNT_MASK;
            // Zero is a claim, its remover accounts for it.
            if count > 0 {
                let (taken, kept) = tally.split(&entry.element, count);
                removed += taken;
                if kept > 0 {
                    survivors.push((entry.element.clone(), kept));
                }
            }
            frozen.push(curr);
            curr = next.with_tag(0);
        }

        let mut link = Shared::null();
        for (element, kept) in survivors.into_iter().rev() {
            let entry = Owned::new(Entry::new(element, kept));
            entry.next.store(link, Relaxed);
            link = entry.into_shared(guard);
        }
        // Publishing also thaws the head.
        self.head.store(link, Release);

        for ptr in frozen {
            // SAFETY: detached from the head, and only reachable through
            // frozen links so nobody else can have unlinked it.
            unsafe { guard.defer_destroy(ptr) };
        }
        self.size.release(removed);

        tracing::debug!(removed, "lock-free remove_all");
        removed > 0
    }

    fn size(&self) -> usize {
        self.size.get()
    }

    fn capacity(&self) -> Option<usize> {
        self.size.capacity()
    }
}

impl<T> fmt::Display for LockFreeMultiset<T>
where
    T: Hash + Eq + Clone + fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = EntryList::new(f)?;
        self.for_each_live(|e, n| list.entry(e, n))?;
        list.finish()
    }
}

impl<T> fmt::Debug for LockFreeMultiset<T>
where
    T: Hash + Eq + Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        self.for_each_live(|e, n| {
            map.entry(e, &n);
            Ok(())
        })?;
        map.finish()
    }
}
