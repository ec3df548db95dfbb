//! LazyMultiset - optimistic traversal, locking only at the mutation site.
//!
//! Traversals take no locks at all. A mutator walks to its window, locks the
//! predecessor and the current node, then validates that neither has been
//! removed and that they are still adjacent. If validation fails it starts
//! over from the head.
//!
//! Removal is two step: the node's count is zeroed and the node marked, then
//! it is unlinked. Both happen under the window's locks, and the node is
//! retired to the epoch collector rather than freed, so a reader that still
//! holds a pointer to it keeps reading valid memory. `count` never locks. It
//! reads the count of whatever node its traversal stops on, and a removed node
//! reads as zero.
//!
//! `remove_all` holds the head lock for its whole walk and marks every node it
//! passes. Marked nodes fail validation, so no mutator can change the part of
//! the chain behind it, and nobody can insert in front of it. It then builds a
//! fresh chain from the survivors, swings the head to it, and retires the old
//! nodes. A node marked this way keeps its count, so a reader still on the old
//! chain sees the state from just before the swing.

use crossbeam_epoch as epoch;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::Backoff;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::hash::Hash;
use std::mem;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};

use crate::admission::AdmissionGate;
use crate::error::MultisetError;
use crate::internals::size::SizeCounter;
use crate::internals::tally::Tally;
use crate::multiset::{check_occurrences, EntryList, Multiset};

struct Entry<T> {
    // None only for the two sentinels.
    element: Option<T>,
    count: AtomicUsize,
    marked: AtomicBool,
    lock: Mutex<()>,
    next: Atomic<Entry<T>>,
}

impl<T> Entry<T> {
    fn sentinel() -> Self {
        Entry {
            element: None,
            count: AtomicUsize::new(0),
            marked: AtomicBool::new(false),
            lock: Mutex::new(()),
            next: Atomic::null(),
        }
    }

    fn new(element: T, count: usize) -> Self {
        Entry {
            element: Some(element),
            count: AtomicUsize::new(count),
            ..Self::sentinel()
        }
    }

    #[inline]
    fn is_sentinel(&self) -> bool {
        self.element.is_none()
    }
}

struct Window<'g, T> {
    pred: &'g Entry<T>,
    curr: &'g Entry<T>,
    curr_ptr: Shared<'g, Entry<T>>,
}

impl<'g, T> Window<'g, T> {
    fn is_valid(&self, guard: &'g Guard) -> bool {
        !self.pred.marked.load(Acquire)
            && !self.curr.marked.load(Acquire)
            && self.pred.next.load(Acquire, guard) == self.curr_ptr
    }
}

/// A concurrent multiset with lock-free reads and optimistic, validated
/// locking for mutations.
///
/// # Examples
/// ```
/// use conmultiset::{LazyMultiset, Multiset};
///
/// let ms = LazyMultiset::new();
/// ms.add('a', 2).unwrap();
/// ms.add('b', 2).unwrap();
/// assert_eq!(ms.remove(&'a', 1), Ok(2));
/// assert_eq!(ms.to_string(), "[(a: 1); (b: 2)]");
/// ```
pub struct LazyMultiset<T> {
    head: Entry<T>,
    size: SizeCounter,
    gate: AdmissionGate,
}

impl<T> LazyMultiset<T>
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
        LazyMultiset {
            head: Entry {
                next: Atomic::new(Entry::sentinel()),
                ..Entry::sentinel()
            },
            size: SizeCounter::new(capacity),
            gate: AdmissionGate::new(),
        }
    }

    /// Walk to the first node holding `element`, or the tail. No locks are
    /// taken, the result may be stale by the time it is used.
    fn find<'g>(&'g self, element: &T, guard: &'g Guard) -> Window<'g, T> {
        let mut pred = &self.head;
        loop {
            let curr_ptr = pred.next.load(Acquire, guard);
            // SAFETY: only the tail has a null successor and we never step
            // past it. Unlinked nodes are retired, not freed, while pinned.
            let curr = unsafe { curr_ptr.deref() };
            if curr.is_sentinel() || curr.element.as_ref() == Some(element) {
                return Window {
                    pred,
                    curr,
                    curr_ptr,
                };
            }
            pred = curr;
        }
    }

    /// Find, lock and validate the window for `element`, retrying until it
    /// holds.
    fn lock_window<'g>(
        &'g self,
        element: &T,
        guard: &'g Guard,
    ) -> (Window<'g, T>, [MutexGuard<'g, ()>; 2]) {
        let backoff = Backoff::new();
        loop {
            let w = self.find(element, guard);
            let locks = [w.pred.lock.lock(), w.curr.lock.lock()];
            if w.is_valid(guard) {
                return (w, locks);
            }
            drop(locks);
            tracing::trace!("lazy window validation failed, retrying");
            backoff.spin();
        }
    }

    fn for_each_live<F>(&self, mut visit: F) -> fmt::Result
    where
        F: FnMut(&T, usize) -> fmt::Result,
    {
        let guard = &epoch::pin();
        let mut curr_ptr = self.head.next.load(Acquire, guard);
        // SAFETY: as in `find`.
        while let Some(curr) = unsafe { curr_ptr.as_ref() } {
            if let Some(element) = curr.element.as_ref() {
                // Removed nodes read as zero. Nodes marked by a running
                // `remove_all` still count, like they do for `count`.
                let count = curr.count.load(Acquire);
                if count > 0 {
                    visit(element, count)?;
                }
            }
            curr_ptr = curr.next.load(Acquire, guard);
        }
        Ok(())
    }
}

impl<T> Default for LazyMultiset<T>
where
    T: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LazyMultiset<T> {
    fn drop(&mut self) {
        let mut o_curr = mem::take(&mut self.head.next);
        // SAFETY: with `&mut self` nobody else can hold a pointer into the
        // chain. Retired nodes are no longer linked and belong to the
        // collector.
        while let Some(curr) = unsafe { o_curr.try_into_owned() }.map(Owned::into_box) {
            o_curr = curr.next;
        }
    }
}

impl<T> Multiset<T> for LazyMultiset<T>
where
    T: Hash + Eq + Clone,
{
    fn add(&self, element: T, occurrences: usize) -> Result<usize, MultisetError> {
        check_occurrences(occurrences)?;
        let _pass = self.gate.try_enter_mutator();
        let guard = &epoch::pin();
        let (w, _locks) = self.lock_window(&element, guard);
        self.size.reserve(occurrences)?;

        if !w.curr.is_sentinel() {
            return Ok(w.curr.count.fetch_add(occurrences, AcqRel));
        }

        let entry = Owned::new(Entry::new(element, occurrences));
        entry.next.store(w.curr_ptr, Relaxed);
        w.pred.next.store(entry, Release);
        Ok(0)
    }

    fn remove(&self, element: &T, occurrences: usize) -> Result<usize, MultisetError> {
        check_occurrences(occurrences)?;
        let _pass = self.gate.try_enter_mutator();
        let guard = &epoch::pin();
        let (w, locks) = self.lock_window(element, guard);

        if w.curr.is_sentinel() {
            return Ok(0);
        }

        let prev = w.curr.count.load(Acquire);
        if prev > occurrences {
            w.curr.count.fetch_sub(occurrences, AcqRel);
            drop(locks);
            self.size.release(occurrences);
        } else {
            w.curr.count.store(0, Release);
            w.curr.marked.store(true, Release);
            w.pred.next.store(w.curr.next.load(Acquire, guard), Release);
            drop(locks);
            // SAFETY: unlinked above with both ends locked and validated.
            unsafe { guard.defer_destroy(w.curr_ptr) };
            self.size.release(prev);
        }
        Ok(prev)
    }

    fn count(&self, element: &T) -> usize {
        let guard = &epoch::pin();
        let w = self.find(element, guard);
        if w.curr.is_sentinel() {
            0
        } else {
            w.curr.count.load(Acquire)
        }
    }

    fn remove_all(&self, collection: &[T]) -> bool {
        let tally = Tally::new(collection);
        if tally.is_empty() {
            return false;
        }
        let _bulk = self.gate.enter_bulk();
        let guard = &epoch::pin();
        let _head = self.head.lock.lock();

        let mut retired = Vec::new();
        let mut survivors = Vec::new();
        let mut removed = 0;

        let mut curr_ptr = self.head.next.load(Acquire, guard);
        let tail = loop {
            // SAFETY: as in `find`.
            let curr = unsafe { curr_ptr.deref() };
            let Some(element) = curr.element.as_ref() else {
                break curr_ptr;
            };
            let _lock = curr.lock.lock();
            let was_marked = curr.marked.swap(true, AcqRel);
            // A removed node is unlinked before its predecessor unlocks, and
            // every predecessor we passed is marked.
            debug_assert!(!was_marked);

            let (taken, kept) = tally.split(element, curr.count.load(Acquire));
            removed += taken;
            if kept > 0 {
                survivors.push((element.clone(), kept));
            }
            retired.push(curr_ptr);
            curr_ptr = curr.next.load(Acquire, guard);
        };

        if retired.is_empty() {
            return false;
        }

        // Every old node is marked now, so the chain has to be replaced even
        // if nothing matched.
        let mut link = tail;
        for (element, kept) in survivors.into_iter().rev() {
            let entry = Owned::new(Entry::new(element, kept));
            entry.next.store(link, Relaxed);
            link = entry.into_shared(guard);
        }
        self.head.next.store(link, Release);

        for ptr in retired {
            // SAFETY: no longer reachable from the head, and each old node was
            // marked by us alone so nobody else retires it.
            unsafe { guard.defer_destroy(ptr) };
        }
        self.size.release(removed);

        tracing::debug!(removed, "lazy remove_all");
        removed > 0
    }

    fn size(&self) -> usize {
        self.size.get()
    }

    fn capacity(&self) -> Option<usize> {
        self.size.capacity()
    }
}

impl<T> fmt::Display for LazyMultiset<T>
where
    T: Hash + Eq + Clone + fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = EntryList::new(f)?;
        self.for_each_live(|e, n| list.entry(e, n))?;
        list.finish()
    }
}

impl<T> fmt::Debug for LazyMultiset<T>
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

#[cfg(test)]
mod tests {
    use super::LazyMultiset;
    use crate::error::MultisetError;
    use crossbeam_epoch as epoch;
    use crate::multiset::Multiset;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::scope;

    #[test]
    fn test_add_count_remove() {
        let ms = LazyMultiset::new();
        assert_eq!(ms.add("x", 1), Ok(0));
        assert_eq!(ms.add("y", 2), Ok(0));
        assert_eq!(ms.add("x", 4), Ok(1));
        assert_eq!(ms.count(&"x"), 5);
        assert_eq!(ms.size(), 7);

        assert_eq!(ms.remove(&"x", 5), Ok(5));
        assert_eq!(ms.count(&"x"), 0);
        assert_eq!(ms.remove(&"x", 1), Ok(0));
        // Re-inserted after removal, at the end of the chain.
        assert_eq!(ms.add("x", 1), Ok(0));
        assert_eq!(ms.to_string(), "[(y: 2); (x: 1)]");
        assert_eq!(ms.size(), 3);
    }

    #[test]
    fn test_capacity_and_arguments() {
        let ms = LazyMultiset::with_capacity(5);
        assert!(matches!(
            ms.remove(&1, 0),
            Err(MultisetError::InvalidArgument(_))
        ));
        assert_eq!(ms.add(1, 5), Ok(0));
        assert_eq!(
            ms.add(1, 1),
            Err(MultisetError::CapacityExceeded {
                requested: 1,
                capacity: 5
            })
        );
        assert_eq!(ms.count(&1), 5);
        // The window locks were released on the error path.
        assert_eq!(ms.remove(&1, 1), Ok(5));
        assert_eq!(ms.add(2, 1), Ok(0));
        assert_eq!(ms.size(), 5);
    }

    #[test]
    fn test_remove_all_rebuilds() {
        let ms = LazyMultiset::new();
        for i in 0..6u32 {
            ms.add(i, 3).unwrap();
        }
        assert!(ms.remove_all(&[0, 0, 0, 2, 5, 5, 9]));
        assert_eq!(ms.size(), 12);
        assert_eq!(ms.to_string(), "[(1: 3); (2: 2); (3: 3); (4: 3); (5: 1)]");

        // Nothing matched, the chain is replaced but unchanged.
        assert!(!ms.remove_all(&[42]));
        assert_eq!(ms.count(&4), 3);
        assert_eq!(ms.size(), 12);

        // Mutations work on the replacement chain.
        assert_eq!(ms.add(0, 1), Ok(0));
        assert_eq!(ms.remove(&1, 3), Ok(3));
        assert_eq!(ms.size(), 10);
        assert_eq!(format!("{:?}", ms), "{2: 2, 3: 3, 4: 3, 5: 1, 0: 1}");

        let empty = LazyMultiset::<u32>::new();
        assert!(!empty.remove_all(&[1]));
    }

    #[test]
    fn test_render_marked_but_not_removed() {
        let ms = LazyMultiset::new();
        for i in 0..3u32 {
            ms.add(i, 2).unwrap();
        }
        {
            // What a `remove_all` walk leaves behind before its swing.
            let guard = &epoch::pin();
            let w = ms.find(&1, guard);
            w.curr.marked.store(true, Ordering::Release);
        }
        assert_eq!(ms.to_string(), "[(0: 2); (1: 2); (2: 2)]");
        assert_eq!(ms.count(&1), 2);

        // A removed node is zeroed before it is marked, and is not shown.
        {
            let guard = &epoch::pin();
            let w = ms.find(&2, guard);
            w.curr.count.store(0, Ordering::Release);
            w.curr.marked.store(true, Ordering::Release);
        }
        assert_eq!(ms.to_string(), "[(0: 2); (1: 2)]");
        assert_eq!(format!("{:?}", ms), "{0: 2, 1: 2}");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_readers_during_writes() {
        let ms = LazyMultiset::new();
        ms.add(u32::MAX, 1).unwrap();
        let done = AtomicBool::new(false);

        scope(|s| {
            for t in 0..3u32 {
                let ms = &ms;
                s.spawn(move || {
                    for i in 0..2000u32 {
                        let e = (i * 7 + t) % 64;
                        ms.add(e, 1).unwrap();
                        assert!(ms.remove(&e, 1).is_ok());
                    }
                });
            }
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    // Never touched by the writers.
                    assert_eq!(ms.count(&u32::MAX), 1);
                }
            });
            s.spawn(|| {
                for _ in 0..50 {
                    ms.remove_all(&[1, 2, 3]);
                }
            });
            std::thread::sleep(std::time::Duration::from_millis(100));
            done.store(true, Ordering::Release);
        });

        let live: usize = (0..64).map(|e| ms.count(&e)).sum();
        assert_eq!(live + 1, ms.size());
    }
}
