//! FineGrainedMultiset - hand-over-hand locking.
//!
//! Each node carries its own lock, guarding its count and its outgoing link.
//! A traversal locks the head and its successor, then always locks the next
//! node *before* releasing the one behind it, so the `(pred, curr)` window it
//! decides on is locked and adjacent. Threads therefore move through the chain
//! in a pipeline and can never overtake one another.
//!
//! That ordering is also what makes immediate reclamation sound: a node is
//! unlinked while its predecessor is locked, and the only way to reach a node
//! is through its locked predecessor, so once the remover lets go nobody can
//! hold or be waiting on the node it frees.
//!
//! `remove_all` holds the head lock for the whole of its walk. Nobody can
//! enter the chain behind it, and by the time it holds the tail everyone
//! ahead of it has left, so the survivors can be relinked into a replacement
//! chain and the head swung to it before any other thread gets back in.

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::hash::Hash;
use std::mem;
use std::ptr;

use crate::admission::AdmissionGate;
use crate::error::MultisetError;
use crate::internals::size::SizeCounter;
use crate::internals::tally::Tally;
use crate::multiset::{check_occurrences, EntryList, Multiset};

struct Slot<T> {
    count: usize,
    next: *mut Entry<T>,
}

struct Entry<T> {
    // None only for the two sentinels.
    element: Option<T>,
    slot: Mutex<Slot<T>>,
}

impl<T> Entry<T>
where
    T: Eq,
{
    fn new(element: Option<T>, count: usize, next: *mut Entry<T>) -> Self {
        Entry {
            element,
            slot: Mutex::new(Slot { count, next }),
        }
    }

    #[inline]
    fn is_sentinel(&self) -> bool {
        self.element.is_none()
    }

    #[inline]
    fn holds(&self, element: &T) -> bool {
        self.element.as_ref() == Some(element)
    }
}

/// Two adjacent nodes, both locked.
struct Window<'a, T> {
    pred: MutexGuard<'a, Slot<T>>,
    curr: MutexGuard<'a, Slot<T>>,
    curr_ptr: *mut Entry<T>,
    curr_entry: &'a Entry<T>,
}

/// A concurrent multiset using per-node locks, acquired hand over hand.
///
/// # Examples
/// ```
/// use conmultiset::{FineGrainedMultiset, Multiset};
///
/// let ms = FineGrainedMultiset::new();
/// ms.add(1u64, 3).unwrap();
/// ms.add(2u64, 1).unwrap();
/// assert!(ms.remove_all(&[1, 2, 2]));
/// assert_eq!(ms.count(&1), 2);
/// assert!(!ms.contains(&2));
/// ```
pub struct FineGrainedMultiset<T> {
    head: Entry<T>,
    tail: *mut Entry<T>,
    size: SizeCounter,
    gate: AdmissionGate,
}

unsafe impl<T: Send + Sync> Send for FineGrainedMultiset<T> {}
unsafe impl<T: Send + Sync> Sync for FineGrainedMultiset<T> {}

impl<T> FineGrainedMultiset<T>
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
        let tail = Box::into_raw(Box::new(Entry::new(None, 0, ptr::null_mut())));
        FineGrainedMultiset {
            head: Entry::new(None, 0, tail),
            tail,
            size: SizeCounter::new(capacity),
            gate: AdmissionGate::new(),
        }
    }

    /// Lock the window whose `curr` either holds `element` or is the tail.
    fn find<'a>(&'a self, element: &T) -> Window<'a, T> {
        let mut pred = self.head.slot.lock();
        let mut curr_ptr = pred.next;
        // SAFETY: links always point at live nodes, and we hold the lock of
        // the predecessor so the target can't be unlinked and freed under us.
        let mut curr_entry = unsafe { &*curr_ptr };
        let mut curr = curr_entry.slot.lock();

        while !curr_entry.is_sentinel() && !curr_entry.holds(element) {
            let next_ptr = curr.next;
            // SAFETY: as above, `curr` is locked.
            let next_entry = unsafe { &*next_ptr };
            let next = next_entry.slot.lock();
            // Lock the next node, only then let go of the one behind.
            pred = mem::replace(&mut curr, next);
            curr_ptr = next_ptr;
            curr_entry = next_entry;
        }

        Window {
            pred,
            curr,
            curr_ptr,
            curr_entry,
        }
    }

    /// Visit each live entry under hand-over-hand locking.
    fn try_for_each<E, F>(&self, mut visit: F) -> Result<(), E>
    where
        F: FnMut(&T, usize) -> Result<(), E>,
    {
        let mut curr = self.head.slot.lock();
        loop {
            // SAFETY: `curr` is locked, its successor is live.
            let next_entry = unsafe { &*curr.next };
            let next = next_entry.slot.lock();
            let Some(element) = next_entry.element.as_ref() else {
                return Ok(());
            };
            visit(element, next.count)?;
            curr = next;
        }
    }
}

impl<T> Default for FineGrainedMultiset<T>
where
    T: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for FineGrainedMultiset<T> {
    fn drop(&mut self) {
        // We are the only owner, free every node through to the tail.
        let mut next = self.head.slot.get_mut().next;
        while !next.is_null() {
            // SAFETY: every node was leaked from a box and is reachable once.
            let mut entry = unsafe { Box::from_raw(next) };
            next = entry.slot.get_mut().next;
        }
    }
}

impl<T> Multiset<T> for FineGrainedMultiset<T>
where
    T: Hash + Eq + Clone,
{
    fn add(&self, element: T, occurrences: usize) -> Result<usize, MultisetError> {
        check_occurrences(occurrences)?;
        let _pass = self.gate.try_enter_mutator();
        let mut w = self.find(&element);
        self.size.reserve(occurrences)?;

        if !w.curr_entry.is_sentinel() {
            let prev = w.curr.count;
            w.curr.count += occurrences;
            return Ok(prev);
        }

        let entry = Box::new(Entry::new(Some(element), occurrences, w.curr_ptr));
        w.pred.next = Box::into_raw(entry);
        Ok(0)
    }

    fn remove(&self, element: &T, occurrences: usize) -> Result<usize, MultisetError> {
        check_occurrences(occurrences)?;
        let _pass = self.gate.try_enter_mutator();
        let mut w = self.find(element);

        if w.curr_entry.is_sentinel() {
            return Ok(0);
        }

        let prev = w.curr.count;
        if prev > occurrences {
            w.curr.count -= occurrences;
            drop(w);
            self.size.release(occurrences);
        } else {
            w.pred.next = w.curr.next;
            let victim = w.curr_ptr;
            drop(w);
            // SAFETY: unlinked with both ends locked. Reaching it again would
            // need the predecessor's lock, which only led to us.
            unsafe { drop(Box::from_raw(victim)) };
            self.size.release(prev);
        }
        Ok(prev)
    }

    fn count(&self, element: &T) -> usize {
        let w = self.find(element);
        if w.curr_entry.is_sentinel() {
            0
        } else {
            w.curr.count
        }
    }

    fn remove_all(&self, collection: &[T]) -> bool {
        let tally = Tally::new(collection);
        if tally.is_empty() {
            return false;
        }
        let _bulk = self.gate.enter_bulk();
        // Held to the end, see the module docs.
        let mut head = self.head.slot.lock();

        let mut survivors: Vec<(*mut Entry<T>, usize)> = Vec::new();
        let mut doomed: Vec<*mut Entry<T>> = Vec::new();
        let mut removed = 0;

        {
            let mut curr_ptr = head.next;
            // SAFETY: the head is locked.
            let mut curr_entry = unsafe { &*curr_ptr };
            let mut curr = curr_entry.slot.lock();
            let mut _pred: Option<MutexGuard<'_, Slot<T>>> = None;

            while let Some(element) = curr_entry.element.as_ref() {
                let (taken, kept) = tally.split(element, curr.count);
                removed += taken;
                if kept > 0 {
                    survivors.push((curr_ptr, kept));
                } else {
                    doomed.push(curr_ptr);
                }

                let next_ptr = curr.next;
                // SAFETY: `curr` is locked.
                let next_entry = unsafe { &*next_ptr };
                let next = next_entry.slot.lock();
                _pred = Some(mem::replace(&mut curr, next));
                curr_ptr = next_ptr;
                curr_entry = next_entry;
            }
            // Reached the tail. Nobody is left ahead of us, and nobody can
            // come in behind while the head is held.
        }

        if removed > 0 {
            let mut link = self.tail;
            for &(ptr, kept) in survivors.iter().rev() {
                // SAFETY: survivors are live and exclusively ours, the locks
                // are uncontended.
                let mut slot = unsafe { &*ptr }.slot.lock();
                slot.count = kept;
                slot.next = link;
                link = ptr;
            }
            head.next = link;
            for ptr in doomed {
                // SAFETY: no longer reachable from the head.
                unsafe { drop(Box::from_raw(ptr)) };
            }
            self.size.release(removed);
        }

        tracing::debug!(removed, "fine-grained remove_all");
        removed > 0
    }

    fn size(&self) -> usize {
        self.size.get()
    }

    fn capacity(&self) -> Option<usize> {
        self.size.capacity()
    }
}

impl<T> fmt::Display for FineGrainedMultiset<T>
where
    T: Hash + Eq + Clone + fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = EntryList::new(f)?;
        self.try_for_each(|e, n| list.entry(e, n))?;
        list.finish()
    }
}

impl<T> fmt::Debug for FineGrainedMultiset<T>
where
    T: Hash + Eq + Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        self.try_for_each(|e, n| {
            map.entry(e, &n);
            Ok::<(), fmt::Error>(())
        })?;
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::FineGrainedMultiset;
    use crate::error::MultisetError;
    use crate::multiset::Multiset;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::scope;

    #[test]
    fn test_add_count_remove() {
        let ms = FineGrainedMultiset::new();
        assert_eq!(ms.add(10, 2), Ok(0));
        assert_eq!(ms.add(20, 1), Ok(0));
        assert_eq!(ms.add(10, 1), Ok(2));
        assert_eq!(ms.count(&10), 3);
        assert_eq!(ms.size(), 4);

        assert_eq!(ms.remove(&10, 2), Ok(3));
        assert_eq!(ms.count(&10), 1);
        assert_eq!(ms.remove(&10, 1), Ok(1));
        assert_eq!(ms.count(&10), 0);
        assert_eq!(ms.remove(&30, 1), Ok(0));
        assert_eq!(ms.size(), 1);
        assert_eq!(ms.to_string(), "[(20: 1)]");
    }

    #[test]
    fn test_errors_leave_state() {
        let ms = FineGrainedMultiset::with_capacity(2);
        assert!(matches!(
            ms.add(1, 0),
            Err(MultisetError::InvalidArgument(_))
        ));
        assert_eq!(ms.add(1, 2), Ok(0));
        assert_eq!(
            ms.add(2, 1),
            Err(MultisetError::CapacityExceeded {
                requested: 1,
                capacity: 2
            })
        );
        assert!(!ms.contains(&2));
        assert_eq!(ms.size(), 2);
        // Locks were released on the error path.
        assert_eq!(ms.remove(&1, 2), Ok(2));
        assert!(ms.is_empty());
    }

    #[test]
    fn test_remove_all_relinks() {
        let ms = FineGrainedMultiset::new();
        for i in 0..10 {
            ms.add(i, 2).unwrap();
        }
        let c: Vec<i32> = (0..10).filter(|i| i % 2 == 0).collect();
        assert!(ms.remove_all(&c));
        assert_eq!(ms.size(), 15);
        for i in 0..10 {
            assert_eq!(ms.count(&i), if i % 2 == 0 { 1 } else { 2 });
        }
        assert!(ms.remove_all(&c));
        assert_eq!(ms.size(), 10);
        assert_eq!(ms.to_string(), "[(1: 2); (3: 2); (5: 2); (7: 2); (9: 2)]");
        // The chain is still usable at both ends.
        ms.add(0, 1).unwrap();
        assert_eq!(ms.remove(&1, 2), Ok(2));
        assert_eq!(ms.size(), 9);
        assert!(!ms.remove_all(&[42]));
    }

    static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Tracked(u32);

    impl Drop for Tracked {
        fn drop(&mut self) {
            DROP_COUNT.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[test]
    fn test_nodes_are_freed() {
        DROP_COUNT.store(0, Ordering::Release);
        {
            let one = Tracked(1);
            let doomed = [Tracked(2), Tracked(3)];
            let ms = FineGrainedMultiset::new();
            for i in 0..8 {
                ms.add(Tracked(i), 1).unwrap();
            }
            // An add of an existing element drops its argument.
            ms.add(Tracked(0), 1).unwrap();
            assert_eq!(DROP_COUNT.load(Ordering::Acquire), 1);
            assert_eq!(ms.remove(&one, 1), Ok(1));
            assert_eq!(DROP_COUNT.load(Ordering::Acquire), 2);
            assert!(ms.remove_all(&doomed));
            assert_eq!(DROP_COUNT.load(Ordering::Acquire), 4);
        }
        // 5 remaining nodes, then the 3 locals.
        assert_eq!(DROP_COUNT.load(Ordering::Acquire), 12);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_multithread_mixed() {
        let ms = FineGrainedMultiset::new();
        scope(|s| {
            for t in 0..4u32 {
                let ms = &ms;
                s.spawn(move || {
                    for i in 0..500u32 {
                        let e = i % 37;
                        ms.add(e, 2).unwrap();
                        ms.remove(&e, 1).unwrap();
                        if i % 100 == t {
                            ms.remove_all(&[e]);
                        }
                    }
                });
            }
        });
        // Quiescent: size matches the live counts.
        let live: usize = (0..37).map(|e| ms.count(&e)).sum();
        assert_eq!(live, ms.size());
    }
}
