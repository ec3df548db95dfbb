//! CoarseGrainedMultiset - one lock around the whole chain.
//!
//! Every operation, reads included, takes the same exclusive lock for its
//! full body. This is the baseline the other strategies are compared against:
//! trivially linearizable (at the unlock), with no parallelism at all.

use parking_lot::Mutex;
use std::fmt;
use std::hash::Hash;

use crate::error::MultisetError;
use crate::internals::size::SizeCounter;
use crate::internals::tally::Tally;
use crate::multiset::{check_occurrences, EntryList, Multiset};

type Link<T> = Option<Box<Entry<T>>>;

struct Entry<T> {
    element: T,
    count: usize,
    next: Link<T>,
}

// The mutex guarded root is the left sentinel, `None` is the right one.
struct Chain<T> {
    head: Link<T>,
}

impl<T> Chain<T>
where
    T: Eq,
{
    /// Returns the link that either holds the node for `element`, or is the
    /// tail (`None`) if the element is absent.
    fn search(&mut self, element: &T) -> &mut Link<T> {
        let mut cursor = &mut self.head;
        while cursor.as_ref().is_some_and(|e| e.element != *element) {
            if let Some(entry) = cursor {
                cursor = &mut entry.next;
            }
        }
        cursor
    }
}

impl<T> Chain<T> {
    fn iter(&self) -> impl Iterator<Item = &Entry<T>> {
        std::iter::successors(self.head.as_deref(), |e| e.next.as_deref())
    }
}

impl<T> Drop for Chain<T> {
    fn drop(&mut self) {
        // Unlink iteratively, a recursive drop can overflow on long chains.
        let mut next = self.head.take();
        while let Some(mut e) = next {
            next = e.next.take();
        }
    }
}

/// A concurrent multiset serialising all operations through one lock.
///
/// # Examples
/// ```
/// use conmultiset::{CoarseGrainedMultiset, Multiset};
///
/// let ms = CoarseGrainedMultiset::new();
/// assert_eq!(ms.add("x", 2), Ok(0));
/// assert_eq!(ms.add("x", 1), Ok(2));
/// assert_eq!(ms.remove(&"x", 5), Ok(3));
/// assert!(ms.is_empty());
/// ```
pub struct CoarseGrainedMultiset<T> {
    chain: Mutex<Chain<T>>,
    size: SizeCounter,
}

impl<T> CoarseGrainedMultiset<T>
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
        CoarseGrainedMultiset {
            chain: Mutex::new(Chain { head: None }),
            size: SizeCounter::new(capacity),
        }
    }
}

impl<T> Default for CoarseGrainedMultiset<T>
where
    T: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Multiset<T> for CoarseGrainedMultiset<T>
where
    T: Hash + Eq + Clone,
{
    fn add(&self, element: T, occurrences: usize) -> Result<usize, MultisetError> {
        check_occurrences(occurrences)?;
        let mut chain = self.chain.lock();
        let link = chain.search(&element);
        self.size.reserve(occurrences)?;
        if let Some(entry) = link.as_mut() {
            let prev = entry.count;
            entry.count += occurrences;
            return Ok(prev);
        }
        *link = Some(Box::new(Entry {
            element,
            count: occurrences,
            next: None,
        }));
        Ok(0)
    }

    fn remove(&self, element: &T, occurrences: usize) -> Result<usize, MultisetError> {
        check_occurrences(occurrences)?;
        let mut chain = self.chain.lock();
        let link = chain.search(element);
        let Some(entry) = link.as_mut() else {
            return Ok(0);
        };
        let prev = entry.count;
        if prev > occurrences {
            entry.count -= occurrences;
            self.size.release(occurrences);
        } else if let Some(entry) = link.take() {
            // Splice the successor in place of the node.
            *link = entry.next;
            self.size.release(prev);
        }
        Ok(prev)
    }

    fn count(&self, element: &T) -> usize {
        let mut chain = self.chain.lock();
        chain.search(element).as_ref().map_or(0, |e| e.count)
    }

    fn remove_all(&self, collection: &[T]) -> bool {
        let tally = Tally::new(collection);
        if tally.is_empty() {
            return false;
        }
        let mut chain = self.chain.lock();
        let mut removed = 0;

        // Rebuild the survivors into a disjoint chain, then swap it in.
        let mut replacement: Link<T> = None;
        let mut tail = &mut replacement;
        let mut next = chain.head.take();
        while let Some(mut entry) = next {
            next = entry.next.take();
            let (taken, kept) = tally.split(&entry.element, entry.count);
            removed += taken;
            if kept > 0 {
                entry.count = kept;
                tail = &mut tail.insert(entry).next;
            }
        }
        chain.head = replacement;
        self.size.release(removed);

        tracing::debug!(removed, "coarse remove_all");
        removed > 0
    }

    fn size(&self) -> usize {
        let _chain = self.chain.lock();
        self.size.get()
    }

    fn capacity(&self) -> Option<usize> {
        self.size.capacity()
    }
}

impl<T> fmt::Display for CoarseGrainedMultiset<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain = self.chain.lock();
        let mut list = EntryList::new(f)?;
        for e in chain.iter() {
            list.entry(&e.element, e.count)?;
        }
        list.finish()
    }
}

impl<T> fmt::Debug for CoarseGrainedMultiset<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain = self.chain.lock();
        f.debug_map()
            .entries(chain.iter().map(|e| (&e.element, e.count)))
            .finish()
    }
}
