use std::cmp::Ordering;

use tidemark_epoch::EpochGuard;

use crate::index::node::NodePtr;
use crate::index::skip_index::OrderedIndex;
use crate::ordering::{KeyEquality, KeyOrdering, ValueEquality};

/// Ordered cursor over the level-0 chain.
///
/// The cursor pins its epoch for its whole lifetime, so entries it has
/// observed stay dereferenceable even if concurrent deletes unlink them.
/// Tombstoned entries are visible; callers that want only live data filter
/// with [`is_tombstoned`](ForwardIterator::is_tombstoned) or use the
/// [`Iterator`] impl, which yields live entries.
pub struct ForwardIterator<'a, K, V, R> {
    index: &'a OrderedIndex<K, V, R>,
    cursor: NodePtr<K, V>,
    _guard: EpochGuard<'a>,
}

impl<'a, K, V, R> ForwardIterator<'a, K, V, R>
where
    R: KeyOrdering<K> + KeyEquality<K> + ValueEquality<V>,
{
    pub(crate) fn from_start(index: &'a OrderedIndex<K, V, R>) -> Self {
        let guard = index.pin();
        let cursor = unsafe { (*index.head_node()).forward(0) };
        ForwardIterator {
            index,
            cursor,
            _guard: guard,
        }
    }

    pub(crate) fn from_lower_bound(index: &'a OrderedIndex<K, V, R>, key: &K) -> Self {
        let guard = index.pin();
        let cursor = unsafe { index.move_to(key) };
        ForwardIterator {
            index,
            cursor,
            _guard: guard,
        }
    }

    /// Whether the cursor has run off the last entry.
    pub fn is_end(&self) -> bool {
        self.index.is_tail(self.cursor)
    }

    /// Step to the next entry; at the end this is a no-op.
    pub fn advance(&mut self) {
        if !self.is_end() {
            self.cursor = unsafe { (*self.cursor).forward(0) };
        }
    }

    pub fn entry(&self) -> Option<(&K, &V)> {
        if self.is_end() {
            None
        } else {
            unsafe { Some((*self.cursor).entry()) }
        }
    }

    pub fn key(&self) -> Option<&K> {
        self.entry().map(|(key, _)| key)
    }

    pub fn value(&self) -> Option<&V> {
        self.entry().map(|(_, value)| value)
    }

    /// Whether the current entry is logically deleted. End cursors report
    /// `false`.
    pub fn is_tombstoned(&self) -> bool {
        !self.is_end() && unsafe { (*self.cursor).is_tombstoned() }
    }
}

/// Cursors over the same index order by key; two end cursors are equal and
/// an end cursor sorts after every positioned one.
impl<K, V, R> PartialEq for ForwardIterator<'_, K, V, R>
where
    R: KeyOrdering<K> + KeyEquality<K> + ValueEquality<V>,
{
    fn eq(&self, other: &Self) -> bool {
        match (self.is_end(), other.is_end()) {
            (true, true) => true,
            (true, false) | (false, true) => false,
            (false, false) => unsafe {
                self.index
                    .key_equal((*self.cursor).key(), (*other.cursor).key())
            },
        }
    }
}

impl<K, V, R> PartialOrd for ForwardIterator<'_, K, V, R>
where
    R: KeyOrdering<K> + KeyEquality<K> + ValueEquality<V>,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.is_end(), other.is_end()) {
            (true, true) => Some(Ordering::Equal),
            (false, true) => Some(Ordering::Less),
            (true, false) => Some(Ordering::Greater),
            (false, false) => unsafe {
                let a = (*self.cursor).key();
                let b = (*other.cursor).key();
                if self.index.key_less(a, b) {
                    Some(Ordering::Less)
                } else if self.index.key_less(b, a) {
                    Some(Ordering::Greater)
                } else {
                    Some(Ordering::Equal)
                }
            },
        }
    }
}

// Entries are cloned out rather than borrowed: a borrowed item could not
// outlive a `next` call without tying it to the pinned guard's lifetime.
impl<K, V, R> Iterator for ForwardIterator<'_, K, V, R>
where
    K: Clone,
    V: Clone,
    R: KeyOrdering<K> + KeyEquality<K> + ValueEquality<V>,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        while !self.is_end() {
            let item = unsafe {
                let (key, value) = (*self.cursor).entry();
                if (*self.cursor).is_tombstoned() {
                    None
                } else {
                    Some((key.clone(), value.clone()))
                }
            };
            self.advance();
            if item.is_some() {
                return item;
            }
        }
        None
    }
}
