use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::Backoff;
use tidemark_epoch::{EpochGuard, EpochManager};

use crate::index::iterator::ForwardIterator;
use crate::index::node::{dealloc_erased, Node, NodePtr};
use crate::ordering::{KeyEquality, KeyOrdering, NaturalOrder, ValueEquality};

// =============================================================================
// LINK GRAPH
// =============================================================================
//
// Multi-level forward-link structure between the head and tail sentinels
// (sorted ascending at every level, duplicates permitted in non-unique mode):
//
// Level 2:  HEAD ──────────────────────────► 30 ─────────────────────► TAIL
//             │                               │
// Level 1:  HEAD ──────────► 10 ───────────► 30 ─────────────────────► TAIL
//             │               │               │
// Level 0:  HEAD ──► 10 ───► 10 ──► 20 ────► 30 ──────────► 40 ──────► TAIL
//
// INVARIANTS:
// 1. Every level's forward chain out of HEAD ends at TAIL.
// 2. Level-0 keys are non-decreasing under the caller's ordering; level 0 is
//    the authoritative sequence, upper levels are search accelerators.
// 3. The tombstone flag transitions once, false → true; the winning CAS is
//    the delete's linearization point. Links of a tombstoned node stay
//    read-valid until the epoch manager frees it.
// 4. `cur_level` upper-bounds the height of any link out of HEAD that
//    reaches a non-sentinel. It may run stale high or (briefly) low; both
//    only cost descent steps because every search bottoms out at level 0.
//
// INSERT (per level, bottom first):
//   frame ← update_list(key); succ ← frame[0].forward[0]
//   node.forward[0] ← succ; CAS(frame[0].forward[0], succ → node)
//   The level-0 CAS publishes the node (linearization point). Upper levels
//   repeat the CAS with re-search on failure and stop if the node was
//   tombstoned meanwhile.
//
// DELETE (top-down after winning the tombstone CAS):
//   for level = height .. 0:
//     pred ← predecessor_at(level, key, node)
//     CAS(pred.forward[level], node → node.forward[level])
//   Unlinking from the top guarantees a node unreachable at level 0 is
//   unreachable everywhere, so descending searches never strand on a
//   detached tower.
//
// =============================================================================

/// Tower height cap; with p = 0.5 this covers ≈ 2^16 expected entries.
pub const MAX_LEVEL: usize = 16;

/// Per-level predecessor frame recorded by `update_list`.
type Frame<K, V> = [NodePtr<K, V>; MAX_LEVEL + 1];

/// Outcome of [`OrderedIndex::conditional_insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConditionalOutcome {
    /// Whether a new entry was linked.
    pub inserted: bool,
    /// Whether the predicate matched an existing live value for the key.
    pub predicate_satisfied: bool,
}

/// A concurrent multi-level ordered index from keys to values.
///
/// Readers and writers proceed without coarse locks: traversal reads every
/// link atomically, mutation goes through per-level compare-and-set with
/// re-validation, and unlinked nodes are handed to an epoch manager that
/// frees them only after every reader that could have observed them leaves.
///
/// Duplicate keys are permitted unless the index is constructed in unique
/// mode; `(key, value)` pairs are unique among live entries in either mode.
pub struct OrderedIndex<K, V, R = NaturalOrder> {
    head: NodePtr<K, V>,
    tail: NodePtr<K, V>,
    /// Monotone-biased hint; searches descend from here.
    cur_level: AtomicUsize,
    unique_keys: bool,
    relation: R,
    live_bytes: AtomicUsize,
    epochs: EpochManager,
}

unsafe impl<K: Send + Sync, V: Send + Sync, R: Send + Sync> Send for OrderedIndex<K, V, R> {}
unsafe impl<K: Send + Sync, V: Send + Sync, R: Send + Sync> Sync for OrderedIndex<K, V, R> {}

impl<K, V, R> OrderedIndex<K, V, R>
where
    R: KeyOrdering<K> + KeyEquality<K> + ValueEquality<V>,
{
    /// Create an index using the relation's `Default` instance.
    ///
    /// With `unique_keys`, a second insert under an existing key is refused
    /// regardless of value.
    pub fn new(unique_keys: bool) -> Self
    where
        R: Default,
    {
        Self::with_relation(unique_keys, R::default())
    }

    /// Create an index with an explicit relation instance (schema-aware
    /// comparators and the like).
    pub fn with_relation(unique_keys: bool, relation: R) -> Self {
        let head = Node::alloc_sentinel(MAX_LEVEL);
        let tail = Node::alloc_sentinel(MAX_LEVEL);
        unsafe {
            for level in 0..=MAX_LEVEL {
                (*head).set_forward(level, tail);
            }
        }
        OrderedIndex {
            head,
            tail,
            cur_level: AtomicUsize::new(0),
            unique_keys,
            relation,
            live_bytes: AtomicUsize::new(0),
            epochs: EpochManager::new(),
        }
    }

    /// Whether the index refuses duplicate keys.
    pub fn unique_keys(&self) -> bool {
        self.unique_keys
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Insert a `(key, value)` entry.
    ///
    /// Returns `false` if the pair already exists live, or (in unique mode)
    /// the key already exists live.
    pub fn insert(&self, key: K, value: V) -> bool {
        let _guard = self.epochs.join();
        unsafe { self.insert_internal(key, value) }
    }

    /// Tombstone the live entry carrying exactly this `(key, value)` pair.
    ///
    /// Returns `true` iff this call won the tombstone; the winner also
    /// unlinks the node and enrolls it for reclamation.
    pub fn delete(&self, key: &K, value: &V) -> bool {
        let _guard = self.epochs.join();
        unsafe { self.delete_internal(key, value) }
    }

    /// Collect every live value stored under `key`, in chain order.
    pub fn get_value(&self, key: &K) -> Vec<V>
    where
        V: Clone,
    {
        let _guard = self.epochs.join();
        let mut values = Vec::new();
        unsafe {
            let mut x = self.move_to(key);
            while !self.is_tail(x) && self.key_equal((*x).key(), key) {
                if !(*x).is_tombstoned() {
                    values.push((*x).value().clone());
                }
                x = (*x).forward(0);
            }
        }
        values
    }

    /// Whether any live value under `key` satisfies `predicate`.
    pub fn conditional_find<P>(&self, key: &K, predicate: P) -> bool
    where
        P: Fn(&V) -> bool,
    {
        let _guard = self.epochs.join();
        unsafe { self.conditional_find_internal(key, &predicate) }
    }

    /// Insert unless some live value under `key` satisfies `predicate`.
    ///
    /// The check and the insert are not atomic: a racing writer may slip a
    /// matching value in between, in which case this call may still insert,
    /// or may refuse for the usual duplicate reasons. Either outcome
    /// preserves the index invariants.
    pub fn conditional_insert<P>(&self, key: K, value: V, predicate: P) -> ConditionalOutcome
    where
        P: Fn(&V) -> bool,
    {
        let _guard = self.epochs.join();
        unsafe {
            if self.conditional_find_internal(&key, &predicate) {
                return ConditionalOutcome {
                    inserted: false,
                    predicate_satisfied: true,
                };
            }
            ConditionalOutcome {
                inserted: self.insert_internal(key, value),
                predicate_satisfied: false,
            }
        }
    }

    /// Whether any live entry exists under `key`.
    pub fn contains(&self, key: &K) -> bool {
        let _guard = self.epochs.join();
        unsafe { self.live_key_exists(key) }
    }

    /// Whether a live entry carries exactly this `(key, value)` pair.
    pub fn contains_pair(&self, key: &K, value: &V) -> bool {
        let _guard = self.epochs.join();
        unsafe { !self.find_pair(key, value).is_null() }
    }

    /// Number of live entries (level-0 walk).
    pub fn len(&self) -> usize {
        let _guard = self.epochs.join();
        let mut count = 0;
        unsafe {
            let mut x = (*self.head).forward(0);
            while !self.is_tail(x) {
                if !(*x).is_tombstoned() {
                    count += 1;
                }
                x = (*x).forward(0);
            }
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cursor positioned at the first entry.
    pub fn begin(&self) -> ForwardIterator<'_, K, V, R> {
        ForwardIterator::from_start(self)
    }

    /// Cursor positioned at the first entry whose key is ≥ `key`.
    pub fn begin_at(&self, key: &K) -> ForwardIterator<'_, K, V, R> {
        ForwardIterator::from_lower_bound(self, key)
    }

    /// Advance the reclamation epoch and free whatever has drained.
    pub fn perform_gc(&self) {
        self.epochs.perform_gc();
    }

    /// Whether unlinked nodes are awaiting reclamation.
    pub fn needs_gc(&self) -> bool {
        self.epochs.needs_gc()
    }

    /// Bytes held by live nodes plus nodes pending reclamation.
    pub fn memory_footprint(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed) + self.epochs.pending_bytes()
    }

    // =========================================================================
    // Traversal primitives
    // =========================================================================

    /// Descend to the first node whose key is ≥ `key`.
    ///
    /// Returns that node (possibly the tail sentinel), never the head. Safe
    /// against in-flight mutation because every link is reread atomically on
    /// each step.
    ///
    /// # Safety
    /// Must run under an epoch guard from this index's manager.
    pub(crate) unsafe fn move_to(&self, key: &K) -> NodePtr<K, V> {
        let mut x = self.head;
        for level in (0..=self.search_top()).rev() {
            unsafe {
                loop {
                    let next = (*x).forward(level);
                    if self.is_tail(next) || !self.key_less((*next).key(), key) {
                        break;
                    }
                    x = next;
                }
            }
        }
        unsafe {
            let mut x = if x == self.head {
                (*self.head).forward(0)
            } else {
                x
            };
            while !self.is_tail(x) && self.key_less((*x).key(), key) {
                x = (*x).forward(0);
            }
            x
        }
    }

    /// Record, per level, the last node strictly before `key`.
    ///
    /// A tombstoned frame entry backs off one step to the previous node on
    /// the search path; the mutators re-validate with CAS anyway. Frames
    /// above the observed search top fall back to the head sentinel.
    unsafe fn update_list(&self, key: &K, frame: &mut Frame<K, V>) {
        let top = self.search_top();
        for level in top + 1..=MAX_LEVEL {
            frame[level] = self.head;
        }
        let mut prev = self.head;
        let mut x = self.head;
        for level in (0..=top).rev() {
            unsafe {
                loop {
                    let next = (*x).forward(level);
                    if self.is_tail(next) || !self.key_less((*next).key(), key) {
                        break;
                    }
                    prev = x;
                    x = next;
                }
                frame[level] = if (*x).is_tombstoned() { prev } else { x };
            }
        }
    }

    /// Level-0 scan for the first live node carrying exactly `(key, value)`.
    unsafe fn find_pair(&self, key: &K, value: &V) -> NodePtr<K, V> {
        unsafe {
            let mut x = self.move_to(key);
            while !self.is_tail(x) && self.key_equal((*x).key(), key) {
                if !(*x).is_tombstoned() && self.value_equal((*x).value(), value) {
                    return x;
                }
                x = (*x).forward(0);
            }
        }
        null_mut()
    }

    unsafe fn live_key_exists(&self, key: &K) -> bool {
        unsafe {
            let mut x = self.move_to(key);
            while !self.is_tail(x) && self.key_equal((*x).key(), key) {
                if !(*x).is_tombstoned() {
                    return true;
                }
                x = (*x).forward(0);
            }
        }
        false
    }

    unsafe fn conditional_find_internal<P>(&self, key: &K, predicate: &P) -> bool
    where
        P: Fn(&V) -> bool,
    {
        unsafe {
            let mut x = self.move_to(key);
            while !self.is_tail(x) && self.key_equal((*x).key(), key) {
                if !(*x).is_tombstoned() && predicate((*x).value()) {
                    return true;
                }
                x = (*x).forward(0);
            }
        }
        false
    }

    /// Walk level `level`'s chain through the run of keys ≤ `key` and return
    /// the node currently linking to `node` there, or `None` when `node` is
    /// not linked at this level. The chain at a level visits every node
    /// linked at that level in key order, so a linked node is always found
    /// before the scan leaves its run.
    unsafe fn predecessor_at(
        &self,
        level: usize,
        key: &K,
        node: NodePtr<K, V>,
    ) -> Option<NodePtr<K, V>> {
        unsafe {
            let mut x = self.head;
            loop {
                let next = (*x).forward(level);
                if next == node {
                    return Some(x);
                }
                if self.is_tail(next) || self.key_less(key, (*next).key()) {
                    return None;
                }
                x = next;
            }
        }
    }

    /// Detach `node` from level `level`, rescanning for the predecessor on
    /// every CAS failure. Returns once the node is no longer linked there,
    /// whether this call or a racing one removed it (or the inserter never
    /// reached the level).
    unsafe fn unlink_level(&self, level: usize, key: &K, node: NodePtr<K, V>) {
        let backoff = Backoff::new();
        unsafe {
            while let Some(pred) = self.predecessor_at(level, key, node) {
                let succ = (*node).forward(level);
                if (*pred).cas_forward(level, node, succ).is_ok() {
                    return;
                }
                backoff.spin();
            }
        }
    }

    // =========================================================================
    // Mutators
    // =========================================================================

    unsafe fn insert_internal(&self, key: K, value: V) -> bool {
        unsafe {
            if self.unique_keys {
                if self.live_key_exists(&key) {
                    return false;
                }
            } else if !self.find_pair(&key, &value).is_null() {
                return false;
            }
        }

        let height = Self::random_level();
        self.cur_level.fetch_max(height, Ordering::Relaxed);

        let node = Node::alloc_entry(key, value, height);
        let mut frame: Frame<K, V> = [null_mut(); MAX_LEVEL + 1];

        unsafe {
            let key = (*node).key();
            let value = (*node).value();

            // Bottom-level install: the level-0 CAS publishes the node.
            loop {
                self.update_list(key, &mut frame);
                let pred = frame[0];
                let succ = (*pred).forward(0);
                if !self.is_tail(succ)
                    && !(*succ).is_tombstoned()
                    && self.key_equal((*succ).key(), key)
                {
                    let duplicate = if self.unique_keys {
                        true
                    } else {
                        self.value_equal((*succ).value(), value)
                    };
                    if duplicate {
                        Node::dealloc_node(node);
                        return false;
                    }
                }
                if (*pred).is_tombstoned() {
                    continue;
                }
                (*node).set_forward(0, succ);
                if (*pred).cas_forward(0, succ, node).is_ok() {
                    break;
                }
            }
            self.live_bytes.fetch_add((*node).footprint(), Ordering::Relaxed);

            // Upper levels are accelerators; stop if a deleter claimed the
            // node, and take back a link installed after the claim.
            'levels: for level in 1..=height {
                loop {
                    if (*node).is_tombstoned() {
                        break 'levels;
                    }
                    let pred = frame[level];
                    if (*pred).is_tombstoned() {
                        self.update_list(key, &mut frame);
                        continue;
                    }
                    let succ = (*pred).forward(level);
                    if succ == node {
                        break;
                    }
                    if !self.is_tail(succ) && self.key_less((*succ).key(), key) {
                        // A racing insert linked a smaller key after pred.
                        frame[level] = succ;
                        continue;
                    }
                    (*node).set_forward(level, succ);
                    match (*pred).cas_forward(level, succ, node) {
                        Ok(_) => {
                            if (*node).is_tombstoned() {
                                // The deleter may already have swept this
                                // level top-down; take the link back out so
                                // the node ends up unreachable everywhere.
                                self.unlink_level(level, key, node);
                                break 'levels;
                            }
                            continue 'levels;
                        }
                        Err(_) => {
                            self.update_list(key, &mut frame);
                        }
                    }
                }
            }
        }
        true
    }

    unsafe fn delete_internal(&self, key: &K, value: &V) -> bool {
        let node = unsafe { self.find_pair(key, value) };
        if node.is_null() {
            return false;
        }
        unsafe {
            if !(*node).mark_tombstone() {
                // Another writer won the logical delete.
                return false;
            }

            // Physical unlink, top-down.
            let height = (*node).height();
            let footprint = (*node).footprint();
            for level in (0..=height).rev() {
                self.unlink_level(level, key, node);
            }

            self.live_bytes.fetch_sub(footprint, Ordering::Relaxed);
            self.epochs
                .add_garbage(node as *mut (), dealloc_erased::<K, V>, footprint);
            self.reset_cur_level();
        }
        true
    }

    // =========================================================================
    // Hints and helpers
    // =========================================================================

    /// Geometric height, p = 0.5, truncated to `MAX_LEVEL`: one random word,
    /// trailing ones counted as consecutive coin hits.
    fn random_level() -> usize {
        (fastrand::u32(..).trailing_ones() as usize).min(MAX_LEVEL)
    }

    #[inline]
    fn search_top(&self) -> usize {
        self.cur_level.load(Ordering::Relaxed).min(MAX_LEVEL)
    }

    /// Lower the hint to the highest level with a non-sentinel link out of
    /// head. Best effort; a racing insert may republish a higher value.
    fn reset_cur_level(&self) {
        let mut level = MAX_LEVEL;
        unsafe {
            while level > 0 && self.is_tail((*self.head).forward(level)) {
                level -= 1;
            }
        }
        self.cur_level.store(level, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn is_tail(&self, node: NodePtr<K, V>) -> bool {
        node == self.tail
    }

    #[inline]
    pub(crate) fn key_less(&self, a: &K, b: &K) -> bool {
        self.relation.less(a, b)
    }

    #[inline]
    pub(crate) fn key_equal(&self, a: &K, b: &K) -> bool {
        KeyEquality::equal(&self.relation, a, b)
    }

    #[inline]
    fn value_equal(&self, a: &V, b: &V) -> bool {
        ValueEquality::equal(&self.relation, a, b)
    }

    #[inline]
    pub(crate) fn head_node(&self) -> NodePtr<K, V> {
        self.head
    }

    pub(crate) fn pin(&self) -> EpochGuard<'_> {
        self.epochs.join()
    }
}

impl<K, V, R> Drop for OrderedIndex<K, V, R> {
    fn drop(&mut self) {
        // Exclusive access: no readers remain, so one GC cycle drains every
        // enrolled node. The level-0 chain (tail included) and the head are
        // freed directly afterwards.
        self.epochs.perform_gc();
        unsafe {
            let mut x = (*self.head).forward(0);
            while !x.is_null() {
                let next = (*x).forward(0);
                // Only the tail sentinel may appear in the chain, and only at
                // its end.
                debug_assert!(!(*x).is_sentinel() || next.is_null());
                Node::dealloc_node(x);
                x = next;
            }
            Node::dealloc_node(self.head);
        }
    }
}
