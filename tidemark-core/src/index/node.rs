use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

pub(crate) type NodePtr<K, V> = *mut Node<K, V>;

/// A tower node: one (key, value) entry plus its forward links.
///
/// Uses the flexible array member pattern for the link tower:
/// - Single allocation per node, links inline after the struct fields
/// - Layout: [item, height, tombstone, forward[0], ..., forward[height]]
///
/// A node of height `h` participates in levels `0..=h`. Sentinels carry no
/// item (`item == None`) and are allocated at the maximum height so every
/// level is bounded on both ends.
#[repr(C)]
pub(crate) struct Node<K, V> {
    item: Option<(K, V)>,
    height: usize,
    tombstone: AtomicBool,
    // Flexible array: height + 1 pointers allocated inline after this struct
    links: [AtomicPtr<Node<K, V>>; 0],
}

impl<K, V> Node<K, V> {
    /// Layout of a node whose tower spans levels `0..=height`.
    fn layout_for(height: usize) -> Layout {
        Layout::new::<Self>()
            .extend(Layout::array::<AtomicPtr<Self>>(height + 1).unwrap())
            .unwrap()
            .0
            .pad_to_align()
    }

    pub(crate) fn alloc_entry(key: K, value: V, height: usize) -> *mut Self {
        Self::alloc_raw(Some((key, value)), height)
    }

    pub(crate) fn alloc_sentinel(height: usize) -> *mut Self {
        Self::alloc_raw(None, height)
    }

    fn alloc_raw(item: Option<(K, V)>, height: usize) -> *mut Self {
        unsafe {
            let layout = Self::layout_for(height);
            let node = alloc(layout) as *mut Self;
            if node.is_null() {
                handle_alloc_error(layout);
            }

            ptr::write(&mut (*node).item, item);
            ptr::write(&mut (*node).height, height);
            ptr::write(&mut (*node).tombstone, AtomicBool::new(false));

            let links = (*node).links.as_ptr() as *mut AtomicPtr<Self>;
            for level in 0..=height {
                ptr::write(links.add(level), AtomicPtr::new(ptr::null_mut()));
            }

            node
        }
    }

    /// Deallocate a node.
    ///
    /// # Safety
    /// The pointer must have been produced by `alloc_entry`/`alloc_sentinel`
    /// and must not be reachable from any live traversal.
    pub(crate) unsafe fn dealloc_node(node: *mut Self) {
        unsafe {
            let layout = Self::layout_for((*node).height);
            ptr::drop_in_place(&mut (*node).item);
            dealloc(node as *mut u8, layout);
        }
    }

    /// Exact size of this node's allocation, tower included.
    pub(crate) fn footprint(&self) -> usize {
        Self::layout_for(self.height).size()
    }

    #[inline]
    pub(crate) fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub(crate) fn is_sentinel(&self) -> bool {
        self.item.is_none()
    }

    #[inline]
    pub(crate) fn key(&self) -> &K {
        let (key, _) = self.item.as_ref().expect("sentinel carries no entry");
        key
    }

    #[inline]
    pub(crate) fn value(&self) -> &V {
        let (_, value) = self.item.as_ref().expect("sentinel carries no entry");
        value
    }

    #[inline]
    pub(crate) fn entry(&self) -> (&K, &V) {
        let (key, value) = self.item.as_ref().expect("sentinel carries no entry");
        (key, value)
    }

    #[inline]
    pub(crate) fn is_tombstoned(&self) -> bool {
        self.tombstone.load(Ordering::Acquire)
    }

    /// One-shot false → true transition; the winner owns the physical unlink.
    #[inline]
    pub(crate) fn mark_tombstone(&self) -> bool {
        self.tombstone
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    fn link_at(&self, level: usize) -> &AtomicPtr<Self> {
        debug_assert!(level <= self.height);
        unsafe { &*self.links.as_ptr().add(level) }
    }

    /// Load the forward link at `level` (Acquire).
    #[inline]
    pub(crate) fn forward(&self, level: usize) -> *mut Self {
        self.link_at(level).load(Ordering::Acquire)
    }

    /// Store the forward link at `level` (Release).
    #[inline]
    pub(crate) fn set_forward(&self, level: usize, node: *mut Self) {
        self.link_at(level).store(node, Ordering::Release)
    }

    /// CAS the forward link at `level` (Release/Relaxed).
    #[inline]
    pub(crate) fn cas_forward(
        &self,
        level: usize,
        expected: *mut Self,
        new: *mut Self,
    ) -> Result<*mut Self, *mut Self> {
        self.link_at(level)
            .compare_exchange(expected, new, Ordering::Release, Ordering::Relaxed)
    }
}

/// Type-erased deallocation entry point handed to the epoch manager.
///
/// # Safety
/// `node` must be a `Node<K, V>` allocation matching the instantiation.
pub(crate) unsafe fn dealloc_erased<K, V>(node: *mut ()) {
    unsafe { Node::<K, V>::dealloc_node(node as *mut Node<K, V>) }
}
