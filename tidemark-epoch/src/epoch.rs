use std::ptr::null_mut;
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;
use log::{debug, trace};

// =============================================================================
// EPOCH LIFECYCLE
// =============================================================================
//
// Epochs form a singly linked chain from oldest to newest:
//
//   head_epoch ──► E1 ──► E2 ──► E3 (= current_epoch)
//                  │      │      │
//               garbage garbage garbage
//               active  active  active
//
// join()        registers a reader with current_epoch (active += 1).
// leave()       deregisters (active -= 1); done by EpochGuard's Drop.
// add_garbage() pushes an unlinked node onto current_epoch's garbage stack.
// advance()     appends a fresh epoch and publishes it as current.
// reclaim()     walks from head_epoch: while the oldest epoch is not current
//               and its active count is zero, close it (active ← CLOSED),
//               unlink it, and free its garbage. Stops at the first epoch
//               with live readers. Later epochs are never reclaimed before
//               earlier ones, even when empty: a reader registered with an
//               old epoch may still hold pointers to nodes enrolled later.
//
// A reader that loaded current_epoch and races with reclaim() may increment
// a closed epoch's count; it observes the CLOSED sentinel in the fetch_add
// result, undoes the increment, and retries against the new current epoch.
// Closed epoch records are parked on a retired list and freed when the
// manager drops, so that racing fetch_add always lands on live memory.
//
// =============================================================================

/// Active-count sentinel marking an epoch closed to joiners.
const CLOSED: isize = isize::MIN / 2;

struct GarbageNode {
    next: *mut GarbageNode,
    ptr: *mut (),
    dealloc: unsafe fn(*mut ()),
    bytes: usize,
}

struct Epoch {
    active: AtomicIsize,
    garbage: AtomicPtr<GarbageNode>,
    next: AtomicPtr<Epoch>,
}

impl Epoch {
    fn new() -> Self {
        Epoch {
            active: AtomicIsize::new(0),
            garbage: AtomicPtr::new(null_mut()),
            next: AtomicPtr::new(null_mut()),
        }
    }
}

/// Manages the epoch chain and the garbage enrolled against it.
///
/// All operations are lock-free; the only waiting anywhere is the bounded
/// retry in [`join`](EpochManager::join) when the loaded epoch was closed
/// between the load and the registration.
pub struct EpochManager {
    /// Oldest epoch still in the chain.
    head_epoch: AtomicPtr<Epoch>,
    /// Newest epoch; the one joiners register with and garbage enrolls to.
    current_epoch: AtomicPtr<Epoch>,
    /// Closed epoch records awaiting the manager's drop.
    retired: AtomicPtr<Epoch>,
    pending_count: AtomicUsize,
    pending_bytes: AtomicUsize,
}

unsafe impl Send for EpochManager {}
unsafe impl Sync for EpochManager {}

impl EpochManager {
    pub fn new() -> Self {
        let initial = Box::into_raw(Box::new(Epoch::new()));
        EpochManager {
            head_epoch: AtomicPtr::new(initial),
            current_epoch: AtomicPtr::new(initial),
            retired: AtomicPtr::new(null_mut()),
            pending_count: AtomicUsize::new(0),
            pending_bytes: AtomicUsize::new(0),
        }
    }

    /// Register a reader with the current epoch.
    ///
    /// The returned guard deregisters on drop. Every dereference of a node
    /// owned by the collection this manager serves must happen while such a
    /// guard is alive.
    pub fn join(&self) -> EpochGuard<'_> {
        let backoff = Backoff::new();
        loop {
            let epoch = self.current_epoch.load(Ordering::Acquire);
            let seen = unsafe { (*epoch).active.fetch_add(1, Ordering::AcqRel) };
            if seen >= 0 {
                return EpochGuard {
                    manager: self,
                    epoch,
                };
            }
            // The epoch was closed between the load and the increment.
            unsafe { (*epoch).active.fetch_sub(1, Ordering::AcqRel) };
            backoff.spin();
        }
    }

    fn leave(&self, epoch: *mut Epoch) {
        unsafe { (*epoch).active.fetch_sub(1, Ordering::AcqRel) };
    }

    /// Enroll an unlinked allocation for deferred destruction.
    ///
    /// # Safety
    ///
    /// - `ptr` must be an allocation that is no longer reachable from the
    ///   owning collection's roots and will not be enrolled again.
    /// - `dealloc` must be the matching deallocation routine for `ptr`.
    /// - The caller must hold an [`EpochGuard`] from this manager; that pins
    ///   an epoch at or before the current one, which keeps the current
    ///   epoch's garbage stack from being drained mid-push.
    pub unsafe fn add_garbage(&self, ptr: *mut (), dealloc: unsafe fn(*mut ()), bytes: usize) {
        let node = Box::into_raw(Box::new(GarbageNode {
            next: null_mut(),
            ptr,
            dealloc,
            bytes,
        }));
        let epoch = self.current_epoch.load(Ordering::Acquire);
        unsafe {
            let mut top = (*epoch).garbage.load(Ordering::Relaxed);
            loop {
                (*node).next = top;
                match (*epoch).garbage.compare_exchange_weak(
                    top,
                    node,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => top = actual,
                }
            }
        }
        self.pending_count.fetch_add(1, Ordering::Relaxed);
        self.pending_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Append a fresh epoch and publish it as current.
    pub fn advance(&self) {
        let fresh = Box::into_raw(Box::new(Epoch::new()));
        loop {
            let current = self.current_epoch.load(Ordering::Acquire);
            let next = unsafe { (*current).next.load(Ordering::Acquire) };
            if !next.is_null() {
                // A racing advance spliced but has not published yet.
                let _ = self.current_epoch.compare_exchange(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            let spliced = unsafe {
                (*current)
                    .next
                    .compare_exchange(null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            };
            if spliced {
                let _ = self.current_epoch.compare_exchange(
                    current,
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                trace!("epoch advanced");
                return;
            }
        }
    }

    /// Free the garbage of every drained epoch older than the current one.
    ///
    /// Reclamation is strictly ordered: the walk stops at the first epoch
    /// with a nonzero active count, leaving every later epoch untouched.
    pub fn reclaim(&self) {
        loop {
            let head = self.head_epoch.load(Ordering::Acquire);
            let current = self.current_epoch.load(Ordering::Acquire);
            if head == current {
                return;
            }
            unsafe {
                if (*head)
                    .active
                    .compare_exchange(0, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Oldest epoch still has readers, or another thread is
                    // already reclaiming it.
                    return;
                }
                let next = (*head).next.load(Ordering::Acquire);
                debug_assert!(!next.is_null(), "closed epoch must have a successor");
                let unlinked = self
                    .head_epoch
                    .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                debug_assert!(unlinked, "only the closing thread may unlink an epoch");
                let (count, bytes) = self.drain_garbage(head);
                if count > 0 {
                    self.pending_count.fetch_sub(count, Ordering::Relaxed);
                    self.pending_bytes.fetch_sub(bytes, Ordering::Relaxed);
                    debug!("reclaimed {count} nodes ({bytes} bytes)");
                }
                self.retire_epoch(head);
            }
        }
    }

    /// Advance the epoch, then reclaim whatever has drained.
    ///
    /// This is the only way old epochs retire.
    pub fn perform_gc(&self) {
        self.advance();
        self.reclaim();
    }

    /// Whether any enrolled garbage is still awaiting reclamation.
    pub fn needs_gc(&self) -> bool {
        self.pending_count.load(Ordering::Relaxed) > 0
    }

    /// Number of enrolled-but-not-yet-freed allocations.
    pub fn pending_garbage(&self) -> usize {
        self.pending_count.load(Ordering::Relaxed)
    }

    /// Bytes held by enrolled-but-not-yet-freed allocations.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Relaxed)
    }

    /// Length of the visible epoch chain (oldest through current).
    pub fn epoch_count(&self) -> usize {
        let mut count = 0;
        let mut epoch = self.head_epoch.load(Ordering::Acquire);
        while !epoch.is_null() {
            count += 1;
            epoch = unsafe { (*epoch).next.load(Ordering::Acquire) };
        }
        count
    }

    /// Pop and free every garbage record of `epoch`. Returns (count, bytes).
    unsafe fn drain_garbage(&self, epoch: *mut Epoch) -> (usize, usize) {
        let mut garbage = unsafe { (*epoch).garbage.swap(null_mut(), Ordering::AcqRel) };
        let mut count = 0;
        let mut bytes = 0;
        while !garbage.is_null() {
            unsafe {
                let record = Box::from_raw(garbage);
                garbage = record.next;
                (record.dealloc)(record.ptr);
                count += 1;
                bytes += record.bytes;
            }
        }
        (count, bytes)
    }

    /// Park a closed epoch record until the manager drops.
    unsafe fn retire_epoch(&self, epoch: *mut Epoch) {
        let mut top = self.retired.load(Ordering::Relaxed);
        loop {
            unsafe { (*epoch).next.store(top, Ordering::Relaxed) };
            match self
                .retired
                .compare_exchange_weak(top, epoch, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => top = actual,
            }
        }
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        // Exclusive access: every guard has been dropped, so all remaining
        // garbage is free to go regardless of epoch order.
        let mut epoch = self.head_epoch.load(Ordering::Relaxed);
        while !epoch.is_null() {
            unsafe {
                let active = (*epoch).active.load(Ordering::Relaxed);
                debug_assert!(
                    active == 0 || active == CLOSED,
                    "epoch dropped with {active} active readers"
                );
                self.drain_garbage(epoch);
                let next = (*epoch).next.load(Ordering::Relaxed);
                drop(Box::from_raw(epoch));
                epoch = next;
            }
        }
        let mut epoch = self.retired.load(Ordering::Relaxed);
        while !epoch.is_null() {
            unsafe {
                self.drain_garbage(epoch);
                let next = (*epoch).next.load(Ordering::Relaxed);
                drop(Box::from_raw(epoch));
                epoch = next;
            }
        }
    }
}

/// Keeps the joining reader's epoch registration alive.
///
/// Dropping the guard deregisters the reader. Node pointers observed under
/// the guard must not be dereferenced after it drops.
pub struct EpochGuard<'a> {
    manager: &'a EpochManager,
    epoch: *mut Epoch,
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.manager.leave(self.epoch);
    }
}
