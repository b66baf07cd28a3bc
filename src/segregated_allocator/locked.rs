//! Exclusive access to a [`Heap`] shared behind `&self`.
//!
//! Every heap operation runs inside [`LockedHeap::with`] while the lock is
//! held, so no reference into the heap ever outlives its critical section.

use super::*;
use core::cell::{Cell, UnsafeCell};

/// Mutual exclusion for the heap behind a
/// [`SegregatedAllocator`][crate::SegregatedAllocator].
///
/// # Safety
///
/// * Between a `lock` and the matching `unlock`, no other `lock` may return.
///   If the implementation type is `Sync`, this must hold across threads.
///
/// * A `lock` that cannot succeed, including a re-entrant one from the thread
///   that already holds it, must panic, abort, or never return.
pub unsafe trait Lock {
    /// Acquire the lock.
    fn lock(&self);

    /// Release the lock. Only called after a matching `lock`.
    fn unlock(&self);
}

/// A [`Lock`] for allocators that are only used from one thread.
///
/// It is not `Sync`, so neither is an allocator using it. Locking it while it
/// is already held means an allocation re-entered the same allocator, which
/// panics.
#[derive(Debug, Default)]
pub struct SingleThreadedLock {
    held: Cell<bool>,
}

impl SingleThreadedLock {
    /// Construct a new, unheld `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            held: Cell::new(false),
        }
    }
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        if self.held.replace(true) {
            panic!("re-entrant heap access");
        }
    }

    #[inline]
    fn unlock(&self) {
        debug_assert!(self.held.get(), "unlocking a heap that is not locked");
        self.held.set(false);
    }
}

/// A heap and the lock that guards it.
pub(super) struct LockedHeap<G, L>
where
    G: Arena,
{
    lock: L,
    heap: UnsafeCell<Heap<G>>,
}

// Safety: the heap owns its arena outright, so it moves with the lock.
unsafe impl<G, L> Send for LockedHeap<G, L>
where
    G: Arena + Send,
    L: Send,
{
}

// Safety: `with` only hands out `&mut Heap<G>` while `lock` is held, and a
// `Sync` lock excludes other threads. The arena must be `Send` because that
// `&mut` can be used to swap the heap out from another thread.
unsafe impl<G, L> Sync for LockedHeap<G, L>
where
    G: Arena + Send,
    L: Lock + Sync,
{
}

/// Releases the lock when the critical section ends, even by unwinding.
struct Unlock<'a, L: Lock>(&'a L);

impl<L: Lock> Drop for Unlock<'_, L> {
    #[inline]
    fn drop(&mut self) {
        self.0.unlock();
    }
}

impl<G, L> LockedHeap<G, L>
where
    G: Arena,
    L: Lock,
{
    pub(super) const fn new(heap: Heap<G>, lock: L) -> Self {
        LockedHeap {
            lock,
            heap: UnsafeCell::new(heap),
        }
    }

    /// Run `f` on the heap with the lock held.
    #[inline]
    pub(super) fn with<R>(&self, f: impl FnOnce(&mut Heap<G>) -> R) -> R {
        self.lock.lock();
        let _unlock = Unlock(&self.lock);
        // Safety: we hold the lock, and the borrow cannot escape `f`.
        let heap = unsafe { &mut *self.heap.get() };
        f(heap)
    }

    /// Resolve `ptr` to one of our blocks and run `f` on it with the lock
    /// held. Fails if `ptr` does not point into the arena.
    pub(super) fn with_block<R>(
        &self,
        ptr: NonNull<u8>,
        f: impl FnOnce(&mut Heap<G>, Addr) -> Result<R, AllocError>,
    ) -> Result<R, AllocError> {
        self.with(|heap| {
            let addr = heap.addr(ptr);
            debug_assert!(addr.is_some(), "{ptr:p} was not allocated by this heap");
            f(heap, addr.ok_or(AllocError)?)
        })
    }

    pub(super) fn into_heap(self) -> Heap<G> {
        self.heap.into_inner()
    }
}
