//! An [`Allocator`] front end for a [`Heap`].
//!
//! The heap speaks in arena offsets and payload sizes; this translates to and
//! from pointers and `Layout`s:
//!
//! * Every payload is double-word aligned, so layouts that need more alignment
//!   than [`DOUBLE_WORD`] are refused rather than over-allocated.
//!
//! * Zero-sized layouts never touch the heap. They get a dangling, suitably
//!   aligned pointer, and deallocating one is a no-op.
//!
//! * Growing and shrinking go through [`Heap::reallocate`], so a block can
//!   grow in place by absorbing a free neighbor, and shrinking never moves or
//!   splits a block.
//!
//! * The returned slices always cover the block's full payload capacity.
//!
//! The heap is not thread-safe, so every operation runs with a user-provided
//! [`Lock`] held. The allocator is `Sync` exactly when the lock is.

use super::*;
use crate::layout::DOUBLE_WORD;

mod locked;
use locked::LockedHeap;
pub use locked::{Lock, SingleThreadedLock};

/// A shareable segregated-fit allocator over an arena of type `G`.
pub struct SegregatedAllocator<G, L>
where
    G: Arena,
    L: Lock,
{
    heap: LockedHeap<G, L>,
}

impl<G, L> SegregatedAllocator<G, L>
where
    G: Arena,
    L: Lock,
{
    /// Create a new allocator, bootstrapping a heap in the given arena.
    pub fn new(arena: G, lock: L) -> Result<Self, AllocError> {
        Ok(Self::from_heap(Heap::new(arena)?, lock))
    }

    /// Create a new allocator that hands out memory from an existing heap.
    pub const fn from_heap(heap: Heap<G>, lock: L) -> Self {
        SegregatedAllocator {
            heap: LockedHeap::new(heap, lock),
        }
    }

    /// Run `f` with exclusive access to the underlying heap.
    ///
    /// # Panics
    ///
    /// With a [`SingleThreadedLock`], panics if `f` uses this allocator
    /// again.
    pub fn with_heap<R>(&self, f: impl FnOnce(&mut Heap<G>) -> R) -> R {
        self.heap.with(f)
    }

    /// Check the underlying heap's invariants. See [`Heap::check`].
    pub fn check(&self) -> Result<HeapStats, HeapCheckError> {
        self.heap.with(|heap| heap.check())
    }

    /// Tear down this allocator, returning its heap.
    pub fn into_heap(self) -> Heap<G> {
        self.heap.into_heap()
    }

    /// The slice of the block at `addr` that we hand out to callers.
    fn block_slice(heap: &Heap<G>, addr: Addr) -> NonNull<[u8]> {
        NonNull::slice_from_raw_parts(heap.ptr(addr), heap.usable_size(addr))
    }

    /// The empty allocation for a zero-sized layout.
    fn dangling(layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = NonNull::new(layout.align() as *mut u8).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, 0))
    }

    #[inline]
    fn check_align(layout: Layout) -> Result<(), AllocError> {
        if layout.align() > DOUBLE_WORD {
            log::debug!("refusing {layout:?}: alignment exceeds {DOUBLE_WORD} bytes");
            return Err(AllocError);
        }
        Ok(())
    }

    /// Resize the allocation at `ptr` to fit `new_layout`.
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert_ne!(new_layout.size(), 0);
        self.heap.with_block(ptr, |heap, addr| {
            let new_addr = heap
                .reallocate(Some(addr), new_layout.size())?
                .ok_or(AllocError)?;
            Ok(Self::block_slice(heap, new_addr))
        })
    }
}

unsafe impl<G, L> Allocator for SegregatedAllocator<G, L>
where
    G: Arena,
    L: Lock,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        Self::check_align(layout)?;
        if layout.size() == 0 {
            return Self::dangling(layout);
        }

        self.heap.with(|heap| {
            let addr = heap.allocate(layout.size())?.ok_or(AllocError)?;
            Ok(Self::block_slice(heap, addr))
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }

        let _ = self.heap.with_block(ptr, |heap, addr| {
            heap.free(Some(addr));
            Ok(())
        });
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());
        Self::check_align(new_layout)?;
        if old_layout.size() == 0 {
            return self.allocate(new_layout);
        }
        self.reallocate(ptr, new_layout)
    }

    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());
        Self::check_align(new_layout)?;
        if old_layout.size() == 0 {
            return self.allocate_zeroed(new_layout);
        }

        let block = self.reallocate(ptr, new_layout)?;

        // Whether we grew in place or moved, the bytes past the old size are
        // whatever was there before.
        self.heap.with_block(block.cast(), |heap, addr| {
            heap.payload_mut(addr)[old_layout.size()..new_layout.size()].fill(0);
            Ok(block)
        })
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());
        Self::check_align(new_layout)?;
        if new_layout.size() == 0 {
            self.deallocate(ptr, old_layout);
            return Self::dangling(new_layout);
        }
        self.reallocate(ptr, new_layout)
    }
}

impl<G, L> core::fmt::Debug for SegregatedAllocator<G, L>
where
    G: Arena,
    L: Lock,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SegregatedAllocator").finish_non_exhaustive()
    }
}
