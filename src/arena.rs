//! The arena: a single contiguous region of memory that only ever grows at
//! its end.
//!
//! The heap consumes exactly one operation from it, [`Arena::grow`]. Offsets
//! handed out by the heap are relative to the arena's base, so the base must
//! never move once memory has been handed out.

use super::*;
use crate::layout::DOUBLE_WORD;

/// A contiguous, growable region of memory that a [`Heap`][crate::Heap]
/// manages.
///
/// # Safety
///
/// * [`base`][Arena::base] must be aligned to [`DOUBLE_WORD`] and must stay
///   the same for the lifetime of the arena.
///
/// * The first [`len`][Arena::len] bytes starting at `base` must be
///   initialized, valid for reads and writes, and not accessed by anything
///   other than the owner of this arena.
///
/// * `grow` must never shrink or move the existing region.
pub unsafe trait Arena {
    /// Extend the arena by `bytes` bytes.
    ///
    /// On success, returns the offset at which the new region begins, which is
    /// always the old length. Fails when no more address space is available,
    /// leaving the arena unchanged.
    fn grow(&mut self, bytes: usize) -> Result<usize, AllocError>;

    /// The current length of the arena in bytes.
    fn len(&self) -> usize;

    /// Whether the arena has not been grown yet.
    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A pointer to the start of the arena.
    fn base(&self) -> NonNull<u8>;

    /// The arena's memory.
    #[inline]
    fn as_slice(&self) -> &[u8] {
        // Safety: upheld by the trait's implementation contract.
        unsafe { core::slice::from_raw_parts(self.base().as_ptr().cast_const(), self.len()) }
    }

    /// The arena's memory, mutably.
    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: upheld by the trait's implementation contract, and we have
        // exclusive access to the arena.
        unsafe { core::slice::from_raw_parts_mut(self.base().as_ptr(), self.len()) }
    }
}

/// An [`Arena`] backed by a fixed-capacity reservation from an inner
/// allocator.
///
/// The whole capacity is reserved (and zeroed) up front; growing just moves
/// the break forward until the capacity is exhausted. The reservation is
/// returned to the inner allocator on drop.
pub struct FixedArena<A>
where
    A: Allocator,
{
    /// The underlying allocator the reservation came from.
    inner: A,

    /// The start of the reservation.
    base: NonNull<u8>,

    /// The size of the reservation.
    capacity: usize,

    /// The current end of the arena; everything before it has been handed
    /// out by `grow`.
    brk: usize,
}

// Safety: the arena exclusively owns its reservation.
unsafe impl<A> Send for FixedArena<A> where A: Allocator + Send {}

impl<A> FixedArena<A>
where
    A: Allocator,
{
    /// Reserve `capacity` bytes from `inner` for a new, empty arena.
    pub fn new(inner: A, capacity: usize) -> Result<Self, AllocError> {
        let layout = Self::reservation_layout(capacity)?;
        let reservation = inner.allocate_zeroed(layout)?;
        Ok(FixedArena {
            inner,
            base: reservation.cast(),
            capacity,
            brk: 0,
        })
    }

    fn reservation_layout(capacity: usize) -> Result<Layout, AllocError> {
        // Zero-sized reservations are not ours to hand to the inner allocator.
        Layout::from_size_align(capacity.max(DOUBLE_WORD), DOUBLE_WORD).map_err(|_| AllocError)
    }

    /// The maximum length this arena can grow to.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many more bytes can be handed out before the arena is exhausted.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.brk
    }

    /// Get a shared reference to the inner allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }
}

// Safety: the reservation is aligned to `DOUBLE_WORD`, zero-initialized,
// exclusively owned, never moves, and `brk` only increases.
unsafe impl<A> Arena for FixedArena<A>
where
    A: Allocator,
{
    fn grow(&mut self, bytes: usize) -> Result<usize, AllocError> {
        if bytes > self.remaining() {
            log::debug!(
                "arena exhausted: requested {bytes} bytes with {} of {} remaining",
                self.remaining(),
                self.capacity
            );
            return Err(AllocError);
        }
        let old_brk = self.brk;
        self.brk += bytes;
        log::trace!("arena grew by {bytes} bytes to {}", self.brk);
        Ok(old_brk)
    }

    #[inline]
    fn len(&self) -> usize {
        self.brk
    }

    #[inline]
    fn base(&self) -> NonNull<u8> {
        self.base
    }
}

impl<A> Drop for FixedArena<A>
where
    A: Allocator,
{
    fn drop(&mut self) {
        if let Ok(layout) = Self::reservation_layout(self.capacity) {
            // Safety: the reservation was allocated from `self.inner` with
            // this same layout and nothing references it after we are gone.
            unsafe { self.inner.deallocate(self.base, layout) };
        }
    }
}

impl<A> core::fmt::Debug for FixedArena<A>
where
    A: Allocator,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FixedArena")
            .field("base", &self.base)
            .field("len", &self.brk)
            .field("capacity", &self.capacity)
            .finish()
    }
}
