//! The heap: segregated free lists, fit search, splitting, coalescing, and
//! reallocation over a single [`Arena`].
//!
//! The arena is laid out as an alignment pad, an allocated prologue block
//! that is nothing but a header and footer, the blocks proper, and finally a
//! zero-sized allocated epilogue header:
//!
//! ```text
//! +-----+----------+----------+---------+---------+-- ... --+----------+
//! | pad | pro. hdr | pro. ftr | block 0 | block 1 |   ...   | epi. hdr |
//! +-----+----------+----------+---------+---------+-- ... --+----------+
//! ```
//!
//! The two sentinels mean every real block has a readable neighbor on both
//! sides, and that neighbor is marked allocated at the edges, so coalescing
//! never needs to special-case the ends of the arena.
//!
//! Allocation uses a hybrid first- and best-fit search: starting at the size
//! class of the request, we move to larger and larger classes until one of
//! them holds any block that fits, and take the tightest fit from that class
//! alone.

use super::*;
use crate::free_list::FreeLists;
use crate::layout::{
    adjusted_size, block_size, header, is_allocated, next_block, prev_block, round_up, set_tags,
    write_word, Tag, CHUNK_SIZE, DOUBLE_WORD, MIN_BLOCK_SIZE, OVERHEAD, WORD,
};
use crate::size_class::{size_class, NUM_SIZE_CLASSES};
use core::num::NonZeroUsize;

/// The address of an allocated block's payload: its offset from the start of
/// the arena.
///
/// Offset zero is the arena's alignment pad and never a payload, so the
/// absence of an address is `Option::<Addr>::None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(NonZeroUsize);

impl Addr {
    #[inline]
    pub(crate) fn from_offset(offset: usize) -> Option<Self> {
        NonZeroUsize::new(offset).map(Addr)
    }

    /// The payload's offset from the start of the arena.
    #[inline]
    pub fn offset(self) -> usize {
        self.0.get()
    }
}

/// Where a block being placed came from.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Found by the fit search; still linked into its free list.
    FreeList,
    /// Just carved out of the arena by growing it; not in any list.
    Grown,
}

/// A segregated-fit heap with boundary-tag coalescing, managing the memory of
/// an arena of type `G`.
///
/// This type is single-threaded; see
/// [`SegregatedAllocator`][crate::SegregatedAllocator] for a front end that
/// can be shared.
pub struct Heap<G>
where
    G: Arena,
{
    /// The memory we manage.
    arena: G,

    /// Heads of the free list of every size class.
    free_lists: FreeLists,

    /// The payload offset of the prologue block.
    prologue: usize,
}

impl<G> Heap<G>
where
    G: Arena,
{
    /// Create a new, empty heap in the given arena.
    ///
    /// Grows the arena just enough to hold the alignment pad and the prologue
    /// and epilogue sentinels. The first allocation grows it further.
    pub fn new(mut arena: G) -> Result<Self, AllocError> {
        let start = arena.grow(4 * WORD)?;
        debug_assert_eq!(start % DOUBLE_WORD, 0, "arena start {start:#x} is misaligned");

        let mem = arena.as_mut_slice();
        write_word(mem, start, 0);
        let prologue = start + DOUBLE_WORD;
        set_tags(mem, prologue, DOUBLE_WORD, true);
        Tag::new(0, true).write(mem, header(prologue + DOUBLE_WORD));

        log::trace!("bootstrapped heap with prologue at {prologue:#x}");
        Ok(Heap {
            arena,
            free_lists: FreeLists::new(),
            prologue,
        })
    }

    /// Get a shared reference to the underlying arena.
    #[inline]
    pub fn arena(&self) -> &G {
        &self.arena
    }

    /// Tear down this heap, returning its arena.
    #[inline]
    pub fn into_arena(self) -> G {
        self.arena
    }

    #[inline]
    pub(crate) fn prologue(&self) -> usize {
        self.prologue
    }

    #[inline]
    pub(crate) fn free_lists(&self) -> &FreeLists {
        &self.free_lists
    }

    #[inline]
    pub(crate) fn mem(&self) -> &[u8] {
        self.arena.as_slice()
    }

    /// Allocate a block with room for at least `size` bytes of payload.
    ///
    /// Returns `Ok(None)` for a zero-sized request and `Err(AllocError)` when
    /// the arena cannot grow enough to satisfy it.
    pub fn allocate(&mut self, size: usize) -> Result<Option<Addr>, AllocError> {
        if size == 0 {
            return Ok(None);
        }

        let asize = adjusted_size(size).ok_or(AllocError)?;

        if let Some(bp) = self.find_fit(asize) {
            self.place(bp, asize, Origin::FreeList);
            return Ok(Addr::from_offset(bp));
        }

        let bp = self.extend(asize.max(CHUNK_SIZE))?;
        self.place(bp, asize, Origin::Grown);
        Ok(Addr::from_offset(bp))
    }

    /// Free the block at `addr`, merging it with any free neighbors.
    ///
    /// Freeing `None` does nothing. `addr` must have come from this heap and
    /// must not have been freed already.
    pub fn free(&mut self, addr: Option<Addr>) {
        let Some(addr) = addr else {
            return;
        };
        let bp = addr.offset();
        let mem = self.arena.as_mut_slice();
        debug_assert!(bp < mem.len(), "{bp:#x} is outside the arena");
        debug_assert!(is_allocated(mem, bp), "double free of {bp:#x}");

        let size = block_size(mem, bp);
        set_tags(mem, bp, size, false);
        self.coalesce(bp);
    }

    /// Resize the block at `addr` to hold at least `size` bytes of payload.
    ///
    /// * A zero `size` frees the block and returns `Ok(None)`.
    /// * A `None` address allocates a fresh block.
    /// * If the block's payload already fits `size`, the block is returned
    ///   unchanged. Shrinking never splits off the unused tail.
    /// * If the next block is free and the two together fit `size`, the block
    ///   absorbs its neighbor in place.
    /// * Otherwise the contents move to a new block and the old one is freed.
    ///   If that allocation fails, the old block is left untouched.
    pub fn reallocate(
        &mut self,
        addr: Option<Addr>,
        size: usize,
    ) -> Result<Option<Addr>, AllocError> {
        if size == 0 {
            self.free(addr);
            return Ok(None);
        }
        let Some(addr) = addr else {
            return self.allocate(size);
        };

        let bp = addr.offset();
        let Heap {
            arena, free_lists, ..
        } = self;
        let mem = arena.as_mut_slice();
        debug_assert!(is_allocated(mem, bp), "reallocating free block {bp:#x}");

        let current = block_size(mem, bp);
        if size <= current - OVERHEAD {
            return Ok(Some(addr));
        }

        let next = next_block(mem, bp);
        if !is_allocated(mem, next) {
            let combined = current + block_size(mem, next);
            if size <= combined - OVERHEAD {
                log::trace!("growing {bp:#x} in place from {current} to {combined} bytes");
                free_lists.remove(mem, next);
                set_tags(mem, bp, combined, true);
                return Ok(Some(addr));
            }
        }

        let new = self.allocate(size)?.ok_or(AllocError)?;
        let len = core::cmp::min(current - OVERHEAD, size);
        self.arena
            .as_mut_slice()
            .copy_within(bp..bp + len, new.offset());
        self.free(Some(addr));
        Ok(Some(new))
    }

    /// The payload of the allocated block at `addr`.
    ///
    /// Its length is the block's full payload capacity, which may exceed the
    /// size that was requested.
    #[inline]
    pub fn payload(&self, addr: Addr) -> &[u8] {
        let mem = self.mem();
        let bp = addr.offset();
        &mem[bp..bp + block_size(mem, bp) - OVERHEAD]
    }

    /// The payload of the allocated block at `addr`, mutably.
    #[inline]
    pub fn payload_mut(&mut self, addr: Addr) -> &mut [u8] {
        let mem = self.arena.as_mut_slice();
        let bp = addr.offset();
        let end = bp + block_size(mem, bp) - OVERHEAD;
        &mut mem[bp..end]
    }

    /// The total size of the block at `addr`, including its header and
    /// footer.
    #[inline]
    pub fn block_size(&self, addr: Addr) -> usize {
        block_size(self.mem(), addr.offset())
    }

    /// How many payload bytes the block at `addr` can hold.
    #[inline]
    pub fn usable_size(&self, addr: Addr) -> usize {
        self.block_size(addr) - OVERHEAD
    }

    /// Convert `addr` into a pointer into the arena.
    #[inline]
    pub fn ptr(&self, addr: Addr) -> NonNull<u8> {
        debug_assert!(addr.offset() < self.arena.len());
        // Safety: the offset is within the arena, and the arena's base is
        // non-null.
        unsafe { self.arena.base().add(addr.offset()) }
    }

    /// Convert a pointer previously produced by [`Heap::ptr`] back into an
    /// address.
    #[inline]
    pub fn addr(&self, ptr: NonNull<u8>) -> Option<Addr> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.arena.base().as_ptr() as usize)?;
        if offset >= self.arena.len() {
            return None;
        }
        Addr::from_offset(offset)
    }

    /// Grow the arena by at least `bytes` bytes and turn the new region into a
    /// single free block, followed by a fresh epilogue.
    ///
    /// The new block is not inserted into any free list.
    fn extend(&mut self, bytes: usize) -> Result<usize, AllocError> {
        let size = round_up(bytes).ok_or(AllocError)?;

        // The new region starts right after the old epilogue header, which
        // becomes the new block's header.
        let bp = self.arena.grow(size)?;
        let mem = self.arena.as_mut_slice();
        set_tags(mem, bp, size, false);
        Tag::new(0, true).write(mem, header(next_block(mem, bp)));

        log::trace!("extended heap with a free block of {size} bytes at {bp:#x}");
        Ok(bp)
    }

    /// Find a free block of at least `asize` bytes.
    ///
    /// Scans size classes upward from `asize`'s own class. The first class
    /// that contains any fitting block wins, and within it the block with the
    /// least slack is chosen (the earliest one on ties).
    fn find_fit(&self, asize: usize) -> Option<usize> {
        let mem = self.mem();
        (size_class(asize)..NUM_SIZE_CLASSES).find_map(|class| {
            self.free_lists
                .iter(mem, class)
                .inspect(|&bp| debug_assert!(!is_allocated(mem, bp)))
                .filter(|&bp| block_size(mem, bp) >= asize)
                .min_by_key(|&bp| block_size(mem, bp) - asize)
        })
    }

    /// Mark `asize` bytes at the start of the free block at `bp` as allocated,
    /// splitting off the rest as a new free block if it is big enough to be
    /// one.
    fn place(&mut self, bp: usize, asize: usize, origin: Origin) {
        let Heap {
            arena, free_lists, ..
        } = self;
        let mem = arena.as_mut_slice();
        let bsize = block_size(mem, bp);
        debug_assert!(bsize >= asize);

        // Unlink while the header still has the old size, so we look in the
        // right class.
        if origin == Origin::FreeList {
            free_lists.remove(mem, bp);
        }

        let remainder = bsize - asize;
        if remainder >= MIN_BLOCK_SIZE {
            set_tags(mem, bp, asize, true);
            let rest = next_block(mem, bp);
            set_tags(mem, rest, remainder, false);
            free_lists.insert(mem, rest);
            log::trace!("placed {asize} bytes at {bp:#x}, split off {remainder} at {rest:#x}");
        } else {
            set_tags(mem, bp, bsize, true);
            log::trace!("placed {asize} bytes at {bp:#x} in a {bsize} byte block");
        }
    }

    /// Merge the newly freed block at `bp` with whichever of its neighbors are
    /// free, and file the result in its free list. Returns the merged block.
    fn coalesce(&mut self, bp: usize) -> usize {
        let Heap {
            arena, free_lists, ..
        } = self;
        let mem = arena.as_mut_slice();

        let prev_allocated = Tag::read(mem, bp - DOUBLE_WORD).is_allocated();
        let next = next_block(mem, bp);
        let next_allocated = is_allocated(mem, next);
        let freed = block_size(mem, bp);
        let mut size = freed;

        let merged = match (prev_allocated, next_allocated) {
            (true, true) => bp,
            (false, true) => {
                let prev = prev_block(mem, bp);
                free_lists.remove(mem, prev);
                size += block_size(mem, prev);
                prev
            }
            (true, false) => {
                free_lists.remove(mem, next);
                size += block_size(mem, next);
                bp
            }
            (false, false) => {
                let prev = prev_block(mem, bp);
                free_lists.remove(mem, prev);
                free_lists.remove(mem, next);
                size += block_size(mem, prev) + block_size(mem, next);
                prev
            }
        };

        set_tags(mem, merged, size, false);
        free_lists.insert(mem, merged);
        if size != freed {
            log::trace!("coalesced {bp:#x} into a {size} byte free block at {merged:#x}");
        }
        merged
    }
}

impl<G> core::fmt::Debug for Heap<G>
where
    G: Arena,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("arena_len", &self.arena.len())
            .field("prologue", &self.prologue)
            .field("free_lists", &self.free_lists)
            .finish()
    }
}
