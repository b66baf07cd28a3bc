//! Heap walking and consistency checking.
//!
//! None of this is needed for allocation to work; it exists so that tests and
//! fuzzers can assert that the heap's invariants hold after every operation.

use super::*;
use crate::free_list::{next_free, prev_free};
use crate::layout::{footer, header, next_block, Tag, DOUBLE_WORD, MIN_BLOCK_SIZE, WORD};
use crate::size_class::{size_class, NUM_SIZE_CLASSES};
use core::fmt;

/// What a block is currently used for.
///
/// A free block's payload holds its free-list links; an allocated block's
/// payload belongs to whoever allocated it and is never interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// The block has been handed out.
    Allocated,
    /// The block is in a free list.
    Free {
        /// The next block in the same free list.
        next: Option<Addr>,
        /// The previous block in the same free list.
        prev: Option<Addr>,
    },
}

/// A block found by walking the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// The block's payload address.
    pub addr: Addr,
    /// The block's total size, including header and footer.
    pub size: usize,
    /// Whether the block is allocated or free.
    pub state: BlockState,
}

impl BlockInfo {
    /// Is this block free?
    #[inline]
    pub fn is_free(&self) -> bool {
        matches!(self.state, BlockState::Free { .. })
    }
}

/// An iterator over every block between the prologue and the epilogue, in
/// address order.
pub struct Blocks<'a> {
    mem: &'a [u8],
    cursor: usize,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let bp = self.cursor;
        let tag = Tag::read(self.mem, header(bp));
        if tag.size() == 0 {
            return None;
        }
        self.cursor = bp + tag.size();

        let state = if tag.is_allocated() {
            BlockState::Allocated
        } else {
            BlockState::Free {
                next: next_free(self.mem, bp).and_then(Addr::from_offset),
                prev: prev_free(self.mem, bp).and_then(Addr::from_offset),
            }
        };
        Some(BlockInfo {
            addr: Addr::from_offset(bp)?,
            size: tag.size(),
            state,
        })
    }
}

/// Summary statistics gathered by a successful [`Heap::check`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// The arena's total length, sentinels included.
    pub arena_len: usize,
    /// The number of allocated blocks.
    pub allocated_blocks: usize,
    /// The total size of all allocated blocks.
    pub allocated_bytes: usize,
    /// The number of free blocks.
    pub free_blocks: usize,
    /// The total size of all free blocks.
    pub free_bytes: usize,
}

/// An inconsistency found by [`Heap::check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapCheckError {
    /// The prologue is not an allocated, double-word sized block.
    BadPrologue,
    /// The heap walk did not end in an allocated, zero-sized epilogue at the
    /// very end of the arena.
    BadEpilogue {
        /// Where the walk expected the epilogue's payload.
        offset: usize,
    },
    /// A payload is not double-word aligned.
    Misaligned {
        /// The offending payload offset.
        offset: usize,
    },
    /// A block is smaller than the minimum block size.
    Undersized {
        /// The offending payload offset.
        offset: usize,
        /// Its size.
        size: usize,
    },
    /// A block extends past the end of the arena.
    OutOfBounds {
        /// The offending payload offset.
        offset: usize,
    },
    /// A block's header and footer disagree.
    TagMismatch {
        /// The offending payload offset.
        offset: usize,
    },
    /// Two free blocks sit next to each other without having been coalesced.
    AdjacentFree {
        /// The second of the two free blocks.
        offset: usize,
    },
    /// A free list contains a block that is marked allocated.
    AllocatedInFreeList {
        /// The free list's size class.
        class: usize,
        /// The offending payload offset.
        offset: usize,
    },
    /// A free list contains a block that belongs to a different size class.
    WrongSizeClass {
        /// The free list's size class.
        class: usize,
        /// The offending payload offset.
        offset: usize,
    },
    /// A free list's links are inconsistent or point outside the heap.
    BrokenLink {
        /// The free list's size class.
        class: usize,
        /// The block whose links are broken.
        offset: usize,
    },
    /// The number of free blocks in the heap differs from the number of
    /// blocks in the free lists.
    UnlistedFreeBlocks {
        /// Free blocks found by walking the heap.
        walked: usize,
        /// Blocks found by walking the free lists.
        listed: usize,
    },
}

impl fmt::Display for HeapCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HeapCheckError::BadPrologue => write!(f, "bad prologue header"),
            HeapCheckError::BadEpilogue { offset } => {
                write!(f, "bad epilogue header at {offset:#x}")
            }
            HeapCheckError::Misaligned { offset } => {
                write!(f, "{offset:#x} is not doubleword aligned")
            }
            HeapCheckError::Undersized { offset, size } => {
                write!(f, "block at {offset:#x} has undersized length {size}")
            }
            HeapCheckError::OutOfBounds { offset } => {
                write!(f, "block at {offset:#x} extends past the end of the arena")
            }
            HeapCheckError::TagMismatch { offset } => {
                write!(f, "header does not match footer at {offset:#x}")
            }
            HeapCheckError::AdjacentFree { offset } => {
                write!(f, "free block at {offset:#x} follows another free block")
            }
            HeapCheckError::AllocatedInFreeList { class, offset } => {
                write!(f, "found allocated block {offset:#x} in free list {class}")
            }
            HeapCheckError::WrongSizeClass { class, offset } => {
                write!(f, "block {offset:#x} is filed in the wrong free list {class}")
            }
            HeapCheckError::BrokenLink { class, offset } => {
                write!(f, "broken link at {offset:#x} in free list {class}")
            }
            HeapCheckError::UnlistedFreeBlocks { walked, listed } => write!(
                f,
                "heap has {walked} free blocks but the free lists hold {listed}"
            ),
        }
    }
}

impl<G> Heap<G>
where
    G: Arena,
{
    /// Iterate over every block in the heap, in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        let mem = self.mem();
        Blocks {
            mem,
            cursor: next_block(mem, self.prologue()),
        }
    }

    /// Iterate over the members of the given size class's free list.
    ///
    /// # Panics
    ///
    /// Panics if `class` is not less than
    /// [`NUM_SIZE_CLASSES`][crate::NUM_SIZE_CLASSES].
    pub fn free_list(&self, class: usize) -> impl Iterator<Item = Addr> + '_ {
        self.free_lists()
            .iter(self.mem(), class)
            .filter_map(Addr::from_offset)
    }

    /// Check the heap's invariants, returning statistics about it if they all
    /// hold.
    ///
    /// This walks every free list and every block, so it is linear in the
    /// size of the heap.
    pub fn check(&self) -> Result<HeapStats, HeapCheckError> {
        let listed = self.check_free_lists()?;
        let stats = self.check_blocks()?;
        if stats.free_blocks != listed {
            return Err(HeapCheckError::UnlistedFreeBlocks {
                walked: stats.free_blocks,
                listed,
            });
        }
        Ok(stats)
    }

    /// Whether `bp` could be the payload offset of a block in this heap.
    fn in_heap(&self, bp: usize) -> bool {
        let mem = self.mem();
        bp > self.prologue() && bp % DOUBLE_WORD == 0 && bp + DOUBLE_WORD <= mem.len()
    }

    /// Check every free list, returning how many blocks they hold in total.
    fn check_free_lists(&self) -> Result<usize, HeapCheckError> {
        let mem = self.mem();
        let max_blocks = mem.len() / MIN_BLOCK_SIZE;
        let mut listed = 0;

        for class in 0..NUM_SIZE_CLASSES {
            let mut prev = None;
            let mut cursor = self.free_lists().head(class);

            while let Some(bp) = cursor {
                if !self.in_heap(bp) || listed > max_blocks {
                    return Err(HeapCheckError::BrokenLink {
                        class,
                        offset: prev.unwrap_or(0),
                    });
                }

                let tag = Tag::read(mem, header(bp));
                if tag.is_allocated() {
                    return Err(HeapCheckError::AllocatedInFreeList { class, offset: bp });
                }
                if size_class(tag.size()) != class {
                    return Err(HeapCheckError::WrongSizeClass { class, offset: bp });
                }
                if prev_free(mem, bp) != prev {
                    return Err(HeapCheckError::BrokenLink { class, offset: bp });
                }

                listed += 1;
                prev = Some(bp);
                cursor = next_free(mem, bp);
            }
        }

        Ok(listed)
    }

    /// Walk the heap from prologue to epilogue, checking every block.
    fn check_blocks(&self) -> Result<HeapStats, HeapCheckError> {
        let mem = self.mem();
        let prologue = self.prologue();

        let tag = Tag::read(mem, header(prologue));
        if tag != Tag::new(DOUBLE_WORD, true) || Tag::read(mem, prologue) != tag {
            return Err(HeapCheckError::BadPrologue);
        }

        let mut stats = HeapStats {
            arena_len: mem.len(),
            ..HeapStats::default()
        };
        let mut prev_free = false;
        let mut bp = next_block(mem, prologue);

        loop {
            if header(bp) + WORD > mem.len() {
                return Err(HeapCheckError::BadEpilogue { offset: bp });
            }
            let tag = Tag::read(mem, header(bp));

            if tag.size() == 0 {
                if !tag.is_allocated() || header(bp) + WORD != mem.len() {
                    return Err(HeapCheckError::BadEpilogue { offset: bp });
                }
                return Ok(stats);
            }

            if bp % DOUBLE_WORD != 0 {
                return Err(HeapCheckError::Misaligned { offset: bp });
            }
            if tag.size() < MIN_BLOCK_SIZE {
                return Err(HeapCheckError::Undersized {
                    offset: bp,
                    size: tag.size(),
                });
            }
            // The footer must fit, and so must the next block's header.
            if bp + tag.size() > mem.len() {
                return Err(HeapCheckError::OutOfBounds { offset: bp });
            }
            if Tag::read(mem, footer(mem, bp)) != tag {
                return Err(HeapCheckError::TagMismatch { offset: bp });
            }

            if tag.is_allocated() {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += tag.size();
                prev_free = false;
            } else {
                if prev_free {
                    return Err(HeapCheckError::AdjacentFree { offset: bp });
                }
                stats.free_blocks += 1;
                stats.free_bytes += tag.size();
                prev_free = true;
            }

            bp += tag.size();
        }
    }

    /// Log every block in the heap at debug level, sentinels included.
    pub fn log_blocks(&self) {
        let mem = self.mem();
        log::debug!("heap ({} bytes):", mem.len());

        let mut bp = self.prologue();
        loop {
            let tag = Tag::read(mem, header(bp));
            if tag.size() == 0 {
                log::debug!("{bp:#x}: end of heap");
                return;
            }
            let footer_tag = Tag::read(mem, footer(mem, bp));
            log::debug!("{bp:#x}: header: {tag:?} footer: {footer_tag:?}");
            bp += tag.size();
        }
    }
}
