//! Segregated, doubly-linked free lists threaded through the payloads of the
//! free blocks themselves.
//!
//! While a block is free, the first word of its payload holds the offset of
//! the next block in its list and the second word holds the offset of the
//! previous one. Zero means "none": offset zero is the arena's alignment pad
//! and is never a payload. Once a block is allocated those words belong to the
//! caller and are never read here again.

use crate::layout::{block_size, is_allocated, read_word, write_word, WORD};
use crate::size_class::{size_class, NUM_SIZE_CLASSES};

const NIL: usize = 0;

#[inline]
fn to_link(bp: Option<usize>) -> usize {
    bp.unwrap_or(NIL)
}

#[inline]
fn from_link(word: usize) -> Option<usize> {
    (word != NIL).then_some(word)
}

/// The next free block after the free block at `bp`.
#[inline]
pub(crate) fn next_free(mem: &[u8], bp: usize) -> Option<usize> {
    from_link(read_word(mem, bp))
}

/// The free block before the free block at `bp`.
#[inline]
pub(crate) fn prev_free(mem: &[u8], bp: usize) -> Option<usize> {
    from_link(read_word(mem, bp + WORD))
}

#[inline]
fn set_next_free(mem: &mut [u8], bp: usize, next: Option<usize>) {
    write_word(mem, bp, to_link(next));
}

#[inline]
fn set_prev_free(mem: &mut [u8], bp: usize, prev: Option<usize>) {
    write_word(mem, bp + WORD, to_link(prev));
}

/// The heads of every size class's free list.
#[derive(Debug)]
pub(crate) struct FreeLists {
    heads: [Option<usize>; NUM_SIZE_CLASSES],
}

impl FreeLists {
    pub(crate) const fn new() -> Self {
        FreeLists {
            heads: [None; NUM_SIZE_CLASSES],
        }
    }

    #[inline]
    pub(crate) fn head(&self, class: usize) -> Option<usize> {
        self.heads[class]
    }

    /// Push the free block at `bp` onto the front of its size class's list.
    ///
    /// The block's tags must already describe its final size.
    pub(crate) fn insert(&mut self, mem: &mut [u8], bp: usize) {
        debug_assert!(!is_allocated(mem, bp), "inserting allocated block {bp:#x}");

        let class = size_class(block_size(mem, bp));
        let head = self.heads[class];
        set_next_free(mem, bp, head);
        set_prev_free(mem, bp, None);
        if let Some(head) = head {
            set_prev_free(mem, head, Some(bp));
        }
        self.heads[class] = Some(bp);
    }

    /// Unlink the free block at `bp` from its size class's list.
    ///
    /// The block's tags must still describe the size it was inserted with.
    pub(crate) fn remove(&mut self, mem: &mut [u8], bp: usize) {
        let class = size_class(block_size(mem, bp));
        let next = next_free(mem, bp);
        let prev = prev_free(mem, bp);

        match prev {
            Some(prev) => set_next_free(mem, prev, next),
            None => {
                debug_assert_eq!(self.heads[class], Some(bp));
                self.heads[class] = next;
            }
        }
        if let Some(next) = next {
            set_prev_free(mem, next, prev);
        }
    }

    /// Iterate over the blocks in the given size class's list, front to back.
    pub(crate) fn iter<'a>(&self, mem: &'a [u8], class: usize) -> FreeListIter<'a> {
        FreeListIter {
            mem,
            cursor: self.heads[class],
        }
    }
}

/// An iterator over the payload offsets of one free list.
pub(crate) struct FreeListIter<'a> {
    mem: &'a [u8],
    cursor: Option<usize>,
}

impl Iterator for FreeListIter<'_> {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        let bp = self.cursor?;
        self.cursor = next_free(self.mem, bp);
        Some(bp)
    }
}
