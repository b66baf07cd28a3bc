//! Block layout: boundary tags and the offset arithmetic between a block's
//! payload, its header and footer, and its neighbors.
//!
//! Every block in the arena looks like this, where `bp` is the payload offset
//! handed out to callers:
//!
//! ```text
//!            bp - WORD        bp                          bp + size - DOUBLE_WORD
//!                |            |                                       |
//!   ... ---------+------------+----------------- ... -----------------+-----------+--- ...
//!                |   header   |  payload (or next / prev links)       |   footer  |
//!   ... ---------+------------+----------------- ... -----------------+-----------+--- ...
//!                 <-------------------------- size ------------------------------->
//! ```
//!
//! Header and footer hold the same [`Tag`]: the block's total size with the
//! allocated flag packed into the low bit.

use core::mem;

/// The size of a word, in bytes. Tags and free-list links are one word each.
pub const WORD: usize = mem::size_of::<usize>();

/// The size of a double word, in bytes. Every block size and every payload
/// offset is a multiple of this.
pub const DOUBLE_WORD: usize = 2 * WORD;

/// Header plus footer.
pub const OVERHEAD: usize = DOUBLE_WORD;

/// The smallest block we ever create: header, footer, and the two free-list
/// link words.
pub const MIN_BLOCK_SIZE: usize = 2 * DOUBLE_WORD;

/// The minimum number of bytes to request from the arena when no free block
/// fits an allocation.
pub const CHUNK_SIZE: usize = 1 << 12;

const ALLOCATED_BIT: usize = 0x1;
const SIZE_MASK: usize = !(DOUBLE_WORD - 1);

/// A boundary tag: a block size and an allocated flag packed into one word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag(usize);

impl Tag {
    #[inline]
    pub(crate) fn new(size: usize, allocated: bool) -> Self {
        debug_assert_eq!(size % DOUBLE_WORD, 0, "block size {size} is not aligned");
        Tag(size | if allocated { ALLOCATED_BIT } else { 0 })
    }

    #[inline]
    pub(crate) fn size(self) -> usize {
        self.0 & SIZE_MASK
    }

    #[inline]
    pub(crate) fn is_allocated(self) -> bool {
        self.0 & ALLOCATED_BIT != 0
    }

    #[inline]
    pub(crate) fn read(mem: &[u8], at: usize) -> Self {
        Tag(read_word(mem, at))
    }

    #[inline]
    pub(crate) fn write(self, mem: &mut [u8], at: usize) {
        write_word(mem, at, self.0);
    }
}

impl core::fmt::Debug for Tag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = if self.is_allocated() { 'a' } else { 'f' };
        write!(f, "[{}:{state}]", self.size())
    }
}

/// Read the word at offset `at`.
#[inline]
pub(crate) fn read_word(mem: &[u8], at: usize) -> usize {
    let mut bytes = [0; WORD];
    bytes.copy_from_slice(&mem[at..at + WORD]);
    usize::from_ne_bytes(bytes)
}

/// Write `value` to the word at offset `at`.
#[inline]
pub(crate) fn write_word(mem: &mut [u8], at: usize, value: usize) {
    mem[at..at + WORD].copy_from_slice(&value.to_ne_bytes());
}

/// The offset of the header of the block whose payload begins at `bp`.
#[inline]
pub(crate) fn header(bp: usize) -> usize {
    bp - WORD
}

/// The offset of the footer of the block whose payload begins at `bp`.
///
/// Reads the size from the block's header, so the header must already be
/// up to date.
#[inline]
pub(crate) fn footer(mem: &[u8], bp: usize) -> usize {
    bp + block_size(mem, bp) - DOUBLE_WORD
}

/// The size recorded in the header of the block at `bp`.
#[inline]
pub(crate) fn block_size(mem: &[u8], bp: usize) -> usize {
    Tag::read(mem, header(bp)).size()
}

/// Whether the header of the block at `bp` says it is allocated.
#[inline]
pub(crate) fn is_allocated(mem: &[u8], bp: usize) -> bool {
    Tag::read(mem, header(bp)).is_allocated()
}

/// Write the same tag to both the header and the footer of the block at `bp`.
///
/// The header is written first, so the footer lands at the end of the block's
/// *new* size.
#[inline]
pub(crate) fn set_tags(mem: &mut [u8], bp: usize, size: usize, allocated: bool) {
    let tag = Tag::new(size, allocated);
    tag.write(mem, header(bp));
    tag.write(mem, bp + size - DOUBLE_WORD);
}

/// The payload offset of the block following the block at `bp`.
#[inline]
pub(crate) fn next_block(mem: &[u8], bp: usize) -> usize {
    bp + block_size(mem, bp)
}

/// The payload offset of the block preceding the block at `bp`, found via the
/// preceding block's footer.
#[inline]
pub(crate) fn prev_block(mem: &[u8], bp: usize) -> usize {
    bp - Tag::read(mem, bp - DOUBLE_WORD).size()
}

/// The block size needed to hold a payload of `size` bytes: header and footer
/// added, rounded up to a double word, and no smaller than
/// [`MIN_BLOCK_SIZE`].
///
/// Returns `None` if the computation overflows.
#[inline]
pub fn adjusted_size(size: usize) -> Option<usize> {
    if size <= DOUBLE_WORD {
        return Some(MIN_BLOCK_SIZE);
    }
    let padded = size.checked_add(OVERHEAD + DOUBLE_WORD - 1)?;
    Some(padded & SIZE_MASK)
}

/// Round `bytes` up to a whole number of double words.
#[inline]
pub(crate) fn round_up(bytes: usize) -> Option<usize> {
    Some(bytes.checked_add(DOUBLE_WORD - 1)? & SIZE_MASK)
}
