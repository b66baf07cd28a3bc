//! Mapping block sizes to segregated free-list buckets.

/// The number of size classes, and therefore of free lists.
pub const NUM_SIZE_CLASSES: usize = 12;

/// Inclusive upper bounds of every class but the last, which takes everything
/// larger than [`LARGEST_BOUNDED_CLASS`].
const UPPER_BOUNDS: [usize; NUM_SIZE_CLASSES - 1] = [
    16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384,
];

/// Blocks larger than this all share the final, catch-all size class.
pub const LARGEST_BOUNDED_CLASS: usize = UPPER_BOUNDS[NUM_SIZE_CLASSES - 2];

/// Get the index of the size class that a block of `size` bytes belongs to.
///
/// Classes are half-open ranges `(previous bound, bound]`; the mapping is
/// monotonic in `size`.
#[inline]
pub fn size_class(size: usize) -> usize {
    UPPER_BOUNDS
        .iter()
        .position(|&bound| size <= bound)
        .unwrap_or(NUM_SIZE_CLASSES - 1)
}
