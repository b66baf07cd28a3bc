#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

use cfg_if::cfg_if;
use core::{alloc::Layout, ptr::NonNull};

mod arena;
mod check;
mod free_list;
mod heap;
pub mod layout;
mod segregated_allocator;
mod size_class;

pub use arena::{Arena, FixedArena};
pub use check::{BlockInfo, BlockState, Blocks, HeapCheckError, HeapStats};
pub use heap::{Addr, Heap};
pub use segregated_allocator::{Lock, SegregatedAllocator, SingleThreadedLock};
pub use size_class::{size_class, LARGEST_BOUNDED_CLASS, NUM_SIZE_CLASSES};

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
