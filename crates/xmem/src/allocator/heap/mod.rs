//! Coalescing free-list heap allocator
//!
//! See [`HeapAllocator`] for the allocation policy and
//! [`HeaderPlacement`] for where its descriptor pool lives.

mod allocator;
mod block;

pub use allocator::{FreeSpaceQuery, HeaderPlacement, HeapAllocator};
