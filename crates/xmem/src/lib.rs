//! # xmem
//!
//! Bank-spanning embedded memory allocators.
//!
//! This crate manages raw, caller-provided memory regions without an
//! underlying general-purpose allocator for the managed bytes:
//! - A checkpointable bump allocator ([`StackAllocator`]) for LIFO scratch
//!   memory
//! - A coalescing free-list allocator ([`HeapAllocator`]) with a fixed
//!   descriptor pool
//! - A bank layer ([`BankManager`], [`BankRegistry`]) that spans either
//!   allocator across up to two physical memory banks, including single
//!   allocations that straddle a contiguous bank boundary
//! - A lock-guarded shared-region heap ([`RegionMemoryManager`]) for memory
//!   visible to multiple cores
//!
//! ## Quick start
//!
//! ```rust
//! use core::ptr::NonNull;
//! use xmem::prelude::*;
//!
//! // A region is borrowed raw memory; here it comes from a plain buffer.
//! let mut backing = vec![0u8; 64 * 1024];
//! let region = unsafe {
//!     MemoryRegion::new(NonNull::new(backing.as_mut_ptr()).unwrap(), backing.len())
//! };
//!
//! let manager = BankManager::new(&[region], BankConfig::heap())?;
//! let ptr = manager.alloc(BankSelector::Any, 256, 8)?;
//! manager.free(BankSelector::Any, ptr)?;
//! # Ok::<(), xmem::MemError>(())
//! ```
//!
//! ## Features
//!
//! - `logging` (default): structured logging of init, exhaustion and
//!   straddle events via `tracing`
//!
//! ## Concurrency
//!
//! Allocators are single-owner values; sharing happens one layer up, where
//! every [`BankManager`] call runs under that manager's lock. The only
//! suspending operation in the crate is [`BankManager::alloc_wait`].

// The whole point of this crate is managing raw memory; the workspace-level
// `unsafe_code = "warn"` is opted out here.
#![allow(unsafe_code)]

pub mod allocator;
pub mod bank;
pub mod bitvec;
pub mod error;
pub mod platform;
pub mod region;
pub mod shared;
pub mod utils;

// Re-export core types for convenience
pub use crate::allocator::{
    FreeSpaceQuery, FreeSpan, HeaderPlacement, HeapAllocator, StackAllocator, StackCheckpoint,
};
pub use crate::bank::{
    AllocPolicy, BankConfig, BankManager, BankRegistry, BankSelector, SlotId,
};
pub use crate::error::{MemError, MemResult};
pub use crate::region::{DiscoveredRegions, FixedRegions, MemoryRegion, RegionSource};
pub use crate::shared::RegionMemoryManager;

/// Convenient re-exports of commonly used types and traits.
pub mod prelude {
    pub use crate::allocator::{
        FreeSpaceQuery, FreeSpan, HeaderPlacement, HeapAllocator, StackAllocator, StackCheckpoint,
    };
    pub use crate::bank::{
        AllocPolicy, BankConfig, BankManager, BankRegistry, BankSelector, MAX_BANKS, SlotId,
    };
    pub use crate::error::{MemError, MemResult};
    pub use crate::platform::{CacheMaintenance, CoherentCache};
    pub use crate::region::{DiscoveredRegions, FixedRegions, MemoryRegion, RegionSource};
    pub use crate::shared::RegionMemoryManager;
}
