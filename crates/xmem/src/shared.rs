//! Always-on heap over a single shared region
//!
//! A [`RegionMemoryManager`] wraps one [`HeapAllocator`] over one discovered
//! region — typically memory shared by multiple cores — behind a lock,
//! initialized lazily exactly once. Its descriptor pool is carved from the
//! front of the region itself, so the whole manager needs no memory beyond
//! the region it was given.

use core::ptr::NonNull;

use parking_lot::Mutex;

#[cfg(feature = "logging")]
use tracing::debug;

use crate::allocator::FreeSpan;
use crate::allocator::heap::{FreeSpaceQuery, HeaderPlacement, HeapAllocator};
use crate::error::{MemError, MemResult};
use crate::platform::NATURAL_ALIGN;
use crate::region::{MemoryRegion, RegionSource};

/// Lock-guarded, lazily-initialized heap over one shared region.
pub struct RegionMemoryManager {
    state: Mutex<Option<HeapAllocator>>,
}

impl RegionMemoryManager {
    /// Creates an uninitialized manager.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    /// One-time initialization over `region`.
    ///
    /// Idempotent: a second call on an initialized manager returns `Ok`
    /// without touching anything.
    pub fn init(&self, region: MemoryRegion, block_slots: usize) -> MemResult<()> {
        let mut guard = self.state.lock();
        if guard.is_some() {
            return Ok(());
        }

        // The descriptor pool plus at least one usable word must fit.
        let overhead = HeapAllocator::header_bytes(block_slots) + NATURAL_ALIGN;
        if region.size() <= overhead {
            return Err(MemError::config_unsupported(
                "shared region too small for its heap bookkeeping",
            ));
        }

        let heap = HeapAllocator::new(region, block_slots, HeaderPlacement::Internal)
            .map_err(|e| MemError::init_banks_failed(0, &e.to_string()))?;

        #[cfg(feature = "logging")]
        debug!(
            "shared region manager over {:#x}..{:#x}: {} bytes usable",
            region.addr(),
            region.end(),
            heap.free_bytes()
        );

        *guard = Some(heap);
        Ok(())
    }

    /// Initializes from a region source, taking the first discovered region.
    pub fn init_from(&self, source: &dyn RegionSource, block_slots: usize) -> MemResult<()> {
        let found = source.discover(0)?;
        let region = found
            .regions
            .first()
            .copied()
            .ok_or_else(|| MemError::config_unsupported("no shared region discovered"))?;
        self.init(region, block_slots)
    }

    /// Whether [`init`](Self::init) has completed
    pub fn is_initialized(&self) -> bool {
        self.state.lock().is_some()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HeapAllocator) -> R) -> MemResult<R> {
        let mut guard = self.state.lock();
        let heap = guard.as_mut().ok_or(MemError::Uninitialized)?;
        Ok(f(heap))
    }

    /// Allocates `size` bytes aligned to `align`.
    pub fn alloc(&self, size: usize, align: usize) -> MemResult<NonNull<u8>> {
        self.with(|heap| heap.alloc(size, align))?
    }

    /// Releases an allocation.
    pub fn free(&self, ptr: NonNull<u8>) -> MemResult<()> {
        self.with(|heap| heap.free(ptr))?
    }

    /// Releases an allocation and zero-fills its block.
    pub fn free_with_clear(&self, ptr: NonNull<u8>) -> MemResult<()> {
        self.with(|heap| heap.free_with_clear(ptr))?
    }

    /// Non-mutating free-space report.
    pub fn free_space(&self, align: usize, query: FreeSpaceQuery) -> MemResult<FreeSpan> {
        self.with(|heap| heap.free_space(align, query))
    }

    /// Restores the post-init state.
    pub fn reset(&self) -> MemResult<()> {
        self.with(HeapAllocator::reset)
    }

    /// Whether `ptr` points into a live allocation.
    pub fn contains(&self, ptr: NonNull<u8>) -> MemResult<bool> {
        self.with(|heap| heap.contains(ptr))
    }

    /// Free bytes currently available.
    pub fn free_bytes(&self) -> MemResult<usize> {
        self.with(|heap| heap.free_bytes())
    }

    /// Bytes currently allocated (including the in-region bookkeeping).
    pub fn allocated_bytes(&self) -> MemResult<usize> {
        self.with(|heap| heap.allocated_bytes())
    }
}

impl Default for RegionMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for RegionMemoryManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegionMemoryManager")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
