//! Main heap allocator implementation
//!
//! # Safety
//!
//! The allocator manages a borrowed memory region with a fixed pool of block
//! descriptors:
//! - Free spans sit on an address-sorted, index-linked free list
//! - Allocated spans sit on a head-insert alloc list, identified by their
//!   aligned address
//! - Which descriptor slots are live is tracked by a [`BitVector`] bitmap
//!   (bit set = slot unused)
//!
//! ## Invariants
//!
//! - `free_bytes + allocated_bytes == total_usable` after every operation
//! - The free list is strictly address-sorted; adjacent free blocks are
//!   always coalesced, so no two entries touch
//! - Every descriptor reachable from either list is marked used in the bitmap
//! - A failed allocation mutates nothing
//!
//! The invariants are re-checked after every mutation in debug builds.
//!
//! Access is single-owner (`&mut self`); shared instances are serialized by
//! the owning bank manager's lock.

use core::mem::size_of;
use core::ptr::{self, NonNull};

#[cfg(feature = "logging")]
use tracing::debug;

use super::block::{Block, HeaderLayout, NIL, SlotArena, header_bytes, place_header};
use crate::allocator::FreeSpan;
use crate::bitvec::BitVector;
use crate::error::{MemError, MemResult};
use crate::platform::NATURAL_ALIGN;
use crate::region::MemoryRegion;
use crate::utils::{align_up, is_power_of_two};

/// Where the descriptor pool (bitmap + block array) is stored.
#[derive(Debug, Clone, Copy)]
pub enum HeaderPlacement {
    /// Carve the pool from the front of the managed buffer itself. The
    /// carved span becomes a permanently-allocated header block that is
    /// never freed.
    Internal,
    /// Keep the pool in separate memory; the entire managed buffer starts
    /// as one free block.
    External(MemoryRegion),
}

/// Which free-space figure a non-mutating query reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeSpaceQuery {
    /// The largest alignment-adjusted free block anywhere.
    Max,
    /// The first (lowest-address) free block.
    Start,
    /// The trailing free block, reported only when it ends exactly at the
    /// buffer end.
    End,
}

/// Splitting is refused when the remainder would be at most this many bytes,
/// bounding descriptor-pool pressure.
const MIN_SPLIT: usize = size_of::<usize>();

/// First-fit, address-ordered free-list allocator with block splitting and
/// two-sided coalescing.
///
/// # Memory layout (internal header)
/// ```text
/// [bitmap|slots][ header pad ][ free / allocated spans ........ ][end]
/// ^ region start^ usable_start
/// ```
pub struct HeapAllocator {
    region: MemoryRegion,
    usable_start: usize,
    arena: SlotArena,
    slot_map: BitVector,
    num_slots: usize,
    free_head: u32,
    alloc_head: u32,
    /// Slot of the permanent header block (internal placement only). Never
    /// linked on either list.
    header_slot: Option<u32>,
    free_bytes: usize,
    allocated_bytes: usize,
}

// SAFETY: the allocator exclusively owns its region and header memory; the
// raw pointers inside are address bookkeeping, not shared references.
unsafe impl Send for HeapAllocator {}

impl HeapAllocator {
    /// Worst-case bytes of separate header memory needed for `block_slots`
    /// descriptors (for [`HeaderPlacement::External`]).
    pub fn header_bytes(block_slots: usize) -> usize {
        header_bytes(block_slots)
    }

    /// Creates a heap allocator over `region` with a pool of `block_slots`
    /// descriptors.
    pub fn new(
        region: MemoryRegion,
        block_slots: usize,
        placement: HeaderPlacement,
    ) -> MemResult<Self> {
        if region.size() == 0 {
            return Err(MemError::invalid_args("region size must be non-zero"));
        }
        if block_slots < 2 || block_slots >= NIL as usize {
            return Err(MemError::invalid_args(
                "descriptor pool needs at least 2 and fewer than 2^32-1 slots",
            ));
        }

        let (layout, usable_start, internal) = match placement {
            HeaderPlacement::External(header) => {
                let layout = place_header(header, block_slots)?;
                (layout, region.addr(), false)
            }
            HeaderPlacement::Internal => {
                let layout = place_header(region, block_slots)?;
                let usable_start = align_up(layout.end, NATURAL_ALIGN);
                if usable_start >= region.end() {
                    return Err(MemError::pool_too_small(
                        usable_start - region.addr(),
                        region.size(),
                    ));
                }
                (layout, usable_start, true)
            }
        };
        let HeaderLayout { bitmap, slots, .. } = layout;

        // SAFETY: place_header bounds-checked both spans inside memory the
        // caller handed over for exactly this purpose.
        let arena = unsafe { SlotArena::from_raw(slots, block_slots) };
        let slot_map = unsafe { BitVector::from_raw(bitmap, block_slots) };

        let mut heap = Self {
            region,
            usable_start,
            arena,
            slot_map,
            num_slots: block_slots,
            free_head: NIL,
            alloc_head: NIL,
            header_slot: internal.then_some(0),
            free_bytes: 0,
            allocated_bytes: 0,
        };
        heap.install_initial_blocks();

        #[cfg(feature = "logging")]
        debug!(
            "heap allocator over {:#x}..{:#x}: {} descriptor slots, {} bytes free",
            heap.region.addr(),
            heap.region.end(),
            block_slots,
            heap.free_bytes
        );

        Ok(heap)
    }

    /// Derives the post-init block state: one permanent header block plus
    /// one free block (internal), or a single free block over the whole
    /// buffer (external).
    fn install_initial_blocks(&mut self) {
        self.slot_map.fill(true);
        self.alloc_head = NIL;

        let free_block = Block {
            buffer: self.usable_start,
            aligned: self.usable_start,
            size: self.region.end() - self.usable_start,
            next: NIL,
        };

        if self.header_slot.is_some() {
            let header = Block {
                buffer: self.region.addr(),
                aligned: self.region.addr(),
                size: self.usable_start - self.region.addr(),
                next: NIL,
            };
            self.arena.set(0, header);
            self.arena.set(1, free_block);
            self.slot_map.toggle_range(0, 2);
            self.free_head = 1;
            self.allocated_bytes = header.size;
        } else {
            self.arena.set(0, free_block);
            self.slot_map.toggle_range(0, 1);
            self.free_head = 0;
            self.allocated_bytes = 0;
        }
        self.free_bytes = free_block.size;
        self.debug_validate();
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// First fit in address order: the lowest-addressed free block that can
    /// hold the request (after alignment padding) is taken, not the
    /// smallest sufficient one.
    pub fn alloc(&mut self, size: usize, align: usize) -> MemResult<NonNull<u8>> {
        if size == 0 {
            return Err(MemError::invalid_args("allocation size must be non-zero"));
        }
        if !is_power_of_two(align) {
            return Err(MemError::illegal_align(align));
        }

        let mut prev = NIL;
        let mut index = self.free_head;
        while index != NIL {
            let block = self.arena.get(index);
            if let Some(adjusted) = adjusted_size(&block, size, align)
                && block.size >= adjusted
            {
                return self.alloc_in_block(prev, index, size, align);
            }
            prev = index;
            index = block.next;
        }
        Err(MemError::alloc_failed(size, align))
    }

    /// Allocates from the trailing free block only; the block must end
    /// exactly at the buffer end. Used for the bank-0 half of a straddling
    /// allocation.
    pub(crate) fn alloc_tail(&mut self, size: usize, align: usize) -> MemResult<NonNull<u8>> {
        let (prev, last) = self.last_free();
        if last == NIL {
            return Err(MemError::alloc_failed(size, align));
        }
        let block = self.arena.get(last);
        let fits = block.end() == self.region.end()
            && adjusted_size(&block, size, align).is_some_and(|adjusted| block.size >= adjusted);
        if !fits {
            return Err(MemError::alloc_failed(size, align));
        }
        self.alloc_in_block(prev, last, size, align)
    }

    /// Allocates `size` bytes from the first free block, which must start
    /// exactly at the usable buffer start. Used for the bank-1 half of a
    /// straddling allocation.
    pub(crate) fn alloc_head_exact(&mut self, size: usize) -> MemResult<NonNull<u8>> {
        if self.free_head == NIL {
            return Err(MemError::alloc_failed(size, 1));
        }
        let block = self.arena.get(self.free_head);
        if block.buffer != self.usable_start || block.size < size {
            return Err(MemError::alloc_failed(size, 1));
        }
        self.alloc_in_block(NIL, self.free_head, size, 1)
    }

    /// Commits an allocation into the free block at `index` (preceded on the
    /// free list by `prev`), splitting off the remainder when profitable.
    fn alloc_in_block(
        &mut self,
        prev: u32,
        index: u32,
        size: usize,
        align: usize,
    ) -> MemResult<NonNull<u8>> {
        let mut block = self.arena.get(index);
        let padding = align_up(block.buffer, align) - block.buffer;
        let adjusted = size + padding;
        debug_assert!(block.size >= adjusted);

        let aligned_addr = block.buffer + padding;
        let remainder = block.size - adjusted;

        if remainder > MIN_SPLIT
            && let Some(slot) = self.take_slot()
        {
            // Shrink the chosen block and leave the remainder behind at the
            // same position in the free list.
            let tail = Block {
                buffer: block.buffer + adjusted,
                aligned: block.buffer + adjusted,
                size: remainder,
                next: block.next,
            };
            self.arena.set(slot, tail);
            self.set_free_link(prev, slot);
            block.size = adjusted;
        } else {
            // Consume the whole block; any excess stays unusable until the
            // block is freed.
            self.set_free_link(prev, block.next);
        }

        self.free_bytes -= block.size;
        self.allocated_bytes += block.size;

        block.aligned = aligned_addr;
        block.next = self.alloc_head;
        self.alloc_head = index;
        self.arena.set(index, block);

        self.debug_validate();
        NonNull::new(aligned_addr as *mut u8)
            .ok_or_else(|| MemError::internal("aligned address collapsed to null"))
    }

    /// Releases the allocation whose aligned address is `ptr`.
    pub fn free(&mut self, ptr: NonNull<u8>) -> MemResult<()> {
        self.free_impl(ptr, false)
    }

    /// Releases the allocation and zero-fills the whole block's bytes.
    pub fn free_with_clear(&mut self, ptr: NonNull<u8>) -> MemResult<()> {
        self.free_impl(ptr, true)
    }

    fn free_impl(&mut self, ptr: NonNull<u8>, clear: bool) -> MemResult<()> {
        let addr = ptr.as_ptr() as usize;

        // Locate the descriptor on the alloc list.
        let mut prev = NIL;
        let mut index = self.alloc_head;
        while index != NIL {
            let block = self.arena.get(index);
            if block.aligned == addr {
                break;
            }
            prev = index;
            index = block.next;
        }
        if index == NIL {
            return Err(MemError::ptr_out_of_bounds(addr));
        }
        let mut block = self.arena.get(index);

        // Unlink from the alloc list.
        if prev == NIL {
            self.alloc_head = block.next;
        } else {
            let mut p = self.arena.get(prev);
            p.next = block.next;
            self.arena.set(prev, p);
        }

        if clear {
            // SAFETY: the block's span was handed out by this allocator and
            // is being reclaimed; nothing else may reference it anymore.
            unsafe { ptr::write_bytes(block.buffer as *mut u8, 0, block.size) };
        }

        self.allocated_bytes -= block.size;
        self.free_bytes += block.size;

        // Find the insertion point in the address-sorted free list.
        let mut fprev = NIL;
        let mut fnext = self.free_head;
        while fnext != NIL {
            let candidate = self.arena.get(fnext);
            if candidate.buffer > block.buffer {
                break;
            }
            fprev = fnext;
            fnext = candidate.next;
        }

        block.aligned = block.buffer;
        block.next = fnext;

        // Merge backward into the previous free block when adjacent,
        // returning this descriptor's slot to the bitmap.
        let mut merged_index = index;
        let mut merged = block;
        if fprev != NIL {
            let mut before = self.arena.get(fprev);
            if before.end() == block.buffer {
                before.size += block.size;
                self.arena.set(fprev, before);
                self.release_slot(index);
                merged_index = fprev;
                merged = before;
            } else {
                self.arena.set(index, block);
                before.next = index;
                self.arena.set(fprev, before);
            }
        } else {
            self.arena.set(index, block);
            self.free_head = index;
        }

        // Independently merge forward into the next free block.
        if fnext != NIL {
            let after = self.arena.get(fnext);
            if merged.end() == after.buffer {
                merged.size += after.size;
                merged.next = after.next;
                self.arena.set(merged_index, merged);
                self.release_slot(fnext);
            }
        }

        self.debug_validate();
        Ok(())
    }

    /// Reports free space without mutating anything.
    pub fn free_space(&self, align: usize, query: FreeSpaceQuery) -> FreeSpan {
        if !is_power_of_two(align) {
            return FreeSpan::EMPTY;
        }
        match query {
            FreeSpaceQuery::Start => {
                if self.free_head == NIL {
                    return FreeSpan::EMPTY;
                }
                span_of(&self.arena.get(self.free_head), align)
            }
            FreeSpaceQuery::End => {
                let (_, last) = self.last_free();
                if last == NIL {
                    return FreeSpan::EMPTY;
                }
                let block = self.arena.get(last);
                if block.end() != self.region.end() {
                    return FreeSpan::EMPTY;
                }
                span_of(&block, align)
            }
            FreeSpaceQuery::Max => {
                let mut best = FreeSpan::EMPTY;
                let mut index = self.free_head;
                while index != NIL {
                    let block = self.arena.get(index);
                    let span = span_of(&block, align);
                    if span.bytes > best.bytes {
                        best = span;
                    }
                    index = block.next;
                }
                best
            }
        }
    }

    /// Restores the exact post-init state.
    pub fn reset(&mut self) {
        self.install_initial_blocks();

        #[cfg(feature = "logging")]
        debug!(
            "heap allocator over {:#x}..{:#x} reset",
            self.region.addr(),
            self.region.end()
        );
    }

    /// Whether `ptr` falls within some currently-allocated block.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let mut index = self.alloc_head;
        while index != NIL {
            let block = self.arena.get(index);
            if addr >= block.buffer && addr < block.end() {
                return true;
            }
            index = block.next;
        }
        false
    }

    /// Bytes currently on the free list
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Bytes currently allocated (including the permanent header block for
    /// internal placement)
    #[inline]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Total bytes under management (`free_bytes + allocated_bytes`)
    #[inline]
    pub fn total_usable(&self) -> usize {
        self.region.size()
    }

    /// Number of descriptor slots in the pool
    #[inline]
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub(crate) fn usable_start(&self) -> usize {
        self.usable_start
    }

    /// Last free block and its predecessor (`NIL` when the list is empty).
    fn last_free(&self) -> (u32, u32) {
        let mut prev = NIL;
        let mut index = self.free_head;
        while index != NIL {
            let next = self.arena.get(index).next;
            if next == NIL {
                break;
            }
            prev = index;
            index = next;
        }
        (prev, index)
    }

    /// Claims the lowest unused descriptor slot, if any.
    fn take_slot(&mut self) -> Option<u32> {
        let slot = self.slot_map.first_set()?;
        self.slot_map.toggle_range(slot, 1);
        Some(slot as u32)
    }

    /// Returns a descriptor slot to the bitmap.
    fn release_slot(&mut self, index: u32) {
        debug_assert!(!self.slot_map.get(index as usize), "double slot release");
        self.slot_map.toggle_range(index as usize, 1);
    }

    /// Replaces the free-list link that pointed at the modified block.
    fn set_free_link(&mut self, prev: u32, target: u32) {
        if prev == NIL {
            self.free_head = target;
        } else {
            let mut block = self.arena.get(prev);
            block.next = target;
            self.arena.set(prev, block);
        }
    }

    /// Consistency checks active in debug builds only. Violations are
    /// allocator bugs, never recoverable runtime conditions.
    fn debug_validate(&self) {
        #[cfg(debug_assertions)]
        {
            let mut free_sum = 0;
            let mut free_count = 0;
            let mut last_end = 0;
            let mut index = self.free_head;
            while index != NIL {
                let block = self.arena.get(index);
                debug_assert!(
                    block.buffer > last_end || free_count == 0,
                    "free list not strictly sorted or uncoalesced neighbors"
                );
                debug_assert!(block.buffer >= self.usable_start);
                debug_assert!(block.end() <= self.region.end());
                debug_assert!(!self.slot_map.get(index as usize), "free block on unused slot");
                last_end = block.end();
                free_sum += block.size;
                free_count += 1;
                index = block.next;
            }
            debug_assert_eq!(free_sum, self.free_bytes, "free byte accounting drifted");

            let mut alloc_sum = 0;
            let mut alloc_count = 0;
            index = self.alloc_head;
            while index != NIL {
                let block = self.arena.get(index);
                debug_assert!(!self.slot_map.get(index as usize), "alloc block on unused slot");
                alloc_sum += block.size;
                alloc_count += 1;
                index = block.next;
            }
            let header = self
                .header_slot
                .map_or(0, |slot| self.arena.get(slot).size);
            debug_assert_eq!(
                alloc_sum + header,
                self.allocated_bytes,
                "allocated byte accounting drifted"
            );
            debug_assert_eq!(
                self.free_bytes + self.allocated_bytes,
                self.total_usable(),
                "byte conservation violated"
            );

            let live = free_count + alloc_count + usize::from(self.header_slot.is_some());
            debug_assert_eq!(
                self.num_slots - self.slot_map.popcount(true),
                live,
                "bitmap and descriptor lists disagree"
            );
        }
    }
}

impl core::fmt::Debug for HeapAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("region", &self.region)
            .field("free_bytes", &self.free_bytes)
            .field("allocated_bytes", &self.allocated_bytes)
            .field("num_slots", &self.num_slots)
            .finish_non_exhaustive()
    }
}

/// Size the block must have to satisfy `size` at `align`, or `None` on
/// arithmetic overflow.
#[inline]
fn adjusted_size(block: &Block, size: usize, align: usize) -> Option<usize> {
    let padding = align_up(block.buffer, align) - block.buffer;
    size.checked_add(padding)
}

/// Alignment-adjusted view of one free block.
fn span_of(block: &Block, align: usize) -> FreeSpan {
    let aligned = align_up(block.buffer, align);
    if aligned >= block.end() {
        return FreeSpan::EMPTY;
    }
    FreeSpan {
        bytes: block.end() - aligned,
        start: aligned,
        end: block.end(),
    }
}
