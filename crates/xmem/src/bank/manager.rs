//! Bank manager: one sub-allocator per bank plus straddling allocation
//!
//! ## Locking model
//!
//! Every mutating operation runs under the manager's mutex, making each call
//! atomic with respect to other callers of the same instance. There is no
//! cross-call transaction support and no fairness guarantee. The only
//! suspending operation is [`BankManager::alloc_wait`], which blocks on the
//! manager's condition variable until woken by a `*_signal` free or by
//! timeout.
//!
//! ## Bookkeeping placement
//!
//! Under heap policy the descriptor-pool headers of *both* banks are carved
//! from the front of bank 0, and the remaining span is re-aligned to the
//! platform word before the bank-0 allocator is laid over it. Bank 1 is
//! never carved, so two contiguous input regions stay contiguous at the
//! boundary that matters for straddling. The cache-maintenance hook is
//! invoked around every mutation of that carved header span; it is a no-op
//! on coherent platforms.

use core::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[cfg(feature = "logging")]
use tracing::debug;

use super::{AllocPolicy, BankConfig, BankSelector, MAX_BANKS};
use crate::allocator::heap::{FreeSpaceQuery, HeaderPlacement, HeapAllocator};
use crate::allocator::stack::{StackAllocator, StackCheckpoint};
use crate::error::{MemError, MemResult};
use crate::platform::{CacheMaintenance, CoherentCache, NATURAL_ALIGN};
use crate::region::{MemoryRegion, validate_sorted};

/// One managed bank: its usable region and whether the next bank starts
/// exactly where this one ends.
#[derive(Debug, Clone, Copy)]
struct BankDesc {
    region: MemoryRegion,
    contiguous_with_next: bool,
}

enum Backends {
    Stack(heapless::Vec<StackAllocator, MAX_BANKS>),
    Heap(heapless::Vec<HeapAllocator, MAX_BANKS>),
}

struct BankState {
    banks: heapless::Vec<BankDesc, MAX_BANKS>,
    backends: Backends,
    /// Bank-0 half of the single outstanding straddling allocation.
    straddle_ptr: Option<usize>,
}

/// Manages 1–2 banks behind one lock, routing allocations to the right
/// sub-allocator or splitting one across the bank boundary.
pub struct BankManager {
    state: Mutex<BankState>,
    space_freed: Condvar,
    cache: Arc<dyn CacheMaintenance>,
    /// Carved descriptor-header span in bank 0 (heap policy), for the cache
    /// maintenance hook.
    header_span: Option<(usize, usize)>,
    policy: AllocPolicy,
    num_banks: usize,
    contiguous: bool,
}

impl BankManager {
    /// Creates a manager over `regions` on a coherent-cache platform.
    ///
    /// Regions must be address-sorted and non-overlapping.
    pub fn new(regions: &[MemoryRegion], config: BankConfig) -> MemResult<Self> {
        Self::with_cache(regions, config, Arc::new(CoherentCache))
    }

    /// Creates a manager with an injected cache-maintenance capability.
    pub fn with_cache(
        regions: &[MemoryRegion],
        config: BankConfig,
        cache: Arc<dyn CacheMaintenance>,
    ) -> MemResult<Self> {
        if regions.is_empty() || regions.len() > MAX_BANKS {
            return Err(MemError::invalid_args("expected 1 or 2 banks"));
        }
        validate_sorted(regions)?;

        let mut banks: heapless::Vec<BankDesc, MAX_BANKS> = heapless::Vec::new();
        for (i, region) in regions.iter().enumerate() {
            let contiguous_with_next = regions
                .get(i + 1)
                .is_some_and(|next| region.contiguous_with(next));
            banks
                .push(BankDesc {
                    region: *region,
                    contiguous_with_next,
                })
                .map_err(|_| MemError::internal("bank table overflow"))?;
        }
        let contiguous = banks
            .iter()
            .take(banks.len() - 1)
            .all(|b| b.contiguous_with_next);

        let (backends, header_span) = match config.policy {
            AllocPolicy::Stack => {
                let mut stacks = heapless::Vec::new();
                for (i, desc) in banks.iter_mut().enumerate() {
                    // Only bank 0 is re-aligned; later banks are used as-is.
                    if i == 0 {
                        desc.region = desc.region.align_start(NATURAL_ALIGN);
                    }
                    let stack = StackAllocator::new(desc.region)
                        .map_err(|e| MemError::init_banks_failed(i, &e.to_string()))?;
                    stacks
                        .push(stack)
                        .map_err(|_| MemError::internal("bank table overflow"))?;
                }
                (Backends::Stack(stacks), None)
            }
            AllocPolicy::Heap => {
                // Reserve both banks' descriptor headers from the front of
                // bank 0 only, then re-align what remains.
                let per_bank = HeapAllocator::header_bytes(config.block_slots);
                let reserve = per_bank * banks.len();
                let (headers, rest0) = banks[0]
                    .region
                    .split_front(reserve)
                    .ok_or_else(|| MemError::init_mgr_failed("bookkeeping does not fit in bank 0"))?;
                let rest0 = rest0.align_start(NATURAL_ALIGN);
                if rest0.size() == 0 {
                    return Err(MemError::init_mgr_failed("bank 0 exhausted by bookkeeping"));
                }
                banks[0].region = rest0;

                let mut heaps = heapless::Vec::new();
                let mut header_rest = headers;
                for (i, desc) in banks.iter().enumerate() {
                    let (header, rest) = header_rest
                        .split_front(per_bank)
                        .ok_or_else(|| MemError::internal("header carve arithmetic"))?;
                    header_rest = rest;
                    let heap = HeapAllocator::new(
                        desc.region,
                        config.block_slots,
                        HeaderPlacement::External(header),
                    )
                    .map_err(|e| MemError::init_banks_failed(i, &e.to_string()))?;
                    heaps
                        .push(heap)
                        .map_err(|_| MemError::internal("bank table overflow"))?;
                }
                (
                    Backends::Heap(heaps),
                    Some((headers.addr(), headers.size())),
                )
            }
        };

        #[cfg(feature = "logging")]
        debug!(
            "bank manager: {} bank(s), {:?} policy, contiguous: {}",
            banks.len(),
            config.policy,
            contiguous
        );

        Ok(Self {
            num_banks: banks.len(),
            policy: config.policy,
            contiguous,
            state: Mutex::new(BankState {
                banks,
                backends,
                straddle_ptr: None,
            }),
            space_freed: Condvar::new(),
            cache,
            header_span,
        })
    }

    /// Runs `f` under the manager lock with the cache hook around it.
    fn with_state<R>(&self, f: impl FnOnce(&mut BankState) -> R) -> R {
        let mut guard = self.state.lock();
        self.locked(&mut guard, f)
    }

    fn locked<R>(&self, state: &mut BankState, f: impl FnOnce(&mut BankState) -> R) -> R {
        if let Some((addr, len)) = self.header_span {
            self.cache.invalidate(addr, len);
        }
        let result = f(state);
        if let Some((addr, len)) = self.header_span {
            self.cache.flush(addr, len);
        }
        result
    }

    /// Allocates `size` bytes at `align` from the selected bank, or — for
    /// [`BankSelector::Any`] — from bank 0, a straddling allocation across
    /// the bank boundary, or bank 1, in that order.
    pub fn alloc(&self, sel: BankSelector, size: usize, align: usize) -> MemResult<NonNull<u8>> {
        self.with_state(|state| state.alloc(sel, size, align))
    }

    /// Like [`alloc`](Self::alloc), but on exhaustion blocks until another
    /// thread frees memory through a `*_signal` variant, re-attempting after
    /// each wake. `timeout: None` waits indefinitely. Heap policy only.
    pub fn alloc_wait(
        &self,
        sel: BankSelector,
        size: usize,
        align: usize,
        timeout: Option<Duration>,
    ) -> MemResult<NonNull<u8>> {
        if self.policy != AllocPolicy::Heap {
            return Err(MemError::unsupported("alloc_wait on stack policy"));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.state.lock();
        loop {
            match self.locked(&mut guard, |state| state.alloc(sel, size, align)) {
                Ok(ptr) => return Ok(ptr),
                Err(e) if e.is_retryable() => match deadline {
                    None => {
                        self.space_freed.wait(&mut guard);
                    }
                    Some(deadline) => {
                        if self.space_freed.wait_until(&mut guard, deadline).timed_out() {
                            // One last attempt after the deadline passes.
                            return self.locked(&mut guard, |state| state.alloc(sel, size, align));
                        }
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Releases an allocation. Heap policy only.
    ///
    /// A recorded straddling allocation is released from both banks; the
    /// bank-1 half is located by its known start address.
    pub fn free(&self, sel: BankSelector, ptr: NonNull<u8>) -> MemResult<()> {
        self.free_impl(sel, ptr, false, false)
    }

    /// [`free`](Self::free) plus zero-fill of the released block(s).
    pub fn free_with_clear(&self, sel: BankSelector, ptr: NonNull<u8>) -> MemResult<()> {
        self.free_impl(sel, ptr, true, false)
    }

    /// [`free`](Self::free), then wakes one blocked [`alloc_wait`](Self::alloc_wait) caller.
    pub fn free_signal(&self, sel: BankSelector, ptr: NonNull<u8>) -> MemResult<()> {
        self.free_impl(sel, ptr, false, true)
    }

    /// [`free_with_clear`](Self::free_with_clear), then wakes one blocked waiter.
    pub fn free_with_clear_signal(&self, sel: BankSelector, ptr: NonNull<u8>) -> MemResult<()> {
        self.free_impl(sel, ptr, true, true)
    }

    fn free_impl(
        &self,
        sel: BankSelector,
        ptr: NonNull<u8>,
        clear: bool,
        signal: bool,
    ) -> MemResult<()> {
        if self.policy != AllocPolicy::Heap {
            return Err(MemError::unsupported("free on stack allocator"));
        }
        let result = self.with_state(|state| state.free(sel, ptr, clear));
        if signal && result.is_ok() {
            self.space_freed.notify_one();
        }
        result
    }

    /// Captures the named bank's allocation position. Stack policy only.
    pub fn checkpoint(&self, bank: usize) -> MemResult<StackCheckpoint> {
        self.with_state(|state| match &state.backends {
            Backends::Stack(stacks) => Ok(stacks
                .get(bank)
                .ok_or_else(bad_bank)?
                .checkpoint()),
            Backends::Heap(_) => Err(MemError::unsupported("checkpoint on heap allocator")),
        })
    }

    /// Rolls the named bank back to a checkpoint. Stack policy only.
    pub fn restore(&self, bank: usize, checkpoint: StackCheckpoint) -> MemResult<()> {
        self.with_state(|state| match &mut state.backends {
            Backends::Stack(stacks) => stacks
                .get_mut(bank)
                .ok_or_else(bad_bank)?
                .restore(checkpoint),
            Backends::Heap(_) => Err(MemError::unsupported("checkpoint on heap allocator")),
        })
    }

    /// Resets the named bank to its post-init state.
    pub fn reset(&self, bank: usize) -> MemResult<()> {
        self.with_state(|state| {
            match &mut state.backends {
                Backends::Stack(stacks) => stacks.get_mut(bank).ok_or_else(bad_bank)?.reset(),
                Backends::Heap(heaps) => heaps.get_mut(bank).ok_or_else(bad_bank)?.reset(),
            }
            // Either half of an outstanding straddle may just have vanished.
            state.straddle_ptr = None;
            Ok(())
        })
    }

    /// Whether `ptr` points into currently-allocated bytes of the named bank.
    pub fn contains(&self, bank: usize, ptr: NonNull<u8>) -> MemResult<bool> {
        self.with_state(|state| match &state.backends {
            Backends::Stack(stacks) => Ok(stacks.get(bank).ok_or_else(bad_bank)?.contains(ptr)),
            Backends::Heap(heaps) => Ok(heaps.get(bank).ok_or_else(bad_bank)?.contains(ptr)),
        })
    }

    /// Number of managed banks
    #[inline]
    pub fn num_banks(&self) -> usize {
        self.num_banks
    }

    /// The allocation policy backing every bank
    #[inline]
    pub fn policy(&self) -> AllocPolicy {
        self.policy
    }

    /// Whether every adjacent bank pair is physically contiguous
    #[inline]
    pub fn banks_contiguous(&self) -> bool {
        self.contiguous
    }

    /// Free bytes in the named bank
    pub fn free_bytes(&self, bank: usize) -> MemResult<usize> {
        self.with_state(|state| match &state.backends {
            Backends::Stack(stacks) => Ok(stacks.get(bank).ok_or_else(bad_bank)?.free_bytes()),
            Backends::Heap(heaps) => Ok(heaps.get(bank).ok_or_else(bad_bank)?.free_bytes()),
        })
    }

    /// Allocated bytes in the named bank
    pub fn allocated_bytes(&self, bank: usize) -> MemResult<usize> {
        self.with_state(|state| match &state.backends {
            Backends::Stack(stacks) => Ok(stacks.get(bank).ok_or_else(bad_bank)?.allocated_bytes()),
            Backends::Heap(heaps) => Ok(heaps.get(bank).ok_or_else(bad_bank)?.allocated_bytes()),
        })
    }

    /// Alignment padding lost in the named bank (always 0 under heap policy,
    /// where padding lives inside allocated blocks)
    pub fn unused_bytes(&self, bank: usize) -> MemResult<usize> {
        self.with_state(|state| match &state.backends {
            Backends::Stack(stacks) => Ok(stacks.get(bank).ok_or_else(bad_bank)?.unused_bytes()),
            Backends::Heap(heaps) => {
                heaps.get(bank).ok_or_else(bad_bank)?;
                Ok(0)
            }
        })
    }
}

impl core::fmt::Debug for BankManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BankManager")
            .field("num_banks", &self.num_banks)
            .field("policy", &self.policy)
            .field("contiguous", &self.contiguous)
            .finish_non_exhaustive()
    }
}

fn bad_bank() -> MemError {
    MemError::invalid_args("bank index out of range")
}

impl BankState {
    fn alloc(&mut self, sel: BankSelector, size: usize, align: usize) -> MemResult<NonNull<u8>> {
        match sel {
            BankSelector::Bank(bank) => self.bank_alloc(bank, size, align),
            BankSelector::Any => match self.bank_alloc(0, size, align) {
                Ok(ptr) => Ok(ptr),
                Err(e) if !e.is_retryable() => Err(e),
                Err(e) => {
                    if self.banks.len() < 2 {
                        return Err(e);
                    }
                    if self.banks[0].contiguous_with_next
                        && let Some(ptr) = self.try_straddle(size, align)
                    {
                        return Ok(ptr);
                    }
                    self.bank_alloc(1, size, align)
                }
            },
        }
    }

    fn bank_alloc(&mut self, bank: usize, size: usize, align: usize) -> MemResult<NonNull<u8>> {
        match &mut self.backends {
            Backends::Stack(stacks) => stacks.get_mut(bank).ok_or_else(bad_bank)?.alloc(size, align),
            Backends::Heap(heaps) => heaps.get_mut(bank).ok_or_else(bad_bank)?.alloc(size, align),
        }
    }

    /// Attempts a two-bank allocation across the contiguous boundary:
    /// everything left at the end of bank 0 plus the remainder from the
    /// start of bank 1.
    fn try_straddle(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        match &mut self.backends {
            Backends::Heap(heaps) => {
                // Only one straddling allocation may be outstanding: free()
                // re-locates the bank-1 half by the bank-1 start address, so
                // a second one is refused until the first is released.
                if self.straddle_ptr.is_some() {
                    return None;
                }
                let (head, tail) = heaps.split_at_mut(1);
                let (bank0, bank1) = (&mut head[0], &mut tail[0]);

                let rem0 = bank0.free_space(align, FreeSpaceQuery::End).bytes;
                if rem0 == 0 || rem0 >= size {
                    return None;
                }
                let need1 = size - rem0;
                let head1 = bank1.free_space(1, FreeSpaceQuery::Start);
                if head1.start != bank1.usable_start() || head1.bytes < need1 {
                    return None;
                }

                let ptr0 = bank0.alloc_tail(rem0, align).ok()?;
                match bank1.alloc_head_exact(need1) {
                    Ok(ptr1) => {
                        debug_assert_eq!(
                            ptr0.as_ptr() as usize + rem0,
                            ptr1.as_ptr() as usize,
                            "straddle halves are not physically adjacent"
                        );
                        self.straddle_ptr = Some(ptr0.as_ptr() as usize);

                        #[cfg(feature = "logging")]
                        debug!(
                            "straddling allocation: {} bytes in bank 0, {} in bank 1",
                            rem0, need1
                        );

                        Some(ptr0)
                    }
                    Err(_) => {
                        let _ = bank0.free(ptr0);
                        None
                    }
                }
            }
            Backends::Stack(stacks) => {
                // A stack allocator cannot release part of a bank later
                // without breaking LIFO order, so the bank-1 half is only
                // placed into a completely empty bank.
                let (head, tail) = stacks.split_at_mut(1);
                let (bank0, bank1) = (&mut head[0], &mut tail[0]);
                if !bank1.is_empty() {
                    return None;
                }

                let rem0 = bank0.free_space(align).bytes;
                if rem0 == 0 || rem0 >= size {
                    return None;
                }
                let need1 = size - rem0;
                if bank1.free_space(1).bytes < need1 {
                    return None;
                }

                let undo = bank0.checkpoint();
                let ptr0 = bank0.alloc(rem0, align).ok()?;
                match bank1.alloc(need1, 1) {
                    Ok(_) => {
                        debug_assert_eq!(bank0.free_bytes(), 0);
                        Some(ptr0)
                    }
                    Err(_) => {
                        let _ = bank0.restore(undo);
                        None
                    }
                }
            }
        }
    }

    fn free(&mut self, sel: BankSelector, ptr: NonNull<u8>, clear: bool) -> MemResult<()> {
        let addr = ptr.as_ptr() as usize;

        // The recorded straddle is addressed by its bank-0 half.
        if self.straddle_ptr == Some(addr)
            && matches!(sel, BankSelector::Any | BankSelector::Bank(0))
        {
            let Backends::Heap(heaps) = &mut self.backends else {
                return Err(MemError::internal("straddle recorded under stack policy"));
            };
            let (head, tail) = heaps.split_at_mut(1);
            let (bank0, bank1) = (&mut head[0], &mut tail[0]);

            free_one(bank0, ptr, clear)?;
            let half1 = NonNull::new(bank1.usable_start() as *mut u8)
                .ok_or_else(|| MemError::internal("bank 1 start collapsed to null"))?;
            free_one(bank1, half1, clear)
                .map_err(|_| MemError::internal("straddle bank-1 half missing"))?;
            self.straddle_ptr = None;

            #[cfg(feature = "logging")]
            debug!("straddling allocation released");

            return Ok(());
        }

        let Backends::Heap(heaps) = &mut self.backends else {
            return Err(MemError::unsupported("free on stack allocator"));
        };
        match sel {
            BankSelector::Bank(bank) => free_one(heaps.get_mut(bank).ok_or_else(bad_bank)?, ptr, clear),
            BankSelector::Any => {
                let first = free_one(&mut heaps[0], ptr, clear);
                match first {
                    Err(MemError::PtrOutOfBounds { .. }) if heaps.len() > 1 => {
                        free_one(&mut heaps[1], ptr, clear)
                    }
                    other => other,
                }
            }
        }
    }
}

fn free_one(heap: &mut HeapAllocator, ptr: NonNull<u8>, clear: bool) -> MemResult<()> {
    if clear {
        heap.free_with_clear(ptr)
    } else {
        heap.free(ptr)
    }
}
