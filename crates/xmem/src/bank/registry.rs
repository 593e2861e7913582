//! Registry mapping calling threads to bank managers
//!
//! A fixed-capacity slot table. Each occupied slot holds a manager bound to
//! one owning thread, or — with no owner — the "global" manager reachable by
//! any caller whose thread owns no slot of its own. Managers are handed out
//! as `Arc` so releasing a slot can never invalidate a handle already in use.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::RwLock;

use super::BankManager;
use crate::error::{MemError, MemResult};

/// Registry capacity unless configured otherwise.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 4;

/// Handle to an occupied registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(usize);

struct SlotEntry {
    owner: Option<ThreadId>,
    manager: Arc<BankManager>,
}

/// Fixed-capacity table of [`BankManager`] slots.
pub struct BankRegistry {
    slots: Box<[RwLock<Option<SlotEntry>>]>,
}

impl BankRegistry {
    /// Creates a registry with room for `capacity` managers.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| RwLock::new(None)).collect(),
        }
    }

    /// Number of slots in the table
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.read().is_some()).count()
    }

    /// Whether no slot is occupied
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Installs `manager` into the first uninitialized slot.
    ///
    /// `owner: None` makes this the global manager, resolvable by any thread
    /// without a slot of its own.
    pub fn register(
        &self,
        manager: BankManager,
        owner: Option<ThreadId>,
    ) -> MemResult<SlotId> {
        let entry = SlotEntry {
            owner,
            manager: Arc::new(manager),
        };
        let mut entry = Some(entry);
        for (index, slot) in self.slots.iter().enumerate() {
            let mut guard = slot.write();
            if guard.is_none() {
                *guard = entry.take();
                return Ok(SlotId(index));
            }
        }
        Err(MemError::init_mgr_failed("no free registry slot"))
    }

    /// Installs the global (ownerless) manager.
    pub fn register_global(&self, manager: BankManager) -> MemResult<SlotId> {
        self.register(manager, None)
    }

    /// Installs a manager owned by the calling thread.
    pub fn register_for_current(&self, manager: BankManager) -> MemResult<SlotId> {
        self.register(manager, Some(thread::current().id()))
    }

    /// The manager for the current caller: the slot owned by this thread if
    /// one exists, else the global slot, else `None`.
    pub fn resolve(&self) -> Option<Arc<BankManager>> {
        let caller = thread::current().id();
        let mut global = None;
        for slot in &self.slots {
            if let Some(entry) = &*slot.read() {
                if entry.owner == Some(caller) {
                    return Some(Arc::clone(&entry.manager));
                }
                if entry.owner.is_none() && global.is_none() {
                    global = Some(Arc::clone(&entry.manager));
                }
            }
        }
        global
    }

    /// The manager in a specific slot, if occupied.
    pub fn get(&self, id: SlotId) -> Option<Arc<BankManager>> {
        self.slots
            .get(id.0)?
            .read()
            .as_ref()
            .map(|entry| Arc::clone(&entry.manager))
    }

    /// Marks the slot uninitialized, permitting reuse.
    ///
    /// A thread-owned slot may only be released by its owner. The managed
    /// regions are not zeroed or unmapped; handles already resolved stay
    /// valid until dropped.
    pub fn release(&self, id: SlotId) -> MemResult<()> {
        let slot = self
            .slots
            .get(id.0)
            .ok_or_else(|| MemError::invalid_args("slot id out of range"))?;
        let mut guard = slot.write();
        match &*guard {
            None => Err(MemError::invalid_args("slot is not initialized")),
            Some(entry) => {
                if let Some(owner) = entry.owner
                    && owner != thread::current().id()
                {
                    return Err(MemError::invalid_args("slot owned by another thread"));
                }
                *guard = None;
                Ok(())
            }
        }
    }
}

impl Default for BankRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_CAPACITY)
    }
}

impl core::fmt::Debug for BankRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BankRegistry")
            .field("capacity", &self.capacity())
            .field("occupied", &self.len())
            .finish()
    }
}
