//! FIFO of blocked contexts, stored in one dedicated page.
//!
//! The page starts with a small header followed by an arena of `(id, next)`
//! node slots. Slots are 1-based so that 0 can serve as the null link. A slot
//! comes off the free list if one is available, otherwise from the untouched
//! tail of the arena, and goes back on the free list when popped. The queue
//! does no locking of its own.

use crate::error::SyncError;
use crate::memory::{UserMemory, VirtAddr, WORDS_PER_PAGE};
use crate::types::ContextId;
use log::trace;

const NIL: u32 = 0;

const FIRST: u32 = 0;
const LAST: u32 = 1;
const FREE: u32 = 2;
const HIGH_WATER: u32 = 3;
const LEN: u32 = 4;
const HEADER_WORDS: u32 = 5;

/// Number of waiters one queue page can hold.
pub const CAPACITY: u32 = (WORDS_PER_PAGE - HEADER_WORDS) / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitQueue {
    page: VirtAddr,
}

impl WaitQueue {
    /// View the queue living in `page`. The page must be mapped and `init`ed.
    pub const fn at(page: VirtAddr) -> Self {
        Self { page }
    }

    pub fn page(&self) -> VirtAddr {
        self.page
    }

    /// Reset to an empty queue with an untouched arena.
    pub fn init<M: UserMemory>(&self, mem: &M) -> Result<(), SyncError> {
        for word in 0..HEADER_WORDS {
            mem.store(self.header(word), 0)?;
        }
        Ok(())
    }

    pub fn is_empty<M: UserMemory>(&self, mem: &M) -> Result<bool, SyncError> {
        Ok(mem.load(self.header(FIRST))? == NIL)
    }

    pub fn len<M: UserMemory>(&self, mem: &M) -> Result<u32, SyncError> {
        Ok(mem.load(self.header(LEN))?)
    }

    /// Link `id` at the tail.
    pub fn append<M: UserMemory>(&self, mem: &M, id: ContextId) -> Result<(), SyncError> {
        let slot = self.take_slot(mem)?;
        mem.store(self.slot_id(slot), id.val())?;
        mem.store(self.slot_next(slot), NIL)?;

        let last = mem.load(self.header(LAST))?;
        if last == NIL {
            mem.store(self.header(FIRST), slot)?;
        } else {
            mem.store(self.slot_next(last), slot)?;
        }
        mem.store(self.header(LAST), slot)?;
        self.adjust_len(mem, 1)?;

        trace!("wait queue {}: appended {} in slot {}", self.page, id, slot);
        Ok(())
    }

    /// Unlink and return the head. Fails on an empty queue.
    pub fn pop<M: UserMemory>(&self, mem: &M) -> Result<ContextId, SyncError> {
        let first = mem.load(self.header(FIRST))?;
        if first == NIL {
            return Err(SyncError::QueueEmpty);
        }

        let raw = mem.load(self.slot_id(first))?;
        let next = mem.load(self.slot_next(first))?;
        mem.store(self.header(FIRST), next)?;
        if next == NIL {
            mem.store(self.header(LAST), NIL)?;
        }
        self.adjust_len(mem, -1)?;
        self.release_slot(mem, first)?;

        let id = ContextId::new(raw).ok_or(SyncError::CorruptSlot(first))?;
        trace!("wait queue {}: popped {} from slot {}", self.page, id, first);
        Ok(id)
    }

    fn take_slot<M: UserMemory>(&self, mem: &M) -> Result<u32, SyncError> {
        let free = mem.load(self.header(FREE))?;
        if free != NIL {
            let next = mem.load(self.slot_next(free))?;
            mem.store(self.header(FREE), next)?;
            return Ok(free);
        }

        let high_water = mem.load(self.header(HIGH_WATER))?;
        if high_water >= CAPACITY {
            return Err(SyncError::QueueFull(CAPACITY));
        }
        mem.store(self.header(HIGH_WATER), high_water + 1)?;
        Ok(high_water + 1)
    }

    fn release_slot<M: UserMemory>(&self, mem: &M, slot: u32) -> Result<(), SyncError> {
        let free = mem.load(self.header(FREE))?;
        mem.store(self.slot_id(slot), 0)?;
        mem.store(self.slot_next(slot), free)?;
        mem.store(self.header(FREE), slot)?;
        Ok(())
    }

    fn adjust_len<M: UserMemory>(&self, mem: &M, delta: i32) -> Result<(), SyncError> {
        let len = mem.load(self.header(LEN))?;
        mem.store(self.header(LEN), len.wrapping_add_signed(delta))?;
        Ok(())
    }

    fn header(&self, word: u32) -> VirtAddr {
        self.page.word(word)
    }

    fn slot_id(&self, slot: u32) -> VirtAddr {
        self.page.word(HEADER_WORDS + (slot - 1) * 2)
    }

    fn slot_next(&self, slot: u32) -> VirtAddr {
        self.slot_id(slot).word(1)
    }
}
