//! Block Cache
//!
//! Compiled blocks keyed by guest start address, with a page index so a
//! guest write only has to inspect the blocks that share its 4KiB pages.
//!
//! Every slot carries a generation that changes whenever its block is
//! removed. A [`BlockHandle`] remembers the generation it was issued for,
//! so running a handle whose block was invalidated fails with
//! [`CoreError::StaleBlock`] instead of executing stale code.

use std::collections::HashMap;

use bitvec::prelude::*;
use smallvec::SmallVec;

use crate::error::{CoreError, Result};
use crate::jit::backend::HostCode;

const PAGE_SHIFT: u32 = 12;

/// Reference to a compiled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    pub address: u32,
    slot: usize,
    generation: u64,
}

#[derive(Debug)]
pub struct CompiledBlock {
    pub address: u32,
    /// One past the last guest byte covered.
    pub end: u32,
    pub guest_instructions: u32,
    pub fallbacks: u32,
    pub gprs_read: BitVec<u32>,
    pub gprs_written: BitVec<u32>,
    pub resident_at_exit: BitVec<u32>,
    /// Number of full cache flushes before this block was compiled.
    pub epoch: u64,
    pub code: HostCode,
}

impl CompiledBlock {
    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        self.address < end && start < self.end
    }

    fn pages(&self) -> std::ops::RangeInclusive<u32> {
        let last = self.end.saturating_sub(1).max(self.address);
        (self.address >> PAGE_SHIFT)..=(last >> PAGE_SHIFT)
    }
}

#[derive(Debug, Default)]
struct Slot {
    block: Option<CompiledBlock>,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct BlockCache {
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_address: HashMap<u32, usize>,
    pages: HashMap<u32, SmallVec<[usize; 4]>>,
    next_generation: u64,
    flushes: u64,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Number of full flushes so far.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Insert a block, replacing any block already starting at its address.
    pub fn insert(&mut self, block: CompiledBlock) -> BlockHandle {
        if let Some(&old) = self.by_address.get(&block.address) {
            self.remove_slot(old);
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        self.next_generation += 1;
        let generation = self.next_generation;
        let address = block.address;

        for page in block.pages() {
            self.pages.entry(page).or_default().push(index);
        }
        self.by_address.insert(address, index);
        self.slots[index] = Slot {
            block: Some(block),
            generation,
        };
        BlockHandle {
            address,
            slot: index,
            generation,
        }
    }

    pub fn lookup(&self, address: u32) -> Option<BlockHandle> {
        let index = *self.by_address.get(&address)?;
        Some(BlockHandle {
            address,
            slot: index,
            generation: self.slots[index].generation,
        })
    }

    /// Resolve a handle, failing if its block is gone.
    pub fn get(&self, handle: BlockHandle) -> Result<&CompiledBlock> {
        self.slots
            .get(handle.slot)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.block.as_ref())
            .ok_or(CoreError::StaleBlock {
                address: handle.address,
                generation: handle.generation,
            })
    }

    pub fn block_at(&self, address: u32) -> Option<&CompiledBlock> {
        let index = *self.by_address.get(&address)?;
        self.slots[index].block.as_ref()
    }

    /// Block whose guest range contains `address`.
    pub fn block_containing(&self, address: u32) -> Option<&CompiledBlock> {
        self.pages
            .get(&(address >> PAGE_SHIFT))?
            .iter()
            .filter_map(|&index| self.slots[index].block.as_ref())
            .find(|block| block.overlaps(address, address.wrapping_add(1)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledBlock> {
        self.slots.iter().filter_map(|slot| slot.block.as_ref())
    }

    /// Remove every block overlapping `[address, address + len)`.
    pub fn invalidate_range(&mut self, address: u32, len: u32) -> usize {
        if len == 0 || self.by_address.is_empty() {
            return 0;
        }
        let end = address.saturating_add(len);
        let last_page = (end - 1) >> PAGE_SHIFT;

        let mut victims: SmallVec<[usize; 8]> = SmallVec::new();
        for page in (address >> PAGE_SHIFT)..=last_page {
            let Some(slots) = self.pages.get(&page) else {
                continue;
            };
            for &index in slots {
                let hit = self.slots[index]
                    .block
                    .as_ref()
                    .is_some_and(|block| block.overlaps(address, end));
                if hit && !victims.contains(&index) {
                    victims.push(index);
                }
            }
        }

        for &index in &victims {
            if let Some(block) = self.slots[index].block.as_ref() {
                log::debug!(
                    "invalidating block 0x{:08X}..0x{:08X} (write 0x{:08X}+{})",
                    block.address,
                    block.end,
                    address,
                    len
                );
            }
            self.remove_slot(index);
        }
        victims.len()
    }

    /// Drop every block.
    pub fn clear(&mut self) {
        for index in 0..self.slots.len() {
            if self.slots[index].block.is_some() {
                self.remove_slot(index);
            }
        }
        self.flushes += 1;
    }

    fn remove_slot(&mut self, index: usize) {
        let Some(block) = self.slots[index].block.take() else {
            return;
        };
        for page in block.pages() {
            if let Some(slots) = self.pages.get_mut(&page) {
                slots.retain(|slot| *slot != index);
                if slots.is_empty() {
                    self.pages.remove(&page);
                }
            }
        }
        self.by_address.remove(&block.address);
        self.next_generation += 1;
        self.slots[index].generation = self.next_generation;
        self.free.push(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::backend::{Backend, ThreadedBackend};
    use crate::jit::ir::{ExitKind, IrBlock, IrInst, Retire};

    fn block(address: u32, instructions: u32) -> CompiledBlock {
        let end = address + 4 * instructions;
        let mut ir = IrBlock::new(address);
        ir.end = end;
        ir.insts.push(IrInst::Exit {
            kind: ExitKind::Jump(end),
            retire: Retire { cycles: instructions, instructions },
        });
        CompiledBlock {
            address,
            end,
            guest_instructions: instructions,
            fallbacks: 0,
            gprs_read: BitVec::repeat(false, 32),
            gprs_written: BitVec::repeat(false, 32),
            resident_at_exit: BitVec::repeat(false, 32),
            epoch: 0,
            code: ThreadedBackend.lower(&ir).unwrap(),
        }
    }

    #[test]
    fn test_overlapping_write_invalidates() {
        let mut cache = BlockCache::new();
        let handle = cache.insert(block(0x8000_1000, 4));
        cache.insert(block(0x8000_2000, 4));

        assert_eq!(cache.invalidate_range(0x8000_100C, 4), 1);
        assert!(matches!(cache.get(handle), Err(CoreError::StaleBlock { .. })));
        assert!(cache.lookup(0x8000_1000).is_none());
        assert!(cache.lookup(0x8000_2000).is_some());
    }

    #[test]
    fn test_adjacent_write_keeps_block() {
        let mut cache = BlockCache::new();
        let handle = cache.insert(block(0x8000_1000, 4));
        assert_eq!(cache.invalidate_range(0x8000_1010, 4), 0);
        assert_eq!(cache.invalidate_range(0x8000_0FFC, 4), 0);
        assert!(cache.get(handle).is_ok());
    }

    #[test]
    fn test_block_spanning_pages() {
        let mut cache = BlockCache::new();
        cache.insert(block(0x8000_1FF8, 4));
        assert!(cache.block_containing(0x8000_2000).is_some());
        assert_eq!(cache.invalidate_range(0x8000_2004, 1), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reused_slot_rejects_old_handle() {
        let mut cache = BlockCache::new();
        let old = cache.insert(block(0x8000_1000, 1));
        cache.clear();
        let new = cache.insert(block(0x8000_1000, 1));
        assert!(cache.get(old).is_err());
        assert!(cache.get(new).is_ok());
        assert_eq!(cache.flushes(), 1);
    }
}
