//! Guest GPR Cache
//!
//! Maps guest general-purpose registers onto the allocatable host registers
//! for the duration of one block.
//!
//! # Allocation Strategy
//! - A guest register is bound on first use and stays bound until evicted.
//! - Eviction picks the least recently used unlocked binding and stores it
//!   back first if it is dirty.
//! - Registers bound during the current guest instruction are locked so an
//!   instruction's own operands are never evicted under it.
//! - Before anything that can observe guest state (memory access, SPR/MSR
//!   writes, interpreter fallbacks, exits) the emitter flushes: dirty values
//!   are stored back, bindings are kept.

use bitvec::prelude::*;
use smallvec::SmallVec;

use crate::error::{CoreError, GuestLocation, Result};
use crate::jit::ir::{HostReg, IrInst, FIRST_ALLOCATABLE};

/// How an instruction uses a guest register it binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    fn reads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    host: HostReg,
    guest: Option<u8>,
    dirty: bool,
    locked: bool,
    last_use: u32,
}

#[derive(Debug, Clone)]
pub struct GprCache {
    slots: SmallVec<[Slot; 12]>,
    bindings: [Option<u8>; 32],
    clock: u32,
}

impl GprCache {
    pub fn new(host_registers: usize) -> Self {
        let slots = (0..host_registers)
            .map(|i| Slot {
                host: HostReg(FIRST_ALLOCATABLE + i as u8),
                guest: None,
                dirty: false,
                locked: false,
                last_use: 0,
            })
            .collect();
        Self {
            slots,
            bindings: [None; 32],
            clock: 0,
        }
    }

    /// Bind `gpr` to a host register for the current instruction.
    pub fn bind(
        &mut self,
        gpr: usize,
        access: Access,
        at: GuestLocation,
        out: &mut Vec<IrInst>,
    ) -> Result<HostReg> {
        self.clock = self.clock.wrapping_add(1);
        if let Some(index) = self.bindings[gpr] {
            let slot = &mut self.slots[index as usize];
            slot.dirty |= access.writes();
            slot.locked = true;
            slot.last_use = self.clock;
            return Ok(slot.host);
        }

        let index = self.pick_victim().ok_or(CoreError::RegistersExhausted {
            gpr: gpr as u8,
            location: at,
        })?;
        self.evict(index, out);

        let slot = &mut self.slots[index];
        if access.reads() {
            out.push(IrInst::LoadGpr { dst: slot.host, gpr: gpr as u8 });
        }
        slot.guest = Some(gpr as u8);
        slot.dirty = access.writes();
        slot.locked = true;
        slot.last_use = self.clock;
        self.bindings[gpr] = Some(index as u8);
        Ok(slot.host)
    }

    fn pick_victim(&self) -> Option<usize> {
        if let Some(free) = self.slots.iter().position(|slot| slot.guest.is_none()) {
            return Some(free);
        }
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.locked)
            .min_by_key(|(_, slot)| slot.last_use)
            .map(|(index, _)| index)
    }

    fn evict(&mut self, index: usize, out: &mut Vec<IrInst>) {
        let slot = &mut self.slots[index];
        if let Some(gpr) = slot.guest.take() {
            if slot.dirty {
                out.push(IrInst::StoreGpr { gpr, src: slot.host });
            }
            self.bindings[gpr as usize] = None;
        }
        slot.dirty = false;
        slot.locked = false;
    }

    pub fn unlock_all(&mut self) {
        for slot in &mut self.slots {
            slot.locked = false;
        }
    }

    /// Store every dirty binding back; bindings stay valid.
    pub fn flush(&mut self, out: &mut Vec<IrInst>) {
        for slot in &mut self.slots {
            if let (Some(gpr), true) = (slot.guest, slot.dirty) {
                out.push(IrInst::StoreGpr { gpr, src: slot.host });
                slot.dirty = false;
            }
        }
    }

    /// Forget all bindings. Used after code the cache cannot see wrote guest
    /// registers; callers flush first.
    pub fn discard(&mut self) {
        debug_assert!(self.slots.iter().all(|slot| !slot.dirty));
        for slot in &mut self.slots {
            slot.guest = None;
            slot.dirty = false;
            slot.locked = false;
        }
        self.bindings = [None; 32];
    }

    /// Drop the binding of `gpr` without storing it.
    pub fn invalidate(&mut self, gpr: usize) {
        if let Some(index) = self.bindings[gpr].take() {
            let slot = &mut self.slots[index as usize];
            slot.guest = None;
            slot.dirty = false;
            slot.locked = false;
        }
    }

    pub fn is_resident(&self, gpr: usize) -> bool {
        self.bindings[gpr].is_some()
    }

    pub fn is_dirty(&self, gpr: usize) -> bool {
        self.bindings[gpr].is_some_and(|index| self.slots[index as usize].dirty)
    }

    pub fn is_clean(&self) -> bool {
        self.slots.iter().all(|slot| !slot.dirty)
    }

    /// Guest registers currently held in host registers.
    pub fn resident(&self) -> BitVec<u32> {
        let mut set = bitvec![u32, Lsb0; 0; 32];
        for (gpr, binding) in self.bindings.iter().enumerate() {
            set.set(gpr, binding.is_some());
        }
        set
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
