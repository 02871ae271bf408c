//! Guest CPU model shared by both execution engines.

pub mod exceptions;
pub mod flags;
pub mod memory;
pub mod scheduler;
pub mod state;
pub mod timebase;

use smallvec::SmallVec;

use crate::config::OverflowPolicy;
use exceptions::ExceptionSignal;
use memory::GuestMemory;
use timebase::TimeBase;

/// A guest write that may have touched translated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeWrite {
    pub address: u32,
    pub len: u32,
}

impl CodeWrite {
    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        let write_end = self.address.wrapping_add(self.len);
        self.address < end && start < write_end
    }
}

/// Collaborators an instruction may reach while it executes.
pub struct ExecContext<'a> {
    pub memory: &'a mut dyn GuestMemory,
    pub timebase: &'a mut TimeBase,
    pub signal: &'a ExceptionSignal,
    /// Scheduler ticks as of the instruction being executed.
    pub ticks: u64,
    pub overflow_policy: OverflowPolicy,
    /// Writes and cache-line invalidations to apply to the block cache.
    pub code_writes: SmallVec<[CodeWrite; 4]>,
}

impl<'a> ExecContext<'a> {
    pub fn new(
        memory: &'a mut dyn GuestMemory,
        timebase: &'a mut TimeBase,
        signal: &'a ExceptionSignal,
        ticks: u64,
        overflow_policy: OverflowPolicy,
    ) -> Self {
        Self {
            memory,
            timebase,
            signal,
            ticks,
            overflow_policy,
            code_writes: SmallVec::new(),
        }
    }

    #[inline]
    pub fn record_write(&mut self, address: u32, len: u32) {
        self.code_writes.push(CodeWrite { address, len });
    }
}
