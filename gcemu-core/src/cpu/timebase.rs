//! Virtual time base.
//!
//! The time base advances once every [`TIMER_RATIO`] scheduler ticks,
//! counted from a base tick/value pair. Guest writes and save-state loads
//! re-base the pair so the counter continues from the new value.

use serde::{Deserialize, Serialize};

/// Scheduler ticks per time-base increment.
pub const TIMER_RATIO: u64 = 12;

/// Fixed-point reciprocal of [`TIMER_RATIO`]: `(x * RECIPROCAL) >> 67 == x / 12`.
pub const RECIPROCAL: u64 = 0xAAAA_AAAA_AAAA_AAAB;
/// Extra right shift applied to the high half of the 128-bit product.
pub const RECIPROCAL_SHIFT: u32 = 3;

/// `ticks / 12` through the reciprocal multiply the JIT emits.
#[inline]
pub fn ticks_to_timebase(ticks: u64) -> u64 {
    (((ticks as u128) * (RECIPROCAL as u128)) >> 64) as u64 >> RECIPROCAL_SHIFT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeBase {
    start_ticks: u64,
    start_value: u64,
}

impl TimeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_ticks(&self) -> u64 {
        self.start_ticks
    }

    pub fn start_value(&self) -> u64 {
        self.start_value
    }

    pub fn read_both(&self, ticks: u64) -> u64 {
        let elapsed = ticks.saturating_sub(self.start_ticks);
        self.start_value.wrapping_add(ticks_to_timebase(elapsed))
    }

    pub fn read_lower(&self, ticks: u64) -> u32 {
        self.read_both(ticks) as u32
    }

    pub fn read_upper(&self, ticks: u64) -> u32 {
        (self.read_both(ticks) >> 32) as u32
    }

    /// Continue counting from `value` as of `ticks`.
    pub fn rebase(&mut self, value: u64, ticks: u64) {
        self.start_ticks = ticks;
        self.start_value = value;
    }

    pub fn write_lower(&mut self, ticks: u64, value: u32) {
        let current = self.read_both(ticks);
        self.rebase((current & 0xFFFF_FFFF_0000_0000) | u64::from(value), ticks);
    }

    pub fn write_upper(&mut self, ticks: u64, value: u32) {
        let current = self.read_both(ticks);
        self.rebase((current & 0xFFFF_FFFF) | (u64::from(value) << 32), ticks);
    }
}
