// Global tick source
use serde::{Deserialize, Serialize};

/// Source of the monotonic global tick counter.
pub trait CycleSource {
    fn ticks(&self) -> u64;
}

/// Minimal scheduler: counts the cycles retired by either engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scheduler {
    ticks: u64,
    instructions: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, cycles: u64, instructions: u64) {
        self.ticks = self.ticks.wrapping_add(cycles);
        self.instructions = self.instructions.wrapping_add(instructions);
    }

    pub fn instructions(&self) -> u64 {
        self.instructions
    }
}

impl CycleSource for Scheduler {
    fn ticks(&self) -> u64 {
        self.ticks
    }
}
