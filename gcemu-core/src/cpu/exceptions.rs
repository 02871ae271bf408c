//! Guest exception bookkeeping and delivery.
//!
//! Pending exceptions are a bit set on [`CpuState`]. Devices running on
//! other threads never touch that set directly: they post into an
//! [`ExceptionSignal`] mailbox, which the dispatcher drains at instruction
//! or block boundaries.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::cpu::state::{msr, spr, CpuState};

bitflags! {
    /// Set of pending guest exceptions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ExceptionFlags: u32 {
        const ISI = 1 << 0;
        const DSI = 1 << 1;
        const ALIGNMENT = 1 << 2;
        const PROGRAM = 1 << 3;
        const SYSCALL = 1 << 4;
        const FPU_UNAVAILABLE = 1 << 5;
        const EXTERNAL_INT = 1 << 6;
        const DECREMENTER = 1 << 7;
        const PERFORMANCE_MONITOR = 1 << 8;
    }
}

impl ExceptionFlags {
    /// Exceptions gated by MSR.EE.
    pub const EXTERNAL_MASK: Self = Self::EXTERNAL_INT
        .union(Self::DECREMENTER)
        .union(Self::PERFORMANCE_MONITOR);
}

/// Cause bits recorded in SRR1 for program exceptions.
pub mod program_cause {
    pub const FLOATING_POINT: u32 = 0x0010_0000;
    pub const ILLEGAL: u32 = 0x0008_0000;
    pub const PRIVILEGED: u32 = 0x0004_0000;
    pub const TRAP: u32 = 0x0002_0000;
    pub const MASK: u32 = 0x001E_0000;
}

/// Processor-interface interrupt cause raised by the command processor.
pub const INT_CAUSE_CP: u32 = 0x800;

/// A deliverable exception, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExceptionKind {
    InstructionStorage,
    Program,
    SystemCall,
    FpuUnavailable,
    DataStorage,
    Alignment,
    ExternalInterrupt,
    PerformanceMonitor,
    Decrementer,
}

impl ExceptionKind {
    const SYNCHRONOUS: [ExceptionKind; 6] = [
        ExceptionKind::InstructionStorage,
        ExceptionKind::Program,
        ExceptionKind::SystemCall,
        ExceptionKind::FpuUnavailable,
        ExceptionKind::DataStorage,
        ExceptionKind::Alignment,
    ];

    const EXTERNAL: [ExceptionKind; 3] = [
        ExceptionKind::ExternalInterrupt,
        ExceptionKind::PerformanceMonitor,
        ExceptionKind::Decrementer,
    ];

    pub fn flag(self) -> ExceptionFlags {
        match self {
            ExceptionKind::InstructionStorage => ExceptionFlags::ISI,
            ExceptionKind::Program => ExceptionFlags::PROGRAM,
            ExceptionKind::SystemCall => ExceptionFlags::SYSCALL,
            ExceptionKind::FpuUnavailable => ExceptionFlags::FPU_UNAVAILABLE,
            ExceptionKind::DataStorage => ExceptionFlags::DSI,
            ExceptionKind::Alignment => ExceptionFlags::ALIGNMENT,
            ExceptionKind::ExternalInterrupt => ExceptionFlags::EXTERNAL_INT,
            ExceptionKind::PerformanceMonitor => ExceptionFlags::PERFORMANCE_MONITOR,
            ExceptionKind::Decrementer => ExceptionFlags::DECREMENTER,
        }
    }

    pub fn vector(self) -> u32 {
        match self {
            ExceptionKind::DataStorage => 0x300,
            ExceptionKind::InstructionStorage => 0x400,
            ExceptionKind::ExternalInterrupt => 0x500,
            ExceptionKind::Alignment => 0x600,
            ExceptionKind::Program => 0x700,
            ExceptionKind::FpuUnavailable => 0x800,
            ExceptionKind::Decrementer => 0x900,
            ExceptionKind::SystemCall => 0xC00,
            ExceptionKind::PerformanceMonitor => 0xF00,
        }
    }
}

struct SignalInner {
    pending: AtomicU32,
    check_requested: AtomicBool,
    interrupt_cause: AtomicU32,
}

/// Thread-safe handle used by devices to request exception checks.
#[derive(Clone)]
pub struct ExceptionSignal {
    inner: Arc<SignalInner>,
}

impl ExceptionSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                pending: AtomicU32::new(0),
                check_requested: AtomicBool::new(false),
                interrupt_cause: AtomicU32::new(0),
            }),
        }
    }

    /// Post `flags` and ask the CPU thread to check exceptions.
    pub fn raise(&self, flags: ExceptionFlags) {
        self.inner.pending.fetch_or(flags.bits(), Ordering::AcqRel);
        self.inner.check_requested.store(true, Ordering::Release);
    }

    /// Ask for pending exceptions to be re-evaluated at the next block boundary.
    pub fn request_check(&self) {
        self.inner.check_requested.store(true, Ordering::Release);
    }

    pub fn is_check_requested(&self) -> bool {
        self.inner.check_requested.load(Ordering::Acquire)
    }

    pub fn set_interrupt_cause(&self, cause: u32) {
        self.inner.interrupt_cause.store(cause, Ordering::Release);
    }

    pub fn interrupt_cause(&self) -> u32 {
        self.inner.interrupt_cause.load(Ordering::Acquire)
    }

    /// Take everything posted since the last drain.
    pub fn drain(&self) -> ExceptionFlags {
        if !self.inner.check_requested.swap(false, Ordering::AcqRel) {
            return ExceptionFlags::empty();
        }
        ExceptionFlags::from_bits_truncate(self.inner.pending.swap(0, Ordering::AcqRel))
    }
}

impl Default for ExceptionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExceptionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionSignal")
            .field("pending", &self.inner.pending.load(Ordering::Relaxed))
            .field("check_requested", &self.is_check_requested())
            .finish()
    }
}

/// Dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchState {
    Running,
    ExceptionPending,
    Delivering,
}

/// Evaluates pending exceptions and redirects the guest to their vectors.
#[derive(Debug)]
pub struct ExceptionDispatcher {
    state: DispatchState,
    delivered: u64,
    last: Option<ExceptionKind>,
}

impl ExceptionDispatcher {
    pub fn new() -> Self {
        Self {
            state: DispatchState::Running,
            delivered: 0,
            last: None,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn last_delivered(&self) -> Option<ExceptionKind> {
        self.last
    }

    /// Merge exceptions posted from other threads into the guest state.
    pub fn poll(&mut self, cpu: &mut CpuState, signal: &ExceptionSignal) {
        let posted = signal.drain();
        if !posted.is_empty() {
            log::trace!("exceptions posted: {:#x}", posted.bits());
            cpu.exceptions.insert(posted);
        }
        self.state = if Self::next_deliverable(cpu).is_some() {
            DispatchState::ExceptionPending
        } else {
            DispatchState::Running
        };
    }

    /// Deliver the highest-priority deliverable exception, if any.
    pub fn check_exceptions(&mut self, cpu: &mut CpuState) -> Option<ExceptionKind> {
        let kind = Self::next_deliverable(cpu)?;
        self.deliver(cpu, kind);
        Some(kind)
    }

    /// Deliver only EE-gated exceptions.
    pub fn check_external_exceptions(&mut self, cpu: &mut CpuState) -> Option<ExceptionKind> {
        if cpu.msr & msr::EE == 0 {
            return None;
        }
        let kind = ExceptionKind::EXTERNAL
            .into_iter()
            .find(|kind| cpu.exceptions.contains(kind.flag()))?;
        self.deliver(cpu, kind);
        Some(kind)
    }

    fn next_deliverable(cpu: &CpuState) -> Option<ExceptionKind> {
        if let Some(kind) = ExceptionKind::SYNCHRONOUS
            .into_iter()
            .find(|kind| cpu.exceptions.contains(kind.flag()))
        {
            return Some(kind);
        }
        if cpu.msr & msr::EE == 0 {
            return None;
        }
        ExceptionKind::EXTERNAL
            .into_iter()
            .find(|kind| cpu.exceptions.contains(kind.flag()))
    }

    fn deliver(&mut self, cpu: &mut CpuState, kind: ExceptionKind) {
        self.state = DispatchState::Delivering;

        let cause = match kind {
            ExceptionKind::Program => cpu.spr[spr::SRR1] & program_cause::MASK,
            _ => 0,
        };
        cpu.spr[spr::SRR0] = cpu.pc;
        cpu.spr[spr::SRR1] = (cpu.msr & msr::SRR1_MASK) | cause;
        cpu.msr &= !msr::EXCEPTION_CLEAR;

        let mut vector = kind.vector();
        if cpu.msr & msr::IP != 0 {
            vector |= 0xFFF0_0000;
        }
        log::debug!(
            "delivering {:?} from 0x{:08X} to 0x{:08X}",
            kind,
            cpu.pc,
            vector
        );
        cpu.set_pc(vector);
        cpu.exceptions.remove(kind.flag());

        self.delivered += 1;
        self.last = Some(kind);
        self.state = if Self::next_deliverable(cpu).is_some() {
            DispatchState::ExceptionPending
        } else {
            DispatchState::Running
        };
    }
}

impl Default for ExceptionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_waits_for_ee() {
        let mut cpu = CpuState::new();
        let mut dispatcher = ExceptionDispatcher::new();
        cpu.set_pc(0x8000_1000);
        cpu.exceptions.insert(ExceptionFlags::DECREMENTER);

        assert_eq!(dispatcher.check_exceptions(&mut cpu), None);

        cpu.msr |= msr::EE;
        assert_eq!(
            dispatcher.check_exceptions(&mut cpu),
            Some(ExceptionKind::Decrementer)
        );
        assert_eq!(cpu.pc, 0x900);
        assert_eq!(cpu.spr[spr::SRR0], 0x8000_1000);
        assert_eq!(cpu.msr & msr::EE, 0);
        assert!(cpu.exceptions.is_empty());
    }

    #[test]
    fn test_signal_drains_once() {
        let signal = ExceptionSignal::new();
        signal.raise(ExceptionFlags::EXTERNAL_INT);
        assert_eq!(signal.drain(), ExceptionFlags::EXTERNAL_INT);
        assert!(signal.drain().is_empty());
    }

    #[test]
    fn test_pending_flags_survive_state_serialization() {
        let mut cpu = CpuState::new();
        cpu.exceptions.insert(ExceptionFlags::DSI | ExceptionFlags::DECREMENTER);
        let json = serde_json::to_string(&cpu).unwrap();
        let restored: CpuState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.exceptions, cpu.exceptions);
        assert!(restored.exceptions.intersects(ExceptionFlags::EXTERNAL_MASK));
    }

    #[test]
    fn test_signal_drops_undefined_bits() {
        let signal = ExceptionSignal::new();
        signal.inner.pending.fetch_or(0x8000_0000, Ordering::AcqRel);
        signal.raise(ExceptionFlags::SYSCALL);
        assert_eq!(signal.drain(), ExceptionFlags::SYSCALL);
    }
}
