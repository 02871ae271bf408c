//! JIT Intermediate Representation
//!
//! Register-transfer IR over a small file of 64-bit host registers. The
//! emitter produces one [`IrBlock`] per guest block; a [`Backend`] lowers it
//! to executable host code.
//!
//! # Register Conventions
//! - `R0`..`R4` are scratch registers owned by the emitter. `R0`..`R2` hold
//!   per-instruction temporaries; `R3` and `R4` are reserved for the CR and
//!   XER helper sequences.
//! - Registers from [`FIRST_ALLOCATABLE`] up are handed out by the guest GPR
//!   cache.
//! - Every guest 32-bit value lives zero-extended in its host register;
//!   `W32` operations re-establish that after every write.
//!
//! [`Backend`]: crate::jit::backend::Backend

use std::fmt;

use bitvec::prelude::*;

use crate::interpreter::load_store::AccessSize;

/// Number of host registers.
pub const HOST_REGISTER_COUNT: usize = 16;
/// First host register available to the GPR cache.
pub const FIRST_ALLOCATABLE: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostReg(pub u8);

impl HostReg {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HostReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

pub const RSCRATCH: HostReg = HostReg(0);
pub const RSCRATCH2: HostReg = HostReg(1);
pub const RSCRATCH3: HostReg = HostReg(2);
/// Condition-register helper scratch.
pub const RFLAGS: HostReg = HostReg(3);
pub const RFLAGS2: HostReg = HostReg(4);

/// Operation width. `W32` truncates and zero-extends the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W32,
    W64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(HostReg),
    Imm(u64),
}

impl From<HostReg> for Operand {
    fn from(reg: HostReg) -> Self {
        Operand::Reg(reg)
    }
}

/// Binary host operations. Shift and rotate counts are masked to the
/// operation width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Rotl,
    MulLo,
    /// High half of the signed product.
    MulHiS,
    /// High half of the unsigned product.
    MulHiU,
    /// Signed division; division by zero and `MIN / -1` fault.
    DivS,
    /// Unsigned division; division by zero faults.
    DivU,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    /// Leading zeros counted at the operation width.
    Clz,
    SignExt8,
    SignExt16,
    SignExt32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    LtS,
    LeS,
    GtS,
    GeS,
    LtU,
    LeU,
    GtU,
    GeU,
}

impl Cond {
    pub fn negate(self) -> Self {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::LtS => Cond::GeS,
            Cond::LeS => Cond::GtS,
            Cond::GtS => Cond::LeS,
            Cond::GeS => Cond::LtS,
            Cond::LtU => Cond::GeU,
            Cond::LeU => Cond::GtU,
            Cond::GtU => Cond::LeU,
            Cond::GeU => Cond::LtU,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// Values the dispatcher provides to running code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvSlot {
    /// Scheduler ticks at block entry.
    Ticks,
    TimeBaseStartTicks,
    TimeBaseStartValue,
    InterruptCause,
}

/// Retirement counts charged when control leaves the block at this point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Retire {
    pub cycles: u32,
    pub instructions: u32,
}

/// Guest instruction a memory access belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultSite {
    pub pc: u32,
    pub retire: Retire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Continue at a static guest address after a block-ending instruction.
    Jump(u32),
    /// Continue at a static guest address; the block was cut short
    /// (length limit, breakpoint, modified code) rather than ended.
    Fallthrough(u32),
    /// Continue at the guest address held in a host register.
    Indirect(HostReg),
    /// A synchronous exception is pending; `pc` was set by `SetPc`.
    Exception,
    /// Check external exceptions, then continue at the guest address.
    ExceptionCheck(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrInst {
    // Guest state
    LoadGpr { dst: HostReg, gpr: u8 },
    StoreGpr { gpr: u8, src: HostReg },
    LoadCr { dst: HostReg, field: u8 },
    StoreCr { field: u8, src: HostReg },
    LoadCa { dst: HostReg },
    StoreCa { src: HostReg },
    LoadSoOv { dst: HostReg },
    StoreSoOv { src: HostReg },
    LoadStringCtrl { dst: HostReg },
    StoreStringCtrl { src: HostReg },
    LoadSpr { dst: HostReg, spr: u16 },
    StoreSpr { spr: u16, src: HostReg },
    LoadMsr { dst: HostReg },
    StoreMsr { src: HostReg },
    LoadExceptions { dst: HostReg },
    RaiseException { flags: u32 },
    SetPc { pc: u32 },
    LoadEnv { dst: HostReg, slot: EnvSlot },

    // Computation
    MovImm { dst: HostReg, imm: u64 },
    Mov { width: Width, dst: HostReg, src: HostReg },
    Alu { op: AluOp, width: Width, dst: HostReg, a: HostReg, b: Operand },
    Unary { op: UnaryOp, width: Width, dst: HostReg, src: HostReg },
    /// `dst = (a cond b) as u64`
    SetCc { cond: Cond, width: Width, dst: HostReg, a: HostReg, b: Operand },

    // Control flow within the block; jumps only go forward.
    Label(Label),
    Jump(Label),
    Branch { cond: Cond, width: Width, a: HostReg, b: Operand, target: Label },

    // Memory; a failed access raises DSI and leaves the block.
    Load { size: AccessSize, signed: bool, dst: HostReg, addr: HostReg, site: FaultSite },
    Store { size: AccessSize, src: HostReg, addr: HostReg, site: FaultSite },
    /// Leave the block if a store so far overlapped the block's own code.
    ExitIfCodeModified { next: u32, retire: Retire },

    /// Execute one instruction through the interpreter.
    CallInterpreter { inst: u32, address: u32, cycles_before: u32, retire: Retire },

    Exit { kind: ExitKind, retire: Retire },
}

/// IR for one guest block.
#[derive(Debug, Clone)]
pub struct IrBlock {
    pub address: u32,
    /// One past the last guest byte the block covers.
    pub end: u32,
    pub guest_instructions: u32,
    pub insts: Vec<IrInst>,
    pub label_count: u32,
    /// Guest GPRs bound to host registers when emission finished.
    pub resident_at_exit: BitVec<u32>,
}

impl IrBlock {
    pub fn new(address: u32) -> Self {
        Self {
            address,
            end: address,
            guest_instructions: 0,
            insts: Vec::new(),
            label_count: 0,
            resident_at_exit: bitvec![u32, Lsb0; 0; 32],
        }
    }

    pub fn fallback_count(&self) -> usize {
        self.insts
            .iter()
            .filter(|inst| matches!(inst, IrInst::CallInterpreter { .. }))
            .count()
    }
}

impl fmt::Display for IrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block 0x{:08X}..0x{:08X}:", self.address, self.end)?;
        for inst in &self.insts {
            match inst {
                IrInst::Label(label) => writeln!(f, "L{}:", label.0)?,
                other => writeln!(f, "    {:?}", other)?,
            }
        }
        Ok(())
    }
}
