//! Interpreter
//!
//! Executes exactly one guest instruction per call against [`CpuState`].
//! Every handler is a plain function over the state and the decoded
//! instruction; [`Interpreter::execute`] is the jump table keyed by
//! [`Opcode`].
//!
//! The interpreter is also the JIT's fallback: compiled code flushes its
//! register cache and calls [`Interpreter::execute`] for any instruction it
//! has no code path for, so handlers must not assume anything about how
//! they were reached.

pub mod branch;
pub mod integer;
pub mod load_store;
pub mod system;

use crate::cpu::exceptions::{program_cause, ExceptionFlags};
use crate::cpu::state::CpuState;
use crate::cpu::ExecContext;
use crate::decoder::{DecodedInstruction, Instruction, Opcode};

/// What the dispatcher has to do after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Fall through to `npc`.
    Continue,
    /// Control flow went to `npc`; the block ends here.
    Branch,
    /// The block ends here (serialising instruction, trap not taken, ...).
    EndBlock,
    /// A synchronous exception was raised; `pc` is the faulting address.
    Exception,
    /// External exceptions must be checked before continuing at `npc`.
    ExceptionCheck,
}

impl StepOutcome {
    pub fn ends_block(self) -> bool {
        !matches!(self, StepOutcome::Continue)
    }
}

pub struct Interpreter;

impl Interpreter {
    /// Fetch, execute and retire the instruction at `cpu.pc`.
    ///
    /// Returns the outcome and the decoded instruction (if the fetch
    /// succeeded). On return `pc` points at the next instruction unless an
    /// exception was raised.
    pub fn step(
        cpu: &mut CpuState,
        ctx: &mut ExecContext<'_>,
    ) -> (StepOutcome, Option<DecodedInstruction>) {
        let word = match ctx.memory.read_u32(cpu.pc) {
            Ok(word) => word,
            Err(_) => {
                log::debug!("ISI: instruction fetch from 0x{:08X}", cpu.pc);
                cpu.exceptions.insert(ExceptionFlags::ISI);
                return (StepOutcome::Exception, None);
            }
        };
        let decoded = Instruction::decode(word, cpu.pc);
        cpu.npc = cpu.pc.wrapping_add(4);
        let outcome = Self::execute(cpu, ctx, decoded);
        if outcome != StepOutcome::Exception {
            cpu.pc = cpu.npc;
        }
        (outcome, Some(decoded))
    }

    /// Execute one decoded instruction. `cpu.pc` must be its address and
    /// `cpu.npc` the fall-through address.
    pub fn execute(
        cpu: &mut CpuState,
        ctx: &mut ExecContext<'_>,
        decoded: DecodedInstruction,
    ) -> StepOutcome {
        use Opcode::*;

        let inst = decoded.inst;
        let op = decoded.opcode;
        match op {
            Addi | Addis | Addic | AddicRc | Subfic | Mulli | AndiRc | AndisRc | Ori | Oris
            | Xori | Xoris => integer::execute_immediate(cpu, op, inst),
            Add | Addc | Adde | Addme | Addze | Subf | Subfc | Subfe | Subfme | Subfze | Neg
            | Mullw | Mulhw | Mulhwu | Divw | Divwu => {
                integer::execute_arithmetic(cpu, ctx, op, inst)
            }
            And | Andc | Or | Orc | Xor | Nand | Nor | Eqv | Extsb | Extsh | Cntlzw => {
                integer::execute_logical(cpu, op, inst)
            }
            Rlwimi | Rlwinm | Rlwnm | Slw | Srw | Sraw | Srawi => {
                integer::execute_rotate_shift(cpu, op, inst)
            }
            Cmp | Cmpl | Cmpi | Cmpli => integer::execute_compare(cpu, op, inst),
            Tw | Twi => return system::trap(cpu, op, inst),

            Mcrf => system::mcrf(cpu, inst),
            Mcrxr => system::mcrxr(cpu, inst),
            Mfcr => system::mfcr(cpu, inst),
            Mtcrf => system::mtcrf(cpu, inst),
            Crand | Crandc | Creqv | Crnand | Crnor | Cror | Crorc | Crxor => {
                system::cr_logical(cpu, op, inst)
            }

            Mfspr => system::mfspr(cpu, ctx, inst),
            Mtspr => system::mtspr(cpu, ctx, inst),
            Mftb => system::mftb(cpu, ctx, inst),
            Mfmsr => cpu.gpr[inst.rd()] = cpu.msr,
            Mtmsr => return system::mtmsr(cpu, ctx, inst),

            B => return branch::b(cpu, inst),
            Bc => return branch::bc(cpu, inst),
            Bclr => return branch::bclr(cpu, inst),
            Bcctr => return branch::bcctr(cpu, inst),
            Rfi => return system::rfi(cpu),
            Sc => return system::sc(cpu),
            Isync => return StepOutcome::EndBlock,
            Sync | Eieio | Dcbf | Dcbst | Dcbt | Dcbtst | Dcbi => {}

            Lwz | Lwzu | Lwzx | Lwzux | Lbz | Lbzu | Lbzx | Lbzux | Lhz | Lhzu | Lhzx | Lhzux
            | Lha | Lhau | Lhax | Lhaux | Stw | Stwu | Stwx | Stwux | Stb | Stbu | Stbx
            | Stbux | Sth | Sthu | Sthx | Sthux => {
                return match load_store::AccessForm::of(op) {
                    Some(form) => load_store::load_store(cpu, ctx, inst, form),
                    None => Self::illegal(cpu, decoded),
                };
            }
            Lmw => return load_store::lmw(cpu, ctx, inst),
            Stmw => return load_store::stmw(cpu, ctx, inst),
            Dcbz => return load_store::dcbz(cpu, ctx, inst),
            Icbi => return load_store::icbi(cpu, ctx, inst),

            Invalid => return Self::illegal(cpu, decoded),
        }
        StepOutcome::Continue
    }

    fn illegal(cpu: &mut CpuState, decoded: DecodedInstruction) -> StepOutcome {
        log::warn!(
            "illegal instruction 0x{:08X} at 0x{:08X}",
            decoded.inst.raw(),
            decoded.address
        );
        system::raise_program(cpu, program_cause::ILLEGAL)
    }
}
