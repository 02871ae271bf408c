//! Block Emitter
//!
//! Translates a [`BlockPlan`] into an [`IrBlock`], one guest instruction at
//! a time. Instruction groups live in the submodules; this module owns the
//! per-block context, the GPR cache and the helper sequences shared by all
//! groups (condition-register bit access, CR0 update, XER overflow and the
//! interpreter fallback).
//!
//! # Invariants
//! - The GPR cache is flushed before any conditional path that can leave
//!   the block, so every exit sees guest state fully written back.
//! - Exits carry the cycles and instruction count retired up to and
//!   including the instruction that exits.
//! - An instruction the emitter has no code path for (or whose group is
//!   disabled in [`JitConfig`]) becomes a `CallInterpreter`; the cache is
//!   flushed and discarded around it.
//! - An instruction that needs more host registers than the cache holds is
//!   rolled back and emitted as a fallback instead.

mod branch;
mod integer;
mod load_store;
mod system;

use crate::config::{JitConfig, OverflowPolicy};
use crate::cpu::flags::{CrBit, CR_LT_BIT, CR_NONZERO, CR_SIGN, CR_SO, CR_SO_BIT};
use crate::decoder::{DecodedInstruction, Opcode};
use crate::error::{CoreError, GuestLocation, Result};
use crate::interpreter::load_store::AccessForm;
use crate::jit::analysis::BlockPlan;
use crate::jit::ir::{
    AluOp, Cond, ExitKind, HostReg, IrBlock, IrInst, Label, Operand, Retire, Width, RFLAGS,
    RFLAGS2,
};
use crate::jit::regcache::{Access, GprCache};

/// State of the instruction being emitted.
#[derive(Debug, Clone, Default)]
pub struct BlockContext {
    pub index: usize,
    pub pc: u32,
    pub raw: u32,
    /// Cycles retired by the instructions before this one.
    pub cycles_before: u32,
    pub instructions_before: u32,
    pub current_cycles: u32,
    /// Following instructions already covered by this one.
    pub skip_instructions: usize,
    pub fallbacks: u32,
    /// An unconditional exit was emitted; nothing after it is reachable.
    pub ended: bool,
}

pub struct BlockCompiler<'a> {
    config: &'a JitConfig,
    overflow_policy: OverflowPolicy,
    plan: &'a BlockPlan,
    block: IrBlock,
    gpr: GprCache,
    ctx: BlockContext,
}

impl<'a> BlockCompiler<'a> {
    pub fn new(config: &'a JitConfig, overflow_policy: OverflowPolicy, plan: &'a BlockPlan) -> Self {
        Self {
            config,
            overflow_policy,
            plan,
            block: IrBlock::new(plan.address),
            gpr: GprCache::new(config.host_registers),
            ctx: BlockContext::default(),
        }
    }

    pub fn compile(mut self) -> Result<IrBlock> {
        for index in 0..self.plan.instructions.len() {
            let decoded = self.plan.instructions[index];
            let cycles = decoded.info().cycles;
            if self.ctx.skip_instructions > 0 {
                self.ctx.skip_instructions -= 1;
            } else {
                self.ctx.index = index;
                self.ctx.pc = decoded.address;
                self.ctx.raw = decoded.inst.raw();
                self.ctx.current_cycles = cycles;
                self.compile_or_fall_back(decoded)?;
                self.gpr.unlock_all();
            }
            self.ctx.cycles_before += cycles;
            self.ctx.instructions_before += 1;
            if self.ctx.ended {
                break;
            }
        }

        if !self.ctx.ended {
            self.flush();
            let retire = Retire {
                cycles: self.ctx.cycles_before,
                instructions: self.ctx.instructions_before,
            };
            self.emit_exit(ExitKind::Fallthrough(self.plan.fallthrough()), retire);
        }

        self.block.resident_at_exit = self.gpr.resident();
        self.block.end = self.plan.end_address();
        self.block.guest_instructions = self.plan.instructions.len() as u32;
        log::trace!(
            "emitted {} IR ops for 0x{:08X} ({} fallbacks)",
            self.block.insts.len(),
            self.block.address,
            self.ctx.fallbacks
        );
        Ok(self.block)
    }

    /// Emit `decoded`, rolling back to a fallback when its operands do not
    /// fit in the host registers.
    fn compile_or_fall_back(&mut self, decoded: DecodedInstruction) -> Result<()> {
        let insts = self.block.insts.len();
        let labels = self.block.label_count;
        let gpr = self.gpr.clone();
        let ctx = self.ctx.clone();

        match self.compile_instruction(decoded) {
            Err(CoreError::RegistersExhausted { gpr: reg, .. }) => {
                log::debug!(
                    "r{} does not fit in {} host registers, falling back: {}",
                    reg,
                    self.gpr.capacity(),
                    decoded
                );
                self.block.insts.truncate(insts);
                self.block.label_count = labels;
                self.gpr = gpr;
                self.ctx = ctx;
                self.fallback(decoded)
            }
            result => result,
        }
    }

    fn compile_instruction(&mut self, decoded: DecodedInstruction) -> Result<()> {
        use Opcode::*;

        match decoded.opcode {
            Addi | Addis | Addic | AddicRc | Subfic | Mulli | Add | Addc | Adde | Addme | Addze
            | Subf | Subfc | Subfe | Subfme | Subfze | Neg | Mullw | Mulhw | Mulhwu | Divw
            | Divwu | AndiRc | AndisRc | Ori | Oris | Xori | Xoris | And | Andc | Or | Orc
            | Xor | Nand | Nor | Eqv | Extsb | Extsh | Cntlzw | Rlwimi | Rlwinm | Rlwnm | Slw
            | Srw | Sraw | Srawi | Cmp | Cmpl | Cmpi | Cmpli | Tw | Twi => {
                if self.config.integer_off {
                    self.fallback(decoded)
                } else {
                    self.integer(decoded)
                }
            }
            Mcrf | Mfcr | Mtcrf | Crand | Crandc | Creqv | Crnand | Crnor | Cror | Crorc
            | Crxor | Mfspr | Mtspr | Mftb | Mfmsr | Mtmsr => {
                if self.config.system_registers_off {
                    self.fallback(decoded)
                } else {
                    self.system_register(decoded)
                }
            }
            B | Bc | Bclr | Bcctr => {
                if self.config.branch_off {
                    self.fallback(decoded)
                } else {
                    self.branch(decoded)
                }
            }
            Isync => {
                self.flush();
                let retire = self.retire_current();
                self.emit_exit(ExitKind::Jump(self.next_pc()), retire);
                Ok(())
            }
            Sync | Eieio | Dcbf | Dcbst | Dcbt | Dcbtst | Dcbi => Ok(()),
            op => match AccessForm::of(op) {
                Some(form) if !self.config.load_store_off => self.load_store(decoded, form),
                // lmw, stmw, dcbz, icbi, mcrxr, rfi, sc and invalid encodings
                _ => self.fallback(decoded),
            },
        }
    }

    // ---- emission primitives ----

    #[inline]
    fn emit(&mut self, inst: IrInst) {
        self.block.insts.push(inst);
    }

    fn new_label(&mut self) -> Label {
        let label = Label(self.block.label_count);
        self.block.label_count += 1;
        label
    }

    fn bind_label(&mut self, label: Label) {
        self.emit(IrInst::Label(label));
    }

    fn location(&self) -> GuestLocation {
        GuestLocation::new(self.ctx.pc, Some(self.ctx.raw))
    }

    fn next_pc(&self) -> u32 {
        self.ctx.pc.wrapping_add(4)
    }

    /// Retirement counts for an exit taken by the current instruction.
    fn retire_current(&self) -> Retire {
        Retire {
            cycles: self.ctx.cycles_before + self.ctx.current_cycles,
            instructions: self.ctx.instructions_before + 1,
        }
    }

    fn read_gpr(&mut self, gpr: usize) -> Result<HostReg> {
        let at = self.location();
        self.gpr.bind(gpr, Access::Read, at, &mut self.block.insts)
    }

    fn write_gpr(&mut self, gpr: usize) -> Result<HostReg> {
        let at = self.location();
        self.gpr.bind(gpr, Access::Write, at, &mut self.block.insts)
    }

    /// `gpr = src`. Operand bindings of the current instruction are released
    /// first, so the destination may take over one of their host registers.
    fn set_gpr(&mut self, gpr: usize, src: HostReg) -> Result<()> {
        self.gpr.unlock_all();
        let dst = self.write_gpr(gpr)?;
        self.emit(IrInst::Mov { width: Width::W32, dst, src });
        Ok(())
    }

    fn flush(&mut self) {
        self.gpr.flush(&mut self.block.insts);
    }

    fn emit_exit(&mut self, kind: ExitKind, retire: Retire) {
        debug_assert!(self.gpr.is_clean(), "exit with unflushed guest registers");
        self.emit(IrInst::Exit { kind, retire });
        self.ctx.ended = true;
    }

    /// Emit a side exit that is only reached conditionally.
    fn emit_side_exit(&mut self, kind: ExitKind, retire: Retire) {
        debug_assert!(self.gpr.is_clean(), "side exit with unflushed guest registers");
        self.emit(IrInst::Exit { kind, retire });
    }

    fn alu(&mut self, op: AluOp, width: Width, dst: HostReg, a: HostReg, b: impl Into<Operand>) {
        self.emit(IrInst::Alu { op, width, dst, a, b: b.into() });
    }

    fn alu_imm(&mut self, op: AluOp, width: Width, dst: HostReg, a: HostReg, imm: u64) {
        self.emit(IrInst::Alu { op, width, dst, a, b: Operand::Imm(imm) });
    }

    fn mov(&mut self, dst: HostReg, src: HostReg) {
        self.emit(IrInst::Mov { width: Width::W32, dst, src });
    }

    fn mov_imm(&mut self, dst: HostReg, imm: u64) {
        self.emit(IrInst::MovImm { dst, imm });
    }

    fn branch_to(&mut self, cond: Cond, width: Width, a: HostReg, b: impl Into<Operand>, target: Label) {
        self.emit(IrInst::Branch { cond, width, a, b: b.into(), target });
    }

    /// Route one instruction through the interpreter.
    fn fallback(&mut self, decoded: DecodedInstruction) -> Result<()> {
        log::trace!("fallback: {}", decoded);
        self.flush();
        self.gpr.discard();
        let retire = self.retire_current();
        self.emit(IrInst::CallInterpreter {
            inst: decoded.inst.raw(),
            address: decoded.address,
            cycles_before: self.ctx.cycles_before,
            retire,
        });
        self.ctx.fallbacks += 1;
        if decoded.opcode.ends_block() {
            self.emit_exit(ExitKind::Jump(self.next_pc()), retire);
        } else if decoded.info().flags & crate::decoder::op_flags::STORE != 0 {
            self.emit(IrInst::ExitIfCodeModified { next: self.next_pc(), retire });
        }
        Ok(())
    }

    // ---- condition register helpers ----

    /// `dst = bit of CR field` (0 or 1), optionally negated.
    fn get_cr_bit(&mut self, field: usize, bit: CrBit, dst: HostReg, negate: bool) {
        self.emit(IrInst::LoadCr { dst, field: field as u8 });
        match bit {
            CrBit::So => {
                self.alu_imm(AluOp::Shr, Width::W64, dst, dst, u64::from(CR_SO_BIT));
                self.alu_imm(AluOp::And, Width::W64, dst, dst, 1);
            }
            CrBit::Lt => {
                self.alu_imm(AluOp::Shr, Width::W64, dst, dst, u64::from(CR_LT_BIT));
                self.alu_imm(AluOp::And, Width::W64, dst, dst, 1);
            }
            CrBit::Eq => self.emit(IrInst::SetCc {
                cond: Cond::Eq,
                width: Width::W32,
                dst,
                a: dst,
                b: Operand::Imm(0),
            }),
            CrBit::Gt => self.emit(IrInst::SetCc {
                cond: Cond::GtS,
                width: Width::W64,
                dst,
                a: dst,
                b: Operand::Imm(0),
            }),
        }
        if negate {
            self.alu_imm(AluOp::Xor, Width::W64, dst, dst, 1);
        }
    }

    /// Set one bit of a CR field to `value` (a 0/1 register or immediate),
    /// keeping the other three bits.
    fn set_cr_bit(&mut self, field: usize, bit: CrBit, value: Operand) {
        debug_assert!(!matches!(value, Operand::Reg(r) if r == RFLAGS || r == RFLAGS2));
        self.emit(IrInst::LoadCr { dst: RFLAGS, field: field as u8 });

        // An all-zero field means EQ and GT are both set; keep GT clear when
        // another bit is written.
        if bit != CrBit::Gt {
            let nonzero = self.new_label();
            self.branch_to(Cond::Ne, Width::W64, RFLAGS, Operand::Imm(0), nonzero);
            self.alu_imm(AluOp::Or, Width::W64, RFLAGS, RFLAGS, CR_SIGN);
            self.bind_label(nonzero);
        }

        let (keep_mask, shift, inverted) = match bit {
            CrBit::So => (!CR_SO, CR_SO_BIT, false),
            CrBit::Eq => (0xFFFF_FFFF_0000_0000, 0, true),
            CrBit::Gt => (!CR_SIGN, 63, true),
            CrBit::Lt => (!(1u64 << CR_LT_BIT), CR_LT_BIT, false),
        };
        self.alu_imm(AluOp::And, Width::W64, RFLAGS, RFLAGS, keep_mask);
        match value {
            Operand::Imm(imm) => {
                let bit_value = (imm & 1) ^ inverted as u64;
                if bit_value != 0 {
                    self.alu_imm(AluOp::Or, Width::W64, RFLAGS, RFLAGS, 1u64 << shift);
                }
            }
            Operand::Reg(reg) => {
                self.emit(IrInst::Mov { width: Width::W64, dst: RFLAGS2, src: reg });
                if inverted {
                    self.alu_imm(AluOp::Xor, Width::W64, RFLAGS2, RFLAGS2, 1);
                }
                if shift != 0 {
                    self.alu_imm(AluOp::Shl, Width::W64, RFLAGS2, RFLAGS2, u64::from(shift));
                }
                self.alu(AluOp::Or, Width::W64, RFLAGS, RFLAGS, RFLAGS2);
            }
        }
        self.alu_imm(AluOp::Or, Width::W64, RFLAGS, RFLAGS, CR_NONZERO);
        self.emit(IrInst::StoreCr { field: field as u8, src: RFLAGS });
    }

    fn clear_cr_bit(&mut self, field: usize, bit: CrBit) {
        self.set_cr_bit(field, bit, Operand::Imm(0));
    }

    /// Branch to `target` when the CR bit is set (or clear).
    fn jump_if_cr_bit(&mut self, field: usize, bit: CrBit, jump_if_set: bool, target: Label) {
        self.emit(IrInst::LoadCr { dst: RFLAGS, field: field as u8 });
        let pick = |set: Cond| if jump_if_set { set } else { set.negate() };
        match bit {
            CrBit::So | CrBit::Lt => {
                let mask = if bit == CrBit::So { CR_SO } else { 1u64 << CR_LT_BIT };
                self.alu_imm(AluOp::And, Width::W64, RFLAGS, RFLAGS, mask);
                self.branch_to(pick(Cond::Ne), Width::W64, RFLAGS, Operand::Imm(0), target);
            }
            CrBit::Eq => {
                self.branch_to(pick(Cond::Eq), Width::W32, RFLAGS, Operand::Imm(0), target)
            }
            CrBit::Gt => {
                self.branch_to(pick(Cond::GtS), Width::W64, RFLAGS, Operand::Imm(0), target)
            }
        }
    }

    /// CR0 from a 32-bit result with XER SO copied in.
    fn update_cr0(&mut self, result: HostReg) {
        let done = self.new_label();
        self.emit(IrInst::Unary {
            op: crate::jit::ir::UnaryOp::SignExt32,
            width: Width::W64,
            dst: RFLAGS,
            src: result,
        });
        self.alu_imm(AluOp::And, Width::W64, RFLAGS, RFLAGS, !CR_SO);
        self.emit(IrInst::LoadSoOv { dst: RFLAGS2 });
        self.alu_imm(AluOp::And, Width::W64, RFLAGS2, RFLAGS2, 0b10);
        self.branch_to(Cond::Eq, Width::W64, RFLAGS2, Operand::Imm(0), done);
        self.alu_imm(AluOp::Or, Width::W64, RFLAGS, RFLAGS, CR_SO);
        // zero result with SO: keep GT clear
        self.branch_to(Cond::Ne, Width::W64, RFLAGS, Operand::Imm(CR_SO), done);
        self.alu_imm(AluOp::Or, Width::W64, RFLAGS, RFLAGS, CR_SIGN);
        self.bind_label(done);
        self.emit(IrInst::StoreCr { field: 0, src: RFLAGS });
    }

    /// XER OV from `overflow` (0 or 1); setting OV also sets SO.
    fn store_overflow(&mut self, overflow: HostReg) {
        debug_assert!(overflow != RFLAGS);
        let store = self.new_label();
        self.emit(IrInst::LoadSoOv { dst: RFLAGS });
        self.alu_imm(AluOp::And, Width::W64, RFLAGS, RFLAGS, 0b10);
        self.branch_to(Cond::Eq, Width::W64, overflow, Operand::Imm(0), store);
        self.mov_imm(RFLAGS, 0b11);
        self.bind_label(store);
        self.emit(IrInst::StoreSoOv { src: RFLAGS });
    }

    /// Whether OE should update XER for this instruction.
    fn overflow_enabled(&self, decoded: &DecodedInstruction) -> bool {
        if !decoded.inst.oe() {
            return false;
        }
        match self.overflow_policy {
            OverflowPolicy::Ignore => {
                log::debug!(
                    "{}o at 0x{:08X}: XER[OV] is not updated (overflow policy: ignore)",
                    decoded.opcode.name(),
                    decoded.address
                );
                false
            }
            OverflowPolicy::Architectural => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::cpu::memory::{FlatMemory, GuestMemory};
    use crate::jit::analysis::analyze;

    const BASE: u32 = 0x8000_2000;

    fn compile_words(words: &[u32], config: &JitConfig) -> IrBlock {
        let mut memory = FlatMemory::new(0x10000);
        for (i, word) in words.iter().enumerate() {
            memory.write_u32(BASE + 4 * i as u32, *word).unwrap();
        }
        let plan = analyze(&memory, BASE, config.max_block_instructions, &BTreeSet::new()).unwrap();
        BlockCompiler::new(config, OverflowPolicy::Ignore, &plan).compile().unwrap()
    }

    #[test]
    fn test_block_ends_with_single_exit() {
        // addi r3,r0,5 ; addi r3,r3,1 ; b +8
        let block = compile_words(&[0x3860_0005, 0x3863_0001, 0x4800_0008], &JitConfig::default());
        let exits: Vec<_> = block
            .insts
            .iter()
            .filter_map(|inst| match inst {
                IrInst::Exit { kind, retire } => Some((*kind, *retire)),
                _ => None,
            })
            .collect();
        assert_eq!(
            exits,
            vec![(ExitKind::Jump(BASE + 16), Retire { cycles: 3, instructions: 3 })]
        );
        assert_eq!(block.fallback_count(), 0);
        // r3 is written back exactly once
        let stores = block
            .insts
            .iter()
            .filter(|inst| matches!(inst, IrInst::StoreGpr { gpr: 3, .. }))
            .count();
        assert_eq!(stores, 1);
    }

    #[test]
    fn test_disabled_group_falls_back() {
        let config = JitConfig {
            integer_off: true,
            ..JitConfig::default()
        };
        let block = compile_words(&[0x3860_0005, 0x4800_0000], &config);
        assert_eq!(block.fallback_count(), 1);
    }

    #[test]
    fn test_operands_beyond_host_registers_fall_back() {
        // add r3,r4,r5 ; addi r3,r3,1 ; b 0
        let config = JitConfig {
            host_registers: 1,
            ..JitConfig::default()
        };
        let block = compile_words(&[0x7C64_2A14, 0x3863_0001, 0x4800_0000], &config);
        assert_eq!(block.fallback_count(), 1);
        // the partial binding of r4 was rolled back
        assert!(matches!(
            block.insts.first(),
            Some(IrInst::CallInterpreter { address: BASE, .. })
        ));
        assert!(block
            .insts
            .iter()
            .any(|inst| matches!(inst, IrInst::LoadGpr { gpr: 3, .. })));
    }

    #[test]
    fn test_unsupported_instruction_falls_back() {
        // sc
        let block = compile_words(&[0x4400_0002], &JitConfig::default());
        assert_eq!(block.fallback_count(), 1);
        assert!(matches!(block.insts.last(), Some(IrInst::Exit { .. })));
    }
}
