//! Host Code Backend
//!
//! Lowers an [`IrBlock`] into [`HostCode`] and executes it.
//!
//! The [`Backend`] trait is the seam between the emitter and the host. The
//! bundled [`ThreadedBackend`] resolves labels to instruction indices,
//! validates every register, SPR and CR field reference, and produces a
//! flat op list executed by a small register machine. Anything the IR gets
//! wrong is reported as [`CoreError::CodeGen`] at lowering time; operations
//! that are undefined on the host at run time (division by zero, falling
//! off the end of a block) are reported as [`CoreError::HostFault`].

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::cpu::exceptions::ExceptionFlags;
use crate::cpu::state::{spr, CpuState};
use crate::cpu::ExecContext;
use crate::decoder::Instruction;
use crate::error::{CoreError, GuestLocation, Result};
use crate::interpreter::load_store::{raise_dsi, read_sized, write_sized};
use crate::interpreter::{Interpreter, StepOutcome};
use crate::jit::ir::{
    AluOp, Cond, EnvSlot, ExitKind, HostReg, IrBlock, IrInst, Operand, Retire, UnaryOp, Width,
    HOST_REGISTER_COUNT,
};

/// Lowers IR blocks to executable host code.
pub trait Backend: Send {
    fn name(&self) -> &'static str;
    fn lower(&self, block: &IrBlock) -> Result<HostCode>;
}

/// One lowered operation. Labels are resolved to op indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOp {
    Op(IrInst),
    Jump(usize),
    Branch {
        cond: Cond,
        width: Width,
        a: HostReg,
        b: Operand,
        target: usize,
    },
}

/// How compiled code left its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// Continue at the address after a block-ending instruction; `pc`
    /// already points there.
    Jump(u32),
    /// Continue at the address; the block stopped without a block-ending
    /// instruction, so no exception check is due.
    Fallthrough(u32),
    /// A synchronous exception is pending.
    Exception,
    /// Check external exceptions, then continue at the address.
    ExceptionCheck(u32),
}

/// Result of one execution of a compiled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRun {
    pub exit: BlockExit,
    pub cycles: u32,
    pub instructions: u32,
}

impl BlockRun {
    fn new(exit: BlockExit, retire: Retire) -> Self {
        Self {
            exit,
            cycles: retire.cycles,
            instructions: retire.instructions,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostCode {
    address: u32,
    end: u32,
    ops: Vec<HostOp>,
}

impl HostCode {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[HostOp] {
        &self.ops
    }

    fn fault(&self, message: impl Into<String>) -> CoreError {
        CoreError::host_fault(message, GuestLocation::at(self.address))
    }

    /// Execute the block against `cpu`. `ctx.ticks` must be the scheduler
    /// tick count at block entry.
    pub fn run(&self, cpu: &mut CpuState, ctx: &mut ExecContext<'_>) -> Result<BlockRun> {
        let mut regs = [0u64; HOST_REGISTER_COUNT];
        let entry_ticks = ctx.ticks;
        let mut ip = 0usize;

        loop {
            let op = *self
                .ops
                .get(ip)
                .ok_or_else(|| self.fault("execution ran past the last host op"))?;
            ip += 1;

            let inst = match op {
                HostOp::Jump(target) => {
                    ip = target;
                    continue;
                }
                HostOp::Branch { cond, width, a, b, target } => {
                    if compare(cond, width, regs[a.index()], operand(&regs, b)) {
                        ip = target;
                    }
                    continue;
                }
                HostOp::Op(inst) => inst,
            };

            match inst {
                IrInst::LoadGpr { dst, gpr } => regs[dst.index()] = u64::from(cpu.gpr[gpr as usize]),
                IrInst::StoreGpr { gpr, src } => cpu.gpr[gpr as usize] = regs[src.index()] as u32,
                IrInst::LoadCr { dst, field } => regs[dst.index()] = cpu.cr.fields[field as usize],
                IrInst::StoreCr { field, src } => cpu.cr.fields[field as usize] = regs[src.index()],
                IrInst::LoadCa { dst } => regs[dst.index()] = u64::from(cpu.xer_ca),
                IrInst::StoreCa { src } => cpu.xer_ca = (regs[src.index()] != 0) as u8,
                IrInst::LoadSoOv { dst } => regs[dst.index()] = u64::from(cpu.xer_so_ov),
                IrInst::StoreSoOv { src } => cpu.xer_so_ov = (regs[src.index()] & 0b11) as u8,
                IrInst::LoadStringCtrl { dst } => {
                    regs[dst.index()] = u64::from(cpu.xer_stringctrl)
                }
                IrInst::StoreStringCtrl { src } => cpu.xer_stringctrl = regs[src.index()] as u16,
                IrInst::LoadSpr { dst, spr } => regs[dst.index()] = u64::from(cpu.spr[spr as usize]),
                IrInst::StoreSpr { spr, src } => cpu.spr[spr as usize] = regs[src.index()] as u32,
                IrInst::LoadMsr { dst } => regs[dst.index()] = u64::from(cpu.msr),
                IrInst::StoreMsr { src } => cpu.msr = regs[src.index()] as u32,
                IrInst::LoadExceptions { dst } => {
                    regs[dst.index()] = u64::from(cpu.exceptions.bits())
                }
                IrInst::RaiseException { flags } => {
                    cpu.exceptions.insert(ExceptionFlags::from_bits_truncate(flags))
                }
                IrInst::SetPc { pc } => cpu.set_pc(pc),
                IrInst::LoadEnv { dst, slot } => {
                    regs[dst.index()] = match slot {
                        EnvSlot::Ticks => entry_ticks,
                        EnvSlot::TimeBaseStartTicks => ctx.timebase.start_ticks(),
                        EnvSlot::TimeBaseStartValue => ctx.timebase.start_value(),
                        EnvSlot::InterruptCause => u64::from(ctx.signal.interrupt_cause()),
                    }
                }

                IrInst::MovImm { dst, imm } => regs[dst.index()] = imm,
                IrInst::Mov { width, dst, src } => {
                    regs[dst.index()] = truncate(width, regs[src.index()])
                }
                IrInst::Alu { op, width, dst, a, b } => {
                    let value = alu(op, width, regs[a.index()], operand(&regs, b))
                        .ok_or_else(|| self.fault(format!("{:?} by zero or overflow", op)))?;
                    regs[dst.index()] = value;
                }
                IrInst::Unary { op, width, dst, src } => {
                    regs[dst.index()] = unary(op, width, regs[src.index()])
                }
                IrInst::SetCc { cond, width, dst, a, b } => {
                    let value = compare(cond, width, regs[a.index()], operand(&regs, b));
                    regs[dst.index()] = value as u64;
                }

                IrInst::Load { size, signed, dst, addr, site } => {
                    let address = regs[addr.index()] as u32;
                    match read_sized(ctx, address, size, signed) {
                        Ok(value) => regs[dst.index()] = u64::from(value),
                        Err(_) => {
                            cpu.set_pc(site.pc);
                            raise_dsi(cpu, address, false);
                            return Ok(BlockRun::new(BlockExit::Exception, site.retire));
                        }
                    }
                }
                IrInst::Store { size, src, addr, site } => {
                    let address = regs[addr.index()] as u32;
                    if write_sized(ctx, address, size, regs[src.index()] as u32).is_err() {
                        cpu.set_pc(site.pc);
                        raise_dsi(cpu, address, true);
                        return Ok(BlockRun::new(BlockExit::Exception, site.retire));
                    }
                }
                IrInst::ExitIfCodeModified { next, retire } => {
                    if ctx
                        .code_writes
                        .iter()
                        .any(|write| write.overlaps(self.address, self.end))
                    {
                        log::debug!("block 0x{:08X} modified its own code", self.address);
                        jump(cpu, next);
                        return Ok(BlockRun::new(BlockExit::Fallthrough(next), retire));
                    }
                }

                IrInst::CallInterpreter { inst, address, cycles_before, retire } => {
                    cpu.set_pc(address);
                    let block_ticks = ctx.ticks;
                    ctx.ticks = entry_ticks.wrapping_add(u64::from(cycles_before));
                    let outcome = Interpreter::execute(cpu, ctx, Instruction::decode(inst, address));
                    ctx.ticks = block_ticks;
                    match outcome {
                        StepOutcome::Continue => {}
                        StepOutcome::Branch | StepOutcome::EndBlock => {
                            let next = cpu.npc;
                            jump(cpu, next);
                            return Ok(BlockRun::new(BlockExit::Jump(next), retire));
                        }
                        StepOutcome::ExceptionCheck => {
                            let next = cpu.npc;
                            jump(cpu, next);
                            return Ok(BlockRun::new(BlockExit::ExceptionCheck(next), retire));
                        }
                        StepOutcome::Exception => {
                            return Ok(BlockRun::new(BlockExit::Exception, retire));
                        }
                    }
                }

                IrInst::Exit { kind, retire } => {
                    let exit = match kind {
                        ExitKind::Jump(target) => {
                            jump(cpu, target);
                            BlockExit::Jump(target)
                        }
                        ExitKind::Fallthrough(target) => {
                            jump(cpu, target);
                            BlockExit::Fallthrough(target)
                        }
                        ExitKind::Indirect(reg) => {
                            let target = regs[reg.index()] as u32;
                            jump(cpu, target);
                            BlockExit::Jump(target)
                        }
                        ExitKind::ExceptionCheck(target) => {
                            jump(cpu, target);
                            BlockExit::ExceptionCheck(target)
                        }
                        ExitKind::Exception => BlockExit::Exception,
                    };
                    return Ok(BlockRun::new(exit, retire));
                }

                IrInst::Label(_) | IrInst::Jump(_) | IrInst::Branch { .. } => {
                    return Err(self.fault("unresolved control flow in lowered code"));
                }
            }
        }
    }
}

/// Leave the block at `target` the way a retired branch would: PC and NPC
/// both point at the next instruction.
#[inline]
fn jump(cpu: &mut CpuState, target: u32) {
    cpu.pc = target;
    cpu.npc = target;
}

#[inline]
fn operand(regs: &[u64; HOST_REGISTER_COUNT], operand: Operand) -> u64 {
    match operand {
        Operand::Reg(reg) => regs[reg.index()],
        Operand::Imm(imm) => imm,
    }
}

#[inline]
fn truncate(width: Width, value: u64) -> u64 {
    match width {
        Width::W32 => value & 0xFFFF_FFFF,
        Width::W64 => value,
    }
}

/// Evaluate a binary op. `None` for undefined divisions.
pub fn alu(op: AluOp, width: Width, a: u64, b: u64) -> Option<u64> {
    match width {
        Width::W32 => {
            let (x, y) = (a as u32, b as u32);
            let value = match op {
                AluOp::Add => x.wrapping_add(y),
                AluOp::Sub => x.wrapping_sub(y),
                AluOp::And => x & y,
                AluOp::Or => x | y,
                AluOp::Xor => x ^ y,
                AluOp::Shl => x.wrapping_shl(y),
                AluOp::Shr => x.wrapping_shr(y),
                AluOp::Sar => (x as i32).wrapping_shr(y) as u32,
                AluOp::Rotl => x.rotate_left(y & 31),
                AluOp::MulLo => x.wrapping_mul(y),
                AluOp::MulHiS => ((i64::from(x as i32) * i64::from(y as i32)) >> 32) as u32,
                AluOp::MulHiU => ((u64::from(x) * u64::from(y)) >> 32) as u32,
                AluOp::DivS => (x as i32).checked_div(y as i32)? as u32,
                AluOp::DivU => x.checked_div(y)?,
            };
            Some(u64::from(value))
        }
        Width::W64 => Some(match op {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Shl => a.wrapping_shl(b as u32),
            AluOp::Shr => a.wrapping_shr(b as u32),
            AluOp::Sar => (a as i64).wrapping_shr(b as u32) as u64,
            AluOp::Rotl => a.rotate_left((b & 63) as u32),
            AluOp::MulLo => a.wrapping_mul(b),
            AluOp::MulHiS => ((i128::from(a as i64) * i128::from(b as i64)) >> 64) as u64,
            AluOp::MulHiU => ((u128::from(a) * u128::from(b)) >> 64) as u64,
            AluOp::DivS => (a as i64).checked_div(b as i64)? as u64,
            AluOp::DivU => a.checked_div(b)?,
        }),
    }
}

pub fn unary(op: UnaryOp, width: Width, value: u64) -> u64 {
    let result = match (op, width) {
        (UnaryOp::Not, _) => !value,
        (UnaryOp::Neg, _) => value.wrapping_neg(),
        (UnaryOp::Clz, Width::W32) => u64::from((value as u32).leading_zeros()),
        (UnaryOp::Clz, Width::W64) => u64::from(value.leading_zeros()),
        (UnaryOp::SignExt8, _) => value as u8 as i8 as i64 as u64,
        (UnaryOp::SignExt16, _) => value as u16 as i16 as i64 as u64,
        (UnaryOp::SignExt32, _) => value as u32 as i32 as i64 as u64,
    };
    truncate(width, result)
}

pub fn compare(cond: Cond, width: Width, a: u64, b: u64) -> bool {
    let (ua, ub, sa, sb) = match width {
        Width::W32 => (
            u64::from(a as u32),
            u64::from(b as u32),
            i64::from(a as u32 as i32),
            i64::from(b as u32 as i32),
        ),
        Width::W64 => (a, b, a as i64, b as i64),
    };
    match cond {
        Cond::Eq => ua == ub,
        Cond::Ne => ua != ub,
        Cond::LtS => sa < sb,
        Cond::LeS => sa <= sb,
        Cond::GtS => sa > sb,
        Cond::GeS => sa >= sb,
        Cond::LtU => ua < ub,
        Cond::LeU => ua <= ub,
        Cond::GtU => ua > ub,
        Cond::GeU => ua >= ub,
    }
}

/// Host registers an IR instruction references.
fn registers(inst: &IrInst) -> SmallVec<[HostReg; 3]> {
    let mut regs = SmallVec::new();
    let push_operand = |op: &Operand, regs: &mut SmallVec<[HostReg; 3]>| {
        if let Operand::Reg(reg) = op {
            regs.push(*reg);
        }
    };
    match inst {
        IrInst::LoadGpr { dst, .. }
        | IrInst::LoadCr { dst, .. }
        | IrInst::LoadCa { dst }
        | IrInst::LoadSoOv { dst }
        | IrInst::LoadStringCtrl { dst }
        | IrInst::LoadSpr { dst, .. }
        | IrInst::LoadMsr { dst }
        | IrInst::LoadExceptions { dst }
        | IrInst::LoadEnv { dst, .. }
        | IrInst::MovImm { dst, .. } => regs.push(*dst),
        IrInst::StoreGpr { src, .. }
        | IrInst::StoreCr { src, .. }
        | IrInst::StoreCa { src }
        | IrInst::StoreSoOv { src }
        | IrInst::StoreStringCtrl { src }
        | IrInst::StoreSpr { src, .. }
        | IrInst::StoreMsr { src } => regs.push(*src),
        IrInst::Mov { dst, src, .. } | IrInst::Unary { dst, src, .. } => {
            regs.extend([*dst, *src])
        }
        IrInst::Alu { dst, a, b, .. } | IrInst::SetCc { dst, a, b, .. } => {
            regs.extend([*dst, *a]);
            push_operand(b, &mut regs);
        }
        IrInst::Branch { a, b, .. } => {
            regs.push(*a);
            push_operand(b, &mut regs);
        }
        IrInst::Load { dst, addr, .. } => regs.extend([*dst, *addr]),
        IrInst::Store { src, addr, .. } => regs.extend([*src, *addr]),
        IrInst::Exit { kind: ExitKind::Indirect(reg), .. } => regs.push(*reg),
        IrInst::RaiseException { .. }
        | IrInst::SetPc { .. }
        | IrInst::Label(_)
        | IrInst::Jump(_)
        | IrInst::ExitIfCodeModified { .. }
        | IrInst::CallInterpreter { .. }
        | IrInst::Exit { .. } => {}
    }
    regs
}

fn check_state_indices(inst: &IrInst) -> std::result::Result<(), String> {
    let (gpr, field, spr_index) = match *inst {
        IrInst::LoadGpr { gpr, .. } | IrInst::StoreGpr { gpr, .. } => (Some(gpr), None, None),
        IrInst::LoadCr { field, .. } | IrInst::StoreCr { field, .. } => (None, Some(field), None),
        IrInst::LoadSpr { spr, .. } | IrInst::StoreSpr { spr, .. } => (None, None, Some(spr)),
        _ => (None, None, None),
    };
    if gpr.is_some_and(|gpr| gpr >= 32) {
        return Err(format!("GPR index out of range in {:?}", inst));
    }
    if field.is_some_and(|field| field >= 8) {
        return Err(format!("CR field out of range in {:?}", inst));
    }
    if spr_index.is_some_and(|index| index as usize >= spr::COUNT) {
        return Err(format!("SPR index out of range in {:?}", inst));
    }
    Ok(())
}

/// Lowers to a flat op list run by [`HostCode::run`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadedBackend;

impl Backend for ThreadedBackend {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn lower(&self, block: &IrBlock) -> Result<HostCode> {
        let at = GuestLocation::at(block.address);
        let codegen = |message: String| CoreError::codegen(message, at);

        // label positions in the lowered op list
        let mut positions: HashMap<u32, usize> = HashMap::with_capacity(block.label_count as usize);
        let mut index = 0usize;
        for inst in &block.insts {
            match inst {
                IrInst::Label(label) => {
                    if positions.insert(label.0, index).is_some() {
                        return Err(codegen(format!("label L{} bound twice", label.0)));
                    }
                }
                _ => index += 1,
            }
        }

        let mut ops = Vec::with_capacity(index);
        for inst in &block.insts {
            for reg in registers(inst) {
                if reg.index() >= HOST_REGISTER_COUNT {
                    return Err(codegen(format!("host register {} out of range in {:?}", reg, inst)));
                }
            }
            check_state_indices(inst).map_err(codegen)?;

            let resolve = |label: u32, from: usize| -> Result<usize> {
                let target = *positions
                    .get(&label)
                    .ok_or_else(|| codegen(format!("jump to unbound label L{}", label)))?;
                if target <= from {
                    return Err(codegen(format!("backward jump to L{}", label)));
                }
                Ok(target)
            };
            let from = ops.len();
            match *inst {
                IrInst::Label(_) => {}
                IrInst::Jump(label) => ops.push(HostOp::Jump(resolve(label.0, from)?)),
                IrInst::Branch { cond, width, a, b, target } => ops.push(HostOp::Branch {
                    cond,
                    width,
                    a,
                    b,
                    target: resolve(target.0, from)?,
                }),
                other => ops.push(HostOp::Op(other)),
            }
        }

        if !matches!(ops.last(), Some(HostOp::Op(IrInst::Exit { .. }))) {
            return Err(codegen("block does not end with an exit".to_string()));
        }
        Ok(HostCode {
            address: block.address,
            end: block.end,
            ops,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{Label, RSCRATCH, RSCRATCH2};

    fn block(insts: Vec<IrInst>, labels: u32) -> IrBlock {
        let mut block = IrBlock::new(0x8000_0000);
        block.end = 0x8000_0004;
        block.guest_instructions = 1;
        block.insts = insts;
        block.label_count = labels;
        block
    }

    fn exit() -> IrInst {
        IrInst::Exit {
            kind: ExitKind::Jump(0x8000_0004),
            retire: Retire { cycles: 1, instructions: 1 },
        }
    }

    #[test]
    fn test_alu_width_semantics() {
        assert_eq!(alu(AluOp::Add, Width::W32, 0xFFFF_FFFF, 1), Some(0));
        assert_eq!(alu(AluOp::Add, Width::W64, 0xFFFF_FFFF, 1), Some(0x1_0000_0000));
        assert_eq!(alu(AluOp::Shl, Width::W32, 1, 33), Some(2));
        assert_eq!(alu(AluOp::MulHiS, Width::W32, 0xFFFF_FFFF, 2), Some(0xFFFF_FFFF));
        assert_eq!(alu(AluOp::DivS, Width::W32, 0x8000_0000, 0xFFFF_FFFF), None);
        assert_eq!(alu(AluOp::DivU, Width::W32, 1, 0), None);
        assert_eq!(unary(UnaryOp::SignExt16, Width::W32, 0x8000), 0xFFFF_8000);
        assert_eq!(unary(UnaryOp::Clz, Width::W32, 1), 31);
        assert!(compare(Cond::LtS, Width::W32, 0xFFFF_FFFF, 0));
        assert!(!compare(Cond::LtU, Width::W32, 0xFFFF_FFFF, 0));
    }

    #[test]
    fn test_lowering_resolves_forward_labels() {
        let ir = block(
            vec![
                IrInst::MovImm { dst: RSCRATCH, imm: 0 },
                IrInst::Branch {
                    cond: Cond::Eq,
                    width: Width::W64,
                    a: RSCRATCH,
                    b: Operand::Imm(0),
                    target: Label(0),
                },
                IrInst::MovImm { dst: RSCRATCH2, imm: 1 },
                IrInst::Label(Label(0)),
                exit(),
            ],
            1,
        );
        let code = ThreadedBackend.lower(&ir).unwrap();
        assert_eq!(code.len(), 4);
        assert!(matches!(code.ops()[1], HostOp::Branch { target: 3, .. }));
    }

    #[test]
    fn test_lowering_rejects_bad_ir() {
        let unbound = block(vec![IrInst::Jump(Label(7)), exit()], 0);
        assert!(matches!(ThreadedBackend.lower(&unbound), Err(CoreError::CodeGen { .. })));

        let bad_register = block(vec![IrInst::MovImm { dst: HostReg(40), imm: 0 }, exit()], 0);
        assert!(ThreadedBackend.lower(&bad_register).is_err());

        let no_exit = block(vec![IrInst::MovImm { dst: RSCRATCH, imm: 0 }], 0);
        assert!(ThreadedBackend.lower(&no_exit).is_err());

        let backward = block(
            vec![IrInst::Label(Label(0)), IrInst::Jump(Label(0)), exit()],
            1,
        );
        assert!(ThreadedBackend.lower(&backward).is_err());
    }
}
