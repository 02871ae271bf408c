// Traps, special registers, MSR and condition-register instructions
use crate::cpu::exceptions::{program_cause, ExceptionFlags, INT_CAUSE_CP};
use crate::cpu::flags;
use crate::cpu::state::{msr, spr, CpuState};
use crate::cpu::ExecContext;
use crate::decoder::{Instruction, Opcode};
use crate::interpreter::integer::trap_condition;
use crate::interpreter::StepOutcome;

/// Raise a program exception at the current instruction.
pub(crate) fn raise_program(cpu: &mut CpuState, cause: u32) -> StepOutcome {
    cpu.spr[spr::SRR1] = cause;
    cpu.exceptions.insert(ExceptionFlags::PROGRAM);
    StepOutcome::Exception
}

pub fn trap(cpu: &mut CpuState, op: Opcode, inst: Instruction) -> StepOutcome {
    let a = cpu.gpr[inst.ra()];
    let b = match op {
        Opcode::Tw => cpu.gpr[inst.rb()],
        _ => inst.simm16() as u32,
    };
    if trap_condition(inst.to(), a, b) {
        log::debug!("trap taken at 0x{:08X} (TO={:#04x})", cpu.pc, inst.to());
        raise_program(cpu, program_cause::TRAP)
    } else {
        StepOutcome::EndBlock
    }
}

pub fn mfspr(cpu: &mut CpuState, ctx: &ExecContext<'_>, inst: Instruction) {
    let index = inst.spr();
    let value = match index {
        spr::XER => cpu.xer(),
        spr::TL => ctx.timebase.read_lower(ctx.ticks),
        spr::TU => ctx.timebase.read_upper(ctx.ticks),
        _ => cpu.spr[index],
    };
    cpu.gpr[inst.rd()] = value;
}

pub fn mftb(cpu: &mut CpuState, ctx: &ExecContext<'_>, inst: Instruction) {
    let value = match inst.spr() {
        spr::TU => ctx.timebase.read_upper(ctx.ticks),
        spr::TL => ctx.timebase.read_lower(ctx.ticks),
        other => {
            log::warn!("mftb at 0x{:08X} with invalid TBR {}", cpu.pc, other);
            ctx.timebase.read_lower(ctx.ticks)
        }
    };
    cpu.gpr[inst.rd()] = value;
}

pub fn mtspr(cpu: &mut CpuState, ctx: &mut ExecContext<'_>, inst: Instruction) {
    let index = inst.spr();
    let value = cpu.gpr[inst.rs()];
    match index {
        spr::XER => cpu.set_xer(value),
        spr::TL_W => ctx.timebase.write_lower(ctx.ticks, value),
        spr::TU_W => ctx.timebase.write_upper(ctx.ticks, value),
        spr::PVR => log::warn!("mtspr to read-only PVR at 0x{:08X}", cpu.pc),
        _ => cpu.spr[index] = value,
    }
}

/// Whether enabling EE with these pending exceptions must leave the block.
#[inline]
pub fn ee_enable_needs_check(old_msr: u32, new_msr: u32, pending: ExceptionFlags, cause: u32) -> bool {
    old_msr & msr::EE == 0
        && new_msr & msr::EE != 0
        && pending.intersects(ExceptionFlags::EXTERNAL_MASK)
        && cause & INT_CAUSE_CP == 0
}

pub fn mtmsr(cpu: &mut CpuState, ctx: &ExecContext<'_>, inst: Instruction) -> StepOutcome {
    let old = cpu.msr;
    cpu.msr = cpu.gpr[inst.rs()];
    if ee_enable_needs_check(old, cpu.msr, cpu.exceptions, ctx.signal.interrupt_cause()) {
        StepOutcome::ExceptionCheck
    } else {
        StepOutcome::EndBlock
    }
}

/// Return from interrupt. Restoring MSR may re-enable EE, so external
/// exceptions are checked at the return address.
pub fn rfi(cpu: &mut CpuState) -> StepOutcome {
    cpu.msr = (cpu.msr & !msr::SRR1_MASK) | (cpu.spr[spr::SRR1] & msr::SRR1_MASK);
    cpu.msr &= 0xFFFB_FFFF;
    cpu.npc = cpu.spr[spr::SRR0] & !3;
    StepOutcome::ExceptionCheck
}

pub fn sc(cpu: &mut CpuState) -> StepOutcome {
    cpu.pc = cpu.npc;
    cpu.exceptions.insert(ExceptionFlags::SYSCALL);
    StepOutcome::Exception
}

pub fn mfcr(cpu: &mut CpuState, inst: Instruction) {
    cpu.gpr[inst.rd()] = cpu.cr.get();
}

pub fn mtcrf(cpu: &mut CpuState, inst: Instruction) {
    let value = cpu.gpr[inst.rs()];
    let crm = inst.crm();
    for field in 0..8 {
        if crm & (0x80 >> field) != 0 {
            cpu.cr
                .set_field(field, ((value >> (28 - 4 * field)) & 0xF) as u8);
        }
    }
}

pub fn mcrf(cpu: &mut CpuState, inst: Instruction) {
    cpu.cr.fields[inst.crfd()] = cpu.cr.fields[inst.crfs()];
}

pub fn mcrxr(cpu: &mut CpuState, inst: Instruction) {
    cpu.cr.set_field(inst.crfd(), (cpu.xer() >> 28) as u8);
    cpu.xer_ca = 0;
    cpu.xer_so_ov = 0;
}

/// Condition-register logical instructions.
pub fn cr_logical(cpu: &mut CpuState, op: Opcode, inst: Instruction) {
    let (a_bit, b_bit, d_bit) = (inst.crba(), inst.crbb(), inst.crbd());

    // crclr / crset
    if a_bit == b_bit && b_bit == d_bit {
        match op {
            Opcode::Crxor | Opcode::Crandc => {
                let field = &mut cpu.cr.fields[(d_bit >> 2) as usize];
                *field = flags::clear_bit(*field, flags::CrBit::from_crb(d_bit));
                return;
            }
            Opcode::Creqv => {
                cpu.cr.set_bit(d_bit, true);
                return;
            }
            _ => {}
        }
    }

    let a = cpu.cr.get_bit(a_bit);
    let b = cpu.cr.get_bit(b_bit);
    let result = match op {
        Opcode::Crand => a && b,
        Opcode::Crandc => a && !b,
        Opcode::Creqv => a == b,
        Opcode::Crnand => !(a && b),
        Opcode::Crnor => !(a || b),
        Opcode::Cror => a || b,
        Opcode::Crorc => a || !b,
        Opcode::Crxor => a != b,
        _ => unreachable!("{} is not a CR logical instruction", op.name()),
    };
    cpu.cr.set_bit(d_bit, result);
}
