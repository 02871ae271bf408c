// Integer arithmetic, logical, rotate/shift and compare instructions
use crate::config::OverflowPolicy;
use crate::cpu::flags::{self, carry, rotate_mask};
use crate::cpu::state::CpuState;
use crate::cpu::ExecContext;
use crate::decoder::{Instruction, Opcode};

#[inline]
fn ra_or_zero(cpu: &CpuState, inst: Instruction) -> u32 {
    if inst.ra() == 0 {
        0
    } else {
        cpu.gpr[inst.ra()]
    }
}

/// Apply the `OE` bit of an XO-form instruction.
pub(crate) fn apply_overflow(
    cpu: &mut CpuState,
    ctx: &ExecContext<'_>,
    inst: Instruction,
    op: Opcode,
    overflow: bool,
) {
    if !inst.oe() {
        return;
    }
    match ctx.overflow_policy {
        OverflowPolicy::Ignore => {
            log::debug!(
                "{}o at 0x{:08X}: XER[OV] is not updated (overflow policy: ignore)",
                op.name(),
                cpu.pc
            );
        }
        OverflowPolicy::Architectural => cpu.set_overflow(overflow),
    }
}

#[inline]
fn add_overflows(a: u32, b: u32, result: u32) -> bool {
    ((a ^ result) & (b ^ result)) >> 31 != 0
}

/// `rD = a + b + carry_in` with CA out, as used by the extended adds.
#[inline]
fn add_extended(a: u32, b: u32, carry_in: u32) -> (u32, bool) {
    let sum = a.wrapping_add(b);
    let result = sum.wrapping_add(carry_in);
    (result, carry(a, b) || (carry_in != 0 && carry(sum, carry_in)))
}

/// Immediate-form arithmetic and logical instructions.
pub fn execute_immediate(cpu: &mut CpuState, op: Opcode, inst: Instruction) {
    let simm = inst.simm16() as u32;
    let uimm = inst.uimm();
    match op {
        Opcode::Addi => cpu.gpr[inst.rd()] = ra_or_zero(cpu, inst).wrapping_add(simm),
        Opcode::Addis => cpu.gpr[inst.rd()] = ra_or_zero(cpu, inst).wrapping_add(simm << 16),
        Opcode::Addic | Opcode::AddicRc => {
            let a = cpu.gpr[inst.ra()];
            let result = a.wrapping_add(simm);
            cpu.gpr[inst.rd()] = result;
            cpu.set_carry(carry(a, simm));
            if op == Opcode::AddicRc {
                cpu.update_cr0(result);
            }
        }
        Opcode::Subfic => {
            let a = cpu.gpr[inst.ra()];
            cpu.gpr[inst.rd()] = simm.wrapping_sub(a);
            cpu.set_carry(a == 0 || carry(0u32.wrapping_sub(a), simm));
        }
        Opcode::Mulli => {
            cpu.gpr[inst.rd()] = (cpu.gpr[inst.ra()] as i32).wrapping_mul(simm as i32) as u32;
        }
        Opcode::AndiRc => {
            let result = cpu.gpr[inst.rs()] & uimm;
            cpu.gpr[inst.ra()] = result;
            cpu.update_cr0(result);
        }
        Opcode::AndisRc => {
            let result = cpu.gpr[inst.rs()] & (uimm << 16);
            cpu.gpr[inst.ra()] = result;
            cpu.update_cr0(result);
        }
        Opcode::Ori => cpu.gpr[inst.ra()] = cpu.gpr[inst.rs()] | uimm,
        Opcode::Oris => cpu.gpr[inst.ra()] = cpu.gpr[inst.rs()] | (uimm << 16),
        Opcode::Xori => cpu.gpr[inst.ra()] = cpu.gpr[inst.rs()] ^ uimm,
        Opcode::Xoris => cpu.gpr[inst.ra()] = cpu.gpr[inst.rs()] ^ (uimm << 16),
        _ => unreachable!("{} is not an immediate integer instruction", op.name()),
    }
}

/// XO-form arithmetic: `rD = f(rA, rB)` with optional OE and Rc.
pub fn execute_arithmetic(
    cpu: &mut CpuState,
    ctx: &ExecContext<'_>,
    op: Opcode,
    inst: Instruction,
) {
    let a = cpu.gpr[inst.ra()];
    let b = cpu.gpr[inst.rb()];
    let ca = cpu.xer_ca as u32;

    let (result, overflow) = match op {
        Opcode::Add => {
            let result = a.wrapping_add(b);
            (result, add_overflows(a, b, result))
        }
        Opcode::Addc => {
            let result = a.wrapping_add(b);
            cpu.set_carry(carry(a, b));
            (result, add_overflows(a, b, result))
        }
        Opcode::Adde => {
            let (result, carry_out) = add_extended(a, b, ca);
            cpu.set_carry(carry_out);
            (result, add_overflows(a, b, result))
        }
        Opcode::Addme => {
            let result = a.wrapping_add(ca).wrapping_sub(1);
            cpu.set_carry(a != 0 || ca != 0);
            (result, add_overflows(a, u32::MAX, result))
        }
        Opcode::Addze => {
            let result = a.wrapping_add(ca);
            cpu.set_carry(carry(a, ca));
            (result, add_overflows(a, 0, result))
        }
        Opcode::Subf => {
            let result = b.wrapping_sub(a);
            (result, add_overflows(!a, b, result))
        }
        Opcode::Subfc => {
            let result = b.wrapping_sub(a);
            cpu.set_carry(a == 0 || carry(b, 0u32.wrapping_sub(a)));
            (result, add_overflows(!a, b, result))
        }
        Opcode::Subfe => {
            let (result, carry_out) = add_extended(!a, b, ca);
            cpu.set_carry(carry_out);
            (result, add_overflows(!a, b, result))
        }
        Opcode::Subfme => {
            let result = (!a).wrapping_add(ca).wrapping_sub(1);
            cpu.set_carry(!a != 0 || ca != 0);
            (result, add_overflows(!a, u32::MAX, result))
        }
        Opcode::Subfze => {
            let result = (!a).wrapping_add(ca);
            cpu.set_carry(carry(!a, ca));
            (result, add_overflows(!a, 0, result))
        }
        Opcode::Neg => (a.wrapping_neg(), a == 0x8000_0000),
        Opcode::Mullw => {
            let product = (a as i32 as i64) * (b as i32 as i64);
            (product as u32, product != product as i32 as i64)
        }
        Opcode::Mulhw => (
            (((a as i32 as i64) * (b as i32 as i64)) >> 32) as u32,
            false,
        ),
        Opcode::Mulhwu => ((((a as u64) * (b as u64)) >> 32) as u32, false),
        Opcode::Divw => {
            let overflow = b == 0 || (a == 0x8000_0000 && b == u32::MAX);
            if overflow {
                (if (a as i32) < 0 { u32::MAX } else { 0 }, true)
            } else {
                (((a as i32) / (b as i32)) as u32, false)
            }
        }
        Opcode::Divwu => {
            if b == 0 {
                (0, true)
            } else {
                (a / b, false)
            }
        }
        _ => unreachable!("{} is not an XO-form instruction", op.name()),
    };

    cpu.gpr[inst.rd()] = result;
    apply_overflow(cpu, ctx, inst, op, overflow);
    if inst.rc() {
        cpu.update_cr0(result);
    }
}

/// X-form logical instructions: `rA = f(rS, rB)`.
pub fn execute_logical(cpu: &mut CpuState, op: Opcode, inst: Instruction) {
    let s = cpu.gpr[inst.rs()];
    let b = cpu.gpr[inst.rb()];
    let result = match op {
        Opcode::And => s & b,
        Opcode::Andc => s & !b,
        Opcode::Or => s | b,
        Opcode::Orc => s | !b,
        Opcode::Xor => s ^ b,
        Opcode::Nand => !(s & b),
        Opcode::Nor => !(s | b),
        Opcode::Eqv => !(s ^ b),
        Opcode::Extsb => s as u8 as i8 as i32 as u32,
        Opcode::Extsh => s as u16 as i16 as i32 as u32,
        Opcode::Cntlzw => s.leading_zeros(),
        _ => unreachable!("{} is not a logical instruction", op.name()),
    };
    cpu.gpr[inst.ra()] = result;
    if inst.rc() {
        cpu.update_cr0(result);
    }
}

/// Rotates and shifts: `rA = f(rS, ...)`.
pub fn execute_rotate_shift(cpu: &mut CpuState, op: Opcode, inst: Instruction) {
    let s = cpu.gpr[inst.rs()];
    let result = match op {
        Opcode::Rlwinm => s.rotate_left(inst.sh()) & rotate_mask(inst.mb(), inst.me()),
        Opcode::Rlwnm => {
            s.rotate_left(cpu.gpr[inst.rb()] & 0x1F) & rotate_mask(inst.mb(), inst.me())
        }
        Opcode::Rlwimi => {
            let mask = rotate_mask(inst.mb(), inst.me());
            (s.rotate_left(inst.sh()) & mask) | (cpu.gpr[inst.ra()] & !mask)
        }
        Opcode::Slw => {
            let amount = cpu.gpr[inst.rb()] & 0x3F;
            if amount & 0x20 != 0 {
                0
            } else {
                s << amount
            }
        }
        Opcode::Srw => {
            let amount = cpu.gpr[inst.rb()] & 0x3F;
            if amount & 0x20 != 0 {
                0
            } else {
                s >> amount
            }
        }
        Opcode::Sraw => {
            let amount = cpu.gpr[inst.rb()] & 0x3F;
            shift_right_algebraic(cpu, s, amount)
        }
        Opcode::Srawi => shift_right_algebraic(cpu, s, inst.sh()),
        _ => unreachable!("{} is not a rotate or shift", op.name()),
    };
    cpu.gpr[inst.ra()] = result;
    if inst.rc() {
        cpu.update_cr0(result);
    }
}

/// Algebraic right shift by 0..=63; CA is set when a negative value loses
/// one bits.
fn shift_right_algebraic(cpu: &mut CpuState, value: u32, amount: u32) -> u32 {
    let negative = (value as i32) < 0;
    if amount >= 32 {
        cpu.set_carry(negative);
        return if negative { u32::MAX } else { 0 };
    }
    let lost = amount != 0 && (value & ((1u32 << amount) - 1)) != 0;
    cpu.set_carry(negative && lost);
    ((value as i32) >> amount) as u32
}

pub fn execute_compare(cpu: &mut CpuState, op: Opcode, inst: Instruction) {
    let a = cpu.gpr[inst.ra()];
    let field = match op {
        Opcode::Cmp => flags::compare_signed(a, cpu.gpr[inst.rb()]),
        Opcode::Cmpl => flags::compare_unsigned(a, cpu.gpr[inst.rb()]),
        Opcode::Cmpi => flags::compare_signed(a, inst.simm16() as u32),
        Opcode::Cmpli => flags::compare_unsigned(a, inst.uimm()),
        _ => unreachable!("{} is not a compare", op.name()),
    };
    cpu.cr.fields[inst.crfd()] = field;
}

/// Evaluate the TO condition of `tw`/`twi`.
pub fn trap_condition(to: u32, a: u32, b: u32) -> bool {
    let (sa, sb) = (a as i32, b as i32);
    (to & 0x10 != 0 && sa < sb)
        || (to & 0x08 != 0 && sa > sb)
        || (to & 0x04 != 0 && a == b)
        || (to & 0x02 != 0 && a < b)
        || (to & 0x01 != 0 && a > b)
}
