// Branch instructions
use crate::cpu::state::{spr, CpuState};
use crate::decoder::Instruction;
use crate::interpreter::StepOutcome;

/// Decrement CTR as `bo` requests and report whether the CTR test passes.
#[inline]
pub(crate) fn ctr_condition(cpu: &mut CpuState, bo: u32) -> bool {
    if bo & 0x04 != 0 {
        return true;
    }
    cpu.spr[spr::CTR] = cpu.spr[spr::CTR].wrapping_sub(1);
    (cpu.spr[spr::CTR] != 0) ^ (bo & 0x02 != 0)
}

#[inline]
pub(crate) fn cr_condition(cpu: &CpuState, bo: u32, bi: u32) -> bool {
    bo & 0x10 != 0 || cpu.cr.get_bit(bi) == (bo & 0x08 != 0)
}

pub fn b(cpu: &mut CpuState, inst: Instruction) -> StepOutcome {
    let target = if inst.aa() {
        inst.li() as u32
    } else {
        cpu.pc.wrapping_add(inst.li() as u32)
    };
    if inst.lk() {
        cpu.spr[spr::LR] = cpu.pc.wrapping_add(4);
    }
    cpu.npc = target;
    StepOutcome::Branch
}

pub fn bc(cpu: &mut CpuState, inst: Instruction) -> StepOutcome {
    let taken = ctr_condition(cpu, inst.bo()) & cr_condition(cpu, inst.bo(), inst.bi());
    if taken {
        cpu.npc = if inst.aa() {
            inst.bd() as u32
        } else {
            cpu.pc.wrapping_add(inst.bd() as u32)
        };
    }
    if inst.lk() {
        cpu.spr[spr::LR] = cpu.pc.wrapping_add(4);
    }
    StepOutcome::Branch
}

pub fn bclr(cpu: &mut CpuState, inst: Instruction) -> StepOutcome {
    let target = cpu.spr[spr::LR] & !3;
    let taken = ctr_condition(cpu, inst.bo()) & cr_condition(cpu, inst.bo(), inst.bi());
    if taken {
        cpu.npc = target;
    }
    if inst.lk() {
        cpu.spr[spr::LR] = cpu.pc.wrapping_add(4);
    }
    StepOutcome::Branch
}

pub fn bcctr(cpu: &mut CpuState, inst: Instruction) -> StepOutcome {
    if inst.bo() & 0x04 == 0 {
        log::warn!("bcctr at 0x{:08X} with CTR decrement (invalid form)", cpu.pc);
    }
    if cr_condition(cpu, inst.bo(), inst.bi()) {
        cpu.npc = cpu.spr[spr::CTR] & !3;
    }
    if inst.lk() {
        cpu.spr[spr::LR] = cpu.pc.wrapping_add(4);
    }
    StepOutcome::Branch
}
