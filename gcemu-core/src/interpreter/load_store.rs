// Integer loads, stores and data-cache instructions
use smallvec::SmallVec;

use crate::cpu::exceptions::ExceptionFlags;
use crate::cpu::memory::MemoryError;
use crate::cpu::state::{spr, CpuState};
use crate::cpu::ExecContext;
use crate::decoder::{Instruction, Opcode};
use crate::interpreter::StepOutcome;

pub const DSISR_PAGE: u32 = 0x4000_0000;
pub const DSISR_STORE: u32 = 0x0200_0000;
pub const CACHE_LINE: u32 = 32;

/// Raise a DSI for a failed access at `address`.
pub(crate) fn raise_dsi(cpu: &mut CpuState, address: u32, store: bool) -> StepOutcome {
    log::debug!(
        "DSI at 0x{:08X}: {} 0x{:08X}",
        cpu.pc,
        if store { "store to" } else { "load from" },
        address
    );
    cpu.spr[spr::DAR] = address;
    cpu.spr[spr::DSISR] = DSISR_PAGE | if store { DSISR_STORE } else { 0 };
    cpu.exceptions.insert(ExceptionFlags::DSI);
    StepOutcome::Exception
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    Byte,
    Half,
    Word,
}

impl AccessSize {
    pub fn bytes(self) -> u32 {
        match self {
            AccessSize::Byte => 1,
            AccessSize::Half => 2,
            AccessSize::Word => 4,
        }
    }
}

/// Shape of a load/store opcode.
#[derive(Debug, Clone, Copy)]
pub struct AccessForm {
    pub size: AccessSize,
    pub signed: bool,
    pub store: bool,
    pub update: bool,
    pub indexed: bool,
}

impl AccessForm {
    pub fn of(op: Opcode) -> Option<Self> {
        use AccessSize::*;
        use Opcode::*;
        let (size, signed, store, update, indexed) = match op {
            Lwz => (Word, false, false, false, false),
            Lwzu => (Word, false, false, true, false),
            Lwzx => (Word, false, false, false, true),
            Lwzux => (Word, false, false, true, true),
            Lbz => (Byte, false, false, false, false),
            Lbzu => (Byte, false, false, true, false),
            Lbzx => (Byte, false, false, false, true),
            Lbzux => (Byte, false, false, true, true),
            Lhz => (Half, false, false, false, false),
            Lhzu => (Half, false, false, true, false),
            Lhzx => (Half, false, false, false, true),
            Lhzux => (Half, false, false, true, true),
            Lha => (Half, true, false, false, false),
            Lhau => (Half, true, false, true, false),
            Lhax => (Half, true, false, false, true),
            Lhaux => (Half, true, false, true, true),
            Stw => (Word, false, true, false, false),
            Stwu => (Word, false, true, true, false),
            Stwx => (Word, false, true, false, true),
            Stwux => (Word, false, true, true, true),
            Stb => (Byte, false, true, false, false),
            Stbu => (Byte, false, true, true, false),
            Stbx => (Byte, false, true, false, true),
            Stbux => (Byte, false, true, true, true),
            Sth => (Half, false, true, false, false),
            Sthu => (Half, false, true, true, false),
            Sthx => (Half, false, true, false, true),
            Sthux => (Half, false, true, true, true),
            _ => return None,
        };
        Some(Self {
            size,
            signed,
            store,
            update,
            indexed,
        })
    }
}

/// Effective address of a load/store.
fn effective_address(cpu: &CpuState, inst: Instruction, form: AccessForm) -> u32 {
    let base = if inst.ra() == 0 && !form.update {
        0
    } else {
        cpu.gpr[inst.ra()]
    };
    let offset = if form.indexed {
        cpu.gpr[inst.rb()]
    } else {
        inst.simm16() as u32
    };
    base.wrapping_add(offset)
}

pub fn read_sized(
    ctx: &ExecContext<'_>,
    address: u32,
    size: AccessSize,
    signed: bool,
) -> Result<u32, MemoryError> {
    Ok(match (size, signed) {
        (AccessSize::Byte, _) => u32::from(ctx.memory.read_u8(address)?),
        (AccessSize::Half, false) => u32::from(ctx.memory.read_u16(address)?),
        (AccessSize::Half, true) => ctx.memory.read_u16(address)? as i16 as i32 as u32,
        (AccessSize::Word, _) => ctx.memory.read_u32(address)?,
    })
}

pub fn write_sized(
    ctx: &mut ExecContext<'_>,
    address: u32,
    size: AccessSize,
    value: u32,
) -> Result<(), MemoryError> {
    match size {
        AccessSize::Byte => ctx.memory.write_u8(address, value as u8)?,
        AccessSize::Half => ctx.memory.write_u16(address, value as u16)?,
        AccessSize::Word => ctx.memory.write_u32(address, value)?,
    }
    ctx.record_write(address, size.bytes());
    Ok(())
}

pub fn load_store(
    cpu: &mut CpuState,
    ctx: &mut ExecContext<'_>,
    inst: Instruction,
    form: AccessForm,
) -> StepOutcome {
    let address = effective_address(cpu, inst, form);
    if form.store {
        let value = cpu.gpr[inst.rs()];
        if write_sized(ctx, address, form.size, value).is_err() {
            return raise_dsi(cpu, address, true);
        }
    } else {
        match read_sized(ctx, address, form.size, form.signed) {
            Ok(value) => cpu.gpr[inst.rd()] = value,
            Err(_) => return raise_dsi(cpu, address, false),
        }
    }
    if form.update {
        cpu.gpr[inst.ra()] = address;
    }
    StepOutcome::Continue
}

pub fn lmw(cpu: &mut CpuState, ctx: &mut ExecContext<'_>, inst: Instruction) -> StepOutcome {
    let base = if inst.ra() == 0 { 0 } else { cpu.gpr[inst.ra()] };
    let mut address = base.wrapping_add(inst.simm16() as u32);
    let mut values: SmallVec<[u32; 32]> = SmallVec::new();
    for _ in inst.rd()..32 {
        match ctx.memory.read_u32(address) {
            Ok(value) => values.push(value),
            Err(_) => return raise_dsi(cpu, address, false),
        }
        address = address.wrapping_add(4);
    }
    cpu.gpr[inst.rd()..].copy_from_slice(&values);
    StepOutcome::Continue
}

pub fn stmw(cpu: &mut CpuState, ctx: &mut ExecContext<'_>, inst: Instruction) -> StepOutcome {
    let base = if inst.ra() == 0 { 0 } else { cpu.gpr[inst.ra()] };
    let mut address = base.wrapping_add(inst.simm16() as u32);
    for reg in inst.rs()..32 {
        if write_sized(ctx, address, AccessSize::Word, cpu.gpr[reg]).is_err() {
            return raise_dsi(cpu, address, true);
        }
        address = address.wrapping_add(4);
    }
    StepOutcome::Continue
}

fn cache_line_address(cpu: &CpuState, inst: Instruction) -> u32 {
    let base = if inst.ra() == 0 { 0 } else { cpu.gpr[inst.ra()] };
    base.wrapping_add(cpu.gpr[inst.rb()]) & !(CACHE_LINE - 1)
}

pub fn dcbz(cpu: &mut CpuState, ctx: &mut ExecContext<'_>, inst: Instruction) -> StepOutcome {
    let line = cache_line_address(cpu, inst);
    for offset in (0..CACHE_LINE).step_by(4) {
        if ctx.memory.write_u32(line.wrapping_add(offset), 0).is_err() {
            return raise_dsi(cpu, line.wrapping_add(offset), true);
        }
    }
    ctx.record_write(line, CACHE_LINE);
    StepOutcome::Continue
}

pub fn icbi(cpu: &mut CpuState, ctx: &mut ExecContext<'_>, inst: Instruction) -> StepOutcome {
    let line = cache_line_address(cpu, inst);
    log::trace!("icbi 0x{:08X}", line);
    ctx.record_write(line, CACHE_LINE);
    StepOutcome::EndBlock
}
