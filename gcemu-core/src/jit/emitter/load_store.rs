// Integer load/store emission
use super::BlockCompiler;
use crate::decoder::DecodedInstruction;
use crate::error::Result;
use crate::interpreter::load_store::AccessForm;
use crate::jit::ir::{AluOp, FaultSite, IrInst, Operand, Width, RSCRATCH, RSCRATCH2};

impl BlockCompiler<'_> {
    pub(super) fn load_store(&mut self, decoded: DecodedInstruction, form: AccessForm) -> Result<()> {
        let inst = decoded.inst;

        // effective address into RSCRATCH2
        let offset = if form.indexed {
            Operand::Reg(self.read_gpr(inst.rb())?)
        } else {
            Operand::Imm(u64::from(inst.simm16() as u32))
        };
        if inst.ra() == 0 && !form.update {
            match offset {
                Operand::Reg(reg) => self.mov(RSCRATCH2, reg),
                Operand::Imm(imm) => self.mov_imm(RSCRATCH2, imm),
            }
        } else {
            let base = self.read_gpr(inst.ra())?;
            self.alu(AluOp::Add, Width::W32, RSCRATCH2, base, offset);
        }

        let retire = self.retire_current();
        let site = FaultSite { pc: self.ctx.pc, retire };
        if form.store {
            let value = self.read_gpr(inst.rs())?;
            self.mov(RSCRATCH, value);
            self.flush();
            self.emit(IrInst::Store {
                size: form.size,
                src: RSCRATCH,
                addr: RSCRATCH2,
                site,
            });
            if form.update {
                self.set_gpr(inst.ra(), RSCRATCH2)?;
                self.flush();
            }
            self.emit(IrInst::ExitIfCodeModified { next: self.next_pc(), retire });
        } else {
            self.flush();
            self.emit(IrInst::Load {
                size: form.size,
                signed: form.signed,
                dst: RSCRATCH,
                addr: RSCRATCH2,
                site,
            });
            self.set_gpr(inst.rd(), RSCRATCH)?;
            if form.update {
                self.set_gpr(inst.ra(), RSCRATCH2)?;
            }
        }
        Ok(())
    }
}
