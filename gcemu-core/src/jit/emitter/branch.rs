// Branch emission
use super::BlockCompiler;
use crate::cpu::flags::CrBit;
use crate::cpu::state::spr;
use crate::decoder::{DecodedInstruction, Opcode};
use crate::error::{CoreError, Result};
use crate::jit::ir::{AluOp, Cond, ExitKind, IrInst, Operand, Width, RSCRATCH, RSCRATCH3};

#[derive(Debug, Clone, Copy)]
enum Target {
    Static(u32),
    Spr(usize),
}

impl BlockCompiler<'_> {
    pub(super) fn branch(&mut self, decoded: DecodedInstruction) -> Result<()> {
        let inst = decoded.inst;
        let pc = self.ctx.pc;
        match decoded.opcode {
            Opcode::B => {
                let target = if inst.aa() {
                    inst.li() as u32
                } else {
                    pc.wrapping_add(inst.li() as u32)
                };
                self.flush();
                if inst.lk() {
                    self.link();
                }
                let retire = self.retire_current();
                self.emit_exit(ExitKind::Jump(target), retire);
                Ok(())
            }
            Opcode::Bc => {
                let target = if inst.aa() {
                    inst.bd() as u32
                } else {
                    pc.wrapping_add(inst.bd() as u32)
                };
                self.conditional(decoded, Target::Static(target))
            }
            Opcode::Bclr => self.conditional(decoded, Target::Spr(spr::LR)),
            Opcode::Bcctr if inst.bo() & 0x04 == 0 => self.fallback(decoded),
            Opcode::Bcctr => self.conditional(decoded, Target::Spr(spr::CTR)),
            other => Err(CoreError::codegen(
                format!("{} is not a branch", other.name()),
                self.location(),
            )),
        }
    }

    fn link(&mut self) {
        self.mov_imm(RSCRATCH, u64::from(self.next_pc()));
        self.emit(IrInst::StoreSpr { spr: spr::LR as u16, src: RSCRATCH });
    }

    fn conditional(&mut self, decoded: DecodedInstruction, target: Target) -> Result<()> {
        let inst = decoded.inst;
        let (bo, bi) = (inst.bo(), inst.bi());
        self.flush();

        // the target is read before LK overwrites LR
        if let Target::Spr(index) = target {
            self.emit(IrInst::LoadSpr { dst: RSCRATCH3, spr: index as u16 });
            self.alu_imm(AluOp::And, Width::W32, RSCRATCH3, RSCRATCH3, !3u64 & 0xFFFF_FFFF);
        }
        if inst.lk() {
            self.link();
        }

        let not_taken = self.new_label();
        if bo & 0x04 == 0 {
            self.emit(IrInst::LoadSpr { dst: RSCRATCH, spr: spr::CTR as u16 });
            self.alu_imm(AluOp::Sub, Width::W32, RSCRATCH, RSCRATCH, 1);
            self.emit(IrInst::StoreSpr { spr: spr::CTR as u16, src: RSCRATCH });
            let skip_when = if bo & 0x02 != 0 { Cond::Ne } else { Cond::Eq };
            self.branch_to(skip_when, Width::W32, RSCRATCH, Operand::Imm(0), not_taken);
        }
        if bo & 0x10 == 0 {
            let expected = bo & 0x08 != 0;
            self.jump_if_cr_bit((bi >> 2) as usize, CrBit::from_crb(bi), !expected, not_taken);
        }

        let retire = self.retire_current();
        let taken = match target {
            Target::Static(address) => ExitKind::Jump(address),
            Target::Spr(_) => ExitKind::Indirect(RSCRATCH3),
        };
        self.emit_side_exit(taken, retire);
        self.bind_label(not_taken);
        self.emit_exit(ExitKind::Jump(self.next_pc()), retire);
        Ok(())
    }
}
