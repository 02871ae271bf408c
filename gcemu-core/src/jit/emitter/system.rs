// Condition-register, SPR, MSR and time-base emission
use super::BlockCompiler;
use crate::cpu::exceptions::{ExceptionFlags, INT_CAUSE_CP};
use crate::cpu::flags::{CrBit, CR_NONZERO};
use crate::cpu::state::{msr, spr, XER_CA_SHIFT, XER_OV_SHIFT, XER_STRINGCTRL_MASK};
use crate::cpu::timebase::{RECIPROCAL, RECIPROCAL_SHIFT};
use crate::decoder::{DecodedInstruction, Opcode};
use crate::error::{CoreError, Result};
use crate::jit::ir::{
    AluOp, Cond, EnvSlot, ExitKind, HostReg, IrInst, Operand, Width, RFLAGS, RSCRATCH, RSCRATCH2,
    RSCRATCH3,
};

/// SPRs read and written without leaving compiled code.
fn is_plain_spr(index: usize) -> bool {
    matches!(
        index,
        spr::LR
            | spr::CTR
            | spr::SRR0
            | spr::SRR1
            | spr::DAR
            | spr::DSISR
            | spr::SPRG0..=spr::SPRG3
            | spr::GQR0..=spr::GQR7
    )
}

fn is_timebase_read(decoded: &DecodedInstruction) -> bool {
    matches!(decoded.opcode, Opcode::Mftb | Opcode::Mfspr)
        && matches!(decoded.inst.spr(), spr::TL | spr::TU)
}

impl BlockCompiler<'_> {
    pub(super) fn system_register(&mut self, decoded: DecodedInstruction) -> Result<()> {
        use Opcode::*;
        let inst = decoded.inst;
        match decoded.opcode {
            Mcrf => {
                self.emit(IrInst::LoadCr { dst: RSCRATCH, field: inst.crfs() as u8 });
                self.emit(IrInst::StoreCr { field: inst.crfd() as u8, src: RSCRATCH });
                Ok(())
            }
            Mfcr => self.mfcr(inst.rd()),
            Mtcrf => self.mtcrf(inst.rs(), inst.crm()),
            Crand | Crandc | Creqv | Crnand | Crnor | Cror | Crorc | Crxor => {
                self.cr_logical(decoded);
                Ok(())
            }
            Mfspr | Mftb if is_timebase_read(&decoded) => self.timebase_read(decoded),
            Mfspr => self.mfspr(decoded),
            Mtspr => self.mtspr(decoded),
            Mftb => self.fallback(decoded),
            Mfmsr => {
                self.emit(IrInst::LoadMsr { dst: RSCRATCH });
                self.set_gpr(inst.rd(), RSCRATCH)
            }
            Mtmsr => self.mtmsr(decoded),
            other => Err(CoreError::codegen(
                format!("{} is not a system register instruction", other.name()),
                self.location(),
            )),
        }
    }

    fn mfcr(&mut self, rd: usize) -> Result<()> {
        self.mov_imm(RSCRATCH, 0);
        for field in 0..8 {
            for bit in [CrBit::Lt, CrBit::Gt, CrBit::Eq, CrBit::So] {
                let shift = 4 * (7 - field as u64) + bit as u64;
                self.get_cr_bit(field, bit, RSCRATCH2, false);
                if shift != 0 {
                    self.alu_imm(AluOp::Shl, Width::W32, RSCRATCH2, RSCRATCH2, shift);
                }
                self.alu(AluOp::Or, Width::W32, RSCRATCH, RSCRATCH, RSCRATCH2);
            }
        }
        self.set_gpr(rd, RSCRATCH)
    }

    fn mtcrf(&mut self, rs: usize, crm: u32) -> Result<()> {
        let s = self.read_gpr(rs)?;
        for field in 0..8 {
            if crm & (0x80 >> field) == 0 {
                continue;
            }
            // nibble LT GT EQ SO -> packed field
            self.alu_imm(AluOp::Shr, Width::W32, RSCRATCH, s, 28 - 4 * field as u64);
            self.alu_imm(AluOp::And, Width::W32, RSCRATCH, RSCRATCH, 0xF);
            self.mov_imm(RSCRATCH2, CR_NONZERO);
            for bit in [CrBit::So, CrBit::Eq, CrBit::Gt, CrBit::Lt] {
                let (invert, position) = match bit {
                    CrBit::So => (false, 61),
                    CrBit::Eq => (true, 0),
                    CrBit::Gt => (true, 63),
                    CrBit::Lt => (false, 62),
                };
                self.alu_imm(AluOp::Shr, Width::W64, RSCRATCH3, RSCRATCH, bit as u64);
                self.alu_imm(AluOp::And, Width::W64, RSCRATCH3, RSCRATCH3, 1);
                if invert {
                    self.alu_imm(AluOp::Xor, Width::W64, RSCRATCH3, RSCRATCH3, 1);
                }
                if position != 0 {
                    self.alu_imm(AluOp::Shl, Width::W64, RSCRATCH3, RSCRATCH3, position);
                }
                self.alu(AluOp::Or, Width::W64, RSCRATCH2, RSCRATCH2, RSCRATCH3);
            }
            self.emit(IrInst::StoreCr { field: field as u8, src: RSCRATCH2 });
        }
        Ok(())
    }

    fn cr_logical(&mut self, decoded: DecodedInstruction) {
        use Opcode::*;

        let inst = decoded.inst;
        let (crba, crbb, crbd) = (inst.crba(), inst.crbb(), inst.crbd());
        let field_d = (crbd >> 2) as usize;
        let bit_d = CrBit::from_crb(crbd);

        // crclr / crset
        if crba == crbb && crbb == crbd {
            match decoded.opcode {
                Crxor | Crandc => {
                    self.clear_cr_bit(field_d, bit_d);
                    return;
                }
                Creqv => {
                    self.set_cr_bit(field_d, bit_d, Operand::Imm(1));
                    return;
                }
                _ => {}
            }
        }

        // Every op is AND, OR or XOR with optionally complemented inputs:
        //   crnand = ~a | ~b    crnor = ~a & ~b    creqv = ~a ^ b
        //   crandc = a & ~b     crorc = a | ~b
        let op = decoded.opcode;
        let negate_a = matches!(op, Crnand | Crnor | Creqv);
        let negate_b = matches!(op, Crandc | Crorc | Crnand | Crnor);
        let alu = match op {
            Crand | Crandc | Crnor => AluOp::And,
            Creqv | Crxor => AluOp::Xor,
            _ => AluOp::Or,
        };
        self.get_cr_bit((crba >> 2) as usize, CrBit::from_crb(crba), RSCRATCH, negate_a);
        self.get_cr_bit((crbb >> 2) as usize, CrBit::from_crb(crbb), RSCRATCH2, negate_b);
        self.alu(alu, Width::W64, RSCRATCH, RSCRATCH, RSCRATCH2);
        self.set_cr_bit(field_d, bit_d, Operand::Reg(RSCRATCH));
    }

    /// Packed XER into `dst`.
    fn load_xer(&mut self, dst: HostReg) {
        let keep = !(XER_STRINGCTRL_MASK | (1 << XER_CA_SHIFT) | (3 << XER_OV_SHIFT));
        self.emit(IrInst::LoadSpr { dst, spr: spr::XER as u16 });
        self.alu_imm(AluOp::And, Width::W32, dst, dst, u64::from(keep));
        self.emit(IrInst::LoadStringCtrl { dst: RSCRATCH3 });
        self.alu(AluOp::Or, Width::W32, dst, dst, RSCRATCH3);
        self.emit(IrInst::LoadCa { dst: RSCRATCH3 });
        self.alu_imm(AluOp::Shl, Width::W32, RSCRATCH3, RSCRATCH3, u64::from(XER_CA_SHIFT));
        self.alu(AluOp::Or, Width::W32, dst, dst, RSCRATCH3);
        self.emit(IrInst::LoadSoOv { dst: RSCRATCH3 });
        self.alu_imm(AluOp::Shl, Width::W32, RSCRATCH3, RSCRATCH3, u64::from(XER_OV_SHIFT));
        self.alu(AluOp::Or, Width::W32, dst, dst, RSCRATCH3);
    }

    fn mfspr(&mut self, decoded: DecodedInstruction) -> Result<()> {
        let inst = decoded.inst;
        match inst.spr() {
            spr::XER => self.load_xer(RSCRATCH),
            index if is_plain_spr(index) => {
                self.emit(IrInst::LoadSpr { dst: RSCRATCH, spr: index as u16 })
            }
            _ => return self.fallback(decoded),
        }
        self.set_gpr(inst.rd(), RSCRATCH)
    }

    fn mtspr(&mut self, decoded: DecodedInstruction) -> Result<()> {
        let inst = decoded.inst;
        let index = inst.spr();
        if index != spr::XER && !is_plain_spr(index) {
            return self.fallback(decoded);
        }
        let s = self.read_gpr(inst.rs())?;
        if index == spr::XER {
            self.emit(IrInst::StoreSpr { spr: spr::XER as u16, src: s });
            self.alu_imm(AluOp::And, Width::W32, RSCRATCH, s, u64::from(XER_STRINGCTRL_MASK));
            self.emit(IrInst::StoreStringCtrl { src: RSCRATCH });
            self.alu_imm(AluOp::Shr, Width::W32, RSCRATCH, s, u64::from(XER_CA_SHIFT));
            self.alu_imm(AluOp::And, Width::W32, RSCRATCH, RSCRATCH, 1);
            self.emit(IrInst::StoreCa { src: RSCRATCH });
            self.alu_imm(AluOp::Shr, Width::W32, RSCRATCH, s, u64::from(XER_OV_SHIFT));
            self.alu_imm(AluOp::And, Width::W32, RSCRATCH, RSCRATCH, 3);
            self.emit(IrInst::StoreSoOv { src: RSCRATCH });
        } else {
            self.emit(IrInst::StoreSpr { spr: index as u16, src: s });
        }
        Ok(())
    }

    /// Full 64-bit time base as of the current instruction into `RSCRATCH`.
    fn emit_timebase(&mut self) {
        let elapsed = self.new_label();
        self.emit(IrInst::LoadEnv { dst: RSCRATCH, slot: EnvSlot::Ticks });
        self.alu_imm(AluOp::Add, Width::W64, RSCRATCH, RSCRATCH, u64::from(self.ctx.cycles_before));
        self.emit(IrInst::LoadEnv { dst: RSCRATCH2, slot: EnvSlot::TimeBaseStartTicks });
        // saturate ticks - start at zero
        self.branch_to(Cond::GeU, Width::W64, RSCRATCH, RSCRATCH2, elapsed);
        self.emit(IrInst::Mov { width: Width::W64, dst: RSCRATCH, src: RSCRATCH2 });
        self.bind_label(elapsed);
        self.alu(AluOp::Sub, Width::W64, RSCRATCH, RSCRATCH, RSCRATCH2);
        self.alu_imm(AluOp::MulHiU, Width::W64, RSCRATCH, RSCRATCH, RECIPROCAL);
        self.alu_imm(AluOp::Shr, Width::W64, RSCRATCH, RSCRATCH, u64::from(RECIPROCAL_SHIFT));
        self.emit(IrInst::LoadEnv { dst: RSCRATCH2, slot: EnvSlot::TimeBaseStartValue });
        self.alu(AluOp::Add, Width::W64, RSCRATCH, RSCRATCH, RSCRATCH2);
    }

    fn timebase_read(&mut self, decoded: DecodedInstruction) -> Result<()> {
        let inst = decoded.inst;
        let upper = inst.spr() == spr::TU;

        // A following read of the other half into a different register is
        // served from the same sample.
        let merged = if self.config.merge_timebase_reads {
            self.plan
                .instructions
                .get(self.ctx.index + 1)
                .filter(|next| {
                    is_timebase_read(next)
                        && next.inst.spr() != inst.spr()
                        && next.inst.rd() != inst.rd()
                })
                .copied()
        } else {
            None
        };

        self.emit_timebase();
        self.alu_imm(AluOp::Shr, Width::W64, RSCRATCH2, RSCRATCH, 32);
        let (first, second) = if upper { (RSCRATCH2, RSCRATCH) } else { (RSCRATCH, RSCRATCH2) };
        self.set_gpr(inst.rd(), first)?;
        if let Some(next) = merged {
            log::trace!("merged time base read at 0x{:08X}", next.address);
            self.set_gpr(next.inst.rd(), second)?;
            self.ctx.skip_instructions = 1;
        }
        Ok(())
    }

    fn mtmsr(&mut self, decoded: DecodedInstruction) -> Result<()> {
        let s = self.read_gpr(decoded.inst.rs())?;
        self.mov(RSCRATCH, s);
        self.flush();

        let retire = self.retire_current();
        let next = self.next_pc();
        let no_check = self.new_label();
        self.emit(IrInst::LoadMsr { dst: RSCRATCH2 });
        self.emit(IrInst::StoreMsr { src: RSCRATCH });

        // EE going from clear to set with an external exception pending that
        // is not a command-processor interrupt
        let ee = u64::from(msr::EE);
        self.alu_imm(AluOp::And, Width::W32, RSCRATCH2, RSCRATCH2, ee);
        self.branch_to(Cond::Ne, Width::W32, RSCRATCH2, Operand::Imm(0), no_check);
        self.alu_imm(AluOp::And, Width::W32, RSCRATCH3, RSCRATCH, ee);
        self.branch_to(Cond::Eq, Width::W32, RSCRATCH3, Operand::Imm(0), no_check);
        self.emit(IrInst::LoadExceptions { dst: RFLAGS });
        self.alu_imm(
            AluOp::And,
            Width::W32,
            RFLAGS,
            RFLAGS,
            u64::from(ExceptionFlags::EXTERNAL_MASK.bits()),
        );
        self.branch_to(Cond::Eq, Width::W32, RFLAGS, Operand::Imm(0), no_check);
        self.emit(IrInst::LoadEnv { dst: RFLAGS, slot: EnvSlot::InterruptCause });
        self.alu_imm(AluOp::And, Width::W32, RFLAGS, RFLAGS, u64::from(INT_CAUSE_CP));
        self.branch_to(Cond::Ne, Width::W32, RFLAGS, Operand::Imm(0), no_check);
        self.emit_side_exit(ExitKind::ExceptionCheck(next), retire);

        self.bind_label(no_check);
        self.emit_exit(ExitKind::Jump(next), retire);
        Ok(())
    }
}
