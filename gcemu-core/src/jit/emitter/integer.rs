// Integer ALU, rotate/shift, compare and trap emission
use super::BlockCompiler;
use crate::cpu::exceptions::{program_cause, ExceptionFlags};
use crate::cpu::flags::{rotate_mask, CR_SO};
use crate::cpu::state::spr;
use crate::decoder::{DecodedInstruction, Opcode};
use crate::error::{CoreError, Result};
use crate::jit::ir::{
    AluOp, Cond, ExitKind, HostReg, IrInst, Operand, UnaryOp, Width, RFLAGS, RFLAGS2, RSCRATCH,
    RSCRATCH2, RSCRATCH3,
};

#[derive(Debug, Clone, Copy)]
enum CarryIn {
    Zero,
    One,
    Xer,
}

impl BlockCompiler<'_> {
    pub(super) fn integer(&mut self, decoded: DecodedInstruction) -> Result<()> {
        use Opcode::*;
        match decoded.opcode {
            Addi | Addis | Addic | AddicRc | Subfic | Mulli | AndiRc | AndisRc | Ori | Oris
            | Xori | Xoris => self.immediate(decoded),
            Add | Addc | Adde | Addme | Addze | Subf | Subfc | Subfe | Subfme | Subfze | Neg
            | Mullw | Mulhw | Mulhwu | Divw | Divwu => self.arithmetic(decoded),
            And | Andc | Or | Orc | Xor | Nand | Nor | Eqv | Extsb | Extsh | Cntlzw => {
                self.logical(decoded)
            }
            Rlwimi | Rlwinm | Rlwnm | Slw | Srw | Sraw | Srawi => self.rotate_shift(decoded),
            Cmp | Cmpl | Cmpi | Cmpli => self.compare(decoded),
            Tw | Twi => self.trap(decoded),
            op => Err(CoreError::codegen(
                format!("{} is not an integer instruction", op.name()),
                self.location(),
            )),
        }
    }

    fn unary(&mut self, op: UnaryOp, width: Width, dst: HostReg, src: HostReg) {
        self.emit(IrInst::Unary { op, width, dst, src });
    }

    /// `RSCRATCH = x + y + carry_in` (32-bit), `RSCRATCH2 = carry out`.
    fn add_carrying(&mut self, x: HostReg, y: Operand, carry_in: CarryIn) {
        self.emit(IrInst::Mov { width: Width::W32, dst: RSCRATCH, src: x });
        match y {
            Operand::Reg(reg) => self.alu(AluOp::Add, Width::W64, RSCRATCH, RSCRATCH, reg),
            Operand::Imm(imm) => {
                self.alu_imm(AluOp::Add, Width::W64, RSCRATCH, RSCRATCH, imm & 0xFFFF_FFFF)
            }
        }
        match carry_in {
            CarryIn::Zero => {}
            CarryIn::One => self.alu_imm(AluOp::Add, Width::W64, RSCRATCH, RSCRATCH, 1),
            CarryIn::Xer => {
                self.emit(IrInst::LoadCa { dst: RSCRATCH2 });
                self.alu(AluOp::Add, Width::W64, RSCRATCH, RSCRATCH, RSCRATCH2);
            }
        }
        self.alu_imm(AluOp::Shr, Width::W64, RSCRATCH2, RSCRATCH, 32);
        self.emit(IrInst::Mov { width: Width::W32, dst: RSCRATCH, src: RSCRATCH });
    }

    /// Signed overflow of `x + y = result`, written to XER.
    fn add_overflow(&mut self, x: HostReg, y: Operand, result: HostReg) {
        self.alu(AluOp::Xor, Width::W32, RSCRATCH2, x, result);
        match y {
            Operand::Reg(reg) => self.alu(AluOp::Xor, Width::W32, RFLAGS2, reg, result),
            Operand::Imm(imm) => {
                self.mov_imm(RFLAGS2, imm & 0xFFFF_FFFF);
                self.alu(AluOp::Xor, Width::W32, RFLAGS2, RFLAGS2, result);
            }
        }
        self.alu(AluOp::And, Width::W32, RSCRATCH2, RSCRATCH2, RFLAGS2);
        self.alu_imm(AluOp::Shr, Width::W32, RSCRATCH2, RSCRATCH2, 31);
        self.store_overflow(RSCRATCH2);
    }

    fn immediate(&mut self, decoded: DecodedInstruction) -> Result<()> {
        let inst = decoded.inst;
        let simm = inst.simm16() as u32;
        let uimm = u64::from(inst.uimm());
        let op = decoded.opcode;

        let (dst, record) = match op {
            Opcode::Addi | Opcode::Addis => {
                let imm = u64::from(if op == Opcode::Addis { simm << 16 } else { simm });
                if inst.ra() == 0 {
                    self.mov_imm(RSCRATCH, imm);
                } else {
                    let a = self.read_gpr(inst.ra())?;
                    self.alu_imm(AluOp::Add, Width::W32, RSCRATCH, a, imm);
                }
                (inst.rd(), false)
            }
            Opcode::Addic | Opcode::AddicRc => {
                let a = self.read_gpr(inst.ra())?;
                self.add_carrying(a, Operand::Imm(u64::from(simm)), CarryIn::Zero);
                self.emit(IrInst::StoreCa { src: RSCRATCH2 });
                (inst.rd(), op == Opcode::AddicRc)
            }
            Opcode::Subfic => {
                let a = self.read_gpr(inst.ra())?;
                self.unary(UnaryOp::Not, Width::W32, RSCRATCH3, a);
                self.add_carrying(RSCRATCH3, Operand::Imm(u64::from(simm)), CarryIn::One);
                self.emit(IrInst::StoreCa { src: RSCRATCH2 });
                (inst.rd(), false)
            }
            Opcode::Mulli => {
                let a = self.read_gpr(inst.ra())?;
                self.alu_imm(AluOp::MulLo, Width::W32, RSCRATCH, a, u64::from(simm));
                (inst.rd(), false)
            }
            _ => {
                let (alu, imm, record) = match op {
                    Opcode::AndiRc => (AluOp::And, uimm, true),
                    Opcode::AndisRc => (AluOp::And, uimm << 16, true),
                    Opcode::Ori => (AluOp::Or, uimm, false),
                    Opcode::Oris => (AluOp::Or, uimm << 16, false),
                    Opcode::Xori => (AluOp::Xor, uimm, false),
                    Opcode::Xoris => (AluOp::Xor, uimm << 16, false),
                    other => {
                        return Err(CoreError::codegen(
                            format!("{} is not an immediate instruction", other.name()),
                            self.location(),
                        ))
                    }
                };
                let s = self.read_gpr(inst.rs())?;
                self.alu_imm(alu, Width::W32, RSCRATCH, s, imm);
                (inst.ra(), record)
            }
        };

        self.set_gpr(dst, RSCRATCH)?;
        if record {
            self.update_cr0(RSCRATCH);
        }
        Ok(())
    }

    fn arithmetic(&mut self, decoded: DecodedInstruction) -> Result<()> {
        use Opcode::*;

        let inst = decoded.inst;
        let op = decoded.opcode;
        let oe = self.overflow_enabled(&decoded);
        let a = self.read_gpr(inst.ra())?;
        let b = match op {
            Addme | Addze | Subfme | Subfze | Neg => a,
            _ => self.read_gpr(inst.rb())?,
        };
        let all_ones = Operand::Imm(0xFFFF_FFFF);

        match op {
            Add => {
                self.alu(AluOp::Add, Width::W32, RSCRATCH, a, b);
                if oe {
                    self.add_overflow(a, Operand::Reg(b), RSCRATCH);
                }
            }
            Addc | Adde | Addme | Addze => {
                let (y, carry_in) = match op {
                    Addc => (Operand::Reg(b), CarryIn::Zero),
                    Adde => (Operand::Reg(b), CarryIn::Xer),
                    Addme => (all_ones, CarryIn::Xer),
                    _ => (Operand::Imm(0), CarryIn::Xer),
                };
                self.add_carrying(a, y, carry_in);
                self.emit(IrInst::StoreCa { src: RSCRATCH2 });
                if oe {
                    self.add_overflow(a, y, RSCRATCH);
                }
            }
            Subf => {
                self.alu(AluOp::Sub, Width::W32, RSCRATCH, b, a);
                if oe {
                    self.unary(UnaryOp::Not, Width::W32, RSCRATCH3, a);
                    self.add_overflow(RSCRATCH3, Operand::Reg(b), RSCRATCH);
                }
            }
            Subfc | Subfe | Subfme | Subfze => {
                // rD = ~rA + y + carry_in
                let (y, carry_in) = match op {
                    Subfc => (Operand::Reg(b), CarryIn::One),
                    Subfe => (Operand::Reg(b), CarryIn::Xer),
                    Subfme => (all_ones, CarryIn::Xer),
                    _ => (Operand::Imm(0), CarryIn::Xer),
                };
                self.unary(UnaryOp::Not, Width::W32, RSCRATCH3, a);
                self.add_carrying(RSCRATCH3, y, carry_in);
                self.emit(IrInst::StoreCa { src: RSCRATCH2 });
                if oe {
                    self.add_overflow(RSCRATCH3, y, RSCRATCH);
                }
            }
            Neg => {
                self.unary(UnaryOp::Neg, Width::W32, RSCRATCH, a);
                if oe {
                    self.emit(IrInst::SetCc {
                        cond: Cond::Eq,
                        width: Width::W32,
                        dst: RSCRATCH3,
                        a,
                        b: Operand::Imm(0x8000_0000),
                    });
                    self.store_overflow(RSCRATCH3);
                }
            }
            Mullw => {
                self.alu(AluOp::MulLo, Width::W32, RSCRATCH, a, b);
                if oe {
                    self.unary(UnaryOp::SignExt32, Width::W64, RSCRATCH2, a);
                    self.unary(UnaryOp::SignExt32, Width::W64, RSCRATCH3, b);
                    self.alu(AluOp::MulLo, Width::W64, RSCRATCH2, RSCRATCH2, RSCRATCH3);
                    self.unary(UnaryOp::SignExt32, Width::W64, RSCRATCH3, RSCRATCH);
                    self.emit(IrInst::SetCc {
                        cond: Cond::Ne,
                        width: Width::W64,
                        dst: RSCRATCH3,
                        a: RSCRATCH2,
                        b: Operand::Reg(RSCRATCH3),
                    });
                    self.store_overflow(RSCRATCH3);
                }
            }
            Mulhw => self.alu(AluOp::MulHiS, Width::W32, RSCRATCH, a, b),
            Mulhwu => self.alu(AluOp::MulHiU, Width::W32, RSCRATCH, a, b),
            Divw => self.divide_signed(a, b, oe),
            Divwu => self.divide_unsigned(a, b, oe),
            other => {
                return Err(CoreError::codegen(
                    format!("{} is not an XO-form instruction", other.name()),
                    self.location(),
                ))
            }
        }

        self.set_gpr(inst.rd(), RSCRATCH)?;
        if inst.rc() {
            self.update_cr0(RSCRATCH);
        }
        Ok(())
    }

    /// `divw`: division by zero and `0x80000000 / -1` produce 0 or -1 from
    /// the dividend's sign and report overflow.
    fn divide_signed(&mut self, a: HostReg, b: HostReg, oe: bool) {
        let special = self.new_label();
        let normal = self.new_label();
        let done = self.new_label();

        self.branch_to(Cond::Eq, Width::W32, b, Operand::Imm(0), special);
        self.branch_to(Cond::Ne, Width::W32, a, Operand::Imm(0x8000_0000), normal);
        self.branch_to(Cond::Eq, Width::W32, b, Operand::Imm(0xFFFF_FFFF), special);
        self.bind_label(normal);
        self.alu(AluOp::DivS, Width::W32, RSCRATCH, a, b);
        if oe {
            self.mov_imm(RSCRATCH3, 0);
        }
        self.emit(IrInst::Jump(done));

        self.bind_label(special);
        self.unary(UnaryOp::SignExt32, Width::W64, RSCRATCH, a);
        self.alu_imm(AluOp::Sar, Width::W64, RSCRATCH, RSCRATCH, 63);
        self.mov(RSCRATCH, RSCRATCH);
        if oe {
            self.mov_imm(RSCRATCH3, 1);
        }
        self.bind_label(done);
        if oe {
            self.store_overflow(RSCRATCH3);
        }
    }

    fn divide_unsigned(&mut self, a: HostReg, b: HostReg, oe: bool) {
        let special = self.new_label();
        let done = self.new_label();

        self.branch_to(Cond::Eq, Width::W32, b, Operand::Imm(0), special);
        self.alu(AluOp::DivU, Width::W32, RSCRATCH, a, b);
        if oe {
            self.mov_imm(RSCRATCH3, 0);
        }
        self.emit(IrInst::Jump(done));

        self.bind_label(special);
        self.mov_imm(RSCRATCH, 0);
        if oe {
            self.mov_imm(RSCRATCH3, 1);
        }
        self.bind_label(done);
        if oe {
            self.store_overflow(RSCRATCH3);
        }
    }

    fn logical(&mut self, decoded: DecodedInstruction) -> Result<()> {
        use Opcode::*;

        let inst = decoded.inst;
        let s = self.read_gpr(inst.rs())?;
        match decoded.opcode {
            Extsb => self.unary(UnaryOp::SignExt8, Width::W32, RSCRATCH, s),
            Extsh => self.unary(UnaryOp::SignExt16, Width::W32, RSCRATCH, s),
            Cntlzw => self.unary(UnaryOp::Clz, Width::W32, RSCRATCH, s),
            op => {
                let b = self.read_gpr(inst.rb())?;
                let (alu, complement_b, complement_result) = match op {
                    And => (AluOp::And, false, false),
                    Andc => (AluOp::And, true, false),
                    Or => (AluOp::Or, false, false),
                    Orc => (AluOp::Or, true, false),
                    Xor => (AluOp::Xor, false, false),
                    Nand => (AluOp::And, false, true),
                    Nor => (AluOp::Or, false, true),
                    Eqv => (AluOp::Xor, false, true),
                    other => {
                        return Err(CoreError::codegen(
                            format!("{} is not a logical instruction", other.name()),
                            self.location(),
                        ))
                    }
                };
                let rhs = if complement_b {
                    self.unary(UnaryOp::Not, Width::W32, RSCRATCH2, b);
                    RSCRATCH2
                } else {
                    b
                };
                self.alu(alu, Width::W32, RSCRATCH, s, rhs);
                if complement_result {
                    self.unary(UnaryOp::Not, Width::W32, RSCRATCH, RSCRATCH);
                }
            }
        }

        self.set_gpr(inst.ra(), RSCRATCH)?;
        if inst.rc() {
            self.update_cr0(RSCRATCH);
        }
        Ok(())
    }

    fn rotate_shift(&mut self, decoded: DecodedInstruction) -> Result<()> {
        use Opcode::*;

        let inst = decoded.inst;
        let s = self.read_gpr(inst.rs())?;
        let mask = u64::from(rotate_mask(inst.mb(), inst.me()));
        match decoded.opcode {
            Rlwinm => {
                self.alu_imm(AluOp::Rotl, Width::W32, RSCRATCH, s, u64::from(inst.sh()));
                self.alu_imm(AluOp::And, Width::W32, RSCRATCH, RSCRATCH, mask);
            }
            Rlwnm => {
                let b = self.read_gpr(inst.rb())?;
                self.alu_imm(AluOp::And, Width::W32, RSCRATCH2, b, 0x1F);
                self.alu(AluOp::Rotl, Width::W32, RSCRATCH, s, RSCRATCH2);
                self.alu_imm(AluOp::And, Width::W32, RSCRATCH, RSCRATCH, mask);
            }
            Rlwimi => {
                let a = self.read_gpr(inst.ra())?;
                self.alu_imm(AluOp::Rotl, Width::W32, RSCRATCH, s, u64::from(inst.sh()));
                self.alu_imm(AluOp::And, Width::W32, RSCRATCH, RSCRATCH, mask);
                self.alu_imm(AluOp::And, Width::W32, RSCRATCH2, a, !mask & 0xFFFF_FFFF);
                self.alu(AluOp::Or, Width::W32, RSCRATCH, RSCRATCH, RSCRATCH2);
            }
            Slw | Srw => {
                // shift the zero-extended value at 64 bits so amounts 32..=63 clear it
                let b = self.read_gpr(inst.rb())?;
                let shift = if decoded.opcode == Slw { AluOp::Shl } else { AluOp::Shr };
                self.alu_imm(AluOp::And, Width::W32, RSCRATCH2, b, 0x3F);
                self.mov(RSCRATCH, s);
                self.alu(shift, Width::W64, RSCRATCH, RSCRATCH, RSCRATCH2);
                self.mov(RSCRATCH, RSCRATCH);
            }
            Sraw => {
                let b = self.read_gpr(inst.rb())?;
                self.alu_imm(AluOp::And, Width::W32, RSCRATCH2, b, 0x3F);
                self.shift_right_algebraic(s, Operand::Reg(RSCRATCH2));
            }
            Srawi => self.shift_right_algebraic(s, Operand::Imm(u64::from(inst.sh()))),
            other => {
                return Err(CoreError::codegen(
                    format!("{} is not a rotate or shift", other.name()),
                    self.location(),
                ))
            }
        }

        self.set_gpr(inst.ra(), RSCRATCH)?;
        if inst.rc() {
            self.update_cr0(RSCRATCH);
        }
        Ok(())
    }

    /// `RSCRATCH = s >> amount` (algebraic, amount 0..=63); CA is set when a
    /// negative value shifts out one bits.
    fn shift_right_algebraic(&mut self, s: HostReg, amount: Operand) {
        self.unary(UnaryOp::SignExt32, Width::W64, RSCRATCH3, s);
        self.alu(AluOp::Sar, Width::W64, RSCRATCH, RSCRATCH3, amount);
        self.alu(AluOp::Shl, Width::W64, RFLAGS, RSCRATCH, amount);
        self.emit(IrInst::SetCc {
            cond: Cond::Ne,
            width: Width::W64,
            dst: RFLAGS,
            a: RSCRATCH3,
            b: Operand::Reg(RFLAGS),
        });
        self.emit(IrInst::SetCc {
            cond: Cond::LtS,
            width: Width::W64,
            dst: RFLAGS2,
            a: RSCRATCH3,
            b: Operand::Imm(0),
        });
        self.alu(AluOp::And, Width::W64, RFLAGS, RFLAGS, RFLAGS2);
        self.emit(IrInst::StoreCa { src: RFLAGS });
        self.mov(RSCRATCH, RSCRATCH);
    }

    fn compare(&mut self, decoded: DecodedInstruction) -> Result<()> {
        let inst = decoded.inst;
        let a = self.read_gpr(inst.ra())?;
        match decoded.opcode {
            Opcode::Cmp => {
                let b = self.read_gpr(inst.rb())?;
                self.unary(UnaryOp::SignExt32, Width::W64, RSCRATCH, a);
                self.unary(UnaryOp::SignExt32, Width::W64, RSCRATCH2, b);
                self.alu(AluOp::Sub, Width::W64, RSCRATCH, RSCRATCH, RSCRATCH2);
            }
            Opcode::Cmpl => {
                let b = self.read_gpr(inst.rb())?;
                self.mov(RSCRATCH, a);
                self.alu(AluOp::Sub, Width::W64, RSCRATCH, RSCRATCH, b);
            }
            Opcode::Cmpi => {
                self.unary(UnaryOp::SignExt32, Width::W64, RSCRATCH, a);
                let imm = i64::from(inst.simm16()) as u64;
                self.alu_imm(AluOp::Sub, Width::W64, RSCRATCH, RSCRATCH, imm);
            }
            Opcode::Cmpli => {
                self.mov(RSCRATCH, a);
                self.alu_imm(AluOp::Sub, Width::W64, RSCRATCH, RSCRATCH, u64::from(inst.uimm()));
            }
            other => {
                return Err(CoreError::codegen(
                    format!("{} is not a compare", other.name()),
                    self.location(),
                ))
            }
        }
        self.alu_imm(AluOp::And, Width::W64, RSCRATCH, RSCRATCH, !CR_SO);
        self.emit(IrInst::StoreCr { field: inst.crfd() as u8, src: RSCRATCH });
        Ok(())
    }

    fn trap(&mut self, decoded: DecodedInstruction) -> Result<()> {
        let inst = decoded.inst;
        let a = self.read_gpr(inst.ra())?;
        let b = match decoded.opcode {
            Opcode::Tw => Operand::Reg(self.read_gpr(inst.rb())?),
            _ => Operand::Imm(u64::from(inst.simm16() as u32)),
        };
        self.flush();

        let retire = self.retire_current();
        let to = inst.to();
        let conditions = [
            (0x10, Cond::LtS),
            (0x08, Cond::GtS),
            (0x04, Cond::Eq),
            (0x02, Cond::LtU),
            (0x01, Cond::GtU),
        ];
        let taken = self.new_label();
        for (bit, cond) in conditions {
            if to & bit != 0 {
                self.branch_to(cond, Width::W32, a, b, taken);
            }
        }
        self.emit_side_exit(ExitKind::Jump(self.next_pc()), retire);

        self.bind_label(taken);
        self.mov_imm(RSCRATCH, u64::from(program_cause::TRAP));
        self.emit(IrInst::StoreSpr { spr: spr::SRR1 as u16, src: RSCRATCH });
        self.emit(IrInst::RaiseException { flags: ExceptionFlags::PROGRAM.bits() });
        self.emit(IrInst::SetPc { pc: self.ctx.pc });
        self.emit_exit(ExitKind::Exception, retire);
        Ok(())
    }
}
