// Guest CPU state
use serde::{Deserialize, Serialize};

use crate::cpu::exceptions::ExceptionFlags;
use crate::cpu::flags::{self, CrBit};

/// Special-purpose register numbers.
pub mod spr {
    pub const XER: usize = 1;
    pub const LR: usize = 8;
    pub const CTR: usize = 9;
    pub const DSISR: usize = 18;
    pub const DAR: usize = 19;
    pub const DEC: usize = 22;
    pub const SRR0: usize = 26;
    pub const SRR1: usize = 27;
    /// Time base, read encodings (`mftb`).
    pub const TL: usize = 268;
    pub const TU: usize = 269;
    pub const SPRG0: usize = 272;
    pub const SPRG3: usize = 275;
    /// Time base, write encodings (`mtspr`).
    pub const TL_W: usize = 284;
    pub const TU_W: usize = 285;
    pub const PVR: usize = 287;
    pub const GQR0: usize = 912;
    pub const GQR7: usize = 919;
    pub const HID2: usize = 920;
    pub const WPAR: usize = 921;
    pub const HID0: usize = 1008;
    pub const HID1: usize = 1009;

    pub const COUNT: usize = 1024;
}

/// Machine-state register bits.
pub mod msr {
    /// External interrupt enable.
    pub const EE: u32 = 0x8000;
    /// Exception prefix (vectors at 0xFFF00000).
    pub const IP: u32 = 0x40;
    /// Bits preserved into SRR1 on exception entry.
    pub const SRR1_MASK: u32 = 0x87C0_FFFF;
    /// Bits cleared on exception entry.
    pub const EXCEPTION_CLEAR: u32 = 0x0004_EF36;
}

pub const XER_CA_SHIFT: u32 = 29;
pub const XER_OV_SHIFT: u32 = 30;
pub const XER_STRINGCTRL_MASK: u32 = 0xFF7F;
/// `xer_so_ov` bit holding SO.
pub const XER_SO_FLAG: u8 = 0b10;
/// `xer_so_ov` bit holding OV.
pub const XER_OV_FLAG: u8 = 0b01;

/// Processor version reported by Gekko.
pub const GEKKO_PVR: u32 = 0x0008_3214;

/// The eight packed condition-register fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionRegister {
    pub fields: [u64; 8],
}

impl ConditionRegister {
    pub fn new() -> Self {
        Self {
            fields: [flags::ppc_to_internal(0); 8],
        }
    }

    /// Architectural 4-bit value of field `field`.
    pub fn get_field(&self, field: usize) -> u8 {
        flags::internal_to_ppc(self.fields[field])
    }

    pub fn set_field(&mut self, field: usize, value: u8) {
        self.fields[field] = flags::ppc_to_internal(value);
    }

    /// Read CR bit `crb` (0 = LT of cr0).
    pub fn get_bit(&self, crb: u32) -> bool {
        flags::get_bit(self.fields[(crb >> 2) as usize], CrBit::from_crb(crb))
    }

    pub fn set_bit(&mut self, crb: u32, value: bool) {
        let field = &mut self.fields[(crb >> 2) as usize];
        *field = flags::set_bit(*field, CrBit::from_crb(crb), value);
    }

    /// The full 32-bit condition register.
    pub fn get(&self) -> u32 {
        (0..8).fold(0u32, |cr, i| cr | (u32::from(self.get_field(i)) << (28 - 4 * i)))
    }

    pub fn set(&mut self, value: u32) {
        for i in 0..8 {
            self.set_field(i, ((value >> (28 - 4 * i)) & 0xF) as u8);
        }
    }
}

impl Default for ConditionRegister {
    fn default() -> Self {
        Self::new()
    }
}

/// Architectural register file of the guest CPU.
///
/// XER is split into the pieces the integer unit touches most often; the
/// remaining XER bits live in `spr[XER]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    pub gpr: [u32; 32],
    pub pc: u32,
    pub npc: u32,
    pub cr: ConditionRegister,
    pub msr: u32,
    pub xer_ca: u8,
    pub xer_so_ov: u8,
    pub xer_stringctrl: u16,
    pub spr: Vec<u32>,
    pub exceptions: ExceptionFlags,
}

impl CpuState {
    pub fn new() -> Self {
        let mut spr_file = vec![0u32; spr::COUNT];
        spr_file[spr::PVR] = GEKKO_PVR;
        Self {
            gpr: [0; 32],
            pc: 0,
            npc: 4,
            cr: ConditionRegister::new(),
            msr: 0,
            xer_ca: 0,
            xer_so_ov: 0,
            xer_stringctrl: 0,
            spr: spr_file,
            exceptions: ExceptionFlags::empty(),
        }
    }

    /// Jump to `address`, updating both PC and NPC.
    pub fn set_pc(&mut self, address: u32) {
        self.pc = address;
        self.npc = address.wrapping_add(4);
    }

    #[inline]
    pub fn carry(&self) -> bool {
        self.xer_ca != 0
    }

    #[inline]
    pub fn set_carry(&mut self, carry: bool) {
        self.xer_ca = carry as u8;
    }

    #[inline]
    pub fn summary_overflow(&self) -> bool {
        self.xer_so_ov & XER_SO_FLAG != 0
    }

    /// Set or clear OV; setting OV also sets the sticky SO.
    pub fn set_overflow(&mut self, overflow: bool) {
        if overflow {
            self.xer_so_ov = XER_SO_FLAG | XER_OV_FLAG;
        } else {
            self.xer_so_ov &= !XER_OV_FLAG;
        }
    }

    /// Architectural XER value.
    pub fn xer(&self) -> u32 {
        let mut xer = self.spr[spr::XER]
            & !(XER_STRINGCTRL_MASK | (1 << XER_CA_SHIFT) | (3 << XER_OV_SHIFT));
        xer |= u32::from(self.xer_stringctrl);
        xer |= u32::from(self.xer_ca) << XER_CA_SHIFT;
        xer |= u32::from(self.xer_so_ov) << XER_OV_SHIFT;
        xer
    }

    pub fn set_xer(&mut self, value: u32) {
        self.spr[spr::XER] = value;
        self.xer_stringctrl = (value & XER_STRINGCTRL_MASK) as u16;
        self.xer_ca = ((value >> XER_CA_SHIFT) & 1) as u8;
        self.xer_so_ov = ((value >> XER_OV_SHIFT) & 3) as u8;
    }

    /// Store `value` into CR0 with the current XER SO.
    #[inline]
    pub fn update_cr0(&mut self, value: u32) {
        self.cr.fields[0] = flags::update_field(value, self.summary_overflow());
    }

    #[inline]
    pub fn lr(&self) -> u32 {
        self.spr[spr::LR]
    }

    #[inline]
    pub fn ctr(&self) -> u32 {
        self.spr[spr::CTR]
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}
