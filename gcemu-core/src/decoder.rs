//! Gekko Instruction Decoder
//!
//! Decoding is split in two parts:
//!
//! 1. [`Instruction`] is a zero-cost bitfield view over the raw 32-bit word.
//!    Field accessors follow the architecture manual's names (`rd`, `ra`,
//!    `simm16`, `crbd`, `mb`, ...); their meaning depends on the form of the
//!    instruction being looked at.
//! 2. [`Opcode`] is a closed enum of every instruction form either engine
//!    knows. It is resolved through lookup tables built once per process:
//!    one for the primary opcode (bits 26-31) and one each for the extended
//!    opcodes of groups 19 and 31 (bits 1-10).
//!
//! XO-form arithmetic in group 31 ignores the `OE` bit when looking up the
//! extended opcode, so `addo` and `add` resolve to the same [`Opcode`].
//! Floating-point and paired-single groups are not decoded and resolve to
//! [`Opcode::Invalid`].

use std::fmt;
use std::sync::OnceLock;

/// Raw instruction word with field accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Instruction(pub u32);

impl Instruction {
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Primary opcode.
    #[inline]
    pub fn opcd(self) -> u32 {
        self.0 >> 26
    }

    #[inline]
    pub fn rd(self) -> usize {
        ((self.0 >> 21) & 0x1F) as usize
    }

    #[inline]
    pub fn rs(self) -> usize {
        self.rd()
    }

    #[inline]
    pub fn ra(self) -> usize {
        ((self.0 >> 16) & 0x1F) as usize
    }

    #[inline]
    pub fn rb(self) -> usize {
        ((self.0 >> 11) & 0x1F) as usize
    }

    /// Sign-extended 16-bit immediate.
    #[inline]
    pub fn simm16(self) -> i32 {
        self.0 as u16 as i16 as i32
    }

    #[inline]
    pub fn uimm(self) -> u32 {
        self.0 & 0xFFFF
    }

    /// Trap condition bits.
    #[inline]
    pub fn to(self) -> u32 {
        (self.0 >> 21) & 0x1F
    }

    #[inline]
    pub fn crfd(self) -> usize {
        ((self.0 >> 23) & 0x7) as usize
    }

    #[inline]
    pub fn crfs(self) -> usize {
        ((self.0 >> 18) & 0x7) as usize
    }

    #[inline]
    pub fn crbd(self) -> u32 {
        (self.0 >> 21) & 0x1F
    }

    #[inline]
    pub fn crba(self) -> u32 {
        (self.0 >> 16) & 0x1F
    }

    #[inline]
    pub fn crbb(self) -> u32 {
        (self.0 >> 11) & 0x1F
    }

    #[inline]
    pub fn sh(self) -> u32 {
        (self.0 >> 11) & 0x1F
    }

    #[inline]
    pub fn mb(self) -> u32 {
        (self.0 >> 6) & 0x1F
    }

    #[inline]
    pub fn me(self) -> u32 {
        (self.0 >> 1) & 0x1F
    }

    /// Record bit: update CR0 (or CR1 for floating point).
    #[inline]
    pub fn rc(self) -> bool {
        self.0 & 1 != 0
    }

    #[inline]
    pub fn oe(self) -> bool {
        (self.0 >> 10) & 1 != 0
    }

    #[inline]
    pub fn subop10(self) -> u32 {
        (self.0 >> 1) & 0x3FF
    }

    #[inline]
    pub fn subop9(self) -> u32 {
        (self.0 >> 1) & 0x1FF
    }

    /// Special-purpose register number; the two 5-bit halves are swapped in
    /// the encoding.
    #[inline]
    pub fn spr(self) -> usize {
        (((self.0 >> 16) & 0x1F) | (((self.0 >> 11) & 0x1F) << 5)) as usize
    }

    /// Field mask for `mtcrf`.
    #[inline]
    pub fn crm(self) -> u32 {
        (self.0 >> 12) & 0xFF
    }

    /// Sign-extended displacement of `b`.
    #[inline]
    pub fn li(self) -> i32 {
        (((self.0 & 0x03FF_FFFC) << 6) as i32) >> 6
    }

    /// Sign-extended displacement of `bc`.
    #[inline]
    pub fn bd(self) -> i32 {
        (self.0 & 0xFFFC) as u16 as i16 as i32
    }

    #[inline]
    pub fn bo(self) -> u32 {
        (self.0 >> 21) & 0x1F
    }

    #[inline]
    pub fn bi(self) -> u32 {
        (self.0 >> 16) & 0x1F
    }

    /// Absolute-address bit of branches.
    #[inline]
    pub fn aa(self) -> bool {
        (self.0 >> 1) & 1 != 0
    }

    /// Link bit of branches.
    #[inline]
    pub fn lk(self) -> bool {
        self.0 & 1 != 0
    }
}

/// Instruction type categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InstructionType {
    /// Arithmetic and logical operations
    Arithmetic = 0,
    /// Branches and returns from interrupt
    Branch = 1,
    Load = 2,
    Store = 3,
    Compare = 4,
    /// Moves to and from special registers
    Move = 5,
    /// Synchronisation, cache control, system call, trap
    System = 6,
    /// Condition register logic and moves
    ConditionRegister = 7,
    Shift = 8,
    Rotate = 9,
    Unknown = 10,
}

/// Every instruction form the engines execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Invalid,
    // Integer arithmetic
    Addi,
    Addis,
    Addic,
    AddicRc,
    Subfic,
    Mulli,
    Add,
    Addc,
    Adde,
    Addme,
    Addze,
    Subf,
    Subfc,
    Subfe,
    Subfme,
    Subfze,
    Neg,
    Mullw,
    Mulhw,
    Mulhwu,
    Divw,
    Divwu,
    // Logical
    AndiRc,
    AndisRc,
    Ori,
    Oris,
    Xori,
    Xoris,
    And,
    Andc,
    Or,
    Orc,
    Xor,
    Nand,
    Nor,
    Eqv,
    Extsb,
    Extsh,
    Cntlzw,
    // Rotate and shift
    Rlwimi,
    Rlwinm,
    Rlwnm,
    Slw,
    Srw,
    Sraw,
    Srawi,
    // Compare and trap
    Cmp,
    Cmpl,
    Cmpi,
    Cmpli,
    Tw,
    Twi,
    // Condition register
    Mcrf,
    Mcrxr,
    Mfcr,
    Mtcrf,
    Crand,
    Crandc,
    Creqv,
    Crnand,
    Crnor,
    Cror,
    Crorc,
    Crxor,
    // Special registers
    Mfspr,
    Mtspr,
    Mftb,
    Mfmsr,
    Mtmsr,
    // Branches and system
    B,
    Bc,
    Bclr,
    Bcctr,
    Rfi,
    Sc,
    Isync,
    Sync,
    Eieio,
    // Loads and stores
    Lwz,
    Lwzu,
    Lwzx,
    Lwzux,
    Lbz,
    Lbzu,
    Lbzx,
    Lbzux,
    Lhz,
    Lhzu,
    Lhzx,
    Lhzux,
    Lha,
    Lhau,
    Lhax,
    Lhaux,
    Stw,
    Stwu,
    Stwx,
    Stwux,
    Stb,
    Stbu,
    Stbx,
    Stbux,
    Sth,
    Sthu,
    Sthx,
    Sthux,
    Lmw,
    Stmw,
    // Cache control
    Dcbz,
    Icbi,
    Dcbf,
    Dcbst,
    Dcbt,
    Dcbtst,
    Dcbi,
}

/// Block-level properties of an opcode.
pub mod op_flags {
    /// Ends the block after this instruction.
    pub const END_BLOCK: u32 = 1 << 0;
    /// May redirect control flow.
    pub const BRANCH: u32 = 1 << 1;
    /// Reads guest memory.
    pub const LOAD: u32 = 1 << 2;
    /// Writes guest memory.
    pub const STORE: u32 = 1 << 3;
    /// Sets XER CA.
    pub const SETS_CA: u32 = 1 << 4;
    /// Reads XER CA.
    pub const READS_CA: u32 = 1 << 5;
    /// Has an `OE` form.
    pub const HAS_OE: u32 = 1 << 6;
}

#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    pub kind: InstructionType,
    pub flags: u32,
    pub cycles: u32,
}

impl Opcode {
    pub fn info(self) -> OpInfo {
        use op_flags::*;
        use InstructionType as T;
        use Opcode::*;

        let (name, kind, flags, cycles) = match self {
            Invalid => ("(invalid)", T::Unknown, END_BLOCK, 1),
            Addi => ("addi", T::Arithmetic, 0, 1),
            Addis => ("addis", T::Arithmetic, 0, 1),
            Addic => ("addic", T::Arithmetic, SETS_CA, 1),
            AddicRc => ("addic.", T::Arithmetic, SETS_CA, 1),
            Subfic => ("subfic", T::Arithmetic, SETS_CA, 1),
            Mulli => ("mulli", T::Arithmetic, 0, 3),
            Add => ("add", T::Arithmetic, HAS_OE, 1),
            Addc => ("addc", T::Arithmetic, SETS_CA | HAS_OE, 1),
            Adde => ("adde", T::Arithmetic, SETS_CA | READS_CA | HAS_OE, 1),
            Addme => ("addme", T::Arithmetic, SETS_CA | READS_CA | HAS_OE, 1),
            Addze => ("addze", T::Arithmetic, SETS_CA | READS_CA | HAS_OE, 1),
            Subf => ("subf", T::Arithmetic, HAS_OE, 1),
            Subfc => ("subfc", T::Arithmetic, SETS_CA | HAS_OE, 1),
            Subfe => ("subfe", T::Arithmetic, SETS_CA | READS_CA | HAS_OE, 1),
            Subfme => ("subfme", T::Arithmetic, SETS_CA | READS_CA | HAS_OE, 1),
            Subfze => ("subfze", T::Arithmetic, SETS_CA | READS_CA | HAS_OE, 1),
            Neg => ("neg", T::Arithmetic, HAS_OE, 1),
            Mullw => ("mullw", T::Arithmetic, HAS_OE, 5),
            Mulhw => ("mulhw", T::Arithmetic, 0, 5),
            Mulhwu => ("mulhwu", T::Arithmetic, 0, 5),
            Divw => ("divw", T::Arithmetic, HAS_OE, 40),
            Divwu => ("divwu", T::Arithmetic, HAS_OE, 40),
            AndiRc => ("andi.", T::Arithmetic, 0, 1),
            AndisRc => ("andis.", T::Arithmetic, 0, 1),
            Ori => ("ori", T::Arithmetic, 0, 1),
            Oris => ("oris", T::Arithmetic, 0, 1),
            Xori => ("xori", T::Arithmetic, 0, 1),
            Xoris => ("xoris", T::Arithmetic, 0, 1),
            And => ("and", T::Arithmetic, 0, 1),
            Andc => ("andc", T::Arithmetic, 0, 1),
            Or => ("or", T::Arithmetic, 0, 1),
            Orc => ("orc", T::Arithmetic, 0, 1),
            Xor => ("xor", T::Arithmetic, 0, 1),
            Nand => ("nand", T::Arithmetic, 0, 1),
            Nor => ("nor", T::Arithmetic, 0, 1),
            Eqv => ("eqv", T::Arithmetic, 0, 1),
            Extsb => ("extsb", T::Arithmetic, 0, 1),
            Extsh => ("extsh", T::Arithmetic, 0, 1),
            Cntlzw => ("cntlzw", T::Arithmetic, 0, 1),
            Rlwimi => ("rlwimi", T::Rotate, 0, 1),
            Rlwinm => ("rlwinm", T::Rotate, 0, 1),
            Rlwnm => ("rlwnm", T::Rotate, 0, 1),
            Slw => ("slw", T::Shift, 0, 1),
            Srw => ("srw", T::Shift, 0, 1),
            Sraw => ("sraw", T::Shift, SETS_CA, 1),
            Srawi => ("srawi", T::Shift, SETS_CA, 1),
            Cmp => ("cmp", T::Compare, 0, 1),
            Cmpl => ("cmpl", T::Compare, 0, 1),
            Cmpi => ("cmpi", T::Compare, 0, 1),
            Cmpli => ("cmpli", T::Compare, 0, 1),
            Tw => ("tw", T::System, END_BLOCK, 2),
            Twi => ("twi", T::System, END_BLOCK, 2),
            Mcrf => ("mcrf", T::ConditionRegister, 0, 1),
            Mcrxr => ("mcrxr", T::ConditionRegister, 0, 1),
            Mfcr => ("mfcr", T::ConditionRegister, 0, 1),
            Mtcrf => ("mtcrf", T::ConditionRegister, 0, 1),
            Crand => ("crand", T::ConditionRegister, 0, 1),
            Crandc => ("crandc", T::ConditionRegister, 0, 1),
            Creqv => ("creqv", T::ConditionRegister, 0, 1),
            Crnand => ("crnand", T::ConditionRegister, 0, 1),
            Crnor => ("crnor", T::ConditionRegister, 0, 1),
            Cror => ("cror", T::ConditionRegister, 0, 1),
            Crorc => ("crorc", T::ConditionRegister, 0, 1),
            Crxor => ("crxor", T::ConditionRegister, 0, 1),
            Mfspr => ("mfspr", T::Move, 0, 1),
            Mtspr => ("mtspr", T::Move, 0, 2),
            Mftb => ("mftb", T::Move, 0, 1),
            Mfmsr => ("mfmsr", T::Move, 0, 1),
            Mtmsr => ("mtmsr", T::Move, END_BLOCK, 1),
            B => ("b", T::Branch, END_BLOCK | BRANCH, 1),
            Bc => ("bc", T::Branch, END_BLOCK | BRANCH, 1),
            Bclr => ("bclr", T::Branch, END_BLOCK | BRANCH, 1),
            Bcctr => ("bcctr", T::Branch, END_BLOCK | BRANCH, 1),
            Rfi => ("rfi", T::Branch, END_BLOCK | BRANCH, 2),
            Sc => ("sc", T::System, END_BLOCK | BRANCH, 2),
            Isync => ("isync", T::System, END_BLOCK, 1),
            Sync => ("sync", T::System, 0, 3),
            Eieio => ("eieio", T::System, 0, 1),
            Lwz => ("lwz", T::Load, LOAD, 1),
            Lwzu => ("lwzu", T::Load, LOAD, 1),
            Lwzx => ("lwzx", T::Load, LOAD, 1),
            Lwzux => ("lwzux", T::Load, LOAD, 1),
            Lbz => ("lbz", T::Load, LOAD, 1),
            Lbzu => ("lbzu", T::Load, LOAD, 1),
            Lbzx => ("lbzx", T::Load, LOAD, 1),
            Lbzux => ("lbzux", T::Load, LOAD, 1),
            Lhz => ("lhz", T::Load, LOAD, 1),
            Lhzu => ("lhzu", T::Load, LOAD, 1),
            Lhzx => ("lhzx", T::Load, LOAD, 1),
            Lhzux => ("lhzux", T::Load, LOAD, 1),
            Lha => ("lha", T::Load, LOAD, 1),
            Lhau => ("lhau", T::Load, LOAD, 1),
            Lhax => ("lhax", T::Load, LOAD, 1),
            Lhaux => ("lhaux", T::Load, LOAD, 1),
            Stw => ("stw", T::Store, STORE, 1),
            Stwu => ("stwu", T::Store, STORE, 1),
            Stwx => ("stwx", T::Store, STORE, 1),
            Stwux => ("stwux", T::Store, STORE, 1),
            Stb => ("stb", T::Store, STORE, 1),
            Stbu => ("stbu", T::Store, STORE, 1),
            Stbx => ("stbx", T::Store, STORE, 1),
            Stbux => ("stbux", T::Store, STORE, 1),
            Sth => ("sth", T::Store, STORE, 1),
            Sthu => ("sthu", T::Store, STORE, 1),
            Sthx => ("sthx", T::Store, STORE, 1),
            Sthux => ("sthux", T::Store, STORE, 1),
            Lmw => ("lmw", T::Load, LOAD, 11),
            Stmw => ("stmw", T::Store, STORE, 11),
            Dcbz => ("dcbz", T::Store, STORE, 3),
            Icbi => ("icbi", T::System, END_BLOCK, 4),
            Dcbf => ("dcbf", T::System, 0, 3),
            Dcbst => ("dcbst", T::System, 0, 3),
            Dcbt => ("dcbt", T::System, 0, 2),
            Dcbtst => ("dcbtst", T::System, 0, 2),
            Dcbi => ("dcbi", T::System, 0, 3),
        };
        OpInfo { name, kind, flags, cycles }
    }

    #[inline]
    pub fn name(self) -> &'static str {
        self.info().name
    }

    #[inline]
    pub fn ends_block(self) -> bool {
        self.info().flags & op_flags::END_BLOCK != 0
    }
}

/// Decoded instruction with its guest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub inst: Instruction,
    pub opcode: Opcode,
    pub address: u32,
}

impl DecodedInstruction {
    #[inline]
    pub fn info(&self) -> OpInfo {
        self.opcode.info()
    }
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:08X}: {:08X} {}",
            self.address,
            self.inst.raw(),
            self.opcode.name()
        )
    }
}

struct DecodeTables {
    primary: [Opcode; 64],
    group19: Box<[Opcode; 1024]>,
    group31: Box<[Opcode; 1024]>,
}

impl DecodeTables {
    fn build() -> Self {
        use Opcode::*;

        let mut primary = [Invalid; 64];
        let primary_ops: &[(usize, Opcode)] = &[
            (3, Twi),
            (7, Mulli),
            (8, Subfic),
            (10, Cmpli),
            (11, Cmpi),
            (12, Addic),
            (13, AddicRc),
            (14, Addi),
            (15, Addis),
            (16, Bc),
            (17, Sc),
            (18, B),
            (20, Rlwimi),
            (21, Rlwinm),
            (23, Rlwnm),
            (24, Ori),
            (25, Oris),
            (26, Xori),
            (27, Xoris),
            (28, AndiRc),
            (29, AndisRc),
            (32, Lwz),
            (33, Lwzu),
            (34, Lbz),
            (35, Lbzu),
            (36, Stw),
            (37, Stwu),
            (38, Stb),
            (39, Stbu),
            (40, Lhz),
            (41, Lhzu),
            (42, Lha),
            (43, Lhau),
            (44, Sth),
            (45, Sthu),
            (46, Lmw),
            (47, Stmw),
        ];
        for &(opcd, op) in primary_ops {
            primary[opcd] = op;
        }

        let mut group19 = Box::new([Invalid; 1024]);
        let group19_ops: &[(usize, Opcode)] = &[
            (0, Mcrf),
            (16, Bclr),
            (33, Crnor),
            (50, Rfi),
            (129, Crandc),
            (150, Isync),
            (193, Crxor),
            (225, Crnand),
            (257, Crand),
            (289, Creqv),
            (417, Crorc),
            (449, Cror),
            (528, Bcctr),
        ];
        for &(xo, op) in group19_ops {
            group19[xo] = op;
        }

        let mut group31 = Box::new([Invalid; 1024]);
        let group31_ops: &[(usize, Opcode)] = &[
            (0, Cmp),
            (4, Tw),
            (19, Mfcr),
            (23, Lwzx),
            (24, Slw),
            (26, Cntlzw),
            (28, And),
            (32, Cmpl),
            (54, Dcbst),
            (55, Lwzux),
            (60, Andc),
            (83, Mfmsr),
            (86, Dcbf),
            (87, Lbzx),
            (119, Lbzux),
            (124, Nor),
            (144, Mtcrf),
            (146, Mtmsr),
            (151, Stwx),
            (183, Stwux),
            (215, Stbx),
            (246, Dcbtst),
            (247, Stbux),
            (278, Dcbt),
            (279, Lhzx),
            (284, Eqv),
            (311, Lhzux),
            (316, Xor),
            (339, Mfspr),
            (343, Lhax),
            (371, Mftb),
            (375, Lhaux),
            (407, Sthx),
            (412, Orc),
            (439, Sthux),
            (444, Or),
            (467, Mtspr),
            (470, Dcbi),
            (476, Nand),
            (512, Mcrxr),
            (536, Srw),
            (598, Sync),
            (792, Sraw),
            (824, Srawi),
            (854, Eieio),
            (922, Extsh),
            (954, Extsb),
            (982, Icbi),
            (1014, Dcbz),
        ];
        for &(xo, op) in group31_ops {
            group31[xo] = op;
        }

        // XO-form: 9-bit extended opcode, OE in bit 10 of the field.
        let xo_ops: &[(usize, Opcode)] = &[
            (8, Subfc),
            (10, Addc),
            (11, Mulhwu),
            (40, Subf),
            (75, Mulhw),
            (104, Neg),
            (136, Subfe),
            (138, Adde),
            (200, Subfze),
            (202, Addze),
            (232, Subfme),
            (234, Addme),
            (235, Mullw),
            (266, Add),
            (459, Divwu),
            (491, Divw),
        ];
        for &(xo, op) in xo_ops {
            group31[xo] = op;
            if op.info().flags & op_flags::HAS_OE != 0 {
                group31[xo | 0x200] = op;
            }
        }

        Self {
            primary,
            group19,
            group31,
        }
    }
}

fn tables() -> &'static DecodeTables {
    static TABLES: OnceLock<DecodeTables> = OnceLock::new();
    TABLES.get_or_init(DecodeTables::build)
}

impl Instruction {
    /// Resolve the opcode of this word.
    pub fn opcode(self) -> Opcode {
        let tables = tables();
        match self.opcd() {
            19 => tables.group19[self.subop10() as usize],
            31 => tables.group31[self.subop10() as usize],
            opcd => tables.primary[opcd as usize],
        }
    }

    /// Decode a PowerPC instruction word fetched from `address`.
    pub fn decode(word: u32, address: u32) -> DecodedInstruction {
        let inst = Instruction(word);
        DecodedInstruction {
            inst,
            opcode: inst.opcode(),
            address,
        }
    }
}
