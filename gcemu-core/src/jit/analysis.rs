//! Block Analysis
//!
//! Forms a guest block starting at an address: instructions are fetched and
//! decoded until one ends the block, the configured length is reached, a
//! breakpoint address is hit or a fetch fails. The plan also records which
//! guest GPRs the block reads and writes.

use std::collections::BTreeSet;

use bitvec::prelude::*;
use smallvec::SmallVec;

use crate::cpu::memory::GuestMemory;
use crate::decoder::{DecodedInstruction, Instruction, Opcode};

/// Why block formation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEnd {
    /// The last instruction ends the block.
    Terminator,
    SizeLimit,
    /// The next address carries a breakpoint.
    Breakpoint,
    /// The next instruction could not be fetched.
    FetchFault,
}

#[derive(Debug, Clone)]
pub struct BlockPlan {
    pub address: u32,
    pub instructions: Vec<DecodedInstruction>,
    pub gprs_read: BitVec<u32>,
    pub gprs_written: BitVec<u32>,
    pub end: BlockEnd,
}

impl BlockPlan {
    /// One past the last byte of the block.
    pub fn end_address(&self) -> u32 {
        self.address
            .wrapping_add(4 * self.instructions.len() as u32)
    }

    /// Address execution falls through to after the last instruction.
    pub fn fallthrough(&self) -> u32 {
        self.end_address()
    }
}

/// Guest registers an instruction reads and writes.
#[derive(Debug, Default)]
pub struct RegisterUsage {
    pub reads: SmallVec<[usize; 3]>,
    pub writes: SmallVec<[usize; 2]>,
}

pub fn register_usage(decoded: &DecodedInstruction) -> RegisterUsage {
    use Opcode::*;

    let inst: Instruction = decoded.inst;
    let mut usage = RegisterUsage::default();
    let (rd, ra, rb) = (inst.rd(), inst.ra(), inst.rb());
    match decoded.opcode {
        Addi | Addis => {
            if ra != 0 {
                usage.reads.push(ra);
            }
            usage.writes.push(rd);
        }
        Addic | AddicRc | Subfic | Mulli | Addme | Addze | Subfme | Subfze | Neg => {
            usage.reads.push(ra);
            usage.writes.push(rd);
        }
        Add | Addc | Adde | Subf | Subfc | Subfe | Mullw | Mulhw | Mulhwu | Divw | Divwu => {
            usage.reads.extend([ra, rb]);
            usage.writes.push(rd);
        }
        AndiRc | AndisRc | Ori | Oris | Xori | Xoris | Extsb | Extsh | Cntlzw | Rlwinm
        | Srawi => {
            usage.reads.push(inst.rs());
            usage.writes.push(ra);
        }
        And | Andc | Or | Orc | Xor | Nand | Nor | Eqv | Slw | Srw | Sraw | Rlwnm => {
            usage.reads.extend([inst.rs(), rb]);
            usage.writes.push(ra);
        }
        Rlwimi => {
            usage.reads.extend([inst.rs(), ra]);
            usage.writes.push(ra);
        }
        Cmp | Cmpl | Tw => usage.reads.extend([ra, rb]),
        Cmpi | Cmpli | Twi => usage.reads.push(ra),
        Mfcr | Mfspr | Mftb | Mfmsr => usage.writes.push(rd),
        Mtcrf | Mtspr | Mtmsr => usage.reads.push(inst.rs()),
        Lwz | Lbz | Lhz | Lha => {
            if ra != 0 {
                usage.reads.push(ra);
            }
            usage.writes.push(rd);
        }
        Lwzu | Lbzu | Lhzu | Lhau => {
            usage.reads.push(ra);
            usage.writes.extend([rd, ra]);
        }
        Lwzx | Lbzx | Lhzx | Lhax => {
            if ra != 0 {
                usage.reads.push(ra);
            }
            usage.reads.push(rb);
            usage.writes.push(rd);
        }
        Lwzux | Lbzux | Lhzux | Lhaux => {
            usage.reads.extend([ra, rb]);
            usage.writes.extend([rd, ra]);
        }
        Stw | Stb | Sth => {
            usage.reads.push(inst.rs());
            if ra != 0 {
                usage.reads.push(ra);
            }
        }
        Stwu | Stbu | Sthu => {
            usage.reads.extend([inst.rs(), ra]);
            usage.writes.push(ra);
        }
        Stwx | Stbx | Sthx => {
            usage.reads.push(inst.rs());
            if ra != 0 {
                usage.reads.push(ra);
            }
            usage.reads.push(rb);
        }
        Stwux | Stbux | Sthux => {
            usage.reads.extend([inst.rs(), ra, rb]);
            usage.writes.push(ra);
        }
        Lmw => {
            if ra != 0 {
                usage.reads.push(ra);
            }
            usage.writes.extend(rd..32);
        }
        Stmw => {
            if ra != 0 {
                usage.reads.push(ra);
            }
            usage.reads.extend(inst.rs()..32);
        }
        Dcbz | Icbi | Dcbf | Dcbst | Dcbt | Dcbtst | Dcbi => {
            if ra != 0 {
                usage.reads.push(ra);
            }
            usage.reads.push(rb);
        }
        _ => {}
    }
    usage
}

/// Form the block starting at `address`. Returns `None` when the first
/// instruction cannot be fetched.
pub fn analyze(
    memory: &dyn GuestMemory,
    address: u32,
    max_instructions: usize,
    breakpoints: &BTreeSet<u32>,
) -> Option<BlockPlan> {
    let mut instructions = Vec::new();
    let mut gprs_read = bitvec![u32, Lsb0; 0; 32];
    let mut gprs_written = bitvec![u32, Lsb0; 0; 32];
    let mut pc = address;

    let end = loop {
        if instructions.len() >= max_instructions {
            break BlockEnd::SizeLimit;
        }
        if pc != address && breakpoints.contains(&pc) {
            break BlockEnd::Breakpoint;
        }
        let word = match memory.read_u32(pc) {
            Ok(word) => word,
            Err(_) if instructions.is_empty() => return None,
            Err(_) => break BlockEnd::FetchFault,
        };
        let decoded = Instruction::decode(word, pc);
        let usage = register_usage(&decoded);
        for gpr in usage.reads {
            if !gprs_written[gpr] {
                gprs_read.set(gpr, true);
            }
        }
        for gpr in usage.writes {
            gprs_written.set(gpr, true);
        }
        instructions.push(decoded);
        pc = pc.wrapping_add(4);
        if decoded.opcode.ends_block() {
            break BlockEnd::Terminator;
        }
    };

    log::trace!(
        "block 0x{:08X}: {} instructions ({:?})",
        address,
        instructions.len(),
        end
    );
    Some(BlockPlan {
        address,
        instructions,
        gprs_read,
        gprs_written,
        end,
    })
}
