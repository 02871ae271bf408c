//! Test Utilities
//!
//! Instruction encoders, session builders and state assertions shared by
//! the integration tests.

#![allow(dead_code)]

use gcemu_core::cpu::state::CpuState;
use gcemu_core::{CoreConfig, CoreMode, OverflowPolicy, Session};

/// Where test programs are loaded.
pub const BASE: u32 = 0x8000_3100;
/// Scratch data area, well clear of any test program.
pub const DATA: u32 = 0x8001_0000;
pub const RAM_SIZE: u32 = 0x20000;

// ---- instruction encoders ----

pub fn d_form(opcd: u32, rd: u32, ra: u32, imm: u16) -> u32 {
    (opcd << 26) | (rd << 21) | (ra << 16) | u32::from(imm)
}

pub fn addi(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(14, rd, ra, simm as u16)
}

/// `li rd, simm`
pub fn li(rd: u32, simm: i16) -> u32 {
    addi(rd, 0, simm)
}

pub fn addis(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(15, rd, ra, simm as u16)
}

pub fn addic(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(12, rd, ra, simm as u16)
}

pub fn addic_rc(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(13, rd, ra, simm as u16)
}

pub fn subfic(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(8, rd, ra, simm as u16)
}

pub fn mulli(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(7, rd, ra, simm as u16)
}

pub fn ori(ra: u32, rs: u32, uimm: u16) -> u32 {
    d_form(24, rs, ra, uimm)
}

pub fn oris(ra: u32, rs: u32, uimm: u16) -> u32 {
    d_form(25, rs, ra, uimm)
}

pub fn andi_rc(ra: u32, rs: u32, uimm: u16) -> u32 {
    d_form(28, rs, ra, uimm)
}

pub fn cmpi(crf: u32, ra: u32, simm: i16) -> u32 {
    d_form(11, crf << 2, ra, simm as u16)
}

pub fn cmpli(crf: u32, ra: u32, uimm: u16) -> u32 {
    d_form(10, crf << 2, ra, uimm)
}

pub fn twi(to: u32, ra: u32, simm: i16) -> u32 {
    d_form(3, to, ra, simm as u16)
}

/// XO-form arithmetic (`add`, `subfc`, `divw`, ...) by 9-bit extended opcode.
pub fn xo_form(xo: u32, rd: u32, ra: u32, rb: u32, oe: bool, rc: bool) -> u32 {
    (31 << 26)
        | (rd << 21)
        | (ra << 16)
        | (rb << 11)
        | (u32::from(oe) << 10)
        | (xo << 1)
        | u32::from(rc)
}

/// X-form with the source in the `rS` slot (logical, shifts, stores).
pub fn x_form(xo: u32, rs: u32, ra: u32, rb: u32, rc: bool) -> u32 {
    (31 << 26) | (rs << 21) | (ra << 16) | (rb << 11) | (xo << 1) | u32::from(rc)
}

pub mod xo {
    pub const SUBFC: u32 = 8;
    pub const ADDC: u32 = 10;
    pub const MULHWU: u32 = 11;
    pub const SUBF: u32 = 40;
    pub const MULHW: u32 = 75;
    pub const NEG: u32 = 104;
    pub const SUBFE: u32 = 136;
    pub const ADDE: u32 = 138;
    pub const SUBFZE: u32 = 200;
    pub const ADDZE: u32 = 202;
    pub const SUBFME: u32 = 232;
    pub const ADDME: u32 = 234;
    pub const MULLW: u32 = 235;
    pub const ADD: u32 = 266;
    pub const DIVWU: u32 = 459;
    pub const DIVW: u32 = 491;

    pub const ALL: [u32; 16] = [
        SUBFC, ADDC, MULHWU, SUBF, MULHW, NEG, SUBFE, ADDE, SUBFZE, ADDZE, SUBFME, ADDME, MULLW,
        ADD, DIVWU, DIVW,
    ];
}

pub mod x {
    pub const SLW: u32 = 24;
    pub const CNTLZW: u32 = 26;
    pub const AND: u32 = 28;
    pub const ANDC: u32 = 60;
    pub const NOR: u32 = 124;
    pub const EQV: u32 = 284;
    pub const XOR: u32 = 316;
    pub const ORC: u32 = 412;
    pub const OR: u32 = 444;
    pub const NAND: u32 = 476;
    pub const SRW: u32 = 536;
    pub const SRAW: u32 = 792;
    pub const SRAWI: u32 = 824;
    pub const EXTSH: u32 = 922;
    pub const EXTSB: u32 = 954;

    /// Two-source logical and shift forms.
    pub const BINARY: [u32; 11] = [SLW, AND, ANDC, NOR, EQV, XOR, ORC, OR, NAND, SRW, SRAW];
    /// Single-source forms (`rB` unused).
    pub const UNARY: [u32; 3] = [CNTLZW, EXTSH, EXTSB];
}

pub fn add(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(xo::ADD, rd, ra, rb, false, false)
}

pub fn divw(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(xo::DIVW, rd, ra, rb, false, false)
}

pub fn divwu(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(xo::DIVWU, rd, ra, rb, false, false)
}

/// `mr ra, rs`
pub fn mr(ra: u32, rs: u32) -> u32 {
    x_form(x::OR, rs, ra, rs, false)
}

pub fn srawi(ra: u32, rs: u32, sh: u32, rc: bool) -> u32 {
    x_form(x::SRAWI, rs, ra, sh, rc)
}

pub fn rotate(opcd: u32, ra: u32, rs: u32, sh: u32, mb: u32, me: u32, rc: bool) -> u32 {
    (opcd << 26) | (rs << 21) | (ra << 16) | (sh << 11) | (mb << 6) | (me << 1) | u32::from(rc)
}

pub fn rlwinm(ra: u32, rs: u32, sh: u32, mb: u32, me: u32) -> u32 {
    rotate(21, ra, rs, sh, mb, me, false)
}

pub fn rlwimi(ra: u32, rs: u32, sh: u32, mb: u32, me: u32) -> u32 {
    rotate(20, ra, rs, sh, mb, me, false)
}

pub fn cmp(crf: u32, ra: u32, rb: u32) -> u32 {
    x_form(0, crf << 2, ra, rb, false)
}

pub fn cmpl(crf: u32, ra: u32, rb: u32) -> u32 {
    x_form(32, crf << 2, ra, rb, false)
}

pub fn tw(to: u32, ra: u32, rb: u32) -> u32 {
    x_form(4, to, ra, rb, false)
}

fn spr_field(spr: u32) -> u32 {
    ((spr & 0x1F) << 16) | ((spr >> 5) << 11)
}

pub fn mfspr(rd: u32, spr: u32) -> u32 {
    (31 << 26) | (rd << 21) | spr_field(spr) | (339 << 1)
}

pub fn mtspr(spr: u32, rs: u32) -> u32 {
    (31 << 26) | (rs << 21) | spr_field(spr) | (467 << 1)
}

pub fn mftb(rd: u32, tbr: u32) -> u32 {
    (31 << 26) | (rd << 21) | spr_field(tbr) | (371 << 1)
}

pub fn mfmsr(rd: u32) -> u32 {
    x_form(83, rd, 0, 0, false)
}

pub fn mtmsr(rs: u32) -> u32 {
    x_form(146, rs, 0, 0, false)
}

pub fn mfcr(rd: u32) -> u32 {
    x_form(19, rd, 0, 0, false)
}

pub fn mtcrf(crm: u32, rs: u32) -> u32 {
    (31 << 26) | (rs << 21) | (crm << 12) | (144 << 1)
}

pub fn mcrf(crfd: u32, crfs: u32) -> u32 {
    (19 << 26) | (crfd << 23) | (crfs << 18)
}

pub mod cr {
    pub const CRNOR: u32 = 33;
    pub const CRANDC: u32 = 129;
    pub const CRXOR: u32 = 193;
    pub const CRNAND: u32 = 225;
    pub const CRAND: u32 = 257;
    pub const CREQV: u32 = 289;
    pub const CRORC: u32 = 417;
    pub const CROR: u32 = 449;

    pub const ALL: [u32; 8] = [CRNOR, CRANDC, CRXOR, CRNAND, CRAND, CREQV, CRORC, CROR];
}

pub fn cr_logical(xo: u32, crbd: u32, crba: u32, crbb: u32) -> u32 {
    (19 << 26) | (crbd << 21) | (crba << 16) | (crbb << 11) | (xo << 1)
}

/// `b` relative to the branch itself.
pub fn b(offset: i32) -> u32 {
    (18 << 26) | (offset as u32 & 0x03FF_FFFC)
}

pub fn bl(offset: i32) -> u32 {
    b(offset) | 1
}

pub fn bc(bo: u32, bi: u32, offset: i16) -> u32 {
    (16 << 26) | (bo << 21) | (bi << 16) | (offset as u16 as u32 & 0xFFFC)
}

/// `bdnz offset`
pub fn bdnz(offset: i16) -> u32 {
    bc(16, 0, offset)
}

pub const BLR: u32 = 0x4E80_0020;
pub const SC: u32 = 0x4400_0002;
pub const RFI: u32 = 0x4C00_0064;
pub const ISYNC: u32 = 0x4C00_012C;
/// `b .`
pub const HANG: u32 = 0x4800_0000;

pub fn lwz(rd: u32, ra: u32, d: i16) -> u32 {
    d_form(32, rd, ra, d as u16)
}

pub fn lwzu(rd: u32, ra: u32, d: i16) -> u32 {
    d_form(33, rd, ra, d as u16)
}

pub fn lbz(rd: u32, ra: u32, d: i16) -> u32 {
    d_form(34, rd, ra, d as u16)
}

pub fn lha(rd: u32, ra: u32, d: i16) -> u32 {
    d_form(42, rd, ra, d as u16)
}

pub fn stw(rs: u32, ra: u32, d: i16) -> u32 {
    d_form(36, rs, ra, d as u16)
}

pub fn stwu(rs: u32, ra: u32, d: i16) -> u32 {
    d_form(37, rs, ra, d as u16)
}

pub fn stb(rs: u32, ra: u32, d: i16) -> u32 {
    d_form(38, rs, ra, d as u16)
}

pub fn sth(rs: u32, ra: u32, d: i16) -> u32 {
    d_form(44, rs, ra, d as u16)
}

pub fn stwx(rs: u32, ra: u32, rb: u32) -> u32 {
    x_form(151, rs, ra, rb, false)
}

pub fn stmw(rs: u32, ra: u32, d: i16) -> u32 {
    d_form(47, rs, ra, d as u16)
}

pub fn lmw(rd: u32, ra: u32, d: i16) -> u32 {
    d_form(46, rd, ra, d as u16)
}

pub fn icbi(ra: u32, rb: u32) -> u32 {
    x_form(982, 0, ra, rb, false)
}

pub fn dcbz(ra: u32, rb: u32) -> u32 {
    x_form(1014, 0, ra, rb, false)
}

/// Load a full 32-bit constant with `lis` + `ori`.
pub fn load_imm(rd: u32, value: u32) -> [u32; 2] {
    [
        addis(rd, 0, (value >> 16) as u16 as i16),
        ori(rd, rd, value as u16),
    ]
}

// ---- sessions ----

pub fn test_config(mode: CoreMode) -> CoreConfig {
    let mut config = CoreConfig {
        mode,
        ram_size: RAM_SIZE,
        ..CoreConfig::default()
    };
    // merged time-base reads are a documented approximation
    config.jit.merge_timebase_reads = false;
    config
}

/// Session with `program` loaded at [`BASE`] and PC pointing at it.
pub fn session_with_config(config: CoreConfig, program: &[u32]) -> Session {
    let mut session = Session::new(config).unwrap();
    session.load_program(BASE, program).unwrap();
    session.state_mut().set_pc(BASE);
    session
}

pub fn session_with_program(mode: CoreMode, program: &[u32]) -> Session {
    session_with_config(test_config(mode), program)
}

pub fn interpreter_session(program: &[u32]) -> Session {
    session_with_program(CoreMode::Interpreter, program)
}

pub fn jit_session(program: &[u32]) -> Session {
    session_with_program(CoreMode::Jit, program)
}

/// Run `program` (which should end in [`HANG`]) on both engines for the same
/// instruction budget, after applying `setup` to each CPU state.
pub fn run_both_with(
    config: CoreConfig,
    program: &[u32],
    budget: u64,
    setup: impl Fn(&mut CpuState),
) -> (Session, Session) {
    let mut interpreted = session_with_config(
        CoreConfig {
            mode: CoreMode::Interpreter,
            ..config.clone()
        },
        program,
    );
    let mut compiled = session_with_config(
        CoreConfig {
            mode: CoreMode::Jit,
            ..config
        },
        program,
    );
    setup(interpreted.state_mut());
    setup(compiled.state_mut());
    if let Err(err) = interpreted.run(budget) {
        panic!("interpreter failed on [{}]: {}", listing(program), err);
    }
    if let Err(err) = compiled.run(budget) {
        panic!("JIT failed on [{}]: {}", listing(program), err);
    }
    (interpreted, compiled)
}

/// Program words as hex, for failure messages.
pub fn listing(program: &[u32]) -> String {
    program
        .iter()
        .map(|word| format!("{:08X}", word))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn run_both(program: &[u32], setup: impl Fn(&mut CpuState)) -> (Session, Session) {
    let budget = program.len() as u64 + 4;
    run_both_with(test_config(CoreMode::Jit), program, budget, setup)
}

pub fn with_policy(policy: OverflowPolicy) -> CoreConfig {
    CoreConfig {
        overflow_policy: policy,
        ..test_config(CoreMode::Jit)
    }
}

// ---- assertions ----

/// Assert every piece of architected state matches.
pub fn assert_state_equal(expected: &CpuState, actual: &CpuState, message: &str) {
    for i in 0..32 {
        assert_eq!(
            expected.gpr[i], actual.gpr[i],
            "{}: r{} differs: expected 0x{:08X}, got 0x{:08X}",
            message, i, expected.gpr[i], actual.gpr[i]
        );
    }
    for field in 0..8 {
        assert_eq!(
            expected.cr.fields[field], actual.cr.fields[field],
            "{}: cr{} differs: expected 0x{:016X}, got 0x{:016X}",
            message, field, expected.cr.fields[field], actual.cr.fields[field]
        );
    }
    assert_eq!(
        expected.pc, actual.pc,
        "{}: PC differs: expected 0x{:08X}, got 0x{:08X}",
        message, expected.pc, actual.pc
    );
    assert_eq!(expected.npc, actual.npc, "{}: NPC differs", message);
    assert_eq!(expected.msr, actual.msr, "{}: MSR differs", message);
    assert_eq!(
        expected.xer(),
        actual.xer(),
        "{}: XER differs: expected 0x{:08X}, got 0x{:08X}",
        message,
        expected.xer(),
        actual.xer()
    );
    assert_eq!(expected.exceptions, actual.exceptions, "{}: pending exceptions differ", message);
    assert_eq!(expected.spr, actual.spr, "{}: SPR file differs", message);
}

/// Assert both sessions agree on CPU state and retired work.
pub fn assert_sessions_equal(interpreted: &Session, compiled: &Session, message: &str) {
    assert_state_equal(interpreted.state(), compiled.state(), message);
    assert_eq!(interpreted.ticks(), compiled.ticks(), "{}: ticks differ", message);
    assert_eq!(
        interpreted.instructions(),
        compiled.instructions(),
        "{}: retired instruction counts differ",
        message
    );
}
