//! Instruction decoder tests.

mod utils;

use gcemu_core::decoder::{Instruction, Opcode};
use utils::*;

#[test]
fn test_decode_integer_forms() {
    let cases = [
        (addi(3, 1, -8), Opcode::Addi),
        (addis(3, 0, 0x1234), Opcode::Addis),
        (addic_rc(4, 5, 1), Opcode::AddicRc),
        (mulli(6, 7, 3), Opcode::Mulli),
        (ori(3, 3, 0xFFFF), Opcode::Ori),
        (andi_rc(3, 4, 0xF0), Opcode::AndiRc),
        (add(3, 4, 5), Opcode::Add),
        (divw(3, 4, 5), Opcode::Divw),
        (divwu(3, 4, 5), Opcode::Divwu),
        (mr(3, 4), Opcode::Or),
        (srawi(3, 4, 5, true), Opcode::Srawi),
        (rlwinm(3, 4, 2, 0, 29), Opcode::Rlwinm),
        (rlwimi(3, 4, 2, 0, 29), Opcode::Rlwimi),
        (cmp(7, 3, 4), Opcode::Cmp),
        (cmpl(1, 3, 4), Opcode::Cmpl),
        (cmpi(0, 3, -1), Opcode::Cmpi),
        (cmpli(0, 3, 10), Opcode::Cmpli),
        (tw(4, 3, 3), Opcode::Tw),
        (twi(31, 0, 0), Opcode::Twi),
    ];
    for (word, expected) in cases {
        assert_eq!(
            Instruction(word).opcode(),
            expected,
            "0x{:08X} decoded as {:?}",
            word,
            Instruction(word).opcode()
        );
    }
}

#[test]
fn test_decode_system_and_branch_forms() {
    let cases = [
        (mfspr(3, 8), Opcode::Mfspr),
        (mtspr(9, 3), Opcode::Mtspr),
        (mftb(3, 268), Opcode::Mftb),
        (mfmsr(3), Opcode::Mfmsr),
        (mtmsr(3), Opcode::Mtmsr),
        (mfcr(3), Opcode::Mfcr),
        (mtcrf(0xFF, 3), Opcode::Mtcrf),
        (mcrf(1, 0), Opcode::Mcrf),
        (cr_logical(cr::CRXOR, 6, 6, 6), Opcode::Crxor),
        (cr_logical(cr::CROR, 2, 0, 1), Opcode::Cror),
        (b(8), Opcode::B),
        (bl(-4), Opcode::B),
        (bdnz(-8), Opcode::Bc),
        (BLR, Opcode::Bclr),
        (0x4E80_0420, Opcode::Bcctr),
        (SC, Opcode::Sc),
        (RFI, Opcode::Rfi),
        (ISYNC, Opcode::Isync),
        (lwz(3, 1, 8), Opcode::Lwz),
        (lwzu(3, 1, 8), Opcode::Lwzu),
        (stw(3, 1, 8), Opcode::Stw),
        (stwu(1, 1, -16), Opcode::Stwu),
        (lha(3, 4, 0), Opcode::Lha),
        (stmw(29, 1, 8), Opcode::Stmw),
        (lmw(29, 1, 8), Opcode::Lmw),
        (icbi(0, 3), Opcode::Icbi),
        (dcbz(0, 3), Opcode::Dcbz),
    ];
    for (word, expected) in cases {
        assert_eq!(Instruction(word).opcode(), expected, "0x{:08X}", word);
    }
}

#[test]
fn test_oe_variants_share_opcode() {
    for xo in xo::ALL {
        let plain = Instruction(xo_form(xo, 3, 4, 5, false, false)).opcode();
        let with_oe = Instruction(xo_form(xo, 3, 4, 5, true, true)).opcode();
        assert_ne!(plain, Opcode::Invalid, "xo {}", xo);
        if plain.info().flags & gcemu_core::decoder::op_flags::HAS_OE != 0 {
            assert_eq!(plain, with_oe, "xo {}", xo);
            assert!(Instruction(xo_form(xo, 3, 4, 5, true, false)).oe());
        }
    }
}

#[test]
fn test_unimplemented_words_are_invalid() {
    // zero word, fadd, lfd, stfs, psq_l
    for word in [0x0000_0000, 0xFC22_182A, 0xC823_0008, 0xD023_0000, 0xE023_0000] {
        assert_eq!(Instruction(word).opcode(), Opcode::Invalid, "0x{:08X}", word);
    }
}

#[test]
fn test_field_extraction() {
    let inst = Instruction(addi(3, 1, -8));
    assert_eq!(inst.rd(), 3);
    assert_eq!(inst.ra(), 1);
    assert_eq!(inst.simm16(), -8);

    let inst = Instruction(ori(5, 6, 0xBEEF));
    assert_eq!(inst.rs(), 6);
    assert_eq!(inst.ra(), 5);
    assert_eq!(inst.uimm(), 0xBEEF);

    let inst = Instruction(rlwinm(3, 4, 7, 9, 30));
    assert_eq!((inst.sh(), inst.mb(), inst.me()), (7, 9, 30));

    assert_eq!(Instruction(mfspr(3, 272)).spr(), 272);
    assert_eq!(Instruction(mtspr(919, 3)).spr(), 919);
    assert_eq!(Instruction(cmp(6, 1, 2)).crfd(), 6);
    assert_eq!(Instruction(mtcrf(0x81, 3)).crm(), 0x81);
    assert_eq!(Instruction(b(-16)).li(), -16);
    assert_eq!(Instruction(bdnz(-8)).bd(), -8);
    assert_eq!(Instruction(bdnz(-8)).bo(), 16);
    assert!(Instruction(bl(4)).lk());
    assert!(Instruction(srawi(3, 4, 5, true)).rc());
}

#[test]
fn test_decode_records_address() {
    let decoded = Instruction::decode(add(3, 4, 5), 0x8000_1234);
    assert_eq!(decoded.address, 0x8000_1234);
    assert_eq!(decoded.opcode, Opcode::Add);
    assert_eq!(decoded.info().cycles, 1);
    assert!(Opcode::Bclr.ends_block());
    assert!(!Opcode::Add.ends_block());
}
