//! Packed condition-register encoding, carry and rotate masks.

use gcemu_core::cpu::flags::{self, CrBit, CR_SIGN, CR_SO};
use proptest::prelude::*;

const BITS: [CrBit; 4] = [CrBit::Lt, CrBit::Gt, CrBit::Eq, CrBit::So];

fn reference_mask(mb: u32, me: u32) -> u32 {
    let mut mask = 0u32;
    let mut bit = mb;
    loop {
        mask |= 0x8000_0000 >> bit;
        if bit == me {
            break;
        }
        bit = (bit + 1) % 32;
    }
    mask
}

#[test]
fn test_rotate_mask_all_pairs() {
    for mb in 0..32 {
        for me in 0..32 {
            assert_eq!(
                flags::rotate_mask(mb, me),
                reference_mask(mb, me),
                "mask({}, {})",
                mb,
                me
            );
        }
    }
}

#[test]
fn test_update_field_decodes_sign() {
    let cases: [(u32, bool, u8); 6] = [
        (0, false, 0b0010),
        (0, true, 0b0011),
        (1, false, 0b0100),
        (0x7FFF_FFFF, true, 0b0101),
        (0x8000_0000, false, 0b1000),
        (0xFFFF_FFFF, true, 0b1001),
    ];
    for (value, so, expected) in cases {
        let field = flags::update_field(value, so);
        assert_eq!(
            flags::internal_to_ppc(field),
            expected,
            "update_field(0x{:08X}, {})",
            value,
            so
        );
    }
}

#[test]
fn test_all_ppc_values_round_trip() {
    for value in 0u8..16 {
        assert_eq!(flags::internal_to_ppc(flags::ppc_to_internal(value)), value);
    }
}

#[test]
fn test_set_bits_from_cleared_field() {
    let cleared = flags::ppc_to_internal(0);
    for bit in BITS {
        let field = flags::set_bit(cleared, bit, true);
        for other in BITS {
            assert_eq!(
                flags::get_bit(field, other),
                other == bit,
                "setting {:?} on a cleared field changed {:?}",
                bit,
                other
            );
        }
    }
}

#[test]
fn test_compares_ignore_summary_overflow() {
    // a difference with bit 61 set would otherwise read as SO
    let field = flags::compare_unsigned(0, 1);
    assert_eq!(field & CR_SO, 0);
    assert!(flags::get_bit(field, CrBit::Lt));
    assert_eq!(flags::internal_to_ppc(flags::compare_signed(5, 5)), 0b0010);
    assert_eq!(flags::internal_to_ppc(flags::compare_signed(-1i32 as u32, 1)), 0b1000);
    assert_eq!(flags::internal_to_ppc(flags::compare_unsigned(-1i32 as u32, 1)), 0b0100);
}

#[test]
fn test_raw_zero_field_stays_not_greater() {
    // all-zero word reads EQ only; writing SO/LT must not make it GT
    for bit in [CrBit::So, CrBit::Lt] {
        let field = flags::set_bit(0, bit, true);
        assert!(!flags::get_bit(field, CrBit::Gt), "{:?}", bit);
        assert!(flags::get_bit(field, CrBit::Eq), "{:?}", bit);
    }
}

#[test]
fn test_zero_result_with_so_is_not_greater() {
    let field = flags::update_field(0, true);
    assert_ne!(field & CR_SIGN, 0);
    assert!(!flags::get_bit(field, CrBit::Gt));
    assert!(flags::get_bit(field, CrBit::Eq));
    assert!(flags::get_bit(field, CrBit::So));
}

fn cr_bit() -> impl Strategy<Value = CrBit> {
    prop::sample::select(BITS.to_vec())
}

proptest! {
    #[test]
    fn prop_set_bit_touches_only_that_bit(prior in any::<u64>(), bit in cr_bit(), value in any::<bool>()) {
        let field = flags::set_bit(prior, bit, value);
        prop_assert_eq!(flags::get_bit(field, bit), value);
        for other in BITS {
            if other != bit {
                prop_assert_eq!(flags::get_bit(field, other), flags::get_bit(prior, other));
            }
        }
    }

    #[test]
    fn prop_field_round_trip(value in 0u8..16, bit in cr_bit(), set in any::<bool>()) {
        let field = flags::set_bit(flags::ppc_to_internal(value), bit, set);
        let expected = if set { value | bit.ppc_mask() } else { value & !bit.ppc_mask() };
        prop_assert_eq!(flags::internal_to_ppc(field), expected);
    }

    #[test]
    fn prop_carry_matches_wide_add(a in any::<u32>(), b in any::<u32>()) {
        prop_assert_eq!(flags::carry(a, b), u64::from(a) + u64::from(b) > u64::from(u32::MAX));
    }

    #[test]
    fn prop_update_field_matches_signed_compare(value in any::<u32>(), so in any::<bool>()) {
        let field = flags::update_field(value, so);
        let signed = value as i32;
        prop_assert_eq!(flags::get_bit(field, CrBit::Lt), signed < 0);
        prop_assert_eq!(flags::get_bit(field, CrBit::Gt), signed > 0);
        prop_assert_eq!(flags::get_bit(field, CrBit::Eq), signed == 0);
        prop_assert_eq!(flags::get_bit(field, CrBit::So), so);
    }
}
