//! Condition-field codec.
//!
//! Each of the eight CR fields is kept as a 64-bit word instead of four
//! bits, so that the result of most integer instructions can be stored into
//! a field directly after sign-extension:
//!
//! - EQ iff the low 32 bits are zero
//! - GT iff the word, read as `i64`, is greater than zero
//! - LT iff bit 62 is set
//! - SO iff bit 61 is set
//!
//! Bit writes keep bit 32 set so that clearing bit 63 always yields a
//! positive word, and force bit 63 on an all-zero word before touching any
//! bit other than GT. Both engines go through these rules, the JIT by
//! emitting the same operations as host instructions.

use serde::{Deserialize, Serialize};

pub const CR_SO_BIT: u32 = 61;
pub const CR_LT_BIT: u32 = 62;
pub const CR_GT_BIT: u32 = 63;

pub const CR_SO: u64 = 1 << CR_SO_BIT;
pub const CR_LT: u64 = 1 << CR_LT_BIT;
pub const CR_SIGN: u64 = 1 << CR_GT_BIT;
/// Set by every bit write to keep the word non-zero.
pub const CR_NONZERO: u64 = 1 << 32;

/// A single condition bit inside a CR field.
///
/// Discriminants follow the PowerPC bit order inside a field, so
/// `3 - (crb & 3)` maps a CR bit number to its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CrBit {
    So = 0,
    Eq = 1,
    Gt = 2,
    Lt = 3,
}

impl CrBit {
    /// Kind of the bit addressed by a 5-bit CR bit number.
    #[inline]
    pub fn from_crb(crb: u32) -> Self {
        Self::from_index(3 - (crb & 3))
    }

    #[inline]
    pub fn from_index(index: u32) -> Self {
        match index & 3 {
            0 => CrBit::So,
            1 => CrBit::Eq,
            2 => CrBit::Gt,
            _ => CrBit::Lt,
        }
    }

    /// Mask of this bit in the architectural 4-bit field value.
    #[inline]
    pub fn ppc_mask(self) -> u8 {
        1 << (self as u8)
    }
}

/// Build the packed field for a 32-bit result, mirroring XER SO into bit 61.
#[inline]
pub fn update_field(value: u32, xer_so: bool) -> u64 {
    let mut field = (value as i32 as i64 as u64) & !CR_SO;
    if xer_so {
        field |= CR_SO;
        if value == 0 {
            field |= CR_SIGN;
        }
    }
    field
}

/// Packed field produced by a signed compare. SO is never propagated.
#[inline]
pub fn compare_signed(a: u32, b: u32) -> u64 {
    ((a as i32 as i64).wrapping_sub(b as i32 as i64) as u64) & !CR_SO
}

/// Packed field produced by an unsigned compare. SO is never propagated.
#[inline]
pub fn compare_unsigned(a: u32, b: u32) -> u64 {
    (a as u64).wrapping_sub(b as u64) & !CR_SO
}

/// Carry out of `a + b`.
#[inline]
pub fn carry(a: u32, b: u32) -> bool {
    b > !a
}

/// Rotate mask with ones from bit `mb` through bit `me` (big-endian bit
/// numbering), wrapping when `me < mb`.
#[inline]
pub fn rotate_mask(mb: u32, me: u32) -> u32 {
    let begin = u32::MAX >> mb;
    let end = if me < 31 { u32::MAX >> (me + 1) } else { 0 };
    let mask = begin ^ end;
    if me < mb {
        !mask
    } else {
        mask
    }
}

#[inline]
pub fn get_bit(field: u64, bit: CrBit) -> bool {
    match bit {
        CrBit::So => field & CR_SO != 0,
        CrBit::Eq => field as u32 == 0,
        CrBit::Gt => (field as i64) > 0,
        CrBit::Lt => field & CR_LT != 0,
    }
}

pub fn set_bit(field: u64, bit: CrBit, value: bool) -> u64 {
    let mut field = field;
    if bit != CrBit::Gt && field == 0 {
        field |= CR_SIGN;
    }
    field = match bit {
        CrBit::So => (field & !CR_SO) | ((value as u64) << CR_SO_BIT),
        CrBit::Eq => (field & 0xFFFF_FFFF_0000_0000) | (!value as u64),
        CrBit::Gt => (field & !CR_SIGN) | ((!value as u64) << CR_GT_BIT),
        CrBit::Lt => (field & !CR_LT) | ((value as u64) << CR_LT_BIT),
    };
    field | CR_NONZERO
}

#[inline]
pub fn clear_bit(field: u64, bit: CrBit) -> u64 {
    set_bit(field, bit, false)
}

/// Convert an architectural 4-bit field (LT GT EQ SO) to the packed form.
pub fn ppc_to_internal(value: u8) -> u64 {
    let mut field = CR_NONZERO;
    field |= ((value & CrBit::So.ppc_mask() != 0) as u64) << CR_SO_BIT;
    field |= (value & CrBit::Eq.ppc_mask() == 0) as u64;
    field |= ((value & CrBit::Gt.ppc_mask() == 0) as u64) << CR_GT_BIT;
    field |= ((value & CrBit::Lt.ppc_mask() != 0) as u64) << CR_LT_BIT;
    field
}

/// Convert a packed field back to its architectural 4-bit value.
pub fn internal_to_ppc(field: u64) -> u8 {
    let mut value = 0u8;
    for bit in [CrBit::So, CrBit::Eq, CrBit::Gt, CrBit::Lt] {
        if get_bit(field, bit) {
            value |= bit.ppc_mask();
        }
    }
    value
}
