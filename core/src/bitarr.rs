//! Bit-packed field access over byte buffers.
//!
//! Fields are addressed by absolute bit offset and may straddle byte
//! boundaries. Every access loads one little-endian `u64` starting at the
//! field's first byte, so buffers carry [`PADDING`] spare bytes at the end and
//! a single field is limited to 57 bits.
use byteorder::{ByteOrder, LittleEndian};

/// Spare bytes appended to every packed buffer.
pub const PADDING: usize = 8;

/// Widest field a single access can handle.
pub const MAX_FIELD_BITS: u8 = 57;

/// Number of bits needed to store every value in `0..=max_value` (at least 1).
pub fn required_bits(max_value: u64) -> u8 {
    if max_value == 0 {
        1
    } else {
        (64 - max_value.leading_zeros()) as u8
    }
}

#[inline]
pub fn mask(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Buffer size for `entries` records of `entry_bits` each, padding included.
pub fn packed_len(entries: usize, entry_bits: usize) -> usize {
    (entries * entry_bits + 7) / 8 + PADDING
}

#[inline]
pub fn read_bits(data: &[u8], bit_off: u64, bits: u8) -> u64 {
    debug_assert!(bits <= MAX_FIELD_BITS);
    let byte = (bit_off >> 3) as usize;
    let word = LittleEndian::read_u64(&data[byte..byte + 8]);
    (word >> (bit_off & 7)) & mask(bits)
}

#[inline]
pub fn write_bits(data: &mut [u8], bit_off: u64, bits: u8, value: u64) {
    debug_assert!(bits <= MAX_FIELD_BITS);
    let byte = (bit_off >> 3) as usize;
    let shift = bit_off & 7;
    let m = mask(bits) << shift;
    let slot = &mut data[byte..byte + 8];
    let word = LittleEndian::read_u64(slot);
    let word = (word & !m) | ((value << shift) & m);
    LittleEndian::write_u64(slot, word);
}
