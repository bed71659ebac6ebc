//! Reassembly Check Sequence.
//!
//! The RCS is CRC-32/ISO-HDLC (the IEEE 802.3 polynomial, reflected, init
//! and xorout `0xFFFF_FFFF`) over the packet bit string zero-padded on the
//! right to a multiple of the L2 word. Both peers compute it independently;
//! equality gates reassembly success. Padding is idempotent, so computing
//! over an already-padded buffer gives the same value.

/// RCS over the first `bit_len` bits of `bytes`, padded to `l2_word` bits.
///
/// Bits of the last byte past `bit_len` are treated as zero regardless of
/// their stored value.
#[must_use]
pub fn compute(bytes: &[u8], bit_len: usize, l2_word: usize) -> u32 {
    debug_assert!(l2_word % 8 == 0 && l2_word > 0);
    debug_assert!(bit_len <= bytes.len() * 8);

    let padded_bits = bit_len.div_ceil(l2_word) * l2_word;
    let mut buf = vec![0u8; padded_bits / 8];
    let used = bit_len.div_ceil(8);
    buf[..used].copy_from_slice(&bytes[..used]);
    if bit_len % 8 != 0 {
        buf[used - 1] &= 0xFFu8 << (8 - bit_len % 8);
    }
    crc32fast::hash(&buf)
}
