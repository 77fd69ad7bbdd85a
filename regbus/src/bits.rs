//! Bit-span packing for byte-addressed storage.
//!
//! Maps a value of `size` bits located `bit_offset` bits past a byte address
//! onto the minimal span of whole bytes covering it. Bit numbering is
//! MSB-first within each byte and the first byte of a multi-byte span is the
//! most significant (big-endian). These are pure in-memory operations; the
//! driver layer wires them to a transport.

/// Byte-level footprint of a bit field relative to its register address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    /// Whole bytes to skip past the register address
    pub byte_offset: u32,
    /// Remaining bit offset within the first covered byte (0..=7)
    pub bit_remainder: u32,
    /// Number of covered bytes (1..=9)
    pub byte_len: u32,
}

/// Computes the byte span covering a `size`-bit field at `bit_offset`.
///
/// The span length is `ceil((bit_offset % 8 + size) / 8)` and can reach 9
/// bytes only when a sub-byte offset pushes a 64-bit field across a ninth
/// byte.
#[must_use]
pub fn span(size: u32, bit_offset: u32) -> Span {
    debug_assert!(size >= 1 && size <= 64);
    let byte_offset = bit_offset / 8;
    let bit_remainder = bit_offset % 8;
    Span {
        byte_offset,
        bit_remainder,
        byte_len: (bit_remainder + size + 7) / 8,
    }
}

/// Whether a field covers whole bytes exactly (no read-modify-write needed)
#[must_use]
pub const fn is_byte_aligned(size: u32, bit_offset: u32) -> bool {
    bit_offset % 8 == 0 && size % 8 == 0
}

/// Extracts a `size`-bit value from the byte span covering it.
///
/// `bytes` must be exactly the span computed by [`span`] and `bit_remainder`
/// the in-byte offset from the same computation. The span is treated as a
/// big-endian unsigned integer; the leading `bit_remainder` bits are shifted
/// out and the result is right-aligned to exactly `size` bits.
///
/// Spans of 1, 2, 4 and 8 bytes take direct fixed-width paths; 3, 5, 6 and 7
/// byte spans are zero-padded to the next direct width; the 9-byte span is
/// split into a leading partial byte and a trailing 8-byte word.
///
/// # Panics
///
/// Panics if `bytes` does not match the span length implied by `size` and
/// `bit_remainder`. Callers validate span lengths against the transport
/// before extraction.
#[must_use]
pub fn extract(bytes: &[u8], size: u32, bit_remainder: u32) -> u64 {
    let byte_len = ((bit_remainder + size + 7) / 8) as usize;
    assert_eq!(bytes.len(), byte_len, "byte span does not cover the field");

    match byte_len {
        1 => {
            let v = bytes[0];
            u64::from((v << bit_remainder) >> (8 - size))
        }
        2 => {
            let v = u16::from_be_bytes([bytes[0], bytes[1]]);
            u64::from((v << bit_remainder) >> (16 - size))
        }
        3 => {
            // Zero-pad one byte at the most significant end and use the
            // 4-byte path.
            let v = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
            u64::from((v << (8 + bit_remainder)) >> (32 - size))
        }
        4 => {
            let v = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            u64::from((v << bit_remainder) >> (32 - size))
        }
        5..=7 => {
            let padding = 8 - byte_len;
            let mut padded = [0u8; 8];
            padded[padding..].copy_from_slice(bytes);
            let v = u64::from_be_bytes(padded);
            (v << (8 * padding as u32 + bit_remainder)) >> (64 - size)
        }
        8 => {
            let mut word = [0u8; 8];
            word.copy_from_slice(bytes);
            let v = u64::from_be_bytes(word);
            (v << bit_remainder) >> (64 - size)
        }
        9 => {
            // Leading partial byte plus trailing 8-byte word, combined by
            // explicit composition. Only reachable with bit_remainder >= 1.
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[1..9]);
            let lhs = bytes[0] << bit_remainder;
            let rhs = u64::from_be_bytes(word);
            let intermediate = (u64::from(lhs) << 56) | (rhs >> (8 - bit_remainder));
            intermediate >> (64 - size)
        }
        _ => unreachable!("span length out of range"),
    }
}

/// Splices a `size`-bit value into the byte span covering it.
///
/// Only the bits within the field are modified; all other bits of the span
/// keep their current contents, which is what makes the read-modify-write
/// sequence of the driver layer safe for registers sharing bytes.
///
/// # Panics
///
/// Panics if `bytes` does not match the span length implied by `size` and
/// `bit_remainder`.
pub fn insert(bytes: &mut [u8], size: u32, bit_remainder: u32, value: u64) {
    let byte_len = ((bit_remainder + size + 7) / 8) as usize;
    assert_eq!(bytes.len(), byte_len, "byte span does not cover the field");

    // Bit k of the value, counting from the least significant end
    let value_bit = |k: u32| -> bool { k < 64 && (value >> k) & 1 == 1 };
    // Replace the bit at MSB-first position `pos` within one byte
    let splice = |byte: u8, pos: u32, bit: bool| -> u8 {
        let mask = 0x80u8 >> pos;
        if bit {
            byte | mask
        } else {
            byte & !mask
        }
    };

    for i in 0..byte_len {
        let mut current = bytes[i];

        if byte_len == 1 {
            for j in bit_remainder..bit_remainder + size {
                current = splice(current, j, value_bit(size - 1 - (j - bit_remainder)));
            }
        } else if i == 0 {
            for j in bit_remainder..8 {
                current = splice(current, j, value_bit(size - 1 - (j - bit_remainder)));
            }
        } else if i == byte_len - 1 {
            // Bits of the field that fall into the trailing byte; in [1, 8]
            let tail_bits = 8 - (8 * byte_len as u32 - bit_remainder - size);
            for j in 0..tail_bits {
                current = splice(current, j, value_bit(tail_bits - 1 - j));
            }
        } else {
            for j in 0..8 {
                current = splice(current, j, value_bit(size - 1 - (8 * i as u32 - bit_remainder) - j));
            }
        }

        bytes[i] = current;
    }
}

/// Minimal whole-byte big-endian encoding of `value` for a byte-aligned
/// field of `size` bits (`size % 8 == 0`). This is the write fast path: no
/// prior read is required because the field owns its bytes completely.
#[must_use]
pub fn to_whole_bytes(size: u32, value: u64) -> Vec<u8> {
    debug_assert!(size % 8 == 0 && size >= 8 && size <= 64);
    let n = (size / 8) as usize;
    value.to_be_bytes()[8 - n..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_bit(bytes: &[u8], idx: usize) -> bool {
        (bytes[idx / 8] >> (7 - idx % 8)) & 1 == 1
    }

    #[test]
    fn span_math() {
        assert_eq!(
            span(10, 3),
            Span {
                byte_offset: 0,
                bit_remainder: 3,
                byte_len: 2
            }
        );
        assert_eq!(
            span(64, 0),
            Span {
                byte_offset: 0,
                bit_remainder: 0,
                byte_len: 8
            }
        );
        // Sub-byte offset pushes a 64-bit field across a ninth byte
        assert_eq!(
            span(64, 17),
            Span {
                byte_offset: 2,
                bit_remainder: 1,
                byte_len: 9
            }
        );
        assert_eq!(
            span(1, 15),
            Span {
                byte_offset: 1,
                bit_remainder: 7,
                byte_len: 1
            }
        );
    }

    #[test]
    fn extract_known_patterns() {
        // 0x12 0x34 = 0b0001_0010_0011_0100; 10 bits at remainder 3
        assert_eq!(extract(&[0x12, 0x34], 10, 3), 0b10_0100_0110);
        // Full bytes
        assert_eq!(extract(&[0xAB], 8, 0), 0xAB);
        assert_eq!(extract(&[0xDE, 0xAD, 0xBE, 0xEF], 32, 0), 0xDEAD_BEEF);
        assert_eq!(
            extract(&[0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF], 64, 0),
            0x0123_4567_89AB_CDEF
        );
        // Single bit at the very end of a byte
        assert_eq!(extract(&[0x01], 1, 7), 1);
        assert_eq!(extract(&[0xFE], 1, 7), 0);
    }

    #[test]
    fn extract_nine_byte_span() {
        // 64 bits at remainder 1: all ones input must give all ones out
        let bytes = [0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x80];
        assert_eq!(extract(&bytes, 64, 1), u64::MAX);
        let bytes = [0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(extract(&bytes, 64, 1), 0);
    }

    #[test]
    fn insert_preserves_other_bits() {
        let mut bytes = [0xFF, 0xFF];
        insert(&mut bytes, 10, 3, 0);
        // Bits 0..3 and 13..16 of the stream must remain set
        assert_eq!(bytes, [0b1110_0000, 0b0000_0111]);

        let mut bytes = [0x00, 0x00];
        insert(&mut bytes, 10, 3, 0x3FF);
        assert_eq!(bytes, [0b0001_1111, 0b1111_1000]);
    }

    #[test]
    fn round_trip_all_sizes_and_offsets() {
        for size in 1..=64u32 {
            for bit_remainder in 0..=7u32 {
                let byte_len = ((bit_remainder + size + 7) / 8) as usize;
                let backdrop = [0xA5u8; 9];
                let mut bytes = backdrop[..byte_len].to_vec();

                // A value pattern exercising both set and clear bits
                let value = if size == 64 {
                    0x5AA5_F00F_1234_8765
                } else {
                    0x5AA5_F00F_1234_8765u64 & ((1u64 << size) - 1)
                };

                insert(&mut bytes, size, bit_remainder, value);
                assert_eq!(
                    extract(&bytes, size, bit_remainder),
                    value,
                    "size {size} remainder {bit_remainder}"
                );

                // Non-interference: every bit outside the field unchanged
                for idx in 0..byte_len * 8 {
                    let inside = idx >= bit_remainder as usize
                        && idx < (bit_remainder + size) as usize;
                    if !inside {
                        assert_eq!(
                            stream_bit(&bytes, idx),
                            stream_bit(&backdrop, idx),
                            "bit {idx} disturbed at size {size} remainder {bit_remainder}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn whole_byte_encoding() {
        assert_eq!(to_whole_bytes(8, 0xAB), vec![0xAB]);
        assert_eq!(to_whole_bytes(16, 0x1234), vec![0x12, 0x34]);
        assert_eq!(to_whole_bytes(24, 0x0001_0203), vec![0x01, 0x02, 0x03]);
        assert_eq!(
            to_whole_bytes(64, 0x0102_0304_0506_0708),
            vec![1, 2, 3, 4, 5, 6, 7, 8]
        );
    }
}
