//! One-byte norm encoding
//!
//! A norm is `boost / sqrt(num_terms)` squeezed into a byte: an 8-bit float
//! with 3 mantissa bits and a zero exponent of 15. That covers roughly
//! 5.8e-10 to 7.5e9 with one significant decimal digit, which is all a
//! length normalization factor needs.

/// Mantissa bits of the byte float
const MANTISSA_BITS: u32 = 3;
/// Exponent that maps to byte value zero
const ZERO_EXP: u32 = 15;
/// Smallest encoded float bits >> (24 - mantissa)
const FZERO: i32 = ((63 - ZERO_EXP) << MANTISSA_BITS) as i32;

/// Norm written for documents that have no value for a field
pub const DEFAULT_NORM: u8 = encode_norm(1.0);

/// Encode a float as a norm byte, rounding down
///
/// Values too small for the format map to 1 (or 0 for zero and negatives),
/// values too large map to 255.
pub const fn encode_norm(f: f32) -> u8 {
    let bits = f.to_bits() as i32;
    let small = bits >> (24 - MANTISSA_BITS);
    if small <= FZERO {
        if bits <= 0 { 0 } else { 1 }
    } else if small >= FZERO + 0x100 {
        u8::MAX
    } else {
        (small - FZERO) as u8
    }
}

/// Decode a norm byte
pub const fn decode_norm(b: u8) -> f32 {
    if b == 0 {
        return 0.0;
    }
    let mut bits = (b as u32) << (24 - MANTISSA_BITS);
    bits += (63 - ZERO_EXP) << 24;
    f32::from_bits(bits)
}

/// Length normalization for a field with `num_terms` terms
pub fn length_norm(boost: f32, num_terms: usize) -> f32 {
    if num_terms == 0 {
        return boost;
    }
    #[allow(clippy::cast_precision_loss)]
    let terms = num_terms as f32;
    boost / terms.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_norm() {
        assert_eq!(DEFAULT_NORM, 124);
        assert!((decode_norm(DEFAULT_NORM) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_edges() {
        assert_eq!(encode_norm(0.0), 0);
        assert_eq!(encode_norm(-3.0), 0);
        assert_eq!(encode_norm(1.0e-20), 1);
        assert_eq!(encode_norm(1.0e20), 255);
        assert!(decode_norm(0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_encoding_is_monotonic_and_rounds_down() {
        let mut last = 0u8;
        for i in 1..2000 {
            let f = i as f32 / 100.0;
            let b = encode_norm(f);
            assert!(b >= last);
            assert!(decode_norm(b) <= f);
            last = b;
        }
    }

    #[test]
    fn test_length_norm() {
        assert!((length_norm(1.0, 4) - 0.5).abs() < f32::EPSILON);
        assert!((length_norm(2.0, 1) - 2.0).abs() < f32::EPSILON);
        assert!((length_norm(1.0, 0) - 1.0).abs() < f32::EPSILON);
        // 1/sqrt(4) = 0.5 encodes exactly
        assert!((decode_norm(encode_norm(length_norm(1.0, 4))) - 0.5).abs() < f32::EPSILON);
    }
}
