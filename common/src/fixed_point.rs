// Wire-format fixed-point decoding.
//
// The ledger stores ratios and share prices as unsigned binary fixed-point
// integers (Qm.n). Decoding splits the bit pattern at the fractional boundary
// and divides the low part by 2^n. Two decoders exist on purpose:
// - `decode_approx` is lossy f64, good enough for comparison-grade reads
// - `decode_exact` keeps the bits and performs all arithmetic on integers,
//   required wherever sums across many entries must not drift

use crate::decimal::FixedDecimal;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not a valid hex or integer bit pattern: {0:?}")]
    Malformed(String),

    #[error("bit pattern exceeds {width} bits")]
    Overflow { width: u32 },

    #[error("unexpected value shape, expected {expected}")]
    Shape { expected: &'static str },
}

/// A Qm.n layout: `int_bits` integer bits followed by `frac_bits` fractional
/// bits. All formats used by the ledger are unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPointFormat {
    pub int_bits: u32,
    pub frac_bits: u32,
}

impl FixedPointFormat {
    pub const fn new(int_bits: u32, frac_bits: u32) -> Self {
        Self {
            int_bits,
            frac_bits,
        }
    }

    /// Total width of the encoded pattern
    pub const fn width(&self) -> u32 {
        self.int_bits + self.frac_bits
    }
}

/// Share prices and normalized ratios
pub const U64F64: FixedPointFormat = FixedPointFormat::new(64, 64);
/// Sqrt prices in the swap pools
pub const U96F32: FixedPointFormat = FixedPointFormat::new(96, 32);
/// Emission split fractions
pub const U110F18: FixedPointFormat = FixedPointFormat::new(110, 18);
/// Plain integer counters, degenerate fractional part
pub const U64F0: FixedPointFormat = FixedPointFormat::new(64, 0);

/// Parse a raw bit pattern from wire text. Accepts `0x`-prefixed hex or
/// plain decimal digits, nothing else.
pub fn parse_bits(text: &str) -> Result<U256, DecodeError> {
    let trimmed = text.trim();
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        if hex.is_empty() {
            return Err(DecodeError::Malformed(text.to_string()));
        }
        U256::from_str_radix(hex, 16).map_err(|_| DecodeError::Malformed(text.to_string()))
    } else {
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DecodeError::Malformed(text.to_string()));
        }
        U256::from_dec_str(trimmed).map_err(|_| DecodeError::Malformed(text.to_string()))
    }
}

fn check_width(bits: U256, format: FixedPointFormat) -> Result<(), DecodeError> {
    let width = format.width();
    if width < 256 && bits >> width != U256::zero() {
        return Err(DecodeError::Overflow { width });
    }
    Ok(())
}

/// Lossy decode: integer part plus fractional part divided by 2^frac_bits in
/// floating point. With `frac_bits == 0` this is a plain integer read.
pub fn decode_approx(bits: U256, format: FixedPointFormat) -> Result<f64, DecodeError> {
    check_width(bits, format)?;
    if format.frac_bits == 0 {
        return Ok(u256_to_f64(bits));
    }
    let int_part = bits >> format.frac_bits;
    let frac_mask = (U256::one() << format.frac_bits) - U256::one();
    let frac_part = bits & frac_mask;
    Ok(u256_to_f64(int_part) + u256_to_f64(frac_part) / 2f64.powi(format.frac_bits as i32))
}

/// Exact decode: the value is carried as (bits, frac_bits) and all further
/// arithmetic stays in the integer domain.
pub fn decode_exact(bits: U256, format: FixedPointFormat) -> Result<FixedDecimal, DecodeError> {
    check_width(bits, format)?;
    Ok(FixedDecimal::from_bits(bits, format.frac_bits))
}

pub(crate) fn u256_to_f64(value: U256) -> f64 {
    let mut out = 0f64;
    for limb in value.0.iter().rev() {
        out = out * 18_446_744_073_709_551_616f64 + *limb as f64;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_and_decimal() {
        assert_eq!(parse_bits("0x10").unwrap(), U256::from(16u64));
        assert_eq!(parse_bits("42").unwrap(), U256::from(42u64));
        assert_eq!(
            parse_bits("0xffffffffffffffff").unwrap(),
            U256::from(u64::MAX)
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", "0x", "12a", "-5", "1.5", "0xzz"] {
            assert!(parse_bits(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn approx_splits_at_the_fractional_boundary() {
        // 1.5 in Q64.64
        let bits = (U256::from(1u64) << 64) | (U256::one() << 63);
        let value = decode_approx(bits, U64F64).unwrap();
        assert!((value - 1.5).abs() < 1e-12);
    }

    #[test]
    fn zero_frac_bits_is_plain_integer() {
        let value = decode_approx(U256::from(123_456u64), U64F0).unwrap();
        assert_eq!(value, 123_456f64);
    }

    #[test]
    fn emission_fraction_format_decodes() {
        // 0.25 in Q110.18
        let bits = U256::from(1u64 << 16);
        assert_eq!(decode_approx(bits, U110F18).unwrap(), 0.25);
        assert_eq!(decode_exact(bits, U110F18).unwrap().to_f64(), 0.25);
    }

    #[test]
    fn overflowing_pattern_is_rejected() {
        let bits = U256::one() << 128;
        assert!(matches!(
            decode_approx(bits, U64F64),
            Err(DecodeError::Overflow { width: 128 })
        ));
    }

    #[test]
    fn exact_matches_approx_on_simple_values() {
        let bits = (U256::from(7u64) << 32) | U256::from(1u64 << 31);
        let exact = decode_exact(bits, U96F32).unwrap();
        let approx = decode_approx(bits, U96F32).unwrap();
        assert!((exact.to_f64() - approx).abs() < 1e-9);
        assert!((approx - 7.5).abs() < 1e-12);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn rel_close(a: f64, b: f64) -> bool {
            let scale = a.abs().max(b.abs()).max(1.0);
            (a - b).abs() / scale <= 1e-9
        }

        proptest! {
            #[test]
            fn exact_tracks_approx_q64_64(bits in any::<u128>()) {
                let bits = U256::from(bits);
                let exact = decode_exact(bits, U64F64).unwrap().to_f64();
                let approx = decode_approx(bits, U64F64).unwrap();
                prop_assert!(rel_close(exact, approx), "exact {} vs approx {}", exact, approx);
            }

            #[test]
            fn exact_tracks_approx_q96_32(bits in any::<u128>()) {
                let bits = U256::from(bits);
                let exact = decode_exact(bits, U96F32).unwrap().to_f64();
                let approx = decode_approx(bits, U96F32).unwrap();
                prop_assert!(rel_close(exact, approx));
            }

            #[test]
            fn decimal_text_roundtrips(bits in any::<u64>()) {
                let parsed = parse_bits(&bits.to_string()).unwrap();
                prop_assert_eq!(parsed, U256::from(bits));
            }
        }
    }
}
