// Tolerance-based equality.
//
// Two layers: a generic trait for homogeneous operands where the compiler
// enforces the type match, and a dynamic `NumericValue` enum for snapshot
// fields that flow untyped through the contract pipeline. Mixing variants on
// the dynamic path is a `TypeMismatch` error, never a silent coercion.

use crate::decimal::FixedDecimal;
use primitive_types::{U256, U512};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToleranceError {
    #[error("cannot compare {left} against {right}")]
    TypeMismatch {
        left: &'static str,
        right: &'static str,
    },
}

/// Absolute-tolerance equality: `|a - b| <= eps`.
pub trait ApproxEqAbs {
    fn approx_eq_abs(&self, other: &Self, eps: &Self) -> bool;
}

impl ApproxEqAbs for u64 {
    fn approx_eq_abs(&self, other: &Self, eps: &Self) -> bool {
        self.abs_diff(*other) <= *eps
    }
}

impl ApproxEqAbs for u128 {
    fn approx_eq_abs(&self, other: &Self, eps: &Self) -> bool {
        self.abs_diff(*other) <= *eps
    }
}

impl ApproxEqAbs for U256 {
    fn approx_eq_abs(&self, other: &Self, eps: &Self) -> bool {
        let diff = if self >= other {
            *self - *other
        } else {
            *other - *self
        };
        diff <= *eps
    }
}

impl ApproxEqAbs for f64 {
    fn approx_eq_abs(&self, other: &Self, eps: &Self) -> bool {
        (self - other).abs() <= *eps
    }
}

impl ApproxEqAbs for FixedDecimal {
    fn approx_eq_abs(&self, other: &Self, eps: &Self) -> bool {
        self.abs_diff(other) <= *eps
    }
}

/// Relative-tolerance equality in floating point:
/// `|a - b| / max(|a|, |b|, 1) <= rel_tol`.
pub fn approx_eq_rel_f64(a: f64, b: f64, rel_tol: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() / scale <= rel_tol
}

/// Integer-only relative tolerance, the ratio expressed as numer/denom over a
/// declared denominator: `|a - b| * denom <= max(a, b, 1) * numer`.
/// Widened to 512 bits so the cross-multiplication cannot overflow.
pub fn approx_eq_rel_ratio(a: U256, b: U256, numer: u64, denom: u64) -> bool {
    let diff = if a >= b { a - b } else { b - a };
    let scale = a.max(b).max(U256::one());
    U512::from(diff) * U512::from(denom) <= U512::from(scale) * U512::from(numer)
}

/// A decoded storage value of dynamic numeric type. Comparisons require both
/// operands to be the same variant.
#[derive(Debug, Clone)]
pub enum NumericValue {
    Uint(u128),
    Big(U256),
    Float(f64),
    Fixed(FixedDecimal),
}

impl NumericValue {
    fn type_name(&self) -> &'static str {
        match self {
            NumericValue::Uint(_) => "uint",
            NumericValue::Big(_) => "big",
            NumericValue::Float(_) => "float",
            NumericValue::Fixed(_) => "fixed",
        }
    }

    pub fn approx_eq_abs(&self, other: &Self, eps: &Self) -> Result<bool, ToleranceError> {
        use NumericValue::*;
        match (self, other, eps) {
            (Uint(a), Uint(b), Uint(e)) => Ok(a.approx_eq_abs(b, e)),
            (Big(a), Big(b), Big(e)) => Ok(a.approx_eq_abs(b, e)),
            (Float(a), Float(b), Float(e)) => Ok(a.approx_eq_abs(b, e)),
            (Fixed(a), Fixed(b), Fixed(e)) => Ok(a.approx_eq_abs(b, e)),
            _ => Err(ToleranceError::TypeMismatch {
                left: self.type_name(),
                right: if self.type_name() != other.type_name() {
                    other.type_name()
                } else {
                    eps.type_name()
                },
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exact_equality_at_zero_epsilon() {
        assert!(42u64.approx_eq_abs(&42, &0));
        assert!(!42u64.approx_eq_abs(&43, &0));
        assert!(1.5f64.approx_eq_abs(&1.5, &0.0));
    }

    #[test]
    fn relative_tolerance_scales_with_magnitude() {
        assert!(approx_eq_rel_f64(1_000_000.0, 1_000_001.0, 1e-5));
        assert!(!approx_eq_rel_f64(100.0, 102.0, 1e-5));
        // near-zero operands fall back to the unit scale
        assert!(approx_eq_rel_f64(0.0, 1e-6, 1e-5));
    }

    #[test]
    fn integer_ratio_variant_avoids_floats() {
        let a = U256::from(1_000_000u64);
        let b = U256::from(1_000_500u64);
        assert!(approx_eq_rel_ratio(a, b, 1, 1000));
        assert!(!approx_eq_rel_ratio(a, b, 1, 10_000));
    }

    #[test]
    fn ratio_variant_handles_extreme_operands() {
        assert!(approx_eq_rel_ratio(U256::MAX, U256::MAX, 1, 1000));
        assert!(approx_eq_rel_ratio(U256::zero(), U256::zero(), 0, 1));
    }

    #[test]
    fn mismatched_variants_are_an_error() {
        let a = NumericValue::Uint(1);
        let b = NumericValue::Float(1.0);
        let eps = NumericValue::Uint(0);
        assert!(matches!(
            a.approx_eq_abs(&b, &eps),
            Err(ToleranceError::TypeMismatch { .. })
        ));
        // epsilon variant must match too
        let c = NumericValue::Uint(1);
        assert!(matches!(
            a.approx_eq_abs(&c, &NumericValue::Float(0.0)),
            Err(ToleranceError::TypeMismatch { .. })
        ));
    }

    proptest! {
        #[test]
        fn abs_equality_is_reflexive(a in any::<u64>()) {
            prop_assert!(a.approx_eq_abs(&a, &0));
        }

        #[test]
        fn abs_equality_is_symmetric(a in any::<u64>(), b in any::<u64>(), eps in any::<u64>()) {
            prop_assert_eq!(a.approx_eq_abs(&b, &eps), b.approx_eq_abs(&a, &eps));
        }

        #[test]
        fn ratio_is_symmetric(a in any::<u64>(), b in any::<u64>()) {
            let a = U256::from(a);
            let b = U256::from(b);
            prop_assert_eq!(
                approx_eq_rel_ratio(a, b, 1, 1000),
                approx_eq_rel_ratio(b, a, 1, 1000)
            );
        }
    }
}
