// Shared numeric primitives for the Plexus verifier.
//
// Everything in this crate is synchronous and allocation-light: wire-format
// fixed-point decoding, exact decimal arithmetic on power-of-two denominators,
// tolerance-based comparison and seeded random sampling. The verifier crate
// builds the invariant engine and the contract framework on top of these.

pub mod decimal;
pub mod fixed_point;
pub mod sampler;
pub mod tolerance;

pub use decimal::FixedDecimal;
pub use fixed_point::{DecodeError, FixedPointFormat};
pub use sampler::{SampleError, Sampler};
pub use tolerance::{NumericValue, ToleranceError};
