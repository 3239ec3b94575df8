// Seeded random sampling.
//
// Every randomized decision in the verifier flows through a `Sampler` so a
// failing run can be replayed exactly: the seed is either taken from the
// PLEXUS_FUZZ_SEED environment variable or drawn from entropy and logged.
//
// `uniform_inclusive_u256` supports ranges wider than the native machine
// word via rejection sampling over masked random chunks; narrower ranges go
// straight through `gen_range`.

use log::info;
use primitive_types::U256;
use rand::{rngs::StdRng, Rng, SeedableRng};
use thiserror::Error;

/// Environment variable holding a replay seed (decimal or 0x-hex u64).
pub const SEED_ENV: &str = "PLEXUS_FUZZ_SEED";

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("invalid range: max {max} < min {min}")]
    InvalidRange { min: String, max: String },

    #[error("no alternatives to select from")]
    EmptyChoices,
}

pub struct Sampler {
    rng: StdRng,
    seed: u64,
}

impl Sampler {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
        }
    }

    /// Seed from PLEXUS_FUZZ_SEED if set, otherwise from entropy. The chosen
    /// seed is logged so any run can be replayed.
    pub fn from_env_or_entropy() -> Self {
        let seed = std::env::var(SEED_ENV)
            .ok()
            .and_then(|raw| parse_seed(&raw))
            .unwrap_or_else(|| rand::thread_rng().gen());
        info!("sampler seed: {:#018x} (replay: {}={})", seed, SEED_ENV, seed);
        Self::with_seed(seed)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn uniform_u64(&mut self, min: u64, max: u64) -> Result<u64, SampleError> {
        if max < min {
            return Err(SampleError::InvalidRange {
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(self.rng.gen_range(min..=max))
    }

    pub fn uniform_u128(&mut self, min: u128, max: u128) -> Result<u128, SampleError> {
        if max < min {
            return Err(SampleError::InvalidRange {
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(self.rng.gen_range(min..=max))
    }

    /// Inclusive uniform sample over an arbitrary 256-bit range.
    pub fn uniform_u256(&mut self, min: U256, max: U256) -> Result<U256, SampleError> {
        if max < min {
            return Err(SampleError::InvalidRange {
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        if min == max {
            return Ok(min);
        }
        let span = max - min;
        if span <= U256::from(u128::MAX) {
            let offset = self.rng.gen_range(0..=span.as_u128());
            return Ok(min + U256::from(offset));
        }
        // Rejection sampling: draw `span.bits()` random bits and retry until
        // the draw lands inside [0, span]. Expected retries < 2.
        let bits = span.bits();
        loop {
            let mut limbs = [0u64; 4];
            for limb in limbs.iter_mut() {
                *limb = self.rng.gen();
            }
            let mut draw = U256(limbs);
            if bits < 256 {
                draw = draw & ((U256::one() << bits) - U256::one());
            }
            if draw <= span {
                return Ok(min + draw);
            }
        }
    }

    /// Uniform f64 in [0, 1).
    pub fn unit(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Uniform choice from a non-empty list.
    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Result<&'a T, SampleError> {
        if items.is_empty() {
            return Err(SampleError::EmptyChoices);
        }
        let idx = self.rng.gen_range(0..items.len());
        Ok(&items[idx])
    }

    /// Cumulative-probability weighted selection. Weights need not sum to 1:
    /// the draw is scaled by the effective total. The last alternative absorbs
    /// rounding at the top of the partition.
    pub fn weighted_select<'a, T>(&mut self, alternatives: &'a [(f64, T)]) -> Result<&'a T, SampleError> {
        if alternatives.is_empty() {
            return Err(SampleError::EmptyChoices);
        }
        let total: f64 = alternatives.iter().map(|(w, _)| w.max(0.0)).sum();
        if total <= 0.0 {
            return Err(SampleError::EmptyChoices);
        }
        let target = self.unit() * total;
        let mut cumulative = 0.0;
        for (weight, item) in alternatives {
            cumulative += weight.max(0.0);
            if cumulative >= target {
                return Ok(item);
            }
        }
        Ok(&alternatives[alternatives.len() - 1].1)
    }
}

fn parse_seed(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        trimmed.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_range_returns_its_bound() {
        let mut sampler = Sampler::with_seed(1);
        assert_eq!(sampler.uniform_u64(5, 5).unwrap(), 5);
        assert_eq!(
            sampler.uniform_u256(U256::from(9u64), U256::from(9u64)).unwrap(),
            U256::from(9u64)
        );
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut sampler = Sampler::with_seed(1);
        assert!(matches!(
            sampler.uniform_u64(10, 1),
            Err(SampleError::InvalidRange { .. })
        ));
        assert!(matches!(
            sampler.uniform_u256(U256::from(2u64), U256::one()),
            Err(SampleError::InvalidRange { .. })
        ));
    }

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Sampler::with_seed(0xdead_beef);
        let mut b = Sampler::with_seed(0xdead_beef);
        for _ in 0..32 {
            assert_eq!(a.uniform_u64(0, 1000).unwrap(), b.uniform_u64(0, 1000).unwrap());
        }
    }

    #[test]
    fn wide_range_rejection_sampling_stays_in_bounds() {
        let mut sampler = Sampler::with_seed(7);
        let min = U256::from(u128::MAX) + U256::one();
        let max = U256::MAX - U256::one();
        for _ in 0..64 {
            let draw = sampler.uniform_u256(min, max).unwrap();
            assert!(draw >= min && draw <= max);
        }
    }

    #[test]
    fn empty_choices_are_rejected() {
        let mut sampler = Sampler::with_seed(1);
        let nothing: [u32; 0] = [];
        assert!(matches!(sampler.pick(&nothing), Err(SampleError::EmptyChoices)));
        let weightless: [(f64, u32); 0] = [];
        assert!(matches!(
            sampler.weighted_select(&weightless),
            Err(SampleError::EmptyChoices)
        ));
        assert!(matches!(
            sampler.weighted_select(&[(0.0, "a")]),
            Err(SampleError::EmptyChoices)
        ));
    }

    #[test]
    fn weighted_selection_tracks_the_weights() {
        let mut sampler = Sampler::with_seed(42);
        let alternatives = [(0.2, "A"), (0.8, "B")];
        let mut hits_b = 0usize;
        const TRIALS: usize = 10_000;
        for _ in 0..TRIALS {
            if *sampler.weighted_select(&alternatives).unwrap() == "B" {
                hits_b += 1;
            }
        }
        let ratio = hits_b as f64 / TRIALS as f64;
        // statistical bound, generous: expect ~0.8
        assert!(ratio > 0.75 && ratio < 0.85, "B selected {:.3}", ratio);
    }

    #[test]
    fn weights_need_not_sum_to_one() {
        let mut sampler = Sampler::with_seed(9);
        let alternatives = [(3.0, 1u8), (1.0, 2u8)];
        let mut first = 0usize;
        for _ in 0..4000 {
            if *sampler.weighted_select(&alternatives).unwrap() == 1 {
                first += 1;
            }
        }
        let ratio = first as f64 / 4000.0;
        assert!(ratio > 0.70 && ratio < 0.80, "first selected {:.3}", ratio);
    }
}
