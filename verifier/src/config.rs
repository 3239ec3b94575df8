//! Verifier configuration.
//!
//! Tolerance constants are configuration, not code: rules receive a
//! [`ToleranceConfig`] and never embed their own epsilons. Test actors are
//! passed in explicitly at construction; key derivation happens in the
//! caller, the framework only consumes the finished identities.

use crate::client::AccountId;
use serde::{Deserialize, Serialize};

/// Epsilon policy shared by the rule catalog and the contract postconditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToleranceConfig {
    /// Conservation checks accept `expected / conservation_divisor` of
    /// absolute drift, tolerating intra-block rounding.
    pub conservation_divisor: u64,

    /// Relative tolerance for the liquidity reserve comparison.
    pub liquidity_rel_tol: f64,
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            conservation_divisor: 1000,
            liquidity_rel_tol: 1e-5,
        }
    }
}

/// A funded identity the contract catalog signs with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestActor {
    pub name: String,
    pub coldkey: AccountId,
    pub hotkey: AccountId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Page size for full-map scans.
    pub page_size: usize,

    pub tolerance: ToleranceConfig,

    pub actors: Vec<TestActor>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            page_size: 256,
            tolerance: ToleranceConfig::default(),
            actors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_the_observed_policy() {
        let config = VerifierConfig::default();
        assert_eq!(config.tolerance.conservation_divisor, 1000);
        assert!(config.tolerance.liquidity_rel_tol > 0.0);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let mut config = VerifierConfig::default();
        config.actors.push(TestActor {
            name: "alice".to_string(),
            coldkey: AccountId::from_byte(1),
            hotkey: AccountId::from_byte(2),
        });
        let text = serde_json::to_string(&config).unwrap();
        let back: VerifierConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.actors[0].coldkey, config.actors[0].coldkey);
    }
}
