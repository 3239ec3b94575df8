//! Conservation rules.
//!
//! Sums of per-entity stake fields must match their separately stored
//! aggregates. Accumulation is exact (`FixedDecimal` for share values,
//! `U256` for plain counters) and the comparison accepts
//! `expected / conservation_divisor` of absolute drift to tolerate
//! intra-block rounding. Floats never enter these rules.

use super::{key_account, key_subnet, subnet_ids, InvariantRule, RuleError, Violation, SCAN_PAGE_SIZE};
use crate::client::{AccountId, LedgerQuery, MapId, ScalarKey};
use crate::config::ToleranceConfig;
use crate::scanner::collect_map;
use async_trait::async_trait;
use plexus_common::fixed_point::{decode_exact, U64F64};
use plexus_common::tolerance::ApproxEqAbs;
use plexus_common::FixedDecimal;
use primitive_types::U256;
use std::collections::{BTreeMap, BTreeSet};

/// Per (hotkey, netuid): the sum of `Alpha` share entries across coldkeys
/// must equal `TotalHotkeyShares`.
pub struct HotkeyShareConservation;

const SHARE_RULE: &str = "hotkey_share_conservation";

#[async_trait]
impl InvariantRule for HotkeyShareConservation {
    fn id(&self) -> &'static str {
        SHARE_RULE
    }

    async fn check(
        &self,
        ledger: &dyn LedgerQuery,
        tolerance: &ToleranceConfig,
    ) -> Result<Vec<Violation>, RuleError> {
        let mut violations = Vec::new();

        // (hotkey, netuid) -> sum of shares across coldkeys
        let mut sums: BTreeMap<(AccountId, u16), FixedDecimal> = BTreeMap::new();
        for (key, value) in collect_map(ledger, MapId::Alpha, &[], SCAN_PAGE_SIZE).await? {
            let (hotkey, netuid) = match (key_account(&key, 0), key_subnet(&key, 2)) {
                (Some(h), Some(n)) => (h, n),
                _ => continue,
            };
            let shares = decode_exact(value.bits()?, U64F64)?;
            let entry = sums.entry((hotkey, netuid)).or_insert_with(FixedDecimal::zero);
            *entry = entry.checked_add(&shares).ok_or_else(|| {
                RuleError::Overflow(format!("share sum for hotkey {:?} netuid {}", hotkey, netuid))
            })?;
        }

        let mut totals: BTreeMap<(AccountId, u16), FixedDecimal> = BTreeMap::new();
        for (key, value) in
            collect_map(ledger, MapId::TotalHotkeyShares, &[], SCAN_PAGE_SIZE).await?
        {
            let (hotkey, netuid) = match (key_account(&key, 0), key_subnet(&key, 1)) {
                (Some(h), Some(n)) => (h, n),
                _ => continue,
            };
            totals.insert((hotkey, netuid), decode_exact(value.bits()?, U64F64)?);
        }

        let keys: BTreeSet<(AccountId, u16)> =
            sums.keys().chain(totals.keys()).copied().collect();
        for (hotkey, netuid) in keys {
            let computed = sums
                .get(&(hotkey, netuid))
                .copied()
                .unwrap_or_else(FixedDecimal::zero);
            let stored = totals
                .get(&(hotkey, netuid))
                .copied()
                .unwrap_or_else(FixedDecimal::zero);
            let eps = stored.div_int(tolerance.conservation_divisor);
            if !computed.approx_eq_abs(&stored, &eps) {
                violations.push(Violation::new(
                    SHARE_RULE,
                    vec![ScalarKey::Account(hotkey), ScalarKey::Subnet(netuid)],
                    format!(
                        "share sum {} diverges from TotalHotkeyShares {}",
                        computed, stored
                    ),
                ));
            }
        }

        Ok(violations)
    }
}

/// Per netuid: the sum of `TotalHotkeyAlpha` across hotkeys must equal
/// `SubnetAlphaOut + PendingEmission`.
pub struct SubnetStakeConservation;

const STAKE_RULE: &str = "subnet_stake_conservation";

#[async_trait]
impl InvariantRule for SubnetStakeConservation {
    fn id(&self) -> &'static str {
        STAKE_RULE
    }

    async fn check(
        &self,
        ledger: &dyn LedgerQuery,
        tolerance: &ToleranceConfig,
    ) -> Result<Vec<Violation>, RuleError> {
        let mut violations = Vec::new();

        let mut sums: BTreeMap<u16, U256> = BTreeMap::new();
        for (key, value) in
            collect_map(ledger, MapId::TotalHotkeyAlpha, &[], SCAN_PAGE_SIZE).await?
        {
            let netuid = match key_subnet(&key, 1) {
                Some(n) => n,
                None => continue,
            };
            let sum = sums.entry(netuid).or_default();
            *sum = sum
                .checked_add(value.bits()?)
                .ok_or_else(|| RuleError::Overflow(format!("alpha sum for netuid {}", netuid)))?;
        }

        let mut netuids: BTreeSet<u16> = subnet_ids(ledger).await?.into_iter().collect();
        netuids.extend(sums.keys().copied());

        for netuid in netuids {
            let subnet = ScalarKey::Subnet(netuid);
            let alpha_out = ledger
                .read_field(MapId::SubnetAlphaOut, &[subnet])
                .await?
                .map(|v| v.bits())
                .transpose()?
                .unwrap_or_default();
            let pending = ledger
                .read_field(MapId::PendingEmission, &[subnet])
                .await?
                .map(|v| v.bits())
                .transpose()?
                .unwrap_or_default();
            let expected = alpha_out + pending;
            let computed = sums.get(&netuid).copied().unwrap_or_default();
            let eps = expected / U256::from(tolerance.conservation_divisor);
            if !computed.approx_eq_abs(&expected, &eps) {
                violations.push(Violation::new(
                    STAKE_RULE,
                    vec![subnet],
                    format!(
                        "staked alpha sum {} diverges from SubnetAlphaOut {} + PendingEmission {}",
                        computed, alpha_out, pending
                    ),
                ));
            }
        }

        Ok(violations)
    }
}
