//! Staking contracts.
//!
//! `add_stake` stakes a sampled amount to a sampled hotkey and verifies the
//! share-price accounting; `remove_stake` is the inverse, bounded by the
//! actor's current holdings. When the actor holds nothing the parameter
//! stream dries up and the run is skipped rather than failed.

use super::{
    param_account, param_subnet, param_uint, ActionOutput, ChosenParams, ChosenValue, Contract,
    ParameterDescriptor,
};
use crate::client::{AccountId, LedgerMutation, LedgerQuery, MapId, Operation, ScalarKey};
use crate::config::{TestActor, ToleranceConfig};
use crate::invariants::SCAN_PAGE_SIZE;
use crate::scanner::collect_map;
use crate::snapshot::StorageSnapshot;
use anyhow::Context;
use async_trait::async_trait;
use plexus_common::{FixedDecimal, NumericValue};
use primitive_types::U256;

/// Upper bound for sampled stake amounts.
const MAX_STAKE_AMOUNT: u128 = 1_000_000_000;

fn hotkey_subnet_key(hotkey: AccountId, netuid: u16) -> Vec<ScalarKey> {
    vec![ScalarKey::Account(hotkey), ScalarKey::Subnet(netuid)]
}

fn share_entry_key(hotkey: AccountId, coldkey: AccountId, netuid: u16) -> Vec<ScalarKey> {
    vec![
        ScalarKey::Account(hotkey),
        ScalarKey::Account(coldkey),
        ScalarKey::Subnet(netuid),
    ]
}

async fn active_netuids(ledger: &dyn LedgerQuery) -> anyhow::Result<Vec<u16>> {
    let entries = collect_map(ledger, MapId::ActiveSubnets, &[], SCAN_PAGE_SIZE)
        .await
        .context("scanning ActiveSubnets")?;
    Ok(entries
        .iter()
        .filter_map(|(key, _)| match key.first() {
            Some(ScalarKey::Subnet(netuid)) => Some(*netuid),
            _ => None,
        })
        .collect())
}

async fn registered_hotkeys(ledger: &dyn LedgerQuery, netuid: u16) -> anyhow::Result<Vec<AccountId>> {
    let entries = collect_map(ledger, MapId::Uids, &[ScalarKey::Subnet(netuid)], SCAN_PAGE_SIZE)
        .await
        .context("scanning Uids")?;
    Ok(entries
        .iter()
        .filter_map(|(key, _)| match key.get(1) {
            Some(ScalarKey::Account(hotkey)) => Some(*hotkey),
            _ => None,
        })
        .collect())
}

/// Capture the four fields both staking contracts mutate.
async fn stake_snapshot(
    ledger: &dyn LedgerQuery,
    hotkey: AccountId,
    coldkey: AccountId,
    netuid: u16,
) -> anyhow::Result<StorageSnapshot> {
    StorageSnapshot::capture(
        ledger,
        &[
            (MapId::TotalHotkeyAlpha, hotkey_subnet_key(hotkey, netuid)),
            (MapId::TotalHotkeyShares, hotkey_subnet_key(hotkey, netuid)),
            (MapId::Alpha, share_entry_key(hotkey, coldkey, netuid)),
            (MapId::SubnetAlphaOut, vec![ScalarKey::Subnet(netuid)]),
        ],
    )
    .await
    .context("capturing stake fields")
}

/// Verify the stake delta shared by add and remove: plain counters move by
/// exactly `amount` in `direction`, share totals move by the expected
/// share-price delta within the conservation tolerance.
#[allow(clippy::too_many_arguments)]
async fn verify_stake_delta(
    ledger: &dyn LedgerQuery,
    before: &StorageSnapshot,
    hotkey: AccountId,
    coldkey: AccountId,
    netuid: u16,
    amount: u128,
    added: bool,
    tolerance: &ToleranceConfig,
) -> anyhow::Result<bool> {
    let after = stake_snapshot(ledger, hotkey, coldkey, netuid).await?;

    let hk_net = hotkey_subnet_key(hotkey, netuid);
    let subnet_key = vec![ScalarKey::Subnet(netuid)];

    let alpha_before = before.uint_or_zero(MapId::TotalHotkeyAlpha, &hk_net)?;
    let alpha_after = after.uint_or_zero(MapId::TotalHotkeyAlpha, &hk_net)?;
    let out_before = before.uint_or_zero(MapId::SubnetAlphaOut, &subnet_key)?;
    let out_after = after.uint_or_zero(MapId::SubnetAlphaOut, &subnet_key)?;

    let (expected_alpha, expected_out) = if added {
        (alpha_before + amount, out_before + amount)
    } else {
        (
            alpha_before.saturating_sub(amount),
            out_before.saturating_sub(amount),
        )
    };
    if alpha_after != expected_alpha {
        log::warn!(
            "TotalHotkeyAlpha moved {} -> {}, expected {}",
            alpha_before,
            alpha_after,
            expected_alpha
        );
        return Ok(false);
    }
    if out_after != expected_out {
        log::warn!(
            "SubnetAlphaOut moved {} -> {}, expected {}",
            out_before,
            out_after,
            expected_out
        );
        return Ok(false);
    }

    // share totals move by amount * shares/alpha at the pre-action price
    let shares_before = before.bits_or_zero(MapId::TotalHotkeyShares, &hk_net)?;
    let expected_share_delta = if shares_before.is_zero() || alpha_before == 0 {
        U256::from(amount) << 64
    } else {
        U256::from(amount) * shares_before / U256::from(alpha_before)
    };
    let expected_shares = if added {
        shares_before + expected_share_delta
    } else {
        shares_before.saturating_sub(expected_share_delta)
    };

    // dynamic comparison: both operands decoded through the map's declared
    // wire format, epsilon in the same representation
    let got = after.numeric_or_zero(MapId::TotalHotkeyShares, &hk_net)?;
    let want = FixedDecimal::from_bits(expected_shares, 64);
    let eps = NumericValue::Fixed(want.div_int(tolerance.conservation_divisor));
    if !got.approx_eq_abs(&NumericValue::Fixed(want), &eps)? {
        log::warn!("TotalHotkeyShares moved to {:?}, expected {}", got, want);
        return Ok(false);
    }

    Ok(true)
}

pub struct AddStakeContract {
    actor: TestActor,
    tolerance: ToleranceConfig,
}

impl AddStakeContract {
    pub fn new(actor: TestActor, tolerance: ToleranceConfig) -> Self {
        Self { actor, tolerance }
    }
}

#[async_trait]
impl Contract for AddStakeContract {
    fn name(&self) -> &'static str {
        "add_stake"
    }

    fn scope(&self) -> &'static str {
        "stake"
    }

    fn parameter_count(&self) -> usize {
        3
    }

    async fn describe_parameter(
        &self,
        idx: usize,
        chosen: &ChosenParams,
        ledger: &dyn LedgerQuery,
    ) -> anyhow::Result<ParameterDescriptor> {
        match idx {
            0 => {
                let netuids = active_netuids(ledger).await?;
                Ok(ParameterDescriptor::list(
                    "netuid",
                    netuids.into_iter().map(ChosenValue::Subnet).collect(),
                ))
            }
            1 => {
                // hotkey choices depend on the already-chosen netuid
                let netuid = param_subnet(chosen, "netuid")?;
                let hotkeys = registered_hotkeys(ledger, netuid).await?;
                Ok(ParameterDescriptor::list(
                    "hotkey",
                    hotkeys.into_iter().map(ChosenValue::Account).collect(),
                ))
            }
            2 => Ok(ParameterDescriptor::range("amount", 1, MAX_STAKE_AMOUNT)),
            _ => anyhow::bail!("add_stake has no parameter {}", idx),
        }
    }

    async fn precondition(
        &self,
        params: &ChosenParams,
        ledger: &dyn LedgerQuery,
    ) -> anyhow::Result<StorageSnapshot> {
        let netuid = param_subnet(params, "netuid")?;
        let hotkey = param_account(params, "hotkey")?;
        stake_snapshot(ledger, hotkey, self.actor.coldkey, netuid).await
    }

    async fn action(
        &self,
        params: &ChosenParams,
        ledger: &dyn LedgerMutation,
    ) -> anyhow::Result<ActionOutput> {
        let netuid = param_subnet(params, "netuid")?;
        let hotkey = param_account(params, "hotkey")?;
        let amount = param_uint(params, "amount")? as u64;
        let receipt = ledger
            .submit(Operation::AddStake { hotkey, netuid, amount }, &self.actor.coldkey)
            .await?;
        Ok(serde_json::to_value(receipt)?)
    }

    async fn postcondition(
        &self,
        params: &ChosenParams,
        before: &StorageSnapshot,
        _action: &ActionOutput,
        ledger: &dyn LedgerQuery,
    ) -> anyhow::Result<bool> {
        let netuid = param_subnet(params, "netuid")?;
        let hotkey = param_account(params, "hotkey")?;
        let amount = param_uint(params, "amount")?;
        verify_stake_delta(
            ledger,
            before,
            hotkey,
            self.actor.coldkey,
            netuid,
            amount,
            true,
            &self.tolerance,
        )
        .await
    }
}

pub struct RemoveStakeContract {
    actor: TestActor,
    tolerance: ToleranceConfig,
}

impl RemoveStakeContract {
    pub fn new(actor: TestActor, tolerance: ToleranceConfig) -> Self {
        Self { actor, tolerance }
    }

    /// Alpha currently redeemable by the actor's coldkey on a subnet.
    async fn holder_alpha(&self, ledger: &dyn LedgerQuery, netuid: u16) -> anyhow::Result<u128> {
        let hk_net = hotkey_subnet_key(self.actor.hotkey, netuid);
        let entry_key = share_entry_key(self.actor.hotkey, self.actor.coldkey, netuid);

        let read_bits = |value: Option<crate::client::RawValue>| -> anyhow::Result<U256> {
            Ok(value.map(|v| v.bits()).transpose()?.unwrap_or_default())
        };
        let shares = read_bits(ledger.read_field(MapId::Alpha, &entry_key).await?)?;
        let total_shares = read_bits(ledger.read_field(MapId::TotalHotkeyShares, &hk_net).await?)?;
        let total_alpha = read_bits(ledger.read_field(MapId::TotalHotkeyAlpha, &hk_net).await?)?;
        if total_shares.is_zero() {
            return Ok(0);
        }
        Ok((shares * total_alpha / total_shares).as_u128())
    }
}

#[async_trait]
impl Contract for RemoveStakeContract {
    fn name(&self) -> &'static str {
        "remove_stake"
    }

    fn scope(&self) -> &'static str {
        "stake"
    }

    fn parameter_count(&self) -> usize {
        2
    }

    async fn describe_parameter(
        &self,
        idx: usize,
        chosen: &ChosenParams,
        ledger: &dyn LedgerQuery,
    ) -> anyhow::Result<ParameterDescriptor> {
        match idx {
            0 => {
                // only subnets where the actor actually holds something
                let mut netuids = Vec::new();
                for netuid in active_netuids(ledger).await? {
                    if self.holder_alpha(ledger, netuid).await? > 0 {
                        netuids.push(ChosenValue::Subnet(netuid));
                    }
                }
                Ok(ParameterDescriptor::list("netuid", netuids))
            }
            1 => {
                let netuid = param_subnet(chosen, "netuid")?;
                let held = self.holder_alpha(ledger, netuid).await?;
                // held == 0 yields the inverted range [1, 0]: skip, not fail
                Ok(ParameterDescriptor::range("amount", 1, held))
            }
            _ => anyhow::bail!("remove_stake has no parameter {}", idx),
        }
    }

    async fn precondition(
        &self,
        params: &ChosenParams,
        ledger: &dyn LedgerQuery,
    ) -> anyhow::Result<StorageSnapshot> {
        let netuid = param_subnet(params, "netuid")?;
        stake_snapshot(ledger, self.actor.hotkey, self.actor.coldkey, netuid).await
    }

    async fn action(
        &self,
        params: &ChosenParams,
        ledger: &dyn LedgerMutation,
    ) -> anyhow::Result<ActionOutput> {
        let netuid = param_subnet(params, "netuid")?;
        let amount = param_uint(params, "amount")? as u64;
        let receipt = ledger
            .submit(
                Operation::RemoveStake { hotkey: self.actor.hotkey, netuid, amount },
                &self.actor.coldkey,
            )
            .await?;
        Ok(serde_json::to_value(receipt)?)
    }

    async fn postcondition(
        &self,
        params: &ChosenParams,
        before: &StorageSnapshot,
        _action: &ActionOutput,
        ledger: &dyn LedgerQuery,
    ) -> anyhow::Result<bool> {
        let netuid = param_subnet(params, "netuid")?;
        let amount = param_uint(params, "amount")?;
        verify_stake_delta(
            ledger,
            before,
            self.actor.hotkey,
            self.actor.coldkey,
            netuid,
            amount,
            false,
            &self.tolerance,
        )
        .await
    }
}
