//! Deterministic in-memory ledger.
//!
//! Implements both [`LedgerQuery`] and [`LedgerMutation`] over ordered maps,
//! with mutation semantics rich enough to keep the full invariant catalog
//! green: share-price staking, child-key bookkeeping on both sides of the
//! relation, and reserve accounting for liquidity positions. Tests corrupt
//! state through `set_raw`/`remove_raw` to flip individual rules, and use the
//! fault hooks to exercise scan and submission failure paths.

use super::{
    AccountId, Cursor, KeyTuple, LedgerMutation, LedgerQuery, MapId, MutationError, Operation,
    Page, QueryError, RawValue, ScalarKey, SubmitReceipt,
};
use async_trait::async_trait;
use plexus_common::fixed_point::{decode_approx, U64F64};
use primitive_types::U256;
use super::PROPORTION_SCALE;
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Default)]
struct State {
    maps: BTreeMap<MapId, BTreeMap<KeyTuple, RawValue>>,
    block: u64,
    /// Fail any scan page of this map once the cursor reaches the offset.
    fail_scan: Option<(MapId, u64)>,
    /// Force the next submit to be rejected with this reason.
    forced_reject: Option<(String, u32, String)>,
}

pub struct MemoryLedger {
    state: RwLock<State>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    // -- raw access ---------------------------------------------------------

    pub fn set_raw(&self, map: MapId, key: KeyTuple, value: serde_json::Value) {
        let mut state = self.state.write().unwrap();
        state.maps.entry(map).or_default().insert(key, RawValue(value));
    }

    pub fn remove_raw(&self, map: MapId, key: &[ScalarKey]) {
        let mut state = self.state.write().unwrap();
        if let Some(entries) = state.maps.get_mut(&map) {
            entries.remove(key);
        }
    }

    fn read_u64(state: &State, map: MapId, key: &[ScalarKey]) -> u64 {
        state
            .maps
            .get(&map)
            .and_then(|entries| entries.get(key))
            .and_then(|v| v.uint().ok())
            .map(|v| v as u64)
            .unwrap_or(0)
    }

    fn read_bits(state: &State, map: MapId, key: &[ScalarKey]) -> U256 {
        state
            .maps
            .get(&map)
            .and_then(|entries| entries.get(key))
            .and_then(|v| v.bits().ok())
            .unwrap_or_default()
    }

    fn write_u64(state: &mut State, map: MapId, key: KeyTuple, value: u64) {
        state
            .maps
            .entry(map)
            .or_default()
            .insert(key, RawValue::from_u64(value));
    }

    fn write_bits(state: &mut State, map: MapId, key: KeyTuple, value: U256) {
        state
            .maps
            .entry(map)
            .or_default()
            .insert(key, RawValue::from_bits(value));
    }

    // -- fixture seeding ----------------------------------------------------

    /// Create a subnet with zeroed counters and a sqrt price of 1.0.
    pub fn add_subnet(&self, netuid: u16, max_uids: u64) {
        let mut state = self.state.write().unwrap();
        let key = vec![ScalarKey::Subnet(netuid)];
        Self::write_u64(&mut state, MapId::SubnetworkN, key.clone(), 0);
        Self::write_u64(&mut state, MapId::MaxAllowedUids, key.clone(), max_uids);
        Self::write_u64(&mut state, MapId::SubnetAlphaOut, key.clone(), 0);
        Self::write_u64(&mut state, MapId::PendingEmission, key.clone(), 0);
        Self::write_u64(&mut state, MapId::SubnetTao, key.clone(), 0);
        Self::write_u64(&mut state, MapId::SubnetAlphaIn, key.clone(), 0);
        Self::write_bits(&mut state, MapId::AlphaSqrtPrice, key.clone(), U256::one() << 64);
        state
            .maps
            .entry(MapId::ActiveSubnets)
            .or_default()
            .insert(key, RawValue(serde_json::json!(true)));
    }

    /// Register a hotkey on a subnet, assigning the next uid.
    pub fn register(&self, netuid: u16, hotkey: AccountId) -> u64 {
        let mut state = self.state.write().unwrap();
        let subnet_key = vec![ScalarKey::Subnet(netuid)];
        let uid = Self::read_u64(&state, MapId::SubnetworkN, &subnet_key);
        Self::write_u64(
            &mut state,
            MapId::Uids,
            vec![ScalarKey::Subnet(netuid), ScalarKey::Account(hotkey)],
            uid,
        );
        state.maps.entry(MapId::Keys).or_default().insert(
            vec![ScalarKey::Subnet(netuid), ScalarKey::Index(uid)],
            RawValue(serde_json::json!(hotkey.to_string())),
        );
        Self::write_u64(&mut state, MapId::SubnetworkN, subnet_key, uid + 1);
        uid
    }

    /// Stake `alpha` for (hotkey, coldkey) at the current share price,
    /// keeping share and reserve accounting consistent.
    pub fn seed_stake(&self, hotkey: AccountId, coldkey: AccountId, netuid: u16, alpha: u64) {
        let mut state = self.state.write().unwrap();
        Self::apply_stake(&mut state, hotkey, coldkey, netuid, alpha);
    }

    fn apply_stake(state: &mut State, hotkey: AccountId, coldkey: AccountId, netuid: u16, alpha: u64) {
        let hk_net = vec![ScalarKey::Account(hotkey), ScalarKey::Subnet(netuid)];
        let share_key = vec![
            ScalarKey::Account(hotkey),
            ScalarKey::Account(coldkey),
            ScalarKey::Subnet(netuid),
        ];
        let subnet_key = vec![ScalarKey::Subnet(netuid)];

        let total_shares = Self::read_bits(state, MapId::TotalHotkeyShares, &hk_net);
        let total_alpha = Self::read_u64(state, MapId::TotalHotkeyAlpha, &hk_net);

        // First staker mints shares 1:1 (U64F64); afterwards shares are
        // proportional to the pool's current alpha-per-share price.
        let new_shares = if total_shares.is_zero() || total_alpha == 0 {
            U256::from(alpha) << 64
        } else {
            U256::from(alpha) * total_shares / U256::from(total_alpha)
        };

        let shares = Self::read_bits(state, MapId::Alpha, &share_key);
        Self::write_bits(state, MapId::Alpha, share_key, shares + new_shares);
        Self::write_bits(state, MapId::TotalHotkeyShares, hk_net.clone(), total_shares + new_shares);
        Self::write_u64(state, MapId::TotalHotkeyAlpha, hk_net, total_alpha + alpha);
        let out = Self::read_u64(state, MapId::SubnetAlphaOut, &subnet_key);
        Self::write_u64(state, MapId::SubnetAlphaOut, subnet_key, out + alpha);
    }

    pub fn set_pending_emission(&self, netuid: u16, amount: u64) {
        let mut state = self.state.write().unwrap();
        Self::write_u64(
            &mut state,
            MapId::PendingEmission,
            vec![ScalarKey::Subnet(netuid)],
            amount,
        );
    }

    /// Record a liquidity position and credit both reserves with its implied
    /// contribution at the subnet's current sqrt price.
    pub fn seed_position(&self, netuid: u16, liquidity: u64, tick_low: i64, tick_high: i64) {
        let mut state = self.state.write().unwrap();
        let subnet_key = vec![ScalarKey::Subnet(netuid)];
        let sqrt_bits = Self::read_bits(&state, MapId::AlphaSqrtPrice, &subnet_key);
        let sqrt_cur = decode_approx(sqrt_bits, U64F64).unwrap_or(1.0);

        let sqrt_low = 1.0001f64.powf(tick_low as f64 / 2.0);
        let sqrt_high = 1.0001f64.powf(tick_high as f64 / 2.0);
        let clamped = sqrt_cur.clamp(sqrt_low, sqrt_high);
        let tao = liquidity as f64 * (clamped - sqrt_low);
        let alpha = liquidity as f64 * (1.0 / clamped - 1.0 / sqrt_high);

        let index = state
            .maps
            .get(&MapId::Positions)
            .map(|entries| {
                entries
                    .keys()
                    .filter(|key| key.first() == Some(&ScalarKey::Subnet(netuid)))
                    .count() as u64
            })
            .unwrap_or(0);
        state.maps.entry(MapId::Positions).or_default().insert(
            vec![ScalarKey::Subnet(netuid), ScalarKey::Index(index)],
            RawValue(serde_json::json!({
                "liquidity": liquidity,
                "tick_low": tick_low,
                "tick_high": tick_high,
            })),
        );

        let tao_total = Self::read_u64(&state, MapId::SubnetTao, &subnet_key);
        Self::write_u64(&mut state, MapId::SubnetTao, subnet_key.clone(), tao_total + tao.round() as u64);
        let alpha_total = Self::read_u64(&state, MapId::SubnetAlphaIn, &subnet_key);
        Self::write_u64(&mut state, MapId::SubnetAlphaIn, subnet_key, alpha_total + alpha.round() as u64);
    }

    /// Write a parent's child set and mirror it into the reverse table.
    pub fn seed_children(&self, parent: AccountId, netuid: u16, children: &[(u64, AccountId)]) {
        let mut state = self.state.write().unwrap();
        Self::apply_children(&mut state, parent, netuid, children);
    }

    fn apply_children(state: &mut State, parent: AccountId, netuid: u16, children: &[(u64, AccountId)]) {
        let parent_key = vec![ScalarKey::Account(parent), ScalarKey::Subnet(netuid)];

        // Unlink the previous children from the reverse table first.
        let previous = state
            .maps
            .get(&MapId::ChildKeys)
            .and_then(|entries| entries.get(&parent_key))
            .and_then(|v| v.pairs().ok())
            .unwrap_or_default();
        for (_, child) in previous {
            let child_key = vec![ScalarKey::Account(child), ScalarKey::Subnet(netuid)];
            if let Some(value) = state
                .maps
                .get(&MapId::ParentKeys)
                .and_then(|entries| entries.get(&child_key))
            {
                let mut parents = value.pairs().unwrap_or_default();
                parents.retain(|(_, p)| *p != parent);
                state
                    .maps
                    .entry(MapId::ParentKeys)
                    .or_default()
                    .insert(child_key, pairs_value(&parents));
            }
        }

        state
            .maps
            .entry(MapId::ChildKeys)
            .or_default()
            .insert(parent_key, pairs_value(children));

        for (proportion, child) in children {
            let child_key = vec![ScalarKey::Account(*child), ScalarKey::Subnet(netuid)];
            let mut parents = state
                .maps
                .get(&MapId::ParentKeys)
                .and_then(|entries| entries.get(&child_key))
                .and_then(|v| v.pairs().ok())
                .unwrap_or_default();
            parents.retain(|(_, p)| *p != parent);
            parents.push((*proportion, parent));
            state
                .maps
                .entry(MapId::ParentKeys)
                .or_default()
                .insert(child_key, pairs_value(&parents));
        }
    }

    // -- fault hooks --------------------------------------------------------

    /// Fail page fetches for `map` once the cursor reaches `offset`.
    pub fn fail_scan_at(&self, map: MapId, offset: u64) {
        self.state.write().unwrap().fail_scan = Some((map, offset));
    }

    pub fn clear_scan_fault(&self) {
        self.state.write().unwrap().fail_scan = None;
    }

    /// Reject the next submitted operation with a structured reason.
    pub fn reject_next_submit(&self, module: &str, code: u32, reason: &str) {
        self.state.write().unwrap().forced_reject =
            Some((module.to_string(), code, reason.to_string()));
    }
}

fn pairs_value(pairs: &[(u64, AccountId)]) -> RawValue {
    let entries: Vec<serde_json::Value> = pairs
        .iter()
        .map(|(proportion, account)| serde_json::json!([proportion, account.to_string()]))
        .collect();
    RawValue(serde_json::Value::Array(entries))
}

#[async_trait]
impl LedgerQuery for MemoryLedger {
    async fn read_field(&self, map: MapId, key: &[ScalarKey]) -> Result<Option<RawValue>, QueryError> {
        let state = self.state.read().unwrap();
        Ok(state.maps.get(&map).and_then(|entries| entries.get(key)).cloned())
    }

    async fn scan_page(
        &self,
        map: MapId,
        prefix: &[ScalarKey],
        cursor: Option<Cursor>,
        page_size: usize,
    ) -> Result<Page, QueryError> {
        let state = self.state.read().unwrap();
        let offset = cursor.map(|c| c.0).unwrap_or(0);

        if let Some((fail_map, fail_offset)) = state.fail_scan {
            if fail_map == map && offset >= fail_offset {
                return Err(QueryError::PageFetch {
                    map: map.name(),
                    reason: "injected fault".to_string(),
                });
            }
        }

        let matching: Vec<(KeyTuple, RawValue)> = state
            .maps
            .get(&map)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(key, _)| key.starts_with(prefix))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let end = (offset as usize + page_size).min(matching.len());
        let entries = matching
            .get(offset as usize..end)
            .unwrap_or(&[])
            .to_vec();
        let next = if end < matching.len() {
            Some(Cursor(end as u64))
        } else {
            None
        };
        Ok(Page { entries, next })
    }
}

#[async_trait]
impl LedgerMutation for MemoryLedger {
    async fn submit(&self, op: Operation, signer: &AccountId) -> Result<SubmitReceipt, MutationError> {
        let mut state = self.state.write().unwrap();

        if let Some((module, code, reason)) = state.forced_reject.take() {
            return Err(MutationError::Rejected { module, code, reason });
        }

        let receipt_amount = match &op {
            Operation::AddStake { hotkey, netuid, amount } => {
                let uid_key = vec![ScalarKey::Subnet(*netuid), ScalarKey::Account(*hotkey)];
                if !state
                    .maps
                    .get(&MapId::Uids)
                    .map(|entries| entries.contains_key(&uid_key))
                    .unwrap_or(false)
                {
                    return Err(MutationError::Rejected {
                        module: "Stake".to_string(),
                        code: 1,
                        reason: "hotkey not registered on subnet".to_string(),
                    });
                }
                Self::apply_stake(&mut state, *hotkey, *signer, *netuid, *amount);
                Some(*amount)
            }
            Operation::RemoveStake { hotkey, netuid, amount } => {
                let hk_net = vec![ScalarKey::Account(*hotkey), ScalarKey::Subnet(*netuid)];
                let share_key = vec![
                    ScalarKey::Account(*hotkey),
                    ScalarKey::Account(*signer),
                    ScalarKey::Subnet(*netuid),
                ];
                let subnet_key = vec![ScalarKey::Subnet(*netuid)];

                let total_shares = Self::read_bits(&state, MapId::TotalHotkeyShares, &hk_net);
                let total_alpha = Self::read_u64(&state, MapId::TotalHotkeyAlpha, &hk_net);
                let shares = Self::read_bits(&state, MapId::Alpha, &share_key);
                if total_shares.is_zero() || total_alpha == 0 {
                    return Err(MutationError::Rejected {
                        module: "Stake".to_string(),
                        code: 2,
                        reason: "no stake to remove".to_string(),
                    });
                }
                let holder_alpha =
                    (shares * U256::from(total_alpha) / total_shares).as_u128() as u64;
                if *amount > holder_alpha {
                    return Err(MutationError::Rejected {
                        module: "Stake".to_string(),
                        code: 2,
                        reason: format!("insufficient stake: have {}, want {}", holder_alpha, amount),
                    });
                }

                let shares_removed = U256::from(*amount) * total_shares / U256::from(total_alpha);
                Self::write_bits(&mut state, MapId::Alpha, share_key, shares - shares_removed);
                Self::write_bits(
                    &mut state,
                    MapId::TotalHotkeyShares,
                    hk_net.clone(),
                    total_shares - shares_removed,
                );
                Self::write_u64(&mut state, MapId::TotalHotkeyAlpha, hk_net, total_alpha - amount);
                let out = Self::read_u64(&state, MapId::SubnetAlphaOut, &subnet_key);
                Self::write_u64(&mut state, MapId::SubnetAlphaOut, subnet_key, out - amount);
                Some(*amount)
            }
            Operation::SetChildren { hotkey, netuid, children } => {
                let total: u128 = children.iter().map(|(p, _)| *p as u128).sum();
                if total == 0 || total > PROPORTION_SCALE as u128 {
                    return Err(MutationError::Rejected {
                        module: "Children".to_string(),
                        code: 3,
                        reason: format!("proportion sum {} out of range", total),
                    });
                }
                if children.iter().any(|(_, child)| child == hotkey) {
                    return Err(MutationError::Rejected {
                        module: "Children".to_string(),
                        code: 4,
                        reason: "self-delegation".to_string(),
                    });
                }
                Self::apply_children(&mut state, *hotkey, *netuid, children);
                None
            }
        };

        state.block += 1;
        Ok(SubmitReceipt {
            block: state.block,
            amount: receipt_amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actors() -> (AccountId, AccountId) {
        (AccountId::from_byte(1), AccountId::from_byte(2))
    }

    #[tokio::test]
    async fn read_field_distinguishes_missing_from_zero() {
        let ledger = MemoryLedger::new();
        ledger.add_subnet(1, 64);
        let zero = ledger
            .read_field(MapId::SubnetAlphaOut, &[ScalarKey::Subnet(1)])
            .await
            .unwrap();
        assert_eq!(zero.unwrap().uint().unwrap(), 0);
        let missing = ledger
            .read_field(MapId::SubnetAlphaOut, &[ScalarKey::Subnet(9)])
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn staking_updates_all_four_maps() {
        let (hotkey, coldkey) = actors();
        let ledger = MemoryLedger::new();
        ledger.add_subnet(1, 64);
        ledger.register(1, hotkey);

        ledger
            .submit(Operation::AddStake { hotkey, netuid: 1, amount: 1_000 }, &coldkey)
            .await
            .unwrap();

        let hk_net = [ScalarKey::Account(hotkey), ScalarKey::Subnet(1)];
        let alpha = ledger
            .read_field(MapId::TotalHotkeyAlpha, &hk_net)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alpha.uint().unwrap(), 1_000);
        let shares = ledger
            .read_field(MapId::TotalHotkeyShares, &hk_net)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shares.bits().unwrap(), U256::from(1_000u64) << 64);
    }

    #[tokio::test]
    async fn removing_more_than_held_is_rejected() {
        let (hotkey, coldkey) = actors();
        let ledger = MemoryLedger::new();
        ledger.add_subnet(1, 64);
        ledger.register(1, hotkey);
        ledger.seed_stake(hotkey, coldkey, 1, 500);

        let err = ledger
            .submit(Operation::RemoveStake { hotkey, netuid: 1, amount: 501 }, &coldkey)
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::Rejected { code: 2, .. }));
    }

    #[tokio::test]
    async fn set_children_mirrors_the_reverse_table() {
        let (parent, child) = actors();
        let ledger = MemoryLedger::new();
        ledger.add_subnet(1, 64);
        ledger.register(1, parent);
        ledger.register(1, child);

        ledger
            .submit(
                Operation::SetChildren {
                    hotkey: parent,
                    netuid: 1,
                    children: vec![(1_000, child)],
                },
                &parent,
            )
            .await
            .unwrap();

        let parents = ledger
            .read_field(MapId::ParentKeys, &[ScalarKey::Account(child), ScalarKey::Subnet(1)])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parents.pairs().unwrap(), vec![(1_000, parent)]);
    }

    #[tokio::test]
    async fn scan_fault_hook_fires_at_the_configured_offset() {
        let ledger = MemoryLedger::new();
        ledger.add_subnet(1, 64);
        for tag in 0..10 {
            ledger.register(1, AccountId::from_byte(tag));
        }
        ledger.fail_scan_at(MapId::Uids, 4);

        let first = ledger.scan_page(MapId::Uids, &[], None, 4).await.unwrap();
        assert_eq!(first.entries.len(), 4);
        let err = ledger
            .scan_page(MapId::Uids, &[], first.next, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::PageFetch { .. }));
    }
}
