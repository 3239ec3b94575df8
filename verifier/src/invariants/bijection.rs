//! Uid/hotkey bijection.
//!
//! Per subnet, `Uids: (netuid, hotkey) -> uid` and `Keys: (netuid, uid) ->
//! hotkey` must be mutual inverses over exactly `SubnetworkN(netuid)`
//! entries. Every mismatch is reported individually: cardinality on each
//! side, duplicate values, set equality between one side's values and the
//! other side's keys, then point-wise inversion in both directions.

use super::{key_account, key_index, subnet_ids, InvariantRule, RuleError, Violation, SCAN_PAGE_SIZE};
use crate::client::{AccountId, LedgerQuery, MapId, ScalarKey};
use crate::config::ToleranceConfig;
use crate::scanner::collect_map;
use async_trait::async_trait;
use std::collections::BTreeMap;

pub struct UidKeyBijection;

const RULE: &str = "uid_key_bijection";

#[async_trait]
impl InvariantRule for UidKeyBijection {
    fn id(&self) -> &'static str {
        RULE
    }

    async fn check(
        &self,
        ledger: &dyn LedgerQuery,
        _tolerance: &ToleranceConfig,
    ) -> Result<Vec<Violation>, RuleError> {
        let mut violations = Vec::new();

        for netuid in subnet_ids(ledger).await? {
            let subnet = ScalarKey::Subnet(netuid);
            let expected = ledger
                .read_field(MapId::SubnetworkN, &[subnet])
                .await?
                .map(|v| v.uint())
                .transpose()?
                .unwrap_or(0) as usize;

            // hotkey -> uid
            let mut forward: BTreeMap<AccountId, u64> = BTreeMap::new();
            for (key, value) in collect_map(ledger, MapId::Uids, &[subnet], SCAN_PAGE_SIZE).await? {
                let hotkey = key_account(&key, 1).ok_or(RuleError::Decode(
                    plexus_common::fixed_point::DecodeError::Shape {
                        expected: "(netuid, hotkey) key in Uids",
                    },
                ))?;
                forward.insert(hotkey, value.uint()? as u64);
            }

            // uid -> hotkey
            let mut reverse: BTreeMap<u64, AccountId> = BTreeMap::new();
            for (key, value) in collect_map(ledger, MapId::Keys, &[subnet], SCAN_PAGE_SIZE).await? {
                let uid = key_index(&key, 1).ok_or(RuleError::Decode(
                    plexus_common::fixed_point::DecodeError::Shape {
                        expected: "(netuid, uid) key in Keys",
                    },
                ))?;
                reverse.insert(uid, value.account()?);
            }

            if forward.len() != expected {
                violations.push(Violation::new(
                    RULE,
                    vec![subnet],
                    format!("Uids holds {} entries, SubnetworkN says {}", forward.len(), expected),
                ));
            }
            if reverse.len() != expected {
                violations.push(Violation::new(
                    RULE,
                    vec![subnet],
                    format!("Keys holds {} entries, SubnetworkN says {}", reverse.len(), expected),
                ));
            }

            // duplicate values on either side
            let mut uid_owners: BTreeMap<u64, Vec<AccountId>> = BTreeMap::new();
            for (hotkey, uid) in &forward {
                uid_owners.entry(*uid).or_default().push(*hotkey);
            }
            for (uid, owners) in &uid_owners {
                if owners.len() > 1 {
                    violations.push(Violation::new(
                        RULE,
                        vec![subnet, ScalarKey::Index(*uid)],
                        format!("uid {} assigned to {} hotkeys", uid, owners.len()),
                    ));
                }
            }
            let mut hotkey_uids: BTreeMap<AccountId, Vec<u64>> = BTreeMap::new();
            for (uid, hotkey) in &reverse {
                hotkey_uids.entry(*hotkey).or_default().push(*uid);
            }
            for (hotkey, uids) in &hotkey_uids {
                if uids.len() > 1 {
                    violations.push(Violation::new(
                        RULE,
                        vec![subnet, ScalarKey::Account(*hotkey)],
                        format!("hotkey mapped from {} uids", uids.len()),
                    ));
                }
            }

            // value-set of one side must equal the key-set of the other
            for uid in uid_owners.keys() {
                if !reverse.contains_key(uid) {
                    violations.push(Violation::new(
                        RULE,
                        vec![subnet, ScalarKey::Index(*uid)],
                        format!("uid {} present in Uids values but absent from Keys", uid),
                    ));
                }
            }
            for uid in reverse.keys() {
                if !uid_owners.contains_key(uid) {
                    violations.push(Violation::new(
                        RULE,
                        vec![subnet, ScalarKey::Index(*uid)],
                        format!("uid {} present in Keys but absent from Uids values", uid),
                    ));
                }
            }

            // point-wise inversion, both directions
            for (hotkey, uid) in &forward {
                match reverse.get(uid) {
                    Some(mapped) if mapped == hotkey => {}
                    Some(mapped) => violations.push(Violation::new(
                        RULE,
                        vec![subnet, ScalarKey::Account(*hotkey)],
                        format!("Uids says uid {}, but Keys[{}] is {:?}", uid, uid, mapped),
                    )),
                    None => {} // already reported by the set check
                }
            }
            for (uid, hotkey) in &reverse {
                match forward.get(hotkey) {
                    Some(mapped) if mapped == uid => {}
                    Some(mapped) => violations.push(Violation::new(
                        RULE,
                        vec![subnet, ScalarKey::Index(*uid)],
                        format!("Keys says hotkey {:?}, but Uids maps it to uid {}", hotkey, mapped),
                    )),
                    None => violations.push(Violation::new(
                        RULE,
                        vec![subnet, ScalarKey::Index(*uid)],
                        format!("hotkey {:?} from Keys has no Uids entry", hotkey),
                    )),
                }
            }
        }

        Ok(violations)
    }
}
