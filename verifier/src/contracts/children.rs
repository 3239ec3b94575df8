//! Child delegation contract.
//!
//! `set_children` rewrites the actor's child set on a subnet with a sampled
//! child and proportion, then verifies both sides of the relation: the
//! forward table holds exactly the new set, the reverse table gained the new
//! edge, and edges to replaced children are gone from the reverse table.

use super::{
    param_account, param_subnet, param_uint, ActionOutput, ChosenParams, ChosenValue, Contract,
    ParameterDescriptor,
};
use crate::client::{
    AccountId, LedgerMutation, LedgerQuery, MapId, Operation, ScalarKey, PROPORTION_SCALE,
};
use crate::config::TestActor;
use crate::invariants::SCAN_PAGE_SIZE;
use crate::scanner::collect_map;
use crate::snapshot::StorageSnapshot;
use anyhow::Context;
use async_trait::async_trait;

fn edge_key(account: AccountId, netuid: u16) -> Vec<ScalarKey> {
    vec![ScalarKey::Account(account), ScalarKey::Subnet(netuid)]
}

pub struct SetChildrenContract {
    actor: TestActor,
}

impl SetChildrenContract {
    pub fn new(actor: TestActor) -> Self {
        Self { actor }
    }

    async fn subnets_with_actor(&self, ledger: &dyn LedgerQuery) -> anyhow::Result<Vec<u16>> {
        let entries = collect_map(ledger, MapId::ActiveSubnets, &[], SCAN_PAGE_SIZE)
            .await
            .context("scanning ActiveSubnets")?;
        let mut netuids = Vec::new();
        for (key, _) in entries {
            let netuid = match key.first() {
                Some(ScalarKey::Subnet(netuid)) => *netuid,
                _ => continue,
            };
            let registered = ledger
                .read_field(
                    MapId::Uids,
                    &[ScalarKey::Subnet(netuid), ScalarKey::Account(self.actor.hotkey)],
                )
                .await?
                .is_some();
            if registered {
                netuids.push(netuid);
            }
        }
        Ok(netuids)
    }
}

#[async_trait]
impl Contract for SetChildrenContract {
    fn name(&self) -> &'static str {
        "set_children"
    }

    fn scope(&self) -> &'static str {
        "children"
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
                let netuids = self.subnets_with_actor(ledger).await?;
                Ok(ParameterDescriptor::list(
                    "netuid",
                    netuids.into_iter().map(ChosenValue::Subnet).collect(),
                ))
            }
            1 => {
                // any hotkey on the chosen subnet except the actor itself
                let netuid = param_subnet(chosen, "netuid")?;
                let entries =
                    collect_map(ledger, MapId::Uids, &[ScalarKey::Subnet(netuid)], SCAN_PAGE_SIZE)
                        .await
                        .context("scanning Uids")?;
                let children: Vec<ChosenValue> = entries
                    .iter()
                    .filter_map(|(key, _)| match key.get(1) {
                        Some(ScalarKey::Account(hotkey)) if *hotkey != self.actor.hotkey => {
                            Some(ChosenValue::Account(*hotkey))
                        }
                        _ => None,
                    })
                    .collect();
                Ok(ParameterDescriptor::list("child", children))
            }
            2 => Ok(ParameterDescriptor::range(
                "proportion",
                1,
                PROPORTION_SCALE as u128,
            )),
            _ => anyhow::bail!("set_children has no parameter {}", idx),
        }
    }

    async fn precondition(
        &self,
        params: &ChosenParams,
        ledger: &dyn LedgerQuery,
    ) -> anyhow::Result<StorageSnapshot> {
        let netuid = param_subnet(params, "netuid")?;
        let child = param_account(params, "child")?;
        StorageSnapshot::capture(
            ledger,
            &[
                (MapId::ChildKeys, edge_key(self.actor.hotkey, netuid)),
                (MapId::ParentKeys, edge_key(child, netuid)),
            ],
        )
        .await
        .context("capturing child tables")
    }

    async fn action(
        &self,
        params: &ChosenParams,
        ledger: &dyn LedgerMutation,
    ) -> anyhow::Result<ActionOutput> {
        let netuid = param_subnet(params, "netuid")?;
        let child = param_account(params, "child")?;
        let proportion = param_uint(params, "proportion")? as u64;
        let receipt = ledger
            .submit(
                Operation::SetChildren {
                    hotkey: self.actor.hotkey,
                    netuid,
                    children: vec![(proportion, child)],
                },
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
        let child = param_account(params, "child")?;
        let proportion = param_uint(params, "proportion")? as u64;

        // forward table holds exactly the new set
        let forward = ledger
            .read_field(MapId::ChildKeys, &edge_key(self.actor.hotkey, netuid))
            .await?
            .map(|v| v.pairs())
            .transpose()?
            .unwrap_or_default();
        if forward != vec![(proportion, child)] {
            log::warn!("ChildKeys holds {:?}, expected the new set", forward);
            return Ok(false);
        }

        // reverse table gained the new edge
        let reverse = ledger
            .read_field(MapId::ParentKeys, &edge_key(child, netuid))
            .await?
            .map(|v| v.pairs())
            .transpose()?
            .unwrap_or_default();
        if !reverse.contains(&(proportion, self.actor.hotkey)) {
            log::warn!("ParentKeys missing the new edge, holds {:?}", reverse);
            return Ok(false);
        }

        // replaced children no longer point back at the actor
        let previous = before
            .get(MapId::ChildKeys, &edge_key(self.actor.hotkey, netuid))
            .map(|v| v.pairs())
            .transpose()?
            .unwrap_or_default();
        for (_, old_child) in previous {
            if old_child == child {
                continue;
            }
            let links = ledger
                .read_field(MapId::ParentKeys, &edge_key(old_child, netuid))
                .await?
                .map(|v| v.pairs())
                .transpose()?
                .unwrap_or_default();
            if links.iter().any(|(_, parent)| *parent == self.actor.hotkey) {
                log::warn!("replaced child {:?} still links back", old_child);
                return Ok(false);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryLedger;
    use crate::contracts::runner::ContractRunner;
    use crate::contracts::Outcome;
    use plexus_common::Sampler;

    fn actor() -> TestActor {
        TestActor {
            name: "alice".to_string(),
            coldkey: AccountId::from_byte(1),
            hotkey: AccountId::from_byte(2),
        }
    }

    #[tokio::test]
    async fn rewriting_children_passes_and_replaces_old_edges() {
        let actor = actor();
        let ledger = MemoryLedger::new();
        ledger.add_subnet(1, 64);
        ledger.register(1, actor.hotkey);
        ledger.register(1, AccountId::from_byte(3));
        ledger.register(1, AccountId::from_byte(4));
        // a pre-existing child set that the contract must replace
        ledger.seed_children(actor.hotkey, 1, &[(500, AccountId::from_byte(4))]);

        let contract = SetChildrenContract::new(actor);
        let mut runner = ContractRunner::new(&ledger, &ledger, Sampler::with_seed(5));
        for _ in 0..8 {
            let run = runner.execute(&contract).await;
            assert!(run.outcome.is_passed(), "unexpected outcome: {:?}", run.outcome);
        }
    }

    #[tokio::test]
    async fn skips_when_the_actor_is_alone_on_the_subnet() {
        let actor = actor();
        let ledger = MemoryLedger::new();
        ledger.add_subnet(1, 64);
        ledger.register(1, actor.hotkey);

        let contract = SetChildrenContract::new(actor);
        let mut runner = ContractRunner::new(&ledger, &ledger, Sampler::with_seed(5));
        let run = runner.execute(&contract).await;
        assert!(matches!(run.outcome, Outcome::Skipped { .. }));
    }
}
