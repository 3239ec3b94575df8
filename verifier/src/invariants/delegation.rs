//! Delegation graph rules.
//!
//! Parent/child delegation is stored three times: `ChildKeys` (finalized,
//! parent -> children), `ParentKeys` (finalized, child -> parents) and
//! `PendingChildKeys` (scheduled, not yet finalized). Per subnet the merged
//! parent -> child relation must be acyclic, every parent's outgoing
//! proportions must sum within `(0, SCALE]`, and the two finalized tables
//! must mirror each other, checked as two one-way implications so a
//! violation names the side missing the edge.

use super::{key_account, key_subnet, InvariantRule, RuleError, Violation, SCAN_PAGE_SIZE};
use crate::client::{AccountId, KeyTuple, LedgerQuery, MapId, RawValue, ScalarKey, PROPORTION_SCALE};
use crate::config::ToleranceConfig;
use crate::scanner::collect_map;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

pub struct DelegationGraph;

const RULE: &str = "delegation_graph";

type EdgeList = Vec<(u64, AccountId)>;
type PerSubnet<T> = BTreeMap<u16, T>;

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Iterative three-color DFS. Returns one path per back-edge found, each
/// ending with a repeat of the node that closes the cycle.
fn find_cycles(adjacency: &BTreeMap<AccountId, BTreeSet<AccountId>>) -> Vec<Vec<AccountId>> {
    let mut color: BTreeMap<AccountId, Color> = BTreeMap::new();
    for (parent, children) in adjacency {
        color.insert(*parent, Color::White);
        for child in children {
            color.entry(*child).or_insert(Color::White);
        }
    }

    let nodes: Vec<AccountId> = color.keys().copied().collect();
    let mut cycles = Vec::new();

    for start in nodes {
        if color[&start] != Color::White {
            continue;
        }
        let mut stack: Vec<(AccountId, usize)> = vec![(start, 0)];
        let mut path = vec![start];
        color.insert(start, Color::Gray);

        while let Some(&(node, next_idx)) = stack.last() {
            let children: Vec<AccountId> = adjacency
                .get(&node)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            if next_idx < children.len() {
                stack.last_mut().unwrap().1 += 1;
                let child = children[next_idx];
                match color.get(&child).copied().unwrap_or(Color::White) {
                    Color::White => {
                        color.insert(child, Color::Gray);
                        stack.push((child, 0));
                        path.push(child);
                    }
                    Color::Gray => {
                        // back-edge, including self-loops
                        let pos = path.iter().position(|n| *n == child).unwrap_or(0);
                        let mut cycle = path[pos..].to_vec();
                        cycle.push(child);
                        cycles.push(cycle);
                    }
                    Color::Black => {}
                }
            } else {
                color.insert(node, Color::Black);
                stack.pop();
                path.pop();
            }
        }
    }

    cycles
}

fn format_cycle(cycle: &[AccountId]) -> String {
    cycle
        .iter()
        .map(|account| format!("{:?}", account))
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn group_edges(
    entries: Vec<(KeyTuple, RawValue)>,
    account_pos: usize,
    subnet_pos: usize,
) -> Result<PerSubnet<BTreeMap<AccountId, EdgeList>>, RuleError> {
    let mut out: PerSubnet<BTreeMap<AccountId, EdgeList>> = BTreeMap::new();
    for (key, value) in entries {
        let (account, netuid) = match (key_account(&key, account_pos), key_subnet(&key, subnet_pos)) {
            (Some(a), Some(n)) => (a, n),
            _ => continue,
        };
        out.entry(netuid).or_default().insert(account, value.pairs()?);
    }
    Ok(out)
}

fn check_proportion_sum(
    violations: &mut Vec<Violation>,
    table: &'static str,
    netuid: u16,
    parent: AccountId,
    edges: &EdgeList,
) {
    let total: u128 = edges.iter().map(|(p, _)| *p as u128).sum();
    if total == 0 || total > PROPORTION_SCALE as u128 {
        violations.push(Violation::new(
            RULE,
            vec![ScalarKey::Subnet(netuid), ScalarKey::Account(parent)],
            format!("{} proportion sum {} outside (0, {}]", table, total, PROPORTION_SCALE),
        ));
    }
}

#[async_trait]
impl InvariantRule for DelegationGraph {
    fn id(&self) -> &'static str {
        RULE
    }

    async fn check(
        &self,
        ledger: &dyn LedgerQuery,
        _tolerance: &ToleranceConfig,
    ) -> Result<Vec<Violation>, RuleError> {
        let mut violations = Vec::new();

        // (parent, netuid) and (child, netuid) keyed tables
        let children =
            group_edges(collect_map(ledger, MapId::ChildKeys, &[], SCAN_PAGE_SIZE).await?, 0, 1)?;
        let parents =
            group_edges(collect_map(ledger, MapId::ParentKeys, &[], SCAN_PAGE_SIZE).await?, 0, 1)?;

        // (netuid, parent) keyed, value {children, cooldown}
        let mut pending: PerSubnet<BTreeMap<AccountId, EdgeList>> = BTreeMap::new();
        for (key, value) in
            collect_map(ledger, MapId::PendingChildKeys, &[], SCAN_PAGE_SIZE).await?
        {
            let (netuid, parent) = match (key_subnet(&key, 0), key_account(&key, 1)) {
                (Some(n), Some(a)) => (n, a),
                _ => continue,
            };
            let scheduled = value
                .0
                .get("children")
                .cloned()
                .map(|raw| RawValue(raw).pairs())
                .transpose()?
                .unwrap_or_default();
            pending.entry(netuid).or_default().insert(parent, scheduled);
        }

        let netuids: BTreeSet<u16> = children
            .keys()
            .chain(parents.keys())
            .chain(pending.keys())
            .copied()
            .collect();

        for netuid in netuids {
            let empty = BTreeMap::new();
            let finalized = children.get(&netuid).unwrap_or(&empty);
            let reverse = parents.get(&netuid).unwrap_or(&empty);
            let scheduled = pending.get(&netuid).unwrap_or(&empty);

            // proportion bounds, per source table
            for (parent, edges) in finalized {
                check_proportion_sum(&mut violations, "ChildKeys", netuid, *parent, edges);
            }
            for (parent, edges) in scheduled {
                check_proportion_sum(&mut violations, "PendingChildKeys", netuid, *parent, edges);
            }

            // merged adjacency for cycle detection, scheduled edges included
            let mut adjacency: BTreeMap<AccountId, BTreeSet<AccountId>> = BTreeMap::new();
            for (parent, edges) in finalized.iter().chain(scheduled.iter()) {
                let set = adjacency.entry(*parent).or_default();
                set.extend(edges.iter().map(|(_, child)| *child));
            }
            for cycle in find_cycles(&adjacency) {
                violations.push(Violation::new(
                    RULE,
                    vec![ScalarKey::Subnet(netuid)],
                    format!("delegation cycle: {}", format_cycle(&cycle)),
                ));
            }

            // finalized tables must mirror each other, one implication per
            // direction so the message names the missing side
            for (parent, edges) in finalized {
                for (proportion, child) in edges {
                    let mirrored = reverse
                        .get(child)
                        .map(|links| links.contains(&(*proportion, *parent)))
                        .unwrap_or(false);
                    if !mirrored {
                        violations.push(Violation::new(
                            RULE,
                            vec![
                                ScalarKey::Subnet(netuid),
                                ScalarKey::Account(*parent),
                                ScalarKey::Account(*child),
                            ],
                            format!(
                                "edge {:?} -> {:?} in ChildKeys has no matching ParentKeys entry",
                                parent, child
                            ),
                        ));
                    }
                }
            }
            for (child, links) in reverse {
                for (proportion, parent) in links {
                    let mirrored = finalized
                        .get(parent)
                        .map(|edges| edges.contains(&(*proportion, *child)))
                        .unwrap_or(false);
                    if !mirrored {
                        violations.push(Violation::new(
                            RULE,
                            vec![
                                ScalarKey::Subnet(netuid),
                                ScalarKey::Account(*parent),
                                ScalarKey::Account(*child),
                            ],
                            format!(
                                "edge {:?} -> {:?} in ParentKeys has no matching ChildKeys entry",
                                parent, child
                            ),
                        ));
                    }
                }
            }
        }

        Ok(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryLedger;

    fn hk(tag: u8) -> AccountId {
        AccountId::from_byte(tag)
    }

    async fn run(ledger: &MemoryLedger) -> Vec<Violation> {
        DelegationGraph
            .check(ledger, &ToleranceConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn chain_without_cycles_passes() {
        let ledger = MemoryLedger::new();
        ledger.add_subnet(1, 64);
        // A -> B -> C
        ledger.seed_children(hk(1), 1, &[(1_000, hk(2))]);
        ledger.seed_children(hk(2), 1, &[(1_000, hk(3))]);
        assert!(run(&ledger).await.is_empty());
    }

    #[tokio::test]
    async fn two_node_cycle_is_exactly_one_violation() {
        let ledger = MemoryLedger::new();
        ledger.add_subnet(1, 64);
        ledger.seed_children(hk(1), 1, &[(1_000, hk(2))]);
        ledger.seed_children(hk(2), 1, &[(1_000, hk(1))]);

        let violations = run(&ledger).await;
        let cycles: Vec<_> = violations
            .iter()
            .filter(|v| v.message.contains("cycle"))
            .collect();
        assert_eq!(cycles.len(), 1);
    }

    #[tokio::test]
    async fn self_loop_is_exactly_one_violation_naming_the_node() {
        let node = hk(7);
        let ledger = MemoryLedger::new();
        ledger.add_subnet(1, 64);
        // bypass the mutation guard: write the self-edge directly
        ledger.set_raw(
            MapId::ChildKeys,
            vec![ScalarKey::Account(node), ScalarKey::Subnet(1)],
            serde_json::json!([[1_000, node.to_string()]]),
        );
        ledger.set_raw(
            MapId::ParentKeys,
            vec![ScalarKey::Account(node), ScalarKey::Subnet(1)],
            serde_json::json!([[1_000, node.to_string()]]),
        );

        let violations = run(&ledger).await;
        let cycles: Vec<_> = violations
            .iter()
            .filter(|v| v.message.contains("cycle"))
            .collect();
        assert_eq!(cycles.len(), 1);
        assert!(cycles[0].message.contains(&format!("{:?}", node)));
    }

    #[tokio::test]
    async fn pending_edges_participate_in_cycle_detection() {
        let ledger = MemoryLedger::new();
        ledger.add_subnet(1, 64);
        ledger.seed_children(hk(1), 1, &[(1_000, hk(2))]);
        // scheduled, not yet finalized: B -> A
        ledger.set_raw(
            MapId::PendingChildKeys,
            vec![ScalarKey::Subnet(1), ScalarKey::Account(hk(2))],
            serde_json::json!({
                "children": [[1_000, hk(1).to_string()]],
                "cooldown": 100,
            }),
        );

        let violations = run(&ledger).await;
        assert!(violations.iter().any(|v| v.message.contains("cycle")));
    }

    #[tokio::test]
    async fn zero_and_overflowing_proportions_are_reported() {
        let ledger = MemoryLedger::new();
        ledger.add_subnet(1, 64);
        ledger.set_raw(
            MapId::ChildKeys,
            vec![ScalarKey::Account(hk(1)), ScalarKey::Subnet(1)],
            serde_json::json!([[0, hk(2).to_string()]]),
        );
        ledger.set_raw(
            MapId::ChildKeys,
            vec![ScalarKey::Account(hk(3)), ScalarKey::Subnet(1)],
            serde_json::json!([[u64::MAX, hk(4).to_string()], [1, hk(5).to_string()]]),
        );

        let violations = run(&ledger).await;
        let sums: Vec<_> = violations
            .iter()
            .filter(|v| v.message.contains("proportion sum"))
            .collect();
        assert_eq!(sums.len(), 2);
    }

    #[tokio::test]
    async fn one_sided_edges_name_the_missing_side() {
        let ledger = MemoryLedger::new();
        ledger.add_subnet(1, 64);
        // forward edge with no reverse entry
        ledger.set_raw(
            MapId::ChildKeys,
            vec![ScalarKey::Account(hk(1)), ScalarKey::Subnet(1)],
            serde_json::json!([[1_000, hk(2).to_string()]]),
        );
        // reverse edge with no forward entry
        ledger.set_raw(
            MapId::ParentKeys,
            vec![ScalarKey::Account(hk(5)), ScalarKey::Subnet(1)],
            serde_json::json!([[500, hk(6).to_string()]]),
        );

        let violations = run(&ledger).await;
        assert!(violations
            .iter()
            .any(|v| v.message.contains("no matching ParentKeys")));
        assert!(violations
            .iter()
            .any(|v| v.message.contains("no matching ChildKeys")));
    }
}
