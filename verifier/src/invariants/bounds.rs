//! Bound rules.
//!
//! A subnet's registered uid count must not exceed its configured ceiling.
//! Every subnet is checked even after the first hit.

use super::{subnet_ids, InvariantRule, RuleError, Violation};
use crate::client::{LedgerQuery, MapId, ScalarKey};
use crate::config::ToleranceConfig;
use async_trait::async_trait;

pub struct UidCountBound;

const RULE: &str = "uid_count_bound";

#[async_trait]
impl InvariantRule for UidCountBound {
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
            let count = ledger
                .read_field(MapId::SubnetworkN, &[subnet])
                .await?
                .map(|v| v.uint())
                .transpose()?
                .unwrap_or(0);
            let ceiling = ledger
                .read_field(MapId::MaxAllowedUids, &[subnet])
                .await?
                .map(|v| v.uint())
                .transpose()?;

            match ceiling {
                None => violations.push(Violation::new(
                    RULE,
                    vec![subnet],
                    "no configured MaxAllowedUids",
                )),
                Some(max) if count > max => violations.push(Violation::new(
                    RULE,
                    vec![subnet],
                    format!("{} uids registered, maximum is {}", count, max),
                )),
                Some(_) => {}
            }
        }

        Ok(violations)
    }
}
