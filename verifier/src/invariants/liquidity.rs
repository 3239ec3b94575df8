//! Liquidity reserve conservation.
//!
//! Each subnet's swap pool holds range-bound positions described by a
//! liquidity magnitude and a [low, high] tick pair. Ticks convert to sqrt
//! prices via `1.0001^(tick/2)`; a position's implied reserve contribution
//! uses the current sqrt price clamped into its range; the clamp is what
//! keeps the closed-form formulas correct for out-of-range positions:
//!
//! ```text
//! tao   = L * (sqrt_clamped - sqrt_low)
//! alpha = L * (1/sqrt_clamped - 1/sqrt_high)
//! ```
//!
//! Per-subnet sums are compared against the stored reserves under relative
//! tolerance. This is the only rule in the catalog that computes in floating
//! point; the tolerance is configuration, not a constant.

use super::{key_subnet, InvariantRule, RuleError, Violation, SCAN_PAGE_SIZE};
use crate::client::{LedgerQuery, MapId, ScalarKey};
use crate::config::ToleranceConfig;
use crate::scanner::collect_map;
use async_trait::async_trait;
use plexus_common::fixed_point::{decode_approx, DecodeError, U64F64};
use plexus_common::tolerance::approx_eq_rel_f64;
use serde::Deserialize;
use std::collections::BTreeMap;

pub struct LiquidityReserves;

const RULE: &str = "liquidity_reserves";

#[derive(Debug, Deserialize)]
struct Position {
    liquidity: u64,
    tick_low: i64,
    tick_high: i64,
}

fn tick_to_sqrt_price(tick: i64) -> f64 {
    1.0001f64.powf(tick as f64 / 2.0)
}

#[async_trait]
impl InvariantRule for LiquidityReserves {
    fn id(&self) -> &'static str {
        RULE
    }

    async fn check(
        &self,
        ledger: &dyn LedgerQuery,
        tolerance: &ToleranceConfig,
    ) -> Result<Vec<Violation>, RuleError> {
        let mut violations = Vec::new();

        let mut sqrt_prices: BTreeMap<u16, f64> = BTreeMap::new();
        for (key, value) in
            collect_map(ledger, MapId::AlphaSqrtPrice, &[], SCAN_PAGE_SIZE).await?
        {
            if let Some(netuid) = key_subnet(&key, 0) {
                sqrt_prices.insert(netuid, decode_approx(value.bits()?, U64F64)?);
            }
        }

        let mut positions: BTreeMap<u16, Vec<(ScalarKey, Position)>> = BTreeMap::new();
        for (key, value) in collect_map(ledger, MapId::Positions, &[], SCAN_PAGE_SIZE).await? {
            let netuid = match key_subnet(&key, 0) {
                Some(n) => n,
                None => continue,
            };
            let index = key.get(1).copied().unwrap_or(ScalarKey::Index(0));
            let position: Position = serde_json::from_value(value.0.clone())
                .map_err(|_| DecodeError::Shape { expected: "{liquidity, tick_low, tick_high}" })?;
            positions.entry(netuid).or_default().push((index, position));
        }

        for (netuid, subnet_positions) in &positions {
            let subnet = ScalarKey::Subnet(*netuid);
            let sqrt_cur = match sqrt_prices.get(netuid) {
                Some(price) => *price,
                None => {
                    violations.push(Violation::new(
                        RULE,
                        vec![subnet],
                        "positions exist but subnet has no sqrt price",
                    ));
                    continue;
                }
            };

            let mut implied_tao = 0f64;
            let mut implied_alpha = 0f64;
            let mut malformed = false;
            for (index, position) in subnet_positions {
                if position.tick_low >= position.tick_high {
                    violations.push(Violation::new(
                        RULE,
                        vec![subnet, *index],
                        format!(
                            "inverted tick range [{}, {}]",
                            position.tick_low, position.tick_high
                        ),
                    ));
                    malformed = true;
                    continue;
                }
                let sqrt_low = tick_to_sqrt_price(position.tick_low);
                let sqrt_high = tick_to_sqrt_price(position.tick_high);
                let clamped = sqrt_cur.clamp(sqrt_low, sqrt_high);
                implied_tao += position.liquidity as f64 * (clamped - sqrt_low);
                implied_alpha += position.liquidity as f64 * (1.0 / clamped - 1.0 / sqrt_high);
            }
            if malformed {
                // reserve totals cannot be meaningful with broken positions
                continue;
            }

            let stored_tao = ledger
                .read_field(MapId::SubnetTao, &[subnet])
                .await?
                .map(|v| v.uint())
                .transpose()?
                .unwrap_or(0) as f64;
            let stored_alpha = ledger
                .read_field(MapId::SubnetAlphaIn, &[subnet])
                .await?
                .map(|v| v.uint())
                .transpose()?
                .unwrap_or(0) as f64;

            if !approx_eq_rel_f64(implied_tao, stored_tao, tolerance.liquidity_rel_tol) {
                violations.push(Violation::new(
                    RULE,
                    vec![subnet],
                    format!(
                        "implied tao reserve {:.3} diverges from stored {:.3}",
                        implied_tao, stored_tao
                    ),
                ));
            }
            if !approx_eq_rel_f64(implied_alpha, stored_alpha, tolerance.liquidity_rel_tol) {
                violations.push(Violation::new(
                    RULE,
                    vec![subnet],
                    format!(
                        "implied alpha reserve {:.3} diverges from stored {:.3}",
                        implied_alpha, stored_alpha
                    ),
                ));
            }
        }

        Ok(violations)
    }
}
