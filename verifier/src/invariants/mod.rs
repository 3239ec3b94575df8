//! Invariant verification engine.
//!
//! A rule is a named, stateless check over ledger storage that returns every
//! violation it finds. Violations are diagnostic data, not errors, and a
//! rule never stops at the first hit. Only infrastructure failures (a failed
//! scan, a malformed value) abort a rule. The engine is an explicit registry:
//! rules are registered at startup, nothing is discovered by convention.

pub mod bijection;
pub mod bounds;
pub mod conservation;
pub mod delegation;
pub mod liquidity;

use crate::client::{format_keys, AccountId, LedgerQuery, MapId, QueryError, ScalarKey};
use crate::config::ToleranceConfig;
use crate::scanner::{collect_map, ScanError};
use async_trait::async_trait;
use log::{debug, error, warn};
use plexus_common::fixed_point::DecodeError;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// One failed check. Several may come out of a single rule invocation.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub rule: &'static str,
    pub message: String,
    /// Keys identifying the offending entries.
    pub keys: Vec<ScalarKey>,
}

impl Violation {
    pub fn new(rule: &'static str, keys: Vec<ScalarKey>, message: impl Into<String>) -> Self {
        Self {
            rule,
            message: message.into(),
            keys,
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.keys.is_empty() {
            write!(f, "[{}] {}", self.rule, self.message)
        } else {
            write!(f, "[{}] ({}) {}", self.rule, format_keys(&self.keys), self.message)
        }
    }
}

/// Infrastructure failure while running a rule. Violations never travel this
/// path.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("arithmetic overflow: {0}")]
    Overflow(String),
}

#[async_trait]
pub trait InvariantRule: Send + Sync {
    fn id(&self) -> &'static str;

    /// Run the check against current storage. Returns every violation found;
    /// an empty list means the rule passed.
    async fn check(
        &self,
        ledger: &dyn LedgerQuery,
        tolerance: &ToleranceConfig,
    ) -> Result<Vec<Violation>, RuleError>;
}

/// Result of one rule invocation inside a report.
#[derive(Debug, Serialize)]
pub struct RuleOutcome {
    pub rule: &'static str,
    pub violations: Vec<Violation>,
    /// Set when the rule aborted on an infrastructure failure.
    pub error: Option<String>,
}

impl RuleOutcome {
    pub fn passed(&self) -> bool {
        self.violations.is_empty() && self.error.is_none()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct InvariantReport {
    pub outcomes: Vec<RuleOutcome>,
}

impl InvariantReport {
    /// Aggregate verdict: every rule ran and produced zero violations.
    /// A partial run is never reported as a pass.
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed())
    }

    pub fn violation_count(&self) -> usize {
        self.outcomes.iter().map(|o| o.violations.len()).sum()
    }
}

#[derive(Default)]
pub struct InvariantEngine {
    rules: Vec<Arc<dyn InvariantRule>>,
}

impl InvariantEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, rule: Arc<dyn InvariantRule>) {
        self.rules.push(rule);
    }

    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    async fn run_one(
        rule: &Arc<dyn InvariantRule>,
        ledger: &dyn LedgerQuery,
        tolerance: &ToleranceConfig,
    ) -> RuleOutcome {
        debug!("running invariant rule {}", rule.id());
        match rule.check(ledger, tolerance).await {
            Ok(violations) => {
                for violation in &violations {
                    warn!("{}", violation);
                }
                if violations.is_empty() {
                    debug!("rule {} passed", rule.id());
                }
                RuleOutcome {
                    rule: rule.id(),
                    violations,
                    error: None,
                }
            }
            Err(err) => {
                error!("rule {} aborted: {}", rule.id(), err);
                RuleOutcome {
                    rule: rule.id(),
                    violations: Vec::new(),
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Run every registered rule in order.
    pub async fn run_all(
        &self,
        ledger: &dyn LedgerQuery,
        tolerance: &ToleranceConfig,
    ) -> InvariantReport {
        let mut report = InvariantReport::default();
        for rule in &self.rules {
            report.outcomes.push(Self::run_one(rule, ledger, tolerance).await);
        }
        report
    }

    /// Run every registered rule concurrently. Rules are independent of each
    /// other; each rule's internal accumulation stays sequential.
    pub async fn run_all_concurrent(
        &self,
        ledger: &dyn LedgerQuery,
        tolerance: &ToleranceConfig,
    ) -> InvariantReport {
        let outcomes = futures::future::join_all(
            self.rules
                .iter()
                .map(|rule| Self::run_one(rule, ledger, tolerance)),
        )
        .await;
        InvariantReport { outcomes }
    }
}

/// Page size used by full-map scans inside rules.
pub(crate) const SCAN_PAGE_SIZE: usize = 256;

/// All subnets with a registered uid counter.
pub(crate) async fn subnet_ids(ledger: &dyn LedgerQuery) -> Result<Vec<u16>, RuleError> {
    let entries = collect_map(ledger, MapId::SubnetworkN, &[], SCAN_PAGE_SIZE).await?;
    Ok(entries
        .iter()
        .filter_map(|(key, _)| key_subnet(key, 0))
        .collect())
}

pub(crate) fn key_subnet(key: &[ScalarKey], pos: usize) -> Option<u16> {
    match key.get(pos) {
        Some(ScalarKey::Subnet(netuid)) => Some(*netuid),
        _ => None,
    }
}

pub(crate) fn key_account(key: &[ScalarKey], pos: usize) -> Option<AccountId> {
    match key.get(pos) {
        Some(ScalarKey::Account(account)) => Some(*account),
        _ => None,
    }
}

pub(crate) fn key_index(key: &[ScalarKey], pos: usize) -> Option<u64> {
    match key.get(pos) {
        Some(ScalarKey::Index(idx)) => Some(*idx),
        _ => None,
    }
}

/// Engine with the full rule catalog registered.
pub fn default_engine() -> InvariantEngine {
    let mut engine = InvariantEngine::new();
    engine.register(Arc::new(bijection::UidKeyBijection));
    engine.register(Arc::new(conservation::HotkeyShareConservation));
    engine.register(Arc::new(conservation::SubnetStakeConservation));
    engine.register(Arc::new(delegation::DelegationGraph));
    engine.register(Arc::new(bounds::UidCountBound));
    engine.register(Arc::new(liquidity::LiquidityReserves));
    engine
}
