//! Transactional contract framework.
//!
//! A contract models one ledger-mutating operation as a four-stage pipeline:
//! parameter description, precondition capture, action execution and
//! postcondition verification. Contracts are declarative: they own no ledger
//! state and reach the chain only through the injected query/mutation
//! interfaces. The runner (see [`runner`]) guarantees each stage executes at
//! most once and that a failure aborts the remaining stages.

pub mod children;
pub mod runner;
pub mod select;
pub mod stake;

use crate::client::{AccountId, LedgerMutation, LedgerQuery};
use crate::snapshot::StorageSnapshot;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// A value chosen for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChosenValue {
    Uint(u128),
    Subnet(u16),
    Account(AccountId),
}

impl fmt::Display for ChosenValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChosenValue::Uint(v) => write!(f, "{}", v),
            ChosenValue::Subnet(netuid) => write!(f, "{}", netuid),
            ChosenValue::Account(account) => write!(f, "{:?}", account),
        }
    }
}

/// How the next parameter may be chosen.
#[derive(Debug, Clone)]
pub enum ParameterKind {
    /// Uniform choice among legal values.
    List(Vec<ChosenValue>),
    /// Weighted choice among legal values.
    WeightedList(Vec<(f64, ChosenValue)>),
    /// Inclusive numeric range.
    Range { min: u128, max: u128 },
}

/// Descriptor for one parameter. Produced lazily and strictly in order:
/// later descriptors may depend on every previously chosen value.
#[derive(Debug, Clone)]
pub struct ParameterDescriptor {
    pub name: &'static str,
    pub kind: ParameterKind,
}

impl ParameterDescriptor {
    pub fn list(name: &'static str, values: Vec<ChosenValue>) -> Self {
        Self {
            name,
            kind: ParameterKind::List(values),
        }
    }

    pub fn range(name: &'static str, min: u128, max: u128) -> Self {
        Self {
            name,
            kind: ParameterKind::Range { min, max },
        }
    }
}

/// The finalized parameter set, in selection order.
pub type ChosenParams = Vec<(&'static str, ChosenValue)>;

pub fn format_params(params: &ChosenParams) -> String {
    params
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn param_uint(params: &ChosenParams, name: &str) -> anyhow::Result<u128> {
    match params.iter().find(|(n, _)| *n == name) {
        Some((_, ChosenValue::Uint(v))) => Ok(*v),
        other => anyhow::bail!("parameter {} missing or not numeric: {:?}", name, other),
    }
}

pub fn param_subnet(params: &ChosenParams, name: &str) -> anyhow::Result<u16> {
    match params.iter().find(|(n, _)| *n == name) {
        Some((_, ChosenValue::Subnet(netuid))) => Ok(*netuid),
        other => anyhow::bail!("parameter {} missing or not a subnet: {:?}", name, other),
    }
}

pub fn param_account(params: &ChosenParams, name: &str) -> anyhow::Result<AccountId> {
    match params.iter().find(|(n, _)| *n == name) {
        Some((_, ChosenValue::Account(account))) => Ok(*account),
        other => anyhow::bail!("parameter {} missing or not an account: {:?}", name, other),
    }
}

/// Opaque action result, commonly the submit receipt as JSON.
pub type ActionOutput = serde_json::Value;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    ParameterSelection,
    Precondition,
    Action,
    Postcondition,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ParameterSelection => "parameter_selection",
            Stage::Precondition => "precondition",
            Stage::Action => "action",
            Stage::Postcondition => "postcondition",
        };
        f.write_str(name)
    }
}

/// A stage failure wrapping the underlying cause.
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: anyhow::Error,
}

/// Terminal result of one contract run.
#[derive(Debug, Clone, Serialize)]
pub enum Outcome {
    Passed,
    /// No valid instance available right now, not a test failure.
    Skipped { reason: String },
    Failed { stage: Stage, message: String },
}

impl Outcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

/// Record of one executed contract. Created fresh per execution, never
/// reused.
#[derive(Debug, Serialize)]
pub struct ContractRun {
    pub contract: &'static str,
    pub scope: &'static str,
    pub params: ChosenParams,
    /// Precondition snapshot, retained for diagnostics even when a later
    /// stage fails.
    pub snapshot: Option<StorageSnapshot>,
    pub action: Option<ActionOutput>,
    pub outcome: Outcome,
    pub duration_ms: u64,
}

impl ContractRun {
    /// The failure as a typed stage error, `None` for passed or skipped runs.
    pub fn stage_error(&self) -> Option<StageError> {
        match &self.outcome {
            Outcome::Failed { stage, message } => Some(StageError {
                stage: *stage,
                source: anyhow::anyhow!(message.clone()),
            }),
            _ => None,
        }
    }

    /// Single-line rendering for the run journal.
    pub fn summary(&self) -> String {
        let params = format_params(&self.params);
        match &self.outcome {
            Outcome::Passed => format!("{} {} passed", self.contract, params),
            Outcome::Skipped { reason } => format!("{} skipped: {}", self.contract, reason),
            Outcome::Failed { stage, message } => {
                format!("{} {} failed at {}: {}", self.contract, params, stage, message)
            }
        }
    }
}

/// One ledger-mutating operation under test.
#[async_trait]
pub trait Contract: Send + Sync {
    fn name(&self) -> &'static str;

    /// Scope label for reporting, e.g. the pallet the operation lives in.
    fn scope(&self) -> &'static str;

    fn parameter_count(&self) -> usize;

    /// Describe parameter `idx` given every previously chosen value.
    async fn describe_parameter(
        &self,
        idx: usize,
        chosen: &ChosenParams,
        ledger: &dyn LedgerQuery,
    ) -> anyhow::Result<ParameterDescriptor>;

    /// Capture every state field the action is expected to mutate.
    async fn precondition(
        &self,
        params: &ChosenParams,
        ledger: &dyn LedgerQuery,
    ) -> anyhow::Result<StorageSnapshot>;

    /// Perform the mutation through the injected interface.
    async fn action(
        &self,
        params: &ChosenParams,
        ledger: &dyn LedgerMutation,
    ) -> anyhow::Result<ActionOutput>;

    /// Re-read the mutated fields and verify the delta. A `false` verdict is
    /// the normal assertion-failed path; an error is a distinct failure mode.
    async fn postcondition(
        &self,
        params: &ChosenParams,
        before: &StorageSnapshot,
        action: &ActionOutput,
        ledger: &dyn LedgerQuery,
    ) -> anyhow::Result<bool>;
}
