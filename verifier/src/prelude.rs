//! Convenient re-exports for common usage.

pub use crate::client::{
    AccountId, Cursor, KeyTuple, LedgerMutation, LedgerQuery, MapId, MutationError, Operation,
    Page, QueryError, RawValue, ScalarKey, SubmitReceipt, PROPORTION_SCALE,
};
pub use crate::config::{TestActor, ToleranceConfig, VerifierConfig};
pub use crate::contracts::runner::ContractRunner;
pub use crate::contracts::select::ContractRegistry;
pub use crate::contracts::{Contract, ContractRun, Outcome, Stage};
pub use crate::invariants::{
    default_engine, InvariantEngine, InvariantReport, InvariantRule, Violation,
};
pub use crate::journal::RunJournal;
pub use crate::scanner::{collect_map, PagedScanner, ScanError};
pub use crate::snapshot::StorageSnapshot;

pub use plexus_common::{FixedDecimal, SampleError, Sampler};
