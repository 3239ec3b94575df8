//! Weighted contract selection.
//!
//! An explicit registry of `(weight, contract)` entries. `run_random` draws
//! one contract by cumulative-probability weighted selection, executes it and
//! appends the outcome to the run journal.

use super::runner::ContractRunner;
use super::{Contract, ContractRun};
use crate::journal::RunJournal;
use plexus_common::SampleError;
use std::io::Write;
use std::sync::Arc;

#[derive(Default)]
pub struct ContractRegistry {
    entries: Vec<(f64, Arc<dyn Contract>)>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, weight: f64, contract: Arc<dyn Contract>) {
        self.entries.push((weight, contract));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Draw one contract according to the registered weights.
    pub fn select(&self, runner: &mut ContractRunner<'_>) -> Result<Arc<dyn Contract>, SampleError> {
        runner
            .sampler()
            .weighted_select(&self.entries)
            .map(Arc::clone)
    }

    /// Select, execute and journal one contract run.
    pub async fn run_random<W: Write>(
        &self,
        runner: &mut ContractRunner<'_>,
        journal: &mut RunJournal<W>,
    ) -> Result<ContractRun, SampleError> {
        let contract = self.select(runner)?;
        let run = runner.execute(contract.as_ref()).await;
        let ok = !run.outcome.is_failure();
        if let Err(err) = journal.record(ok, &run.summary()) {
            log::warn!("journal write failed: {}", err);
        }
        Ok(run)
    }
}
