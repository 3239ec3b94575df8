//! Contract pipeline execution.
//!
//! Drives one contract through
//! `ParameterSelection -> Precondition -> Action -> Postcondition`.
//! Guarantees: every stage runs at most once, nothing is retried, and a
//! failure at any stage aborts the remaining stages, so the action is never
//! half-repeated. An empty list or inverted range during parameter selection
//! skips the run without counting as a failure; it only means no valid
//! instance exists right now.

use super::{
    ChosenParams, Contract, ContractRun, Outcome, ParameterKind, Stage,
};
use crate::client::{LedgerMutation, LedgerQuery};
use log::{debug, info, warn};
use plexus_common::Sampler;
use std::time::Instant;

enum Selection {
    Chosen(ChosenParams),
    Skip(String),
    Failed(String),
}

pub struct ContractRunner<'a> {
    query: &'a dyn LedgerQuery,
    mutator: &'a dyn LedgerMutation,
    sampler: Sampler,
}

impl<'a> ContractRunner<'a> {
    pub fn new(query: &'a dyn LedgerQuery, mutator: &'a dyn LedgerMutation, sampler: Sampler) -> Self {
        Self {
            query,
            mutator,
            sampler,
        }
    }

    pub fn sampler(&mut self) -> &mut Sampler {
        &mut self.sampler
    }

    async fn select_parameters(&mut self, contract: &dyn Contract) -> Selection {
        let mut chosen: ChosenParams = Vec::with_capacity(contract.parameter_count());
        for idx in 0..contract.parameter_count() {
            let descriptor = match contract.describe_parameter(idx, &chosen, self.query).await {
                Ok(descriptor) => descriptor,
                Err(err) => return Selection::Failed(format!("{:#}", err)),
            };
            let value = match descriptor.kind {
                ParameterKind::List(values) => {
                    if values.is_empty() {
                        return Selection::Skip(format!("no legal values for {}", descriptor.name));
                    }
                    match self.sampler.pick(&values) {
                        Ok(value) => *value,
                        Err(err) => return Selection::Failed(err.to_string()),
                    }
                }
                ParameterKind::WeightedList(values) => {
                    if values.is_empty() {
                        return Selection::Skip(format!("no legal values for {}", descriptor.name));
                    }
                    match self.sampler.weighted_select(&values) {
                        Ok(value) => *value,
                        Err(err) => return Selection::Failed(err.to_string()),
                    }
                }
                ParameterKind::Range { min, max } => {
                    if min > max {
                        return Selection::Skip(format!(
                            "empty range [{}, {}] for {}",
                            min, max, descriptor.name
                        ));
                    }
                    match self.sampler.uniform_u128(min, max) {
                        Ok(value) => super::ChosenValue::Uint(value),
                        Err(err) => return Selection::Failed(err.to_string()),
                    }
                }
            };
            debug!("{}: {} = {}", contract.name(), descriptor.name, value);
            chosen.push((descriptor.name, value));
        }
        Selection::Chosen(chosen)
    }

    /// Execute one contract end to end. Never panics on contract failure:
    /// every outcome is folded into the returned [`ContractRun`].
    pub async fn execute(&mut self, contract: &dyn Contract) -> ContractRun {
        let started = Instant::now();
        let mut run = ContractRun {
            contract: contract.name(),
            scope: contract.scope(),
            params: Vec::new(),
            snapshot: None,
            action: None,
            outcome: Outcome::Passed,
            duration_ms: 0,
        };

        let finish = |mut run: ContractRun, outcome: Outcome, started: Instant| {
            run.outcome = outcome;
            run.duration_ms = started.elapsed().as_millis() as u64;
            match &run.outcome {
                Outcome::Passed => info!("{}", run.summary()),
                Outcome::Skipped { .. } => debug!("{}", run.summary()),
                Outcome::Failed { .. } => {
                    warn!("{}", run.summary());
                    if let Some(snapshot) = &run.snapshot {
                        warn!("precondition snapshot: {}", snapshot.describe());
                    }
                }
            }
            run
        };

        match self.select_parameters(contract).await {
            Selection::Chosen(params) => run.params = params,
            Selection::Skip(reason) => {
                return finish(run, Outcome::Skipped { reason }, started);
            }
            Selection::Failed(message) => {
                return finish(
                    run,
                    Outcome::Failed {
                        stage: Stage::ParameterSelection,
                        message,
                    },
                    started,
                );
            }
        }

        let before = match contract.precondition(&run.params, self.query).await {
            Ok(snapshot) => {
                run.snapshot = Some(snapshot.clone());
                snapshot
            }
            Err(err) => {
                return finish(
                    run,
                    Outcome::Failed {
                        stage: Stage::Precondition,
                        message: format!("Precondition error: {:#}", err),
                    },
                    started,
                );
            }
        };

        let action = match contract.action(&run.params, self.mutator).await {
            Ok(output) => {
                run.action = Some(output.clone());
                output
            }
            Err(err) => {
                // precondition snapshot stays in the run for diagnostics
                return finish(
                    run,
                    Outcome::Failed {
                        stage: Stage::Action,
                        message: format!("Action error: {:#}", err),
                    },
                    started,
                );
            }
        };

        let outcome = match contract
            .postcondition(&run.params, &before, &action, self.query)
            .await
        {
            Ok(true) => Outcome::Passed,
            Ok(false) => Outcome::Failed {
                stage: Stage::Postcondition,
                message: "Postcondition returned false".to_string(),
            },
            Err(err) => Outcome::Failed {
                stage: Stage::Postcondition,
                message: format!("Postcondition error: {:#}", err),
            },
        };
        finish(run, outcome, started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryLedger;
    use crate::contracts::{
        ActionOutput, ChosenValue, ParameterDescriptor,
    };
    use crate::snapshot::StorageSnapshot;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Spy contract counting stage invocations; behavior switched per test.
    #[derive(Default)]
    struct SpyContract {
        fail_precondition: bool,
        fail_action: bool,
        postcondition_verdict: Option<bool>,
        precondition_calls: AtomicUsize,
        action_calls: AtomicUsize,
        postcondition_calls: AtomicUsize,
    }

    #[async_trait]
    impl Contract for SpyContract {
        fn name(&self) -> &'static str {
            "spy"
        }

        fn scope(&self) -> &'static str {
            "test"
        }

        fn parameter_count(&self) -> usize {
            1
        }

        async fn describe_parameter(
            &self,
            _idx: usize,
            _chosen: &ChosenParams,
            _ledger: &dyn LedgerQuery,
        ) -> anyhow::Result<ParameterDescriptor> {
            Ok(ParameterDescriptor::range("amount", 1, 10))
        }

        async fn precondition(
            &self,
            _params: &ChosenParams,
            _ledger: &dyn LedgerQuery,
        ) -> anyhow::Result<StorageSnapshot> {
            self.precondition_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_precondition {
                anyhow::bail!("snapshot unavailable");
            }
            Ok(StorageSnapshot::new())
        }

        async fn action(
            &self,
            _params: &ChosenParams,
            _ledger: &dyn LedgerMutation,
        ) -> anyhow::Result<ActionOutput> {
            self.action_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_action {
                anyhow::bail!("submission rejected");
            }
            Ok(serde_json::json!({"block": 1}))
        }

        async fn postcondition(
            &self,
            _params: &ChosenParams,
            _before: &StorageSnapshot,
            _action: &ActionOutput,
            _ledger: &dyn LedgerQuery,
        ) -> anyhow::Result<bool> {
            self.postcondition_calls.fetch_add(1, Ordering::SeqCst);
            match self.postcondition_verdict {
                Some(verdict) => Ok(verdict),
                None => anyhow::bail!("delta unreadable"),
            }
        }
    }

    fn runner(ledger: &MemoryLedger) -> ContractRunner<'_> {
        ContractRunner::new(ledger, ledger, Sampler::with_seed(1))
    }

    #[tokio::test]
    async fn passing_run_executes_each_stage_once() {
        let ledger = MemoryLedger::new();
        let contract = SpyContract {
            postcondition_verdict: Some(true),
            ..Default::default()
        };
        let run = runner(&ledger).execute(&contract).await;

        assert!(run.outcome.is_passed());
        assert_eq!(contract.precondition_calls.load(Ordering::SeqCst), 1);
        assert_eq!(contract.action_calls.load(Ordering::SeqCst), 1);
        assert_eq!(contract.postcondition_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn precondition_failure_never_reaches_the_action() {
        let ledger = MemoryLedger::new();
        let contract = SpyContract {
            fail_precondition: true,
            ..Default::default()
        };
        let run = runner(&ledger).execute(&contract).await;

        match &run.outcome {
            Outcome::Failed { stage, message } => {
                assert_eq!(*stage, Stage::Precondition);
                assert!(message.starts_with("Precondition error:"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(contract.action_calls.load(Ordering::SeqCst), 0);
        assert_eq!(contract.postcondition_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn action_failure_retains_the_snapshot() {
        let ledger = MemoryLedger::new();
        let contract = SpyContract {
            fail_action: true,
            postcondition_verdict: Some(true),
            ..Default::default()
        };
        let run = runner(&ledger).execute(&contract).await;

        assert!(matches!(
            run.outcome,
            Outcome::Failed { stage: Stage::Action, .. }
        ));
        assert!(run.snapshot.is_some());
        assert_eq!(contract.postcondition_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn false_verdict_has_the_exact_message() {
        let ledger = MemoryLedger::new();
        let contract = SpyContract {
            postcondition_verdict: Some(false),
            ..Default::default()
        };
        let run = runner(&ledger).execute(&contract).await;

        match &run.outcome {
            Outcome::Failed { stage, message } => {
                assert_eq!(*stage, Stage::Postcondition);
                assert_eq!(message, "Postcondition returned false");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let stage_error = run.stage_error().expect("failed run carries a stage error");
        assert_eq!(stage_error.stage, Stage::Postcondition);
        assert_eq!(
            stage_error.to_string(),
            "postcondition failed: Postcondition returned false"
        );
    }

    #[tokio::test]
    async fn postcondition_error_is_distinct_from_false() {
        let ledger = MemoryLedger::new();
        let contract = SpyContract {
            postcondition_verdict: None,
            ..Default::default()
        };
        let run = runner(&ledger).execute(&contract).await;

        match &run.outcome {
            Outcome::Failed { stage, message } => {
                assert_eq!(*stage, Stage::Postcondition);
                assert!(message.starts_with("Postcondition error:"));
                assert!(message.contains("delta unreadable"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn weighted_list_parameters_stay_in_the_legal_set() {
        struct WeightedParam;

        #[async_trait]
        impl Contract for WeightedParam {
            fn name(&self) -> &'static str {
                "weighted_param"
            }
            fn scope(&self) -> &'static str {
                "test"
            }
            fn parameter_count(&self) -> usize {
                1
            }
            async fn describe_parameter(
                &self,
                _idx: usize,
                _chosen: &ChosenParams,
                _ledger: &dyn LedgerQuery,
            ) -> anyhow::Result<ParameterDescriptor> {
                Ok(ParameterDescriptor {
                    name: "amount",
                    kind: crate::contracts::ParameterKind::WeightedList(vec![
                        (0.9, ChosenValue::Uint(10)),
                        (0.1, ChosenValue::Uint(1_000)),
                    ]),
                })
            }
            async fn precondition(
                &self,
                _params: &ChosenParams,
                _ledger: &dyn LedgerQuery,
            ) -> anyhow::Result<StorageSnapshot> {
                Ok(StorageSnapshot::new())
            }
            async fn action(
                &self,
                params: &ChosenParams,
                _ledger: &dyn LedgerMutation,
            ) -> anyhow::Result<ActionOutput> {
                let amount = crate::contracts::param_uint(params, "amount")?;
                anyhow::ensure!(amount == 10 || amount == 1_000, "illegal amount {}", amount);
                Ok(serde_json::json!({"amount": amount}))
            }
            async fn postcondition(
                &self,
                _params: &ChosenParams,
                _before: &StorageSnapshot,
                _action: &ActionOutput,
                _ledger: &dyn LedgerQuery,
            ) -> anyhow::Result<bool> {
                Ok(true)
            }
        }

        let ledger = MemoryLedger::new();
        let mut runner = runner(&ledger);
        for _ in 0..50 {
            let run = runner.execute(&WeightedParam).await;
            assert!(run.outcome.is_passed(), "unexpected outcome: {:?}", run.outcome);
        }
    }

    #[tokio::test]
    async fn empty_list_skips_without_failing() {
        struct NoChoices;

        #[async_trait]
        impl Contract for NoChoices {
            fn name(&self) -> &'static str {
                "no_choices"
            }
            fn scope(&self) -> &'static str {
                "test"
            }
            fn parameter_count(&self) -> usize {
                1
            }
            async fn describe_parameter(
                &self,
                _idx: usize,
                _chosen: &ChosenParams,
                _ledger: &dyn LedgerQuery,
            ) -> anyhow::Result<ParameterDescriptor> {
                Ok(ParameterDescriptor::list("hotkey", vec![]))
            }
            async fn precondition(
                &self,
                _params: &ChosenParams,
                _ledger: &dyn LedgerQuery,
            ) -> anyhow::Result<StorageSnapshot> {
                unreachable!("must not run")
            }
            async fn action(
                &self,
                _params: &ChosenParams,
                _ledger: &dyn LedgerMutation,
            ) -> anyhow::Result<ActionOutput> {
                unreachable!("must not run")
            }
            async fn postcondition(
                &self,
                _params: &ChosenParams,
                _before: &StorageSnapshot,
                _action: &ActionOutput,
                _ledger: &dyn LedgerQuery,
            ) -> anyhow::Result<bool> {
                unreachable!("must not run")
            }
        }

        let ledger = MemoryLedger::new();
        let run = runner(&ledger).execute(&NoChoices).await;
        assert!(matches!(run.outcome, Outcome::Skipped { .. }));
        assert!(!run.outcome.is_failure());
    }

    #[tokio::test]
    async fn inverted_range_skips_without_failing() {
        struct InvertedRange;

        #[async_trait]
        impl Contract for InvertedRange {
            fn name(&self) -> &'static str {
                "inverted_range"
            }
            fn scope(&self) -> &'static str {
                "test"
            }
            fn parameter_count(&self) -> usize {
                1
            }
            async fn describe_parameter(
                &self,
                _idx: usize,
                _chosen: &ChosenParams,
                _ledger: &dyn LedgerQuery,
            ) -> anyhow::Result<ParameterDescriptor> {
                // min > max: no stake available to remove
                Ok(ParameterDescriptor::range("amount", 1, 0))
            }
            async fn precondition(
                &self,
                _params: &ChosenParams,
                _ledger: &dyn LedgerQuery,
            ) -> anyhow::Result<StorageSnapshot> {
                unreachable!("must not run")
            }
            async fn action(
                &self,
                _params: &ChosenParams,
                _ledger: &dyn LedgerMutation,
            ) -> anyhow::Result<ActionOutput> {
                unreachable!("must not run")
            }
            async fn postcondition(
                &self,
                _params: &ChosenParams,
                _before: &StorageSnapshot,
                _action: &ActionOutput,
                _ledger: &dyn LedgerQuery,
            ) -> anyhow::Result<bool> {
                unreachable!("must not run")
            }
        }

        let ledger = MemoryLedger::new();
        let run = runner(&ledger).execute(&InvertedRange).await;
        assert!(matches!(run.outcome, Outcome::Skipped { .. }));
    }
}
