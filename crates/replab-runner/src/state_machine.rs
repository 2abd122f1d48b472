//! Top-level control loop converging an experiment directory to VALIDATED.
//!
//! Every iteration audits, writes the audit log, and then performs exactly
//! one corrective action chosen by [`plan`]. Repairs always take priority over
//! creating missing replications.

use crate::aggregate::write_experiment_summary;
use crate::audit::{AuditFinding, Auditor, ExperimentAudit, ExperimentStatus, Remedy};
use crate::driver::{Driver, DriverError, DriverFailure, ExperimentContext};
use crate::layout::ExperimentLayout;
use crate::lock::{describe_holder, OperationLock};
use crate::oplog::OperationLog;
use crate::pool::run_bounded;
use anyhow::{anyhow, Result};
use chrono::Utc;
use replab_core::Store;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    NotCreated,
    NeedsMigration(String),
    NeedsParameterFix(String),
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::NotCreated => write!(f, "no experiment here; create it with `replab new`"),
            HaltReason::NeedsMigration(r) => write!(f, "needs migration: {}", r),
            HaltReason::NeedsParameterFix(r) => write!(f, "needs manual parameter fix: {}", r),
        }
    }
}

/// Work for one repair batch, grouped by how it is carried out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairBatch {
    /// Replication and the trials whose sessions must be fetched again.
    pub fetch: Vec<(usize, Vec<usize>)>,
    pub reprocess: Vec<usize>,
    pub regenerate: Vec<usize>,
}

impl RepairBatch {
    pub fn is_empty(&self) -> bool {
        self.fetch.is_empty() && self.reprocess.is_empty() && self.regenerate.is_empty()
    }

    pub fn replications(&self) -> BTreeSet<usize> {
        self.fetch
            .iter()
            .map(|(i, _)| *i)
            .chain(self.reprocess.iter().copied())
            .chain(self.regenerate.iter().copied())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Repair(RepairBatch),
    Create(usize),
    Aggregate,
    Done,
    Halt(HaltReason),
}

/// Chooses the next action from an audit. Pure.
pub fn plan(audit: &ExperimentAudit) -> Plan {
    if audit.status == ExperimentStatus::MigrationNeeded {
        let reason = audit
            .migration_reason
            .clone()
            .unwrap_or_else(|| "directory predates the current layout".to_string());
        return Plan::Halt(HaltReason::NeedsMigration(reason));
    }
    if audit.config.is_none() && audit.status == ExperimentStatus::NewNeeded {
        return Plan::Halt(HaltReason::NotCreated);
    }
    let mut config_problems = audit.config_faults.clone();
    for r in &audit.replications {
        if let AuditFinding::ConfigIssue { reason } = &r.finding {
            config_problems.push(reason.clone());
        }
    }
    if !config_problems.is_empty() {
        return Plan::Halt(HaltReason::NeedsParameterFix(config_problems.join("; ")));
    }

    let mut batch = RepairBatch::default();
    for r in &audit.replications {
        match r.finding.remedy() {
            Remedy::FastRepair(trials) => batch.fetch.push((r.replication, trials)),
            Remedy::Reprocess => batch.reprocess.push(r.replication),
            Remedy::Regenerate => batch.regenerate.push(r.replication),
            Remedy::None | Remedy::Reaggregate | Remedy::ManualParameterFix => {}
        }
    }
    if !batch.is_empty() {
        return Plan::Repair(batch);
    }
    if let Some(first) = audit.missing.first() {
        return Plan::Create(*first);
    }
    if audit.status == ExperimentStatus::AggregationNeeded {
        return Plan::Aggregate;
    }
    Plan::Done
}

#[derive(Debug)]
pub struct StepReport {
    pub audit: ExperimentAudit,
    pub plan: Plan,
    /// Driver failures hit while carrying out the plan; the next audit
    /// decides what they mean.
    pub failures: Vec<String>,
    pub cancelled: bool,
}

#[derive(Debug)]
pub enum ConvergeOutcome {
    Validated { steps: usize },
    Halted { reason: HaltReason, audit: ExperimentAudit },
    Exhausted { steps: usize, reason: String, audit: ExperimentAudit },
    Cancelled,
}

impl ConvergeOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            ConvergeOutcome::Validated { .. } => 0,
            ConvergeOutcome::Halted { audit, .. } => audit.exit_code(),
            ConvergeOutcome::Exhausted { audit, .. } => audit.exit_code(),
            ConvergeOutcome::Cancelled => 130,
        }
    }
}

pub struct StateMachine {
    store: Arc<dyn Store>,
    driver: Driver,
    auditor: Auditor,
    layout: ExperimentLayout,
}

impl StateMachine {
    pub fn new(store: Arc<dyn Store>, driver: Driver, dir: impl Into<PathBuf>) -> Self {
        Self {
            auditor: Auditor::new(store.clone()),
            store,
            driver,
            layout: ExperimentLayout::new(dir),
        }
    }

    pub fn dir(&self) -> &Path {
        self.layout.root()
    }

    fn oplog(&self) -> OperationLog<'_> {
        OperationLog::new(self.store.as_ref(), self.layout.operation_log())
    }

    fn lock(&self) -> Result<OperationLock> {
        let path = self.layout.experiment_lock();
        OperationLock::try_acquire(
            &self.store,
            &path,
            "state_machine",
            self.driver.cancel_token().locks(),
        )?
        .ok_or_else(|| {
            anyhow!(
                "experiment is being modified by another process: {}",
                describe_holder(self.store.as_ref(), &path)
            )
        })
    }

    /// One audit followed by at most one corrective action.
    pub fn step(&self) -> Result<StepReport> {
        let _lock = self.lock()?;
        let mut ctx = None;
        self.step_locked(&mut ctx)
    }

    /// Steps until VALIDATED, a halt, the step bound or the repair budget.
    pub fn converge(&self) -> Result<ConvergeOutcome> {
        let _lock = self.lock()?;
        let policy = self.driver.policy().clone();
        let mut ctx = None;
        let mut steps = 0usize;
        let mut repair_batches = 0usize;
        let mut created: BTreeSet<usize> = BTreeSet::new();
        let mut last_aggregate: Option<ExperimentAudit> = None;

        loop {
            let audit = self.audit_and_log()?;
            let next = plan(&audit);
            match &next {
                Plan::Done => {
                    info!(dir = %self.dir().display(), steps, "experiment validated");
                    return Ok(ConvergeOutcome::Validated { steps });
                }
                Plan::Halt(reason) => {
                    warn!(dir = %self.dir().display(), %reason, "halting");
                    return Ok(ConvergeOutcome::Halted {
                        reason: reason.clone(),
                        audit,
                    });
                }
                _ => {}
            }
            if self.driver_cancelled() {
                return Ok(ConvergeOutcome::Cancelled);
            }

            let n = audit.config.as_ref().map(|c| c.replications).unwrap_or(0);
            let max_steps = n + policy.max_repair_iterations + 2;
            let exhausted = |reason: String, audit: ExperimentAudit| -> Result<ConvergeOutcome> {
                error!(steps, %reason, "giving up");
                Ok(ConvergeOutcome::Exhausted {
                    steps,
                    reason,
                    audit,
                })
            };
            if steps >= max_steps {
                return exhausted(format!("no convergence after {} steps", steps), audit);
            }
            match &next {
                Plan::Repair(batch) => {
                    if repair_batches >= policy.max_repair_iterations {
                        return exhausted(
                            format!(
                                "repair budget of {} batches spent; still broken: {:?}",
                                policy.max_repair_iterations,
                                batch.replications()
                            ),
                            audit,
                        );
                    }
                    repair_batches += 1;
                }
                Plan::Create(i) => {
                    if !created.insert(*i) {
                        return exhausted(format!("run_{} was created once and is missing again", i), audit);
                    }
                }
                Plan::Aggregate => {
                    if last_aggregate.as_ref() == Some(&audit) {
                        return exhausted(
                            "aggregation did not change the audit".to_string(),
                            audit,
                        );
                    }
                    last_aggregate = Some(audit.clone());
                }
                Plan::Done | Plan::Halt(_) => {}
            }

            let report = self.execute(&mut ctx, audit, next)?;
            steps += 1;
            if report.cancelled {
                return Ok(ConvergeOutcome::Cancelled);
            }
        }
    }

    fn driver_cancelled(&self) -> bool {
        self.driver.cancel_token().is_cancelled()
    }

    fn step_locked(&self, ctx: &mut Option<ExperimentContext>) -> Result<StepReport> {
        let audit = self.audit_and_log()?;
        let next = plan(&audit);
        self.execute(ctx, audit, next)
    }

    fn audit_and_log(&self) -> Result<ExperimentAudit> {
        let op = self.oplog().start("audit", None);
        let audit = self.auditor.audit_experiment(self.dir());
        if self.store.is_dir(self.dir()) {
            let text = format!(
                "Audited at: {}\n{}",
                Utc::now().to_rfc3339(),
                audit.render_text()
            );
            self.store
                .atomic_write(&self.layout.audit_log(), text.as_bytes())?;
            self.oplog()
                .finish(op, &audit.status.to_string(), None)?;
        }
        Ok(audit)
    }

    fn context<'c>(&self, ctx: &'c mut Option<ExperimentContext>) -> Result<&'c ExperimentContext> {
        if ctx.is_none() {
            *ctx = Some(ExperimentContext::load(self.store.as_ref(), self.dir())?);
        }
        ctx.as_ref()
            .ok_or_else(|| anyhow!("experiment context unavailable"))
    }

    fn execute(
        &self,
        ctx: &mut Option<ExperimentContext>,
        audit: ExperimentAudit,
        next: Plan,
    ) -> Result<StepReport> {
        let mut failures = Vec::new();
        let mut cancelled = false;
        match &next {
            Plan::Done | Plan::Halt(_) => {}
            Plan::Create(i) => {
                let ctx = self.context(ctx)?;
                info!(replication = *i, "creating missing replication");
                let op = self.oplog().start("new_replication", Some(*i));
                let result = self.driver.run_new(ctx, *i).map(|_| ());
                self.record(op, result, &mut failures, &mut cancelled)?;
            }
            Plan::Aggregate => {
                let ctx = self.context(ctx)?;
                let op = self.oplog().start("aggregate", None);
                match write_experiment_summary(self.store.as_ref(), &ctx.layout, &ctx.config) {
                    Ok(result) => self.oplog().finish(
                        op,
                        "ok",
                        Some(format!("{} rows", result.rows)),
                    )?,
                    Err(e) => {
                        self.oplog().finish(op, "failed", Some(format!("{:#}", e)))?;
                        return Err(e);
                    }
                }
            }
            Plan::Repair(batch) => {
                let ctx = self.context(ctx)?;
                self.repair(ctx, batch, &mut failures, &mut cancelled)?;
            }
        }
        Ok(StepReport {
            audit,
            plan: next,
            failures,
            cancelled,
        })
    }

    /// Parallel session fetches across replications, then serial
    /// reprocessing, then serial regeneration.
    fn repair(
        &self,
        ctx: &ExperimentContext,
        batch: &RepairBatch,
        failures: &mut Vec<String>,
        cancelled: &mut bool,
    ) -> Result<()> {
        info!(
            fetch = batch.fetch.len(),
            reprocess = batch.reprocess.len(),
            regenerate = batch.regenerate.len(),
            "repair batch"
        );
        let workers = self.driver.policy().max_parallel_repairs;
        let cancel = self.driver.cancel_token().clone();
        let fetched = run_bounded(&batch.fetch, workers, &cancel, |(i, trials)| {
            let op = self.oplog().start("fast_repair", Some(*i));
            let result = self.driver.fetch_sessions(ctx, *i, trials);
            (op, result)
        })?;

        let mut to_reprocess: BTreeSet<usize> = batch.reprocess.iter().copied().collect();
        for ((i, trials), outcome) in batch.fetch.iter().zip(fetched) {
            let Some((op, result)) = outcome else {
                *cancelled = true;
                continue;
            };
            match result {
                Ok(answered) => {
                    self.oplog().finish(
                        op,
                        "ok",
                        Some(format!("{}/{} sessions answered", answered, trials.len())),
                    )?;
                    to_reprocess.insert(*i);
                }
                Err(e) => self.record(op, Err(e), failures, cancelled)?,
            }
        }
        if *cancelled {
            return Ok(());
        }

        for i in to_reprocess {
            let op = self.oplog().start("reprocess", Some(i));
            let result = self.driver.reprocess(ctx, i).map(|_| ());
            self.record(op, result, failures, cancelled)?;
            if *cancelled {
                return Ok(());
            }
        }
        for i in &batch.regenerate {
            let op = self.oplog().start("regenerate", Some(*i));
            let result = self.driver.regenerate(ctx, *i).map(|_| ());
            self.record(op, result, failures, cancelled)?;
            if *cancelled {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Logs a driver result. Only environment failures (a lock held by
    /// someone else) propagate; everything else is left to the next audit.
    fn record(
        &self,
        op: crate::oplog::PendingOperation,
        result: Result<(), DriverError>,
        failures: &mut Vec<String>,
        cancelled: &mut bool,
    ) -> Result<()> {
        match result {
            Ok(()) => self.oplog().finish(op, "ok", None),
            Err(e) => {
                self.oplog().finish(op, "failed", Some(e.to_string()))?;
                match e.failure {
                    DriverFailure::Cancelled => {
                        *cancelled = true;
                        Ok(())
                    }
                    DriverFailure::LockHeld(_) => Err(anyhow!(e)),
                    _ => {
                        warn!(error = %e, "driver failed; will re-audit");
                        failures.push(e.to_string());
                        Ok(())
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::config::tests::definition;
    use crate::audit::NextAction;
    use crate::config::{write_snapshot, RunnerPolicy};
    use crate::llm::tests::OracleLlm;
    use crate::llm::LlmError;
    use crate::lock::LockRegistry;
    use crate::oplog::OperationRecord;
    use replab_core::MemStore;
    use std::time::Duration;

    const DIR: &str = "/study/exp_a";

    fn policy() -> RunnerPolicy {
        RunnerPolicy {
            retry_backoff_ms: 0,
            ..RunnerPolicy::default()
        }
    }

    fn machine(store: &Arc<MemStore>, llm: OracleLlm) -> StateMachine {
        let driver = Driver::new(store.clone(), Arc::new(llm), policy(), CancelToken::new());
        StateMachine::new(store.clone(), driver, DIR)
    }

    fn created(k: usize, m: usize, n: usize) -> (Arc<MemStore>, ExperimentLayout) {
        let store = Arc::new(MemStore::new());
        let layout = ExperimentLayout::new(DIR);
        write_snapshot(store.as_ref(), &layout, &definition(k, m, n)).expect("snapshot");
        (store, layout)
    }

    fn run_dirs(store: &MemStore, layout: &ExperimentLayout) -> Vec<String> {
        store
            .list(layout.root())
            .expect("list")
            .into_iter()
            .filter(|n| n.starts_with("run_"))
            .collect()
    }

    fn touched_runs(store: &MemStore, layout: &ExperimentLayout) -> BTreeSet<String> {
        store
            .write_log()
            .into_iter()
            .filter_map(|p| {
                p.strip_prefix(layout.root())
                    .ok()
                    .and_then(|rel| rel.components().next())
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
            })
            .filter(|first| first.starts_with("run_"))
            .collect()
    }

    #[test]
    fn fresh_experiment_converges_with_one_row_per_replication() {
        let (store, layout) = created(8, 4, 3);
        let sm = machine(&store, OracleLlm::new());
        let outcome = sm.converge().expect("converge");
        assert!(matches!(outcome, ConvergeOutcome::Validated { steps: 3 }), "{:?}", outcome);
        assert_eq!(run_dirs(&store, &layout), vec!["run_1", "run_2", "run_3"]);
        for i in 1..=3 {
            let names = store.list(&layout.run_dir(i)).expect("list");
            let queries = names.iter().filter(|n| n.starts_with("query_")).count();
            let responses = names.iter().filter(|n| n.starts_with("response_")).count();
            assert_eq!((queries, responses), (4, 4));
        }
        let summary = store.read_to_string(&layout.summary()).expect("summary");
        assert_eq!(summary.lines().count(), 1 + 3);
        assert!(store.exists(&layout.audit_log()));
        assert!(!store.exists(&layout.experiment_lock()));
    }

    #[test]
    fn converged_experiment_is_a_fixed_point() {
        let (store, _) = created(4, 2, 2);
        let sm = machine(&store, OracleLlm::new());
        sm.converge().expect("first");
        let outcome = sm.converge().expect("second");
        assert!(matches!(outcome, ConvergeOutcome::Validated { steps: 0 }));
    }

    #[test]
    fn repair_comes_before_creation() {
        let (store, layout) = created(4, 3, 5);
        let sm = machine(&store, OracleLlm::new());
        for _ in 0..4 {
            sm.step().expect("create");
        }
        assert_eq!(run_dirs(&store, &layout).len(), 4);
        store.remove_file(&layout.response(2, 3)).expect("rm");

        let report = sm.step().expect("step");
        assert_eq!(
            report.plan,
            Plan::Repair(RepairBatch {
                fetch: vec![(2, vec![3])],
                ..RepairBatch::default()
            })
        );
        assert!(!store.is_dir(&layout.run_dir(5)));
        let report = sm.step().expect("step");
        assert_eq!(report.plan, Plan::Create(5));
    }

    #[test]
    fn corrupt_then_repair_touches_only_the_broken_replication() {
        let (store, layout) = created(4, 3, 3);
        let sm = machine(&store, OracleLlm::new());
        sm.converge().expect("converge");
        store.remove_file(&layout.response(2, 3)).expect("rm");
        let audit = Auditor::new(store.clone()).audit_experiment(layout.root());
        assert_eq!(audit.finding(2).map(|f| f.tag()), Some("RESPONSE_ISSUE"));

        store.clear_write_log();
        sm.step().expect("repair step");
        let audit = Auditor::new(store.clone()).audit_experiment(layout.root());
        assert_eq!(audit.finding(2), Some(&AuditFinding::Valid));
        assert_eq!(audit.status, ExperimentStatus::Validated);
        let touched = touched_runs(&store, &layout);
        assert_eq!(touched, BTreeSet::from(["run_2".to_string()]));
    }

    #[test]
    fn unparseable_answers_are_fetched_again() {
        let (store, layout) = created(8, 20, 1);
        let llm = Arc::new(OracleLlm::garbage_first(2));
        let driver = Driver::new(store.clone(), llm.clone(), policy(), CancelToken::new());
        let sm = StateMachine::new(store.clone(), driver, DIR);

        // 18 of 20 parse: below the halt threshold
        let report = sm.step().expect("create");
        assert_eq!(report.plan, Plan::Create(1));
        assert_eq!(report.failures.len(), 1, "{:?}", report.failures);
        let audit = Auditor::new(store.clone()).audit_experiment(layout.root());
        match audit.finding(1) {
            Some(AuditFinding::ResponseIssue { trials, .. }) => assert_eq!(trials.len(), 2),
            other => panic!("expected ResponseIssue, got {:?}", other),
        }

        let outcome = sm.converge().expect("converge");
        assert!(matches!(outcome, ConvergeOutcome::Validated { steps: 1 }), "{:?}", outcome);
        assert_eq!(llm.call_count(), 22);
    }

    #[test]
    fn parallel_fetches_repair_several_replications_in_one_step() {
        let (store, layout) = created(4, 3, 3);
        let llm = OracleLlm {
            delay: Duration::from_millis(10),
            ..OracleLlm::new()
        };
        let sm = machine(&store, llm);
        sm.converge().expect("converge");
        store.remove_file(&layout.response(1, 2)).expect("rm");
        store.remove_file(&layout.response(3, 1)).expect("rm");
        store.remove_file(&layout.response(3, 3)).expect("rm");

        store.clear_write_log();
        let report = sm.step().expect("repair step");
        assert_eq!(
            report.plan,
            Plan::Repair(RepairBatch {
                fetch: vec![(1, vec![2]), (3, vec![1, 3])],
                ..RepairBatch::default()
            })
        );
        assert!(report.failures.is_empty(), "{:?}", report.failures);

        let audit = Auditor::new(store.clone()).audit_experiment(layout.root());
        assert_eq!(audit.status, ExperimentStatus::Validated, "{}", audit.render_text());
        for i in 1..=3 {
            assert!(!store.exists(&layout.replication_lock(i)));
        }
        assert_eq!(
            touched_runs(&store, &layout),
            BTreeSet::from(["run_1".to_string(), "run_3".to_string()])
        );
        assert!(sm.driver.cancel_token().locks().held_paths().is_empty());
    }

    #[test]
    fn structural_corruption_regenerates_the_replication() {
        let (store, layout) = created(4, 3, 2);
        let sm = machine(&store, OracleLlm::new());
        sm.converge().expect("converge");
        store.remove_file(&layout.query(1, 1)).expect("rm");
        store.remove_file(&layout.response(1, 2)).expect("rm");
        let report = sm.step().expect("step");
        assert_eq!(
            report.plan,
            Plan::Repair(RepairBatch {
                regenerate: vec![1],
                ..RepairBatch::default()
            })
        );
        assert!(matches!(
            sm.converge().expect("converge"),
            ConvergeOutcome::Validated { .. }
        ));
    }

    #[test]
    fn stale_summary_is_rebuilt() {
        let (store, layout) = created(4, 2, 2);
        let sm = machine(&store, OracleLlm::new());
        sm.converge().expect("converge");
        store.remove_file(&layout.summary()).expect("rm");
        let report = sm.step().expect("step");
        assert_eq!(report.plan, Plan::Aggregate);
        assert!(matches!(
            sm.converge().expect("converge"),
            ConvergeOutcome::Validated { steps: 0 }
        ));
    }

    #[test]
    fn persistent_failures_exhaust_the_repair_budget() {
        let (store, _) = created(4, 2, 1);
        let llm = OracleLlm::failing_first(usize::MAX, LlmError::AuthFailed);
        let sm = machine(&store, llm);
        let outcome = sm.converge().expect("converge");
        match &outcome {
            ConvergeOutcome::Exhausted { steps, audit, .. } => {
                assert!(*steps <= 1 + policy().max_repair_iterations);
                assert_eq!(audit.status, ExperimentStatus::RepairNeeded);
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
        assert_eq!(outcome.exit_code(), 2);
    }

    #[test]
    fn migration_and_tampering_halt_before_any_replication_runs() {
        let store = Arc::new(MemStore::new());
        let layout = ExperimentLayout::new(DIR);
        store.create_dir_all(&layout.run_dir(1)).expect("legacy run");
        let sm = machine(&store, OracleLlm::new());
        let outcome = sm.converge().expect("converge");
        assert!(matches!(
            outcome,
            ConvergeOutcome::Halted {
                reason: HaltReason::NeedsMigration(_),
                ..
            }
        ));
        assert_eq!(outcome.exit_code(), 3);

        let (store, layout) = created(4, 2, 1);
        let mut def = definition(4, 2, 1);
        def.config.model = "edited/model".to_string();
        crate::layout::write_json(store.as_ref(), &layout.snapshot(), &def.config).expect("edit");
        let sm = machine(&store, OracleLlm::new());
        let outcome = sm.converge().expect("converge");
        assert_eq!(outcome.exit_code(), 4);
        assert!(!store.is_dir(&layout.run_dir(1)));
    }

    #[test]
    fn missing_experiment_halts_with_the_audit_exit_code() {
        let store = Arc::new(MemStore::new());
        store.create_dir_all(Path::new(DIR)).expect("dir");
        let sm = machine(&store, OracleLlm::new());
        let outcome = sm.converge().expect("converge");
        let ConvergeOutcome::Halted { reason, audit } = &outcome else {
            panic!("expected Halted, got {:?}", outcome);
        };
        assert_eq!(reason, &HaltReason::NotCreated);
        assert_eq!(audit.next_action(), NextAction::CreateExperiment);
        assert_eq!(outcome.exit_code(), audit.exit_code());
        assert_eq!(outcome.exit_code(), 2);
    }

    #[test]
    fn held_experiment_lock_refuses_to_run() {
        let (store, layout) = created(4, 2, 1);
        let dyn_store: Arc<dyn Store> = store.clone();
        let _held = OperationLock::try_acquire(
            &dyn_store,
            &layout.experiment_lock(),
            "other",
            &LockRegistry::default(),
        )
            .expect("io")
            .expect("lock");
        let sm = machine(&store, OracleLlm::new());
        let err = sm.converge().expect_err("locked");
        assert!(err.to_string().contains("another process"));
    }

    #[test]
    fn locks_skipped_by_a_hard_exit_are_released_through_the_registry() {
        let (store, layout) = created(4, 2, 1);
        let sm = machine(&store, OracleLlm::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let registry = sm.driver.cancel_token().locks().clone();
        let lock = OperationLock::try_acquire(
            &dyn_store,
            &layout.experiment_lock(),
            "state_machine",
            &registry,
        )
        .expect("io")
        .expect("lock");
        std::mem::forget(lock);
        assert!(sm.converge().is_err());

        assert_eq!(registry.release_all(), 1);
        assert!(!store.exists(&layout.experiment_lock()));
        assert!(matches!(
            sm.converge().expect("converge"),
            ConvergeOutcome::Validated { .. }
        ));
        assert!(registry.held_paths().is_empty());
    }

    #[test]
    fn operations_are_logged() {
        let (store, layout) = created(4, 2, 2);
        let sm = machine(&store, OracleLlm::new());
        sm.converge().expect("converge");
        let records: Vec<OperationRecord> =
            OperationLog::new(store.as_ref(), layout.operation_log())
                .records()
                .expect("records");
        let ops: Vec<&str> = records.iter().map(|r| r.op.as_str()).collect();
        assert_eq!(
            ops,
            vec!["audit", "new_replication", "audit", "new_replication", "audit"]
        );
        assert!(records.iter().all(|r| r.outcome != "failed"));
    }

    #[test]
    fn plan_is_pure_over_the_audit() {
        let (store, layout) = created(4, 2, 2);
        let audit = Auditor::new(store.clone()).audit_experiment(layout.root());
        assert_eq!(plan(&audit), Plan::Create(1));
        assert_eq!(plan(&audit), plan(&audit));
    }
}
