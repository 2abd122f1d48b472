//! The replication pipeline.
//!
//! Seven stages per replication: generate queries, run sessions, parse
//! responses, compute metrics, compute positional bias, write the report,
//! rebuild the experiment summary. The report is written last and
//! atomically; its presence with a valid block is what marks a replication
//! complete. Every entry point holds the replication lock for its duration.

use crate::aggregate::write_experiment_summary;
use crate::cancel::CancelToken;
use crate::config::{
    load_subjects, read_snapshot, validate_config, ExperimentConfig, RunParams, RunnerPolicy,
    SnapshotState, Subject, CURRENT_LAYOUT_VERSION, CURRENT_METRICS_SCHEMA,
};
use crate::layout::{read_json, write_json, ExperimentLayout, TrialManifest};
use crate::llm::{send_with_retry, LlmClient, SessionOutcome};
use crate::lock::{describe_holder, OperationLock};
use crate::pool::run_bounded;
use crate::report::{
    metrics_map, render_report, response_digest, CompletionSummary, ParseFailure, ReportBlock,
    ReportParameters,
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use replab_analysis::{
    compute_bias, compute_metrics, parse_response, ParsedTrial, SESSION_FAILED_MARKER,
};
use replab_core::Store;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    GenerateQueries,
    RunSessions,
    ParseResponses,
    ComputeMetrics,
    ComputeBias,
    WriteReport,
    Aggregate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::GenerateQueries => "1/7 generate queries",
            Stage::RunSessions => "2/7 run sessions",
            Stage::ParseResponses => "3/7 parse responses",
            Stage::ComputeMetrics => "4/7 compute metrics",
            Stage::ComputeBias => "5/7 compute bias",
            Stage::WriteReport => "6/7 write report",
            Stage::Aggregate => "7/7 aggregate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum DriverFailure {
    #[error("only {valid}/{total} valid responses, below the completion threshold")]
    InsufficientData { valid: usize, total: usize },
    #[error("replication is locked: {0}")]
    LockHeld(String),
    #[error("interrupted")]
    Cancelled,
    #[error("run parameters do not match the snapshot: {0}")]
    ConfigMismatch(String),
    #[error("missing artifact: {0}")]
    MissingArtifact(String),
    #[error("replication directory already populated: {0}")]
    Occupied(String),
    #[error("{0:#}")]
    Other(anyhow::Error),
}

#[derive(Debug, Error)]
#[error("run_{replication} failed at stage {stage}: {failure}")]
pub struct DriverError {
    pub stage: Stage,
    pub replication: usize,
    pub failure: DriverFailure,
}

impl DriverError {
    fn new(stage: Stage, replication: usize, failure: DriverFailure) -> Self {
        Self {
            stage,
            replication,
            failure,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.failure, DriverFailure::Cancelled)
    }
}

fn other(stage: Stage, replication: usize) -> impl FnOnce(anyhow::Error) -> DriverError {
    move |e| DriverError::new(stage, replication, DriverFailure::Other(e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionTier {
    Full,
    Notice,
    Warning,
    Halt,
}

impl CompletionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionTier::Full => "full",
            CompletionTier::Notice => "notice",
            CompletionTier::Warning => "warning",
            CompletionTier::Halt => "halt",
        }
    }
}

pub fn completion_tier(valid: usize, total: usize, policy: &RunnerPolicy) -> CompletionTier {
    if total == 0 {
        return CompletionTier::Halt;
    }
    if valid >= total {
        return CompletionTier::Full;
    }
    let ratio = valid as f64 / total as f64;
    if ratio >= policy.completion_notice_threshold {
        CompletionTier::Notice
    } else if ratio >= policy.completion_halt_threshold {
        CompletionTier::Warning
    } else {
        CompletionTier::Halt
    }
}

/// Everything the driver needs from an experiment directory, loaded once.
#[derive(Debug, Clone)]
pub struct ExperimentContext {
    pub layout: ExperimentLayout,
    pub config: ExperimentConfig,
    pub subjects: Vec<Subject>,
}

impl ExperimentContext {
    pub fn load(store: &dyn Store, dir: &Path) -> Result<Self> {
        let layout = ExperimentLayout::new(dir);
        let config = match read_snapshot(store, &layout) {
            SnapshotState::Ok(config) => config,
            SnapshotState::Missing => {
                return Err(anyhow!("{} has no config snapshot", dir.display()))
            }
            other => {
                return Err(anyhow!(
                    "config snapshot at {} is not usable: {:?}",
                    dir.display(),
                    other
                ))
            }
        };
        if config.layout_version != CURRENT_LAYOUT_VERSION
            || config.schema_version != CURRENT_METRICS_SCHEMA
        {
            return Err(anyhow!(
                "{} uses layout {} / schema '{}' and needs migration before it can be modified",
                dir.display(),
                config.layout_version,
                config.schema_version
            ));
        }
        let subjects = load_subjects(store, &layout, &config)?;
        validate_config(&config, &subjects)?;
        Ok(Self {
            layout,
            config,
            subjects,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationOutcome {
    pub replication: usize,
    pub valid: usize,
    pub total: usize,
    pub tier: CompletionTier,
}

pub struct Driver {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmClient>,
    policy: RunnerPolicy,
    cancel: CancelToken,
}

impl Driver {
    pub fn new(
        store: Arc<dyn Store>,
        llm: Arc<dyn LlmClient>,
        policy: RunnerPolicy,
        cancel: CancelToken,
    ) -> Self {
        Self {
            store,
            llm,
            policy,
            cancel,
        }
    }

    pub fn policy(&self) -> &RunnerPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Creates replication `replication` from nothing. Refuses a directory
    /// that already has content.
    pub fn run_new(
        &self,
        ctx: &ExperimentContext,
        replication: usize,
    ) -> Result<ReplicationOutcome, DriverError> {
        let _lock = self.lock(ctx, replication, "new", Stage::GenerateQueries)?;
        let run_dir = ctx.layout.run_dir(replication);
        let existing = self
            .store
            .list(&run_dir)
            .map_err(other(Stage::GenerateQueries, replication))?;
        if !existing.is_empty() {
            return Err(DriverError::new(
                Stage::GenerateQueries,
                replication,
                DriverFailure::Occupied(run_dir.display().to_string()),
            ));
        }
        info!(replication, "creating replication");
        self.generate(ctx, replication)?;
        let all: Vec<usize> = (1..=ctx.config.trials_per_replication).collect();
        self.run_sessions(ctx, replication, &all)?;
        self.analyse(ctx, replication)
    }

    /// Discards the replication directory and rebuilds it from stage 1.
    pub fn regenerate(
        &self,
        ctx: &ExperimentContext,
        replication: usize,
    ) -> Result<ReplicationOutcome, DriverError> {
        let _lock = self.lock(ctx, replication, "regenerate", Stage::GenerateQueries)?;
        warn!(replication, "regenerating replication from scratch");
        self.store
            .delete_subtree(&ctx.layout.run_dir(replication))
            .map_err(other(Stage::GenerateQueries, replication))?;
        self.generate(ctx, replication)?;
        let all: Vec<usize> = (1..=ctx.config.trials_per_replication).collect();
        self.run_sessions(ctx, replication, &all)?;
        self.analyse(ctx, replication)
    }

    /// Re-runs only the sessions for `trials`, leaving every other file alone.
    /// Returns how many of them were answered.
    pub fn fetch_sessions(
        &self,
        ctx: &ExperimentContext,
        replication: usize,
        trials: &[usize],
    ) -> Result<usize, DriverError> {
        let _lock = self.lock(ctx, replication, "fetch", Stage::RunSessions)?;
        self.check_run_params(ctx, replication, Stage::RunSessions)?;
        self.run_sessions(ctx, replication, trials)
    }

    /// Stages 3 to 7 from the responses already on disk.
    pub fn reprocess(
        &self,
        ctx: &ExperimentContext,
        replication: usize,
    ) -> Result<ReplicationOutcome, DriverError> {
        let _lock = self.lock(ctx, replication, "reprocess", Stage::ParseResponses)?;
        self.check_run_params(ctx, replication, Stage::ParseResponses)?;
        self.analyse(ctx, replication)
    }

    /// Re-fetches `trials` and reprocesses, under a single lock.
    pub fn fast_repair(
        &self,
        ctx: &ExperimentContext,
        replication: usize,
        trials: &[usize],
    ) -> Result<ReplicationOutcome, DriverError> {
        let _lock = self.lock(ctx, replication, "repair", Stage::RunSessions)?;
        self.check_run_params(ctx, replication, Stage::RunSessions)?;
        self.run_sessions(ctx, replication, trials)?;
        self.analyse(ctx, replication)
    }

    fn lock(
        &self,
        ctx: &ExperimentContext,
        replication: usize,
        label: &str,
        stage: Stage,
    ) -> Result<OperationLock, DriverError> {
        let path = ctx.layout.replication_lock(replication);
        match OperationLock::try_acquire(&self.store, &path, label, self.cancel.locks()) {
            Ok(Some(lock)) => Ok(lock),
            Ok(None) => Err(DriverError::new(
                stage,
                replication,
                DriverFailure::LockHeld(describe_holder(self.store.as_ref(), &path)),
            )),
            Err(e) => Err(DriverError::new(stage, replication, DriverFailure::Other(e))),
        }
    }

    fn check_run_params(
        &self,
        ctx: &ExperimentContext,
        replication: usize,
        stage: Stage,
    ) -> Result<(), DriverError> {
        let path = ctx.layout.run_params(replication);
        let params: RunParams = read_json(self.store.as_ref(), &path).map_err(|e| {
            DriverError::new(
                stage,
                replication,
                DriverFailure::MissingArtifact(format!("{:#}", e)),
            )
        })?;
        let diffs = params.mismatches(&ctx.config, replication);
        if diffs.is_empty() {
            Ok(())
        } else {
            Err(DriverError::new(
                stage,
                replication,
                DriverFailure::ConfigMismatch(diffs.join(", ")),
            ))
        }
    }

    fn generate(&self, ctx: &ExperimentContext, replication: usize) -> Result<(), DriverError> {
        let stage = Stage::GenerateQueries;
        let store = self.store.as_ref();
        let layout = &ctx.layout;
        store
            .create_dir_all(&layout.run_dir(replication))
            .map_err(other(stage, replication))?;
        let swept = store
            .sweep_temp(&layout.run_dir(replication))
            .map_err(other(stage, replication))?;
        if swept > 0 {
            debug!(replication, swept, "removed leftover temp files");
        }
        write_json(
            store,
            &layout.run_params(replication),
            &RunParams::for_replication(&ctx.config, replication),
        )
        .map_err(other(stage, replication))?;
        for trial in 1..=ctx.config.trials_per_replication {
            if self.cancel.is_cancelled() {
                return Err(DriverError::new(stage, replication, DriverFailure::Cancelled));
            }
            let manifest = build_manifest(&ctx.config, &ctx.subjects, replication, trial);
            let query = render_query(&ctx.config, &ctx.subjects, &manifest)
                .map_err(other(stage, replication))?;
            write_json(store, &layout.manifest(replication, trial), &manifest)
                .map_err(other(stage, replication))?;
            store
                .atomic_write(&layout.query(replication, trial), query.as_bytes())
                .map_err(other(stage, replication))?;
        }
        info!(
            replication,
            trials = ctx.config.trials_per_replication,
            "queries generated"
        );
        Ok(())
    }

    fn run_sessions(
        &self,
        ctx: &ExperimentContext,
        replication: usize,
        trials: &[usize],
    ) -> Result<usize, DriverError> {
        let stage = Stage::RunSessions;
        let store = self.store.as_ref();
        let mut jobs = Vec::with_capacity(trials.len());
        for &trial in trials {
            let path = ctx.layout.query(replication, trial);
            let query = store.read_to_string(&path).map_err(|_| {
                DriverError::new(
                    stage,
                    replication,
                    DriverFailure::MissingArtifact(path.display().to_string()),
                )
            })?;
            jobs.push((trial, query));
        }

        let model = ctx.config.model.as_str();
        let results = run_bounded(
            &jobs,
            self.policy.max_workers,
            &self.cancel,
            |(trial, query)| -> Result<Option<bool>> {
                let outcome =
                    send_with_retry(self.llm.as_ref(), query, model, &self.policy, &self.cancel);
                let (text, answered) = match outcome {
                    SessionOutcome::Answered { text, .. } => (text, true),
                    SessionOutcome::Failed { error, attempts } => (
                        format!("{} {} after {} attempts", SESSION_FAILED_MARKER, error, attempts),
                        false,
                    ),
                    SessionOutcome::Cancelled => return Ok(None),
                };
                store.atomic_write(&ctx.layout.response(replication, *trial), text.as_bytes())?;
                Ok(Some(answered))
            },
        )
        .map_err(|e| DriverError::new(stage, replication, DriverFailure::Other(e)))?;

        let mut answered = 0;
        for result in results {
            match result {
                Some(Ok(Some(true))) => answered += 1,
                Some(Ok(Some(false))) => {}
                Some(Err(e)) => return Err(DriverError::new(stage, replication, DriverFailure::Other(e))),
                Some(Ok(None)) | None => {}
            }
        }
        if self.cancel.is_cancelled() {
            return Err(DriverError::new(stage, replication, DriverFailure::Cancelled));
        }
        info!(replication, requested = trials.len(), answered, "sessions finished");
        Ok(answered)
    }

    /// Stages 3 to 7.
    fn analyse(
        &self,
        ctx: &ExperimentContext,
        replication: usize,
    ) -> Result<ReplicationOutcome, DriverError> {
        let store = self.store.as_ref();
        let layout = &ctx.layout;
        let config = &ctx.config;
        let k = config.group_size;
        let m = config.trials_per_replication;

        let stage = Stage::ParseResponses;
        let mut trials: Vec<ParsedTrial> = Vec::with_capacity(m);
        for t in 1..=m {
            let manifest: TrialManifest =
                read_json(store, &layout.manifest(replication, t)).map_err(|e| {
                    DriverError::new(stage, replication, DriverFailure::MissingArtifact(format!("{:#}", e)))
                })?;
            let response_path = layout.response(replication, t);
            let text = store.read_to_string(&response_path).map_err(|_| {
                DriverError::new(
                    stage,
                    replication,
                    DriverFailure::MissingArtifact(response_path.display().to_string()),
                )
            })?;
            trials.push(parse_response(t, &text, k, manifest.correct_position));
        }
        if self.cancel.is_cancelled() {
            return Err(DriverError::new(stage, replication, DriverFailure::Cancelled));
        }

        let stage = Stage::ComputeMetrics;
        let valid = trials.iter().filter(|t| t.valid).count();
        let tier = completion_tier(valid, m, &self.policy);
        match tier {
            CompletionTier::Full => {}
            CompletionTier::Notice => info!(replication, valid, total = m, "minor response loss"),
            CompletionTier::Warning => warn!(
                replication,
                valid,
                total = m,
                "response loss above notice threshold; results may be degraded"
            ),
            CompletionTier::Halt => {
                warn!(replication, valid, total = m, "too few valid responses, not writing a report");
                return Err(DriverError::new(
                    stage,
                    replication,
                    DriverFailure::InsufficientData { valid, total: m },
                ));
            }
        }
        let metrics = compute_metrics(&trials, k).map_err(other(stage, replication))?;
        let completion = CompletionSummary {
            valid,
            total: m,
            ratio: valid as f64 / m as f64,
            tier: tier.as_str().to_string(),
        };
        write_json(
            store,
            &layout.parsed_metrics(replication),
            &json!({
                "replication": replication,
                "trials": trials,
                "metrics": metrics,
                "completion": completion,
            }),
        )
        .map_err(other(stage, replication))?;

        let stage = Stage::ComputeBias;
        let bias = compute_bias(&trials);
        write_json(store, &layout.bias(replication), &bias).map_err(other(stage, replication))?;

        let stage = Stage::WriteReport;
        if self.cancel.is_cancelled() {
            return Err(DriverError::new(stage, replication, DriverFailure::Cancelled));
        }
        let block = ReportBlock {
            schema_version: config.schema_version.clone(),
            experiment_id: config.experiment_id.clone(),
            replication,
            parameters: ReportParameters {
                model: config.model.clone(),
                group_size: k,
                trials_per_replication: m,
            },
            metrics: metrics_map(&metrics, &bias).map_err(other(stage, replication))?,
            completion,
            parse_failures: trials
                .iter()
                .filter(|t| !t.valid)
                .map(|t| ParseFailure {
                    trial: t.trial,
                    reason: t.reason.clone().unwrap_or_default(),
                })
                .collect(),
            response_digest: response_digest(store, layout, replication, m)
                .map_err(other(stage, replication))?,
            generated_at: Utc::now().to_rfc3339(),
        };
        let text = render_report(&block).map_err(other(stage, replication))?;
        store
            .atomic_write(&layout.report(replication), text.as_bytes())
            .map_err(other(stage, replication))?;
        info!(replication, valid, total = m, tier = tier.as_str(), "report written");

        let stage = Stage::Aggregate;
        write_experiment_summary(store, layout, config).map_err(other(stage, replication))?;

        Ok(ReplicationOutcome {
            replication,
            valid,
            total: m,
            tier,
        })
    }
}

fn draw(config: &ExperimentConfig, replication: usize, trial: usize, tag: &str, id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}|{}|{}|{}|{}|{}",
            config.seed, config.experiment_id, replication, trial, tag, id
        )
        .as_bytes(),
    );
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Deterministic candidate group for one trial: the target, `k - 1`
/// distractors and their order all derive from the seed and the trial
/// coordinates, so regenerating a replication reproduces it exactly.
pub fn build_manifest(
    config: &ExperimentConfig,
    subjects: &[Subject],
    replication: usize,
    trial: usize,
) -> TrialManifest {
    let k = config.group_size;
    let target_idx = (draw(config, replication, trial, "target", "") % subjects.len() as u64) as usize;
    let target = &subjects[target_idx];

    let mut others: Vec<(u64, &Subject)> = subjects
        .iter()
        .filter(|s| s.id != target.id)
        .map(|s| (draw(config, replication, trial, "distractor", &s.id), s))
        .collect();
    others.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

    let mut group: Vec<(u64, &Subject)> = others
        .into_iter()
        .take(k.saturating_sub(1))
        .map(|(_, s)| s)
        .chain(std::iter::once(target))
        .map(|s| (draw(config, replication, trial, "order", &s.id), s))
        .collect();
    group.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

    let candidates: Vec<String> = group.iter().map(|(_, s)| s.id.clone()).collect();
    let correct_position = candidates
        .iter()
        .position(|id| *id == target.id)
        .map(|p| p + 1)
        .unwrap_or(0);
    TrialManifest {
        trial,
        group_size: k,
        subject_id: target.id.clone(),
        candidates,
        correct_position,
    }
}

pub fn render_query(
    config: &ExperimentConfig,
    subjects: &[Subject],
    manifest: &TrialManifest,
) -> Result<String> {
    let find = |id: &str| {
        subjects
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| anyhow!("subject '{}' not in pool", id))
    };
    let target = find(&manifest.subject_id)?;
    let mut lines = Vec::with_capacity(manifest.candidates.len());
    for (n, id) in manifest.candidates.iter().enumerate() {
        lines.push(format!("{}: {}", n + 1, find(id)?.name));
    }
    Ok(config
        .query_template
        .replace("{k}", &config.group_size.to_string())
        .replace("{profile}", target.profile.trim())
        .replace("{candidates}", &lines.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditFinding, Auditor, ExperimentStatus};
    use crate::config::tests::definition;
    use crate::config::write_snapshot;
    use crate::llm::tests::OracleLlm;
    use crate::llm::LlmError;
    use crate::lock::LockRegistry;
    use crate::report::read_block;
    use replab_core::MemStore;
    use std::thread;
    use std::time::Duration;

    fn setup(k: usize, m: usize, n: usize) -> (Arc<MemStore>, ExperimentContext) {
        let store = Arc::new(MemStore::new());
        let layout = ExperimentLayout::new("/exp");
        write_snapshot(store.as_ref(), &layout, &definition(k, m, n)).expect("snapshot");
        let ctx = ExperimentContext::load(store.as_ref(), layout.root()).expect("ctx");
        (store, ctx)
    }

    fn driver(store: &Arc<MemStore>, llm: OracleLlm) -> Driver {
        let policy = RunnerPolicy {
            retry_backoff_ms: 0,
            ..RunnerPolicy::default()
        };
        Driver::new(store.clone(), Arc::new(llm), policy, CancelToken::new())
    }

    #[test]
    fn completed_run_audits_as_valid() {
        let (store, ctx) = setup(4, 5, 1);
        let outcome = driver(&store, OracleLlm::new()).run_new(&ctx, 1).expect("run");
        assert_eq!(outcome.tier, CompletionTier::Full);
        let audit = Auditor::new(store.clone()).audit_experiment(ctx.layout.root());
        assert_eq!(audit.status, ExperimentStatus::Validated, "{}", audit.render_text());
        let block = read_block(store.as_ref(), &ctx.layout, 1).expect("block");
        assert_eq!(block.metrics["mean_top_1_acc"], json!(1.0));
    }

    #[test]
    fn trials_are_deterministic_and_well_formed() {
        let def = definition(5, 3, 1);
        let a = build_manifest(&def.config, &def.subjects, 2, 7);
        let b = build_manifest(&def.config, &def.subjects, 2, 7);
        assert_eq!(a, b);
        assert!(a.is_consistent(7, 5));
        let mut ids = a.candidates.clone();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
        let query = render_query(&def.config, &def.subjects, &a).expect("query");
        assert!(query.contains("1: Person"));
        assert!(!query.contains("{candidates}"));
    }

    #[test]
    fn completion_tiers_follow_policy() {
        let p = RunnerPolicy::default();
        assert_eq!(completion_tier(50, 50, &p), CompletionTier::Full);
        assert_eq!(completion_tier(199, 200, &p), CompletionTier::Notice);
        assert_eq!(completion_tier(48, 50, &p), CompletionTier::Warning);
        assert_eq!(completion_tier(47, 50, &p), CompletionTier::Halt);
        assert_eq!(completion_tier(0, 0, &p), CompletionTier::Halt);
    }

    #[test]
    fn ninety_four_percent_halts_without_report() {
        let (store, ctx) = setup(4, 50, 1);
        let err = driver(&store, OracleLlm::failing_first(3, LlmError::AuthFailed))
            .run_new(&ctx, 1)
            .expect_err("must halt");
        assert!(matches!(
            err.failure,
            DriverFailure::InsufficientData { valid: 47, total: 50 }
        ));
        assert_eq!(err.stage, Stage::ComputeMetrics);
        assert!(!store.exists(&ctx.layout.report(1)));
        // the failed sessions are what a repair has to re-fetch
        let audit = Auditor::new(store.clone()).audit_experiment(ctx.layout.root());
        match audit.finding(1) {
            Some(AuditFinding::ResponseIssue { trials, .. }) => assert_eq!(trials.len(), 3),
            other => panic!("expected ResponseIssue, got {:?}", other),
        }
    }

    #[test]
    fn ninety_six_percent_warns_and_completes() {
        let (store, ctx) = setup(4, 50, 1);
        let outcome = driver(&store, OracleLlm::failing_first(2, LlmError::AuthFailed))
            .run_new(&ctx, 1)
            .expect("run");
        assert_eq!(outcome.tier, CompletionTier::Warning);
        assert_eq!(outcome.valid, 48);
        let block = read_block(store.as_ref(), &ctx.layout, 1).expect("block");
        assert_eq!(block.parse_failures.len(), 2);
        assert_eq!(block.completion.tier, "warning");
    }

    #[test]
    fn ninety_nine_and_a_half_percent_proceeds_quietly() {
        let (store, ctx) = setup(4, 200, 1);
        let outcome = driver(&store, OracleLlm::failing_first(1, LlmError::AuthFailed))
            .run_new(&ctx, 1)
            .expect("run");
        assert_eq!(outcome.tier, CompletionTier::Notice);
        assert_eq!(outcome.valid, 199);
    }

    #[test]
    fn held_lock_is_reported() {
        let (store, ctx) = setup(4, 2, 1);
        let dyn_store: Arc<dyn Store> = store.clone();
        let _held = OperationLock::try_acquire(
            &dyn_store,
            &ctx.layout.replication_lock(1),
            "other",
            &LockRegistry::default(),
        )
            .expect("io")
            .expect("lock");
        let err = driver(&store, OracleLlm::new())
            .run_new(&ctx, 1)
            .expect_err("locked");
        assert!(matches!(err.failure, DriverFailure::LockHeld(_)));
        assert!(!store.exists(&ctx.layout.run_params(1)));
    }

    #[test]
    fn concurrent_creation_of_one_slot_admits_one_driver() {
        let (store, ctx) = setup(4, 3, 1);
        let llm = OracleLlm {
            delay: Duration::from_millis(20),
            ..OracleLlm::new()
        };
        let driver = driver(&store, llm);
        let results: Vec<Result<ReplicationOutcome, DriverError>> = thread::scope(|s| {
            let a = s.spawn(|| driver.run_new(&ctx, 1));
            let b = s.spawn(|| driver.run_new(&ctx, 1));
            vec![a.join().expect("join"), b.join().expect("join")]
        });
        let ok = results.iter().filter(|r| r.is_ok()).count();
        // the loser either saw the lock or, if it came second, the populated directory
        let refused = results
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(DriverError {
                        failure: DriverFailure::LockHeld(_) | DriverFailure::Occupied(_),
                        ..
                    })
                )
            })
            .count();
        assert_eq!((ok, refused), (1, 1));
    }

    #[test]
    fn interrupted_report_write_keeps_previous_report() {
        let (store, ctx) = setup(4, 3, 1);
        let d = driver(&store, OracleLlm::new());
        d.run_new(&ctx, 1).expect("run");
        let before = store.read(&ctx.layout.report(1)).expect("report");

        store
            .atomic_write(&ctx.layout.response(1, 2), b"1: 0.9\n2: 0.8\n3: 0.7\n4: 0.6")
            .expect("write");
        store.fail_writes_named("replication_report.txt");
        let err = d.reprocess(&ctx, 1).expect_err("write fails");
        assert_eq!(err.stage, Stage::WriteReport);
        assert_eq!(store.read(&ctx.layout.report(1)).expect("report"), before);
        // the old report no longer matches the responses, so it is stale, not valid
        let audit = Auditor::new(store.clone()).audit_experiment(ctx.layout.root());
        assert!(matches!(audit.finding(1), Some(AuditFinding::AnalysisIssue { .. })));

        store.clear_write_failures();
        d.reprocess(&ctx, 1).expect("reprocess");
        let audit = Auditor::new(store.clone()).audit_experiment(ctx.layout.root());
        assert_eq!(audit.finding(1), Some(&AuditFinding::Valid));
    }

    #[test]
    fn fast_repair_touches_only_requested_responses() {
        let (store, ctx) = setup(4, 4, 1);
        let d = driver(&store, OracleLlm::new());
        d.run_new(&ctx, 1).expect("run");
        store.remove_file(&ctx.layout.response(1, 3)).expect("rm");
        store.clear_write_log();
        d.fast_repair(&ctx, 1, &[3]).expect("repair");
        let touched: Vec<_> = store
            .write_log()
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().starts_with("response_"))
                    .unwrap_or(false)
            })
            .collect();
        assert_eq!(touched, vec![ctx.layout.response(1, 3)]);
        assert!(!store.write_log().contains(&ctx.layout.query(1, 1)));
    }

    #[test]
    fn cancellation_stops_before_the_report() {
        let (store, ctx) = setup(4, 6, 1);
        let cancel = CancelToken::new();
        cancel.cancel();
        let d = Driver::new(
            store.clone(),
            Arc::new(OracleLlm::new()),
            RunnerPolicy::default(),
            cancel,
        );
        let err = d.run_new(&ctx, 1).expect_err("cancelled");
        assert!(err.is_cancelled());
        assert!(!store.exists(&ctx.layout.report(1)));
        assert!(!store.exists(&ctx.layout.replication_lock(1)));
    }

    #[test]
    fn fetch_refuses_mismatched_parameters() {
        let (store, ctx) = setup(4, 2, 1);
        let d = driver(&store, OracleLlm::new());
        d.run_new(&ctx, 1).expect("run");
        let mut params = RunParams::for_replication(&ctx.config, 1);
        params.seed = 7;
        write_json(store.as_ref(), &ctx.layout.run_params(1), &params).expect("write");
        let err = d.fetch_sessions(&ctx, 1, &[1]).expect_err("mismatch");
        assert!(matches!(err.failure, DriverFailure::ConfigMismatch(_)));
    }
}
