//! Read-only verification of experiment directories.
//!
//! The auditor never writes and never returns an error: a malformed
//! replication is a finding, not a failure. It owns the metrics schema map,
//! keyed by the version recorded in each experiment's snapshot, so older
//! experiments are checked against the schema they were created under.

use crate::aggregate::{experiment_columns, parse_csv, summary_row};
use crate::config::{
    read_snapshot, ExperimentConfig, RunParams, SnapshotState, CURRENT_LAYOUT_VERSION,
    CURRENT_METRICS_SCHEMA,
};
use crate::layout::{
    parse_indexed, read_json, ExperimentLayout, TrialManifest, MANIFEST_PREFIX, QUERY_PREFIX,
    RESPONSE_PREFIX, RUN_PREFIX,
};
use crate::report::{extract_block, response_digest, ReportBlock};
use replab_analysis::{parse_response, BiasRecord, SESSION_FAILED_MARKER};
use replab_core::Store;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const METRICS_V1_KEYS: [&str; 11] = [
    "n_valid_responses",
    "mean_rank_of_correct_id",
    "mean_mrr",
    "mean_top_1_acc",
    "mean_top_3_acc",
    "median_mrr",
    "median_top_1_acc",
    "median_top_3_acc",
    "bias_slope",
    "bias_intercept",
    "bias_p_value",
];

const METRICS_V2_KEYS: [&str; 14] = [
    "n_valid_responses",
    "mean_rank_of_correct_id",
    "mean_mrr",
    "mean_top_1_acc",
    "mean_top_3_acc",
    "median_mrr",
    "median_top_1_acc",
    "median_top_3_acc",
    "bias_slope",
    "bias_intercept",
    "bias_p_value",
    "mean_mrr_lift",
    "mean_top_1_acc_lift",
    "mean_top_3_acc_lift",
];

/// Exact metric key set of a versioned report schema.
pub fn required_metric_keys(schema_version: &str) -> Option<&'static [&'static str]> {
    match schema_version {
        "replication_metrics_v1" => Some(&METRICS_V1_KEYS),
        "replication_metrics_v2" => Some(&METRICS_V2_KEYS),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditFinding {
    Valid,
    /// Responses missing, or failed sessions and unparseable answers blocking
    /// the analysis; fixed by re-fetching just these trials.
    ResponseIssue {
        trials: Vec<usize>,
        paths: Vec<PathBuf>,
    },
    /// Query-side artifacts missing or inconsistent; responses cannot be
    /// trusted without them.
    QueryIssue { paths: Vec<PathBuf> },
    /// Replication produced under parameters other than the snapshot's.
    ConfigIssue { reason: String },
    /// Two or more independent faults, or stale files from another run.
    RunCorrupted { faults: Vec<String> },
    /// Core files intact; parsed metrics, bias analysis or report wrong.
    AnalysisIssue { problems: Vec<String> },
    /// Replication valid but missing from, or stale in, the experiment summary.
    AggregationIssue { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remedy {
    None,
    FastRepair(Vec<usize>),
    Reprocess,
    Regenerate,
    Reaggregate,
    ManualParameterFix,
}

impl AuditFinding {
    pub fn tag(&self) -> &'static str {
        match self {
            AuditFinding::Valid => "VALID",
            AuditFinding::ResponseIssue { .. } => "RESPONSE_ISSUE",
            AuditFinding::QueryIssue { .. } => "QUERY_ISSUE",
            AuditFinding::ConfigIssue { .. } => "CONFIG_ISSUE",
            AuditFinding::RunCorrupted { .. } => "RUN_CORRUPTED",
            AuditFinding::AnalysisIssue { .. } => "ANALYSIS_ISSUE",
            AuditFinding::AggregationIssue { .. } => "AGGREGATION_ISSUE",
        }
    }

    pub fn remedy(&self) -> Remedy {
        match self {
            AuditFinding::Valid => Remedy::None,
            AuditFinding::ResponseIssue { trials, .. } => Remedy::FastRepair(trials.clone()),
            AuditFinding::QueryIssue { .. } | AuditFinding::RunCorrupted { .. } => {
                Remedy::Regenerate
            }
            AuditFinding::ConfigIssue { .. } => Remedy::ManualParameterFix,
            AuditFinding::AnalysisIssue { .. } => Remedy::Reprocess,
            AuditFinding::AggregationIssue { .. } => Remedy::Reaggregate,
        }
    }

    /// Whether the replication itself (not just the roll-up) must be touched.
    pub fn needs_repair(&self) -> bool {
        matches!(
            self.remedy(),
            Remedy::FastRepair(_) | Remedy::Reprocess | Remedy::Regenerate
        )
    }

    pub fn details(&self, root: &Path) -> Vec<String> {
        let rel = |p: &PathBuf| p.strip_prefix(root).unwrap_or(p).display().to_string();
        match self {
            AuditFinding::Valid => Vec::new(),
            AuditFinding::ResponseIssue { paths, .. } | AuditFinding::QueryIssue { paths } => {
                paths.iter().map(rel).collect()
            }
            AuditFinding::ConfigIssue { reason } | AuditFinding::AggregationIssue { reason } => {
                vec![reason.clone()]
            }
            AuditFinding::RunCorrupted { faults } => faults.clone(),
            AuditFinding::AnalysisIssue { problems } => problems.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentStatus {
    NewNeeded,
    RepairNeeded,
    AggregationNeeded,
    Validated,
    MigrationNeeded,
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExperimentStatus::NewNeeded => "NEW_NEEDED",
            ExperimentStatus::RepairNeeded => "REPAIR_NEEDED",
            ExperimentStatus::AggregationNeeded => "AGGREGATION_NEEDED",
            ExperimentStatus::Validated => "VALIDATED",
            ExperimentStatus::MigrationNeeded => "MIGRATION_NEEDED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    None,
    CreateExperiment,
    CreateReplications,
    Repair,
    Aggregate,
    Migrate,
    FixConfiguration,
}

impl NextAction {
    pub fn describe(&self) -> &'static str {
        match self {
            NextAction::None => "none; the experiment is VALIDATED",
            NextAction::CreateExperiment => {
                "run `replab new --config <definition.yaml> <experiment_dir>` to create the experiment"
            }
            NextAction::CreateReplications => {
                "run `replab fix <experiment_dir>` to create the missing replications"
            }
            NextAction::Repair => "run `replab fix <experiment_dir>` to repair the replications listed above",
            NextAction::Aggregate => {
                "run `replab fix <experiment_dir>` to rebuild experiment_summary.csv"
            }
            NextAction::Migrate => {
                "upgrade the directory with the legacy migration tool; `replab fix` will not modify it"
            }
            NextAction::FixConfiguration => {
                "fix the parameters by hand; automatic repair would discard data produced under other parameters"
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationAudit {
    pub replication: usize,
    pub finding: AuditFinding,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentAudit {
    pub dir: PathBuf,
    pub status: ExperimentStatus,
    pub config: Option<ExperimentConfig>,
    /// Problems with the experiment as a whole (snapshot, stray runs) that
    /// need a human.
    pub config_faults: Vec<String>,
    pub migration_reason: Option<String>,
    pub replications: Vec<ReplicationAudit>,
    pub missing: Vec<usize>,
    pub summary_faults: Vec<String>,
}

impl ExperimentAudit {
    pub fn next_action(&self) -> NextAction {
        if self.status == ExperimentStatus::MigrationNeeded {
            return NextAction::Migrate;
        }
        if self.config.is_none() && self.status == ExperimentStatus::NewNeeded {
            return NextAction::CreateExperiment;
        }
        if !self.config_faults.is_empty()
            || self
                .replications
                .iter()
                .any(|r| matches!(r.finding, AuditFinding::ConfigIssue { .. }))
        {
            return NextAction::FixConfiguration;
        }
        match self.status {
            ExperimentStatus::Validated => NextAction::None,
            ExperimentStatus::RepairNeeded => NextAction::Repair,
            ExperimentStatus::NewNeeded => NextAction::CreateReplications,
            ExperimentStatus::AggregationNeeded => NextAction::Aggregate,
            ExperimentStatus::MigrationNeeded => NextAction::Migrate,
        }
    }

    /// 0 validated, 2 work the state machine can do, 3 migration, 4 manual fix.
    pub fn exit_code(&self) -> i32 {
        match self.next_action() {
            NextAction::None => 0,
            NextAction::CreateExperiment
            | NextAction::CreateReplications
            | NextAction::Repair
            | NextAction::Aggregate => 2,
            NextAction::Migrate => 3,
            NextAction::FixConfiguration => 4,
        }
    }

    pub fn finding(&self, replication: usize) -> Option<&AuditFinding> {
        self.replications
            .iter()
            .find(|r| r.replication == replication)
            .map(|r| &r.finding)
    }

    /// Plain, uncolored report for `experiment_audit_log.txt` and the console.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Experiment Audit Report");
        let _ = writeln!(out, "=======================");
        let _ = writeln!(out, "Directory: {}", self.dir.display());
        let _ = writeln!(out, "Status:    {}", self.status);
        if let Some(c) = &self.config {
            let _ = writeln!(
                out,
                "Snapshot:  model={} k={} m={} n={} schema={}",
                c.model, c.group_size, c.trials_per_replication, c.replications, c.schema_version
            );
        }
        if let Some(reason) = &self.migration_reason {
            let _ = writeln!(out, "Migration: {}", reason);
        }
        if !self.config_faults.is_empty() {
            let _ = writeln!(out, "Configuration faults:");
            for f in &self.config_faults {
                let _ = writeln!(out, "  - {}", f);
            }
        }
        if !self.replications.is_empty() || !self.missing.is_empty() {
            let _ = writeln!(out, "Replications:");
            let mut lines: BTreeMap<usize, String> = BTreeMap::new();
            for r in &self.replications {
                let mut line = format!("  run_{:<4} {}", r.replication, r.finding.tag());
                for d in r.finding.details(&self.dir) {
                    let _ = write!(line, "\n      - {}", d);
                }
                lines.insert(r.replication, line);
            }
            for i in &self.missing {
                lines.insert(*i, format!("  run_{:<4} MISSING", i));
            }
            for line in lines.values() {
                let _ = writeln!(out, "{}", line);
            }
        }
        if !self.summary_faults.is_empty() {
            let _ = writeln!(out, "Experiment summary:");
            for f in &self.summary_faults {
                let _ = writeln!(out, "  - {}", f);
            }
        }
        let _ = writeln!(out, "Recommended action: {}", self.next_action().describe());
        out
    }
}

enum SummaryView {
    Missing,
    Broken(String),
    Rows(BTreeMap<usize, Vec<String>>),
}

pub struct Auditor {
    store: Arc<dyn Store>,
}

impl Auditor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn audit_experiment(&self, dir: &Path) -> ExperimentAudit {
        let store = self.store.as_ref();
        let layout = ExperimentLayout::new(dir);
        let mut audit = ExperimentAudit {
            dir: dir.to_path_buf(),
            status: ExperimentStatus::Validated,
            config: None,
            config_faults: Vec::new(),
            migration_reason: None,
            replications: Vec::new(),
            missing: Vec::new(),
            summary_faults: Vec::new(),
        };

        let mut run_dirs: Vec<(String, Option<(usize, bool)>)> = Vec::new();
        match store.list(dir) {
            Ok(names) => {
                for name in names {
                    if name.starts_with(RUN_PREFIX) && store.is_dir(&dir.join(&name)) {
                        let parsed = parse_indexed(&name, RUN_PREFIX, "");
                        run_dirs.push((name, parsed));
                    }
                }
            }
            Err(e) => audit
                .config_faults
                .push(format!("cannot list experiment directory: {:#}", e)),
        }

        let config = match read_snapshot(store, &layout) {
            SnapshotState::Ok(config) => config,
            SnapshotState::Missing => {
                if run_dirs.is_empty() {
                    audit.status = ExperimentStatus::NewNeeded;
                    audit
                        .config_faults
                        .push("no config_snapshot.json; create the experiment with `replab new`".to_string());
                } else {
                    audit.status = ExperimentStatus::MigrationNeeded;
                    audit.migration_reason = Some(
                        "replication directories exist but there is no config snapshot (pre-snapshot layout)"
                            .to_string(),
                    );
                }
                return audit;
            }
            SnapshotState::Unreadable(reason) => {
                audit.status = ExperimentStatus::RepairNeeded;
                audit
                    .config_faults
                    .push(format!("config snapshot unreadable: {}", reason));
                return audit;
            }
            SnapshotState::Tampered { expected, found } => {
                audit.status = ExperimentStatus::RepairNeeded;
                audit.config_faults.push(format!(
                    "config snapshot modified after creation (recorded {}, now {})",
                    expected, found
                ));
                return audit;
            }
        };
        audit.config = Some(config.clone());

        if config.layout_version != CURRENT_LAYOUT_VERSION {
            audit.status = ExperimentStatus::MigrationNeeded;
            audit.migration_reason = Some(format!(
                "layout version {} (this tool writes version {})",
                config.layout_version, CURRENT_LAYOUT_VERSION
            ));
            return audit;
        }
        let Some(keys) = required_metric_keys(&config.schema_version) else {
            audit.status = ExperimentStatus::MigrationNeeded;
            audit.migration_reason = Some(format!(
                "unknown metrics schema '{}'",
                config.schema_version
            ));
            return audit;
        };

        for (name, parsed) in &run_dirs {
            match parsed {
                Some((i, true)) if *i <= config.replications => {}
                _ => audit.config_faults.push(format!(
                    "stray replication directory {} (snapshot declares {} replications)",
                    name, config.replications
                )),
            }
        }

        let summary = self.load_summary(&layout, keys, &mut audit.summary_faults);
        for replication in 1..=config.replications {
            if store.is_dir(&layout.run_dir(replication)) {
                let finding = self.audit_replication(&layout, &config, keys, replication, &summary);
                audit.replications.push(ReplicationAudit {
                    replication,
                    finding,
                });
            } else {
                audit.missing.push(replication);
            }
        }
        if let SummaryView::Rows(rows) = &summary {
            for i in rows.keys() {
                if *i == 0 || *i > config.replications || audit.missing.contains(i) {
                    audit
                        .summary_faults
                        .push(format!("summary has a row for replication {} which does not exist", i));
                }
            }
        }

        let legacy = config.schema_version != CURRENT_METRICS_SCHEMA;
        let needs_repair = audit.replications.iter().any(|r| {
            r.finding.needs_repair() || matches!(r.finding, AuditFinding::ConfigIssue { .. })
        });
        let needs_aggregation = !audit.summary_faults.is_empty()
            || audit
                .replications
                .iter()
                .any(|r| matches!(r.finding, AuditFinding::AggregationIssue { .. }));
        audit.status = if !audit.config_faults.is_empty() || needs_repair {
            ExperimentStatus::RepairNeeded
        } else if !audit.missing.is_empty() {
            ExperimentStatus::NewNeeded
        } else if needs_aggregation {
            ExperimentStatus::AggregationNeeded
        } else {
            ExperimentStatus::Validated
        };
        if legacy && audit.status != ExperimentStatus::Validated && audit.config_faults.is_empty() {
            audit.migration_reason = Some(format!(
                "experiment uses legacy schema '{}' and cannot be completed with '{}' artifacts",
                config.schema_version, CURRENT_METRICS_SCHEMA
            ));
            audit.status = ExperimentStatus::MigrationNeeded;
        }
        audit
    }

    fn load_summary(
        &self,
        layout: &ExperimentLayout,
        keys: &[&str],
        faults: &mut Vec<String>,
    ) -> SummaryView {
        let path = layout.summary();
        if !self.store.exists(&path) {
            return SummaryView::Missing;
        }
        let table = match self
            .store
            .read_to_string(&path)
            .and_then(|text| parse_csv(&text))
        {
            Ok(t) => t,
            Err(e) => {
                let reason = format!("experiment_summary.csv unreadable: {:#}", e);
                faults.push(reason.clone());
                return SummaryView::Broken(reason);
            }
        };
        if table.header != experiment_columns(keys) {
            let reason = "experiment_summary.csv header does not match the metrics schema".to_string();
            faults.push(reason.clone());
            return SummaryView::Broken(reason);
        }
        let mut rows = BTreeMap::new();
        for row in table.rows {
            match row[0].parse::<usize>() {
                Ok(i) => {
                    if rows.insert(i, row).is_some() {
                        faults.push(format!("summary has duplicate rows for replication {}", i));
                    }
                }
                Err(_) => faults.push(format!("summary row with invalid replication '{}'", row[0])),
            }
        }
        SummaryView::Rows(rows)
    }

    /// Classifies one existing replication directory.
    fn audit_replication(
        &self,
        layout: &ExperimentLayout,
        config: &ExperimentConfig,
        keys: &[&str],
        replication: usize,
        summary: &SummaryView,
    ) -> AuditFinding {
        let store = self.store.as_ref();
        let m = config.trials_per_replication;
        let run_dir = layout.run_dir(replication);

        let mut query_faults: Vec<PathBuf> = Vec::new();
        let params_path = layout.run_params(replication);
        if !store.exists(&params_path) {
            query_faults.push(params_path.clone());
        } else {
            match read_json::<RunParams>(store, &params_path) {
                Ok(params) => {
                    let diffs = params.mismatches(config, replication);
                    if !diffs.is_empty() {
                        return AuditFinding::ConfigIssue {
                            reason: format!(
                                "run_{} was produced under different parameters: {}",
                                replication,
                                diffs.join(", ")
                            ),
                        };
                    }
                }
                Err(_) => query_faults.push(params_path.clone()),
            }
        }

        let mut missing_trials: Vec<usize> = Vec::new();
        let mut missing_responses: Vec<PathBuf> = Vec::new();
        // Failed sessions and answers the parser rejects.
        let mut unusable_trials: Vec<usize> = Vec::new();
        for t in 1..=m {
            let query = layout.query(replication, t);
            if !non_empty(store, &query) {
                query_faults.push(query);
            }
            let manifest_path = layout.manifest(replication, t);
            let manifest = read_json::<TrialManifest>(store, &manifest_path)
                .ok()
                .filter(|mf| mf.is_consistent(t, config.group_size));
            if manifest.is_none() {
                query_faults.push(manifest_path);
            }
            let response = layout.response(replication, t);
            match store.read(&response) {
                Ok(bytes) if !bytes.iter().all(|b| b.is_ascii_whitespace()) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let usable = match &manifest {
                        Some(mf) => {
                            parse_response(t, &text, config.group_size, mf.correct_position).valid
                        }
                        None => !text.trim_start().starts_with(SESSION_FAILED_MARKER),
                    };
                    if !usable {
                        unusable_trials.push(t);
                    }
                }
                _ => {
                    missing_trials.push(t);
                    missing_responses.push(response);
                }
            }
        }

        let mut surplus: BTreeSet<String> = BTreeSet::new();
        if let Ok(names) = store.list(&run_dir) {
            for name in names.iter().filter(|n| !n.starts_with('.')) {
                for (prefix, ext) in [
                    (QUERY_PREFIX, "txt"),
                    (RESPONSE_PREFIX, "txt"),
                    (MANIFEST_PREFIX, "json"),
                ] {
                    if let Some((idx, canonical)) = parse_indexed(name, prefix, ext) {
                        if !canonical || idx > m {
                            surplus.insert(name.clone());
                        }
                    }
                }
            }
        }

        let mut faults = Vec::new();
        if !query_faults.is_empty() {
            faults.push(format!(
                "{} missing or invalid query-side artifact(s)",
                query_faults.len()
            ));
        }
        if !missing_responses.is_empty() {
            faults.push(format!("missing responses for trials {:?}", missing_trials));
        }
        if !surplus.is_empty() {
            faults.push(format!(
                "surplus artifacts from a differently-configured run: {}",
                surplus.into_iter().collect::<Vec<_>>().join(", ")
            ));
            return AuditFinding::RunCorrupted { faults };
        }
        if faults.len() >= 2 {
            return AuditFinding::RunCorrupted { faults };
        }
        if !query_faults.is_empty() {
            return AuditFinding::QueryIssue {
                paths: query_faults,
            };
        }
        if !missing_responses.is_empty() {
            return AuditFinding::ResponseIssue {
                trials: missing_trials,
                paths: missing_responses,
            };
        }

        let (problems, metrics) = self.check_analysis(layout, config, keys, replication);
        if !problems.is_empty() {
            if !unusable_trials.is_empty() {
                let paths = unusable_trials
                    .iter()
                    .map(|t| layout.response(replication, *t))
                    .collect();
                return AuditFinding::ResponseIssue {
                    trials: unusable_trials,
                    paths,
                };
            }
            return AuditFinding::AnalysisIssue { problems };
        }

        let Some(metrics) = metrics else {
            return AuditFinding::AnalysisIssue {
                problems: vec!["report metrics unavailable".to_string()],
            };
        };
        match summary {
            SummaryView::Missing => AuditFinding::AggregationIssue {
                reason: "experiment_summary.csv missing".to_string(),
            },
            SummaryView::Broken(reason) => AuditFinding::AggregationIssue {
                reason: reason.clone(),
            },
            SummaryView::Rows(rows) => match rows.get(&replication) {
                None => AuditFinding::AggregationIssue {
                    reason: format!("experiment_summary.csv has no row for run_{}", replication),
                },
                Some(row) => match summary_row(replication, config, &metrics, keys) {
                    Ok(expected) if &expected == row => AuditFinding::Valid,
                    _ => AuditFinding::AggregationIssue {
                        reason: format!(
                            "experiment_summary.csv row for run_{} is stale",
                            replication
                        ),
                    },
                },
            },
        }
    }

    fn check_analysis(
        &self,
        layout: &ExperimentLayout,
        config: &ExperimentConfig,
        keys: &[&str],
        replication: usize,
    ) -> (Vec<String>, Option<BTreeMap<String, Value>>) {
        let store = self.store.as_ref();
        let mut problems = Vec::new();

        match read_json::<Value>(store, &layout.parsed_metrics(replication)) {
            Ok(v) => {
                let trials = v.get("trials").and_then(|t| t.as_array()).map(|a| a.len());
                if trials != Some(config.trials_per_replication) {
                    problems.push("parsed_metrics.json does not cover every trial".to_string());
                }
            }
            Err(_) => problems.push("parsed_metrics.json missing or unreadable".to_string()),
        }
        if read_json::<BiasRecord>(store, &layout.bias(replication)).is_err() {
            problems.push("bias_analysis.json missing or unreadable".to_string());
        }

        let text = match store.read_to_string(&layout.report(replication)) {
            Ok(t) => t,
            Err(_) => {
                problems.push("replication_report.txt missing".to_string());
                return (problems, None);
            }
        };
        let block = match extract_block(&text) {
            Ok(b) => b,
            Err(reason) => {
                problems.push(reason);
                return (problems, None);
            }
        };

        let declared = block.get("schema_version").and_then(|v| v.as_str());
        if declared != Some(config.schema_version.as_str()) {
            problems.push(format!(
                "report schema {:?} does not match experiment schema '{}'",
                declared, config.schema_version
            ));
        }
        let Some(metrics) = block.get("metrics").and_then(|m| m.as_object()) else {
            problems.push("report has no metrics object".to_string());
            return (problems, None);
        };
        let required: BTreeSet<&str> = keys.iter().copied().collect();
        let present: BTreeSet<&str> = metrics.keys().map(|k| k.as_str()).collect();
        let missing: Vec<&str> = required.difference(&present).copied().collect();
        let extra: Vec<&str> = present.difference(&required).copied().collect();
        if !missing.is_empty() {
            problems.push(format!("report is missing metric keys: {}", missing.join(", ")));
        }
        if !extra.is_empty() {
            problems.push(format!("report has undeclared metric keys: {}", extra.join(", ")));
        }
        for (key, value) in metrics {
            if required.contains(key.as_str()) && crate::aggregate::format_value(value).is_none() {
                problems.push(format!("metric '{}' is not a finite number", key));
            }
        }

        match serde_json::from_value::<ReportBlock>(block.clone()) {
            Ok(typed) => {
                if typed.replication != replication {
                    problems.push(format!(
                        "report belongs to replication {}, not {}",
                        typed.replication, replication
                    ));
                }
                if typed.parameters.model != config.model
                    || typed.parameters.group_size != config.group_size
                    || typed.parameters.trials_per_replication != config.trials_per_replication
                {
                    problems.push("report parameters do not match the snapshot".to_string());
                }
                match response_digest(store, layout, replication, config.trials_per_replication) {
                    Ok(digest) if digest == typed.response_digest => {}
                    _ => problems.push("report is stale: responses changed since it was written".to_string()),
                }
            }
            Err(e) => problems.push(format!("report block malformed: {}", e)),
        }

        let metrics: BTreeMap<String, Value> =
            metrics.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        (problems, Some(metrics))
    }
}

fn non_empty(store: &dyn Store, path: &Path) -> bool {
    store
        .read(path)
        .map(|b| !b.iter().all(|c| c.is_ascii_whitespace()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::config::tests::definition;
    use crate::config::{write_snapshot, RunnerPolicy};
    use crate::driver::{Driver, ExperimentContext};
    use crate::layout::write_json;
    use crate::llm::tests::OracleLlm;
    use crate::report::render_report;
    use replab_core::MemStore;

    struct Fixture {
        store: Arc<MemStore>,
        layout: ExperimentLayout,
        auditor: Auditor,
    }

    /// A fully valid experiment with `n` replications created by the driver.
    fn fixture(k: usize, m: usize, n: usize, created: usize) -> Fixture {
        let store = Arc::new(MemStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let layout = ExperimentLayout::new("/study/exp");
        write_snapshot(store.as_ref(), &layout, &definition(k, m, n)).expect("snapshot");
        let ctx = ExperimentContext::load(dyn_store.as_ref(), layout.root()).expect("ctx");
        let policy = RunnerPolicy {
            retry_backoff_ms: 0,
            ..RunnerPolicy::default()
        };
        let driver = Driver::new(
            dyn_store.clone(),
            Arc::new(OracleLlm::new()),
            policy,
            CancelToken::new(),
        );
        for i in 1..=created {
            driver.run_new(&ctx, i).expect("run");
        }
        Fixture {
            store,
            layout,
            auditor: Auditor::new(dyn_store),
        }
    }

    fn finding(fx: &Fixture, i: usize) -> AuditFinding {
        fx.auditor
            .audit_experiment(fx.layout.root())
            .finding(i)
            .cloned()
            .expect("replication audited")
    }

    fn rewrite_report(fx: &Fixture, i: usize, edit: impl FnOnce(&mut ReportBlock)) {
        let mut block = crate::report::read_block(fx.store.as_ref(), &fx.layout, i).expect("block");
        edit(&mut block);
        let text = render_report(&block).expect("render");
        fx.store
            .atomic_write(&fx.layout.report(i), text.as_bytes())
            .expect("write");
    }

    #[test]
    fn fresh_replications_are_valid() {
        let fx = fixture(4, 3, 2, 2);
        let audit = fx.auditor.audit_experiment(fx.layout.root());
        assert_eq!(audit.status, ExperimentStatus::Validated, "{}", audit.render_text());
        assert!(audit.replications.iter().all(|r| r.finding == AuditFinding::Valid));
        assert_eq!(audit.next_action(), NextAction::None);
    }

    #[test]
    fn audit_is_idempotent_and_read_only() {
        let fx = fixture(4, 3, 3, 2);
        fx.store
            .remove_file(&fx.layout.response(2, 1))
            .expect("remove");
        fx.store.clear_write_log();
        let first = fx.auditor.audit_experiment(fx.layout.root());
        let second = fx.auditor.audit_experiment(fx.layout.root());
        assert_eq!(first, second);
        assert_eq!(first.render_text(), second.render_text());
        assert!(fx.store.write_log().is_empty());
    }

    #[test]
    fn single_missing_response_is_repairable_in_place() {
        let fx = fixture(4, 3, 1, 1);
        fx.store.remove_file(&fx.layout.response(1, 3)).expect("remove");
        match finding(&fx, 1) {
            AuditFinding::ResponseIssue { trials, paths } => {
                assert_eq!(trials, vec![3]);
                assert_eq!(paths, vec![fx.layout.response(1, 3)]);
            }
            other => panic!("expected ResponseIssue, got {:?}", other),
        }
    }

    #[test]
    fn empty_response_counts_as_missing() {
        let fx = fixture(4, 3, 1, 1);
        fx.store
            .atomic_write(&fx.layout.response(1, 2), b"  \n")
            .expect("write");
        assert!(matches!(finding(&fx, 1), AuditFinding::ResponseIssue { .. }));
    }

    #[test]
    fn missing_query_and_its_response_are_two_faults() {
        let fx = fixture(4, 3, 1, 1);
        fx.store.remove_file(&fx.layout.query(1, 2)).expect("q");
        fx.store.remove_file(&fx.layout.response(1, 2)).expect("r");
        match finding(&fx, 1) {
            AuditFinding::RunCorrupted { faults } => assert_eq!(faults.len(), 2, "{:?}", faults),
            other => panic!("expected RunCorrupted, got {:?}", other),
        }
    }

    #[test]
    fn missing_query_alone_is_a_query_issue() {
        let fx = fixture(4, 3, 1, 1);
        fx.store.remove_file(&fx.layout.manifest(1, 1)).expect("manifest");
        fx.store.remove_file(&fx.layout.query(1, 1)).expect("query");
        match finding(&fx, 1) {
            AuditFinding::QueryIssue { paths } => assert_eq!(paths.len(), 2),
            other => panic!("expected QueryIssue, got {:?}", other),
        }
    }

    #[test]
    fn too_many_session_files_is_structural() {
        let fx = fixture(4, 3, 1, 1);
        fx.store
            .atomic_write(&fx.layout.run_dir(1).join("query_4.txt"), b"stale query")
            .expect("write");
        match finding(&fx, 1) {
            AuditFinding::RunCorrupted { faults } => {
                assert!(faults.iter().any(|f| f.contains("query_4.txt")), "{:?}", faults)
            }
            other => panic!("expected RunCorrupted, got {:?}", other),
        }
    }

    #[test]
    fn temp_files_are_invisible() {
        let fx = fixture(4, 3, 1, 1);
        fx.store
            .atomic_write(
                &fx.layout.run_dir(1).join(".replication_report.txt.tmp.1.2.3"),
                b"partial",
            )
            .expect("write");
        assert_eq!(finding(&fx, 1), AuditFinding::Valid);
    }

    #[test]
    fn extra_metric_key_is_a_schema_issue() {
        let fx = fixture(4, 3, 1, 1);
        rewrite_report(&fx, 1, |b| {
            b.metrics.insert("mean_top_5_acc".to_string(), Value::from(1.0));
        });
        match finding(&fx, 1) {
            AuditFinding::AnalysisIssue { problems } => assert!(
                problems.iter().any(|p| p.contains("undeclared metric keys: mean_top_5_acc")),
                "{:?}",
                problems
            ),
            other => panic!("expected AnalysisIssue, got {:?}", other),
        }
    }

    #[test]
    fn missing_metric_key_is_a_schema_issue() {
        let fx = fixture(4, 3, 1, 1);
        rewrite_report(&fx, 1, |b| {
            b.metrics.remove("median_mrr");
        });
        match finding(&fx, 1) {
            AuditFinding::AnalysisIssue { problems } => {
                assert!(problems.iter().any(|p| p.contains("missing metric keys: median_mrr")))
            }
            other => panic!("expected AnalysisIssue, got {:?}", other),
        }
    }

    #[test]
    fn changed_response_makes_report_stale() {
        let fx = fixture(4, 3, 1, 1);
        fx.store
            .atomic_write(&fx.layout.response(1, 1), b"1: 0.1\n2: 0.2\n3: 0.3\n4: 0.4")
            .expect("write");
        match finding(&fx, 1) {
            AuditFinding::AnalysisIssue { problems } => {
                assert!(problems.iter().any(|p| p.contains("stale")), "{:?}", problems)
            }
            other => panic!("expected AnalysisIssue, got {:?}", other),
        }
    }

    #[test]
    fn failed_sessions_without_report_ask_for_refetch() {
        let fx = fixture(4, 3, 1, 1);
        fx.store
            .atomic_write(&fx.layout.response(1, 2), b"#SESSION_FAILED: rate limited")
            .expect("write");
        fx.store.remove_file(&fx.layout.report(1)).expect("remove");
        assert_eq!(
            finding(&fx, 1).remedy(),
            Remedy::FastRepair(vec![2])
        );
    }

    #[test]
    fn unparseable_answer_without_report_asks_for_refetch() {
        let fx = fixture(4, 3, 1, 1);
        fx.store
            .atomic_write(&fx.layout.response(1, 3), b"no ranking today")
            .expect("write");
        fx.store.remove_file(&fx.layout.report(1)).expect("remove");
        match finding(&fx, 1) {
            AuditFinding::ResponseIssue { trials, paths } => {
                assert_eq!(trials, vec![3]);
                assert_eq!(paths, vec![fx.layout.response(1, 3)]);
            }
            other => panic!("expected ResponseIssue, got {:?}", other),
        }
    }

    #[test]
    fn mismatched_run_params_need_a_human() {
        let fx = fixture(4, 3, 1, 1);
        let mut params: RunParams =
            read_json(fx.store.as_ref(), &fx.layout.run_params(1)).expect("params");
        params.model = "other/model".to_string();
        write_json(fx.store.as_ref(), &fx.layout.run_params(1), &params).expect("write");
        let audit = fx.auditor.audit_experiment(fx.layout.root());
        assert!(matches!(audit.finding(1), Some(AuditFinding::ConfigIssue { .. })));
        assert_eq!(audit.next_action(), NextAction::FixConfiguration);
    }

    #[test]
    fn missing_summary_row_is_an_aggregation_issue() {
        let fx = fixture(4, 3, 2, 2);
        let text = fx
            .store
            .read_to_string(&fx.layout.summary())
            .expect("summary");
        let kept: Vec<&str> = text.lines().filter(|l| !l.starts_with("2,")).collect();
        fx.store
            .atomic_write(&fx.layout.summary(), kept.join("\n").as_bytes())
            .expect("write");
        let audit = fx.auditor.audit_experiment(fx.layout.root());
        assert_eq!(audit.finding(1), Some(&AuditFinding::Valid));
        assert!(matches!(audit.finding(2), Some(AuditFinding::AggregationIssue { .. })));
        assert_eq!(audit.status, ExperimentStatus::AggregationNeeded);
    }

    #[test]
    fn missing_slot_and_stray_run_directories() {
        let fx = fixture(4, 2, 3, 2);
        let audit = fx.auditor.audit_experiment(fx.layout.root());
        assert_eq!(audit.missing, vec![3]);
        assert_eq!(audit.status, ExperimentStatus::NewNeeded);

        fx.store
            .create_dir_all(&fx.layout.root().join("run_9"))
            .expect("dir");
        let audit = fx.auditor.audit_experiment(fx.layout.root());
        assert!(audit.config_faults.iter().any(|f| f.contains("run_9")));
        assert_eq!(audit.next_action(), NextAction::FixConfiguration);
    }

    #[test]
    fn snapshot_problems_are_classified() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let auditor = Auditor::new(store.clone());
        let root = PathBuf::from("/legacy");
        store.create_dir_all(&root.join("run_1")).expect("dir");
        let audit = auditor.audit_experiment(&root);
        assert_eq!(audit.status, ExperimentStatus::MigrationNeeded);
        assert_eq!(audit.next_action(), NextAction::Migrate);

        let fx = fixture(4, 2, 1, 1);
        let mut def = definition(4, 2, 1);
        def.config.layout_version = 1;
        let old = ExperimentLayout::new("/old");
        write_snapshot(fx.store.as_ref(), &old, &def).expect("snapshot");
        assert_eq!(
            fx.auditor.audit_experiment(old.root()).status,
            ExperimentStatus::MigrationNeeded
        );
    }

    #[test]
    fn empty_directory_asks_for_replab_new() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let root = PathBuf::from("/study/not_yet");
        store.create_dir_all(&root).expect("dir");
        let audit = Auditor::new(store).audit_experiment(&root);
        assert_eq!(audit.status, ExperimentStatus::NewNeeded);
        assert_eq!(audit.next_action(), NextAction::CreateExperiment);
        assert_eq!(audit.exit_code(), 2);
        assert!(audit.render_text().contains("replab new"));
    }

    #[test]
    fn legacy_schema_is_audited_against_its_own_keys() {
        let fx = fixture(4, 2, 1, 1);
        // Rebuild as a v1 experiment: drop lift keys everywhere.
        let mut def = definition(4, 2, 1);
        def.config.schema_version = "replication_metrics_v1".to_string();
        fx.store.delete_subtree(&fx.layout.snapshot()).expect("rm");
        fx.store.delete_subtree(&fx.layout.snapshot_digest()).expect("rm");
        write_snapshot(fx.store.as_ref(), &fx.layout, &def).expect("snapshot");
        let mut params: RunParams =
            read_json(fx.store.as_ref(), &fx.layout.run_params(1)).expect("params");
        params.schema_version = def.config.schema_version.clone();
        write_json(fx.store.as_ref(), &fx.layout.run_params(1), &params).expect("params");
        rewrite_report(&fx, 1, |b| {
            b.schema_version = "replication_metrics_v1".to_string();
            b.metrics.retain(|k, _| !k.ends_with("_lift"));
        });
        crate::aggregate::write_experiment_summary(fx.store.as_ref(), &fx.layout, &def.config)
            .expect("summary");
        let audit = fx.auditor.audit_experiment(fx.layout.root());
        assert_eq!(audit.status, ExperimentStatus::Validated, "{}", audit.render_text());

        fx.store.remove_file(&fx.layout.response(1, 1)).expect("rm");
        let audit = fx.auditor.audit_experiment(fx.layout.root());
        assert_eq!(audit.status, ExperimentStatus::MigrationNeeded);
    }
}
