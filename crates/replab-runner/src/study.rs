use crate::aggregate::{parse_csv, study_columns, study_row};
use crate::audit::{required_metric_keys, Auditor, ExperimentAudit, ExperimentStatus};
use crate::layout::{ExperimentLayout, RUN_PREFIX, SNAPSHOT_FILE, STUDY_SUMMARY_FILE};
use anyhow::{anyhow, Result};
use replab_core::Store;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Experiment directories directly under `study_dir`, by name.
pub fn discover_experiments(store: &dyn Store, study_dir: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for name in store.list(study_dir)? {
        if name.starts_with('.') {
            continue;
        }
        let dir = study_dir.join(&name);
        if !store.is_dir(&dir) {
            continue;
        }
        let looks_like_experiment = store.exists(&dir.join(SNAPSHOT_FILE))
            || store
                .list(&dir)?
                .iter()
                .any(|n| n.starts_with(RUN_PREFIX) && store.is_dir(&dir.join(n)));
        if looks_like_experiment {
            out.push(name);
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudyAudit {
    pub dir: PathBuf,
    pub experiments: Vec<(String, ExperimentAudit)>,
    pub summary_faults: Vec<String>,
}

impl StudyAudit {
    pub fn all_validated(&self) -> bool {
        !self.experiments.is_empty()
            && self
                .experiments
                .iter()
                .all(|(_, a)| a.status == ExperimentStatus::Validated)
    }

    /// Worst experiment wins: parameter fix, then migration, then repair.
    pub fn exit_code(&self) -> i32 {
        let worst = self
            .experiments
            .iter()
            .map(|(_, a)| a.exit_code())
            .max_by_key(|code| match code {
                4 => 3,
                3 => 2,
                0 => 0,
                _ => 1,
            })
            .unwrap_or(2);
        if worst == 0 && !self.summary_faults.is_empty() {
            2
        } else {
            worst
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Study Audit Report");
        let _ = writeln!(out, "==================");
        let _ = writeln!(out, "Directory: {}", self.dir.display());
        if self.experiments.is_empty() {
            let _ = writeln!(out, "No experiments found.");
        }
        for (name, audit) in &self.experiments {
            let _ = writeln!(
                out,
                "  {:<32} {:<20} {}",
                name,
                audit.status.to_string(),
                audit.next_action().describe()
            );
        }
        if self.summary_faults.is_empty() {
            let _ = writeln!(out, "Study summary: ok");
        } else {
            let _ = writeln!(out, "Study summary:");
            for f in &self.summary_faults {
                let _ = writeln!(out, "  - {}", f);
            }
        }
        out
    }
}

/// Metric keys every experiment in the study shares, or why there are none.
fn shared_keys(experiments: &[(String, ExperimentAudit)]) -> Result<&'static [&'static str], String> {
    let mut schemas: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (name, audit) in experiments {
        let Some(config) = &audit.config else {
            return Err(format!("{} has no readable config snapshot", name));
        };
        schemas
            .entry(config.schema_version.clone())
            .or_default()
            .push(name.as_str());
    }
    if schemas.len() > 1 {
        return Err(format!(
            "experiments use different metric schemas: {:?}",
            schemas
        ));
    }
    let schema = schemas
        .keys()
        .next()
        .ok_or_else(|| "study has no experiments".to_string())?;
    required_metric_keys(schema).ok_or_else(|| format!("unknown metrics schema '{}'", schema))
}

fn expected_rows(
    store: &dyn Store,
    study_dir: &Path,
    experiments: &[(String, ExperimentAudit)],
    keys: &[&str],
) -> Result<Vec<Vec<String>>> {
    let mut rows = Vec::with_capacity(experiments.len());
    for (name, audit) in experiments {
        let config = audit
            .config
            .as_ref()
            .ok_or_else(|| anyhow!("{} has no config snapshot", name))?;
        let layout = ExperimentLayout::new(study_dir.join(name));
        let summary = parse_csv(&store.read_to_string(&layout.summary())?)?;
        rows.push(study_row(name, config, &summary, keys)?);
    }
    Ok(rows)
}

pub fn audit_study(store: Arc<dyn Store>, study_dir: &Path) -> Result<StudyAudit> {
    let auditor = Auditor::new(store.clone());
    let mut experiments = Vec::new();
    for name in discover_experiments(store.as_ref(), study_dir)? {
        let audit = auditor.audit_experiment(&study_dir.join(&name));
        experiments.push((name, audit));
    }
    let mut study = StudyAudit {
        dir: study_dir.to_path_buf(),
        experiments,
        summary_faults: Vec::new(),
    };
    if !study.all_validated() {
        return Ok(study);
    }

    let path = study_dir.join(STUDY_SUMMARY_FILE);
    let keys = match shared_keys(&study.experiments) {
        Ok(keys) => keys,
        Err(reason) => {
            study.summary_faults.push(reason);
            return Ok(study);
        }
    };
    if !store.exists(&path) {
        study
            .summary_faults
            .push(format!("{} missing", STUDY_SUMMARY_FILE));
        return Ok(study);
    }
    let table = match store.read_to_string(&path).and_then(|t| parse_csv(&t)) {
        Ok(t) => t,
        Err(e) => {
            study
                .summary_faults
                .push(format!("{} unreadable: {:#}", STUDY_SUMMARY_FILE, e));
            return Ok(study);
        }
    };
    if table.header != study_columns(keys) {
        study
            .summary_faults
            .push(format!("{} header does not match the metrics schema", STUDY_SUMMARY_FILE));
        return Ok(study);
    }
    let expected = match expected_rows(store.as_ref(), study_dir, &study.experiments, keys) {
        Ok(rows) => rows,
        Err(e) => {
            study.summary_faults.push(format!("{:#}", e));
            return Ok(study);
        }
    };
    let actual: BTreeMap<&str, &Vec<String>> =
        table.rows.iter().map(|r| (r[0].as_str(), r)).collect();
    for row in &expected {
        match actual.get(row[0].as_str()) {
            None => study
                .summary_faults
                .push(format!("no row for experiment {}", row[0])),
            Some(found) if *found != row => study
                .summary_faults
                .push(format!("row for experiment {} is stale", row[0])),
            Some(_) => {}
        }
    }
    if table.rows.len() != expected.len() {
        study.summary_faults.push(format!(
            "{} has {} rows for {} experiments",
            STUDY_SUMMARY_FILE,
            table.rows.len(),
            expected.len()
        ));
    }
    Ok(study)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompileResult {
    pub path: PathBuf,
    pub rows: usize,
}

/// Writes `study_summary.csv`, one averaged row per experiment. Refuses to
/// run until every experiment in the study is VALIDATED.
pub fn compile_study(store: Arc<dyn Store>, study_dir: &Path) -> Result<CompileResult> {
    let study = audit_study(store.clone(), study_dir)?;
    if study.experiments.is_empty() {
        return Err(anyhow!("no experiments under {}", study_dir.display()));
    }
    let pending: Vec<String> = study
        .experiments
        .iter()
        .filter(|(_, a)| a.status != ExperimentStatus::Validated)
        .map(|(name, a)| format!("{} ({})", name, a.status))
        .collect();
    if !pending.is_empty() {
        return Err(anyhow!(
            "cannot compile study: experiments not VALIDATED: {}",
            pending.join(", ")
        ));
    }
    let keys = shared_keys(&study.experiments).map_err(|e| anyhow!(e))?;
    let rows = expected_rows(store.as_ref(), study_dir, &study.experiments, keys)?;
    let table = crate::aggregate::CsvTable {
        header: study_columns(keys),
        rows,
    };
    let path = study_dir.join(STUDY_SUMMARY_FILE);
    store.atomic_write(&path, table.render().as_bytes())?;
    info!(path = %path.display(), rows = table.rows.len(), "study summary written");
    Ok(CompileResult {
        path,
        rows: table.rows.len(),
    })
}
