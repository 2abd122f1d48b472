use anyhow::{anyhow, Result};
use replab_core::Store;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SNAPSHOT_FILE: &str = "config_snapshot.json";
pub const SNAPSHOT_DIGEST_FILE: &str = "config_snapshot.digest";
pub const SUBJECT_POOL_FILE: &str = "subject_pool.json";
pub const EXPERIMENT_SUMMARY_FILE: &str = "experiment_summary.csv";
pub const AUDIT_LOG_FILE: &str = "experiment_audit_log.txt";
pub const OPERATION_LOG_FILE: &str = "experiment_operation_log.jsonl";
pub const STUDY_SUMMARY_FILE: &str = "study_summary.csv";
pub const LOCK_DIR: &str = ".locks";

pub const RUN_PARAMS_FILE: &str = "run_params.json";
pub const PARSED_METRICS_FILE: &str = "parsed_metrics.json";
pub const BIAS_FILE: &str = "bias_analysis.json";
pub const REPORT_FILE: &str = "replication_report.txt";

pub const RUN_PREFIX: &str = "run_";
pub const QUERY_PREFIX: &str = "query_";
pub const RESPONSE_PREFIX: &str = "response_";
pub const MANIFEST_PREFIX: &str = "manifest_";

/// Paths inside one experiment directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentLayout {
    root: PathBuf,
}

impl ExperimentLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    pub fn snapshot_digest(&self) -> PathBuf {
        self.root.join(SNAPSHOT_DIGEST_FILE)
    }

    pub fn subject_pool(&self) -> PathBuf {
        self.root.join(SUBJECT_POOL_FILE)
    }

    pub fn summary(&self) -> PathBuf {
        self.root.join(EXPERIMENT_SUMMARY_FILE)
    }

    pub fn audit_log(&self) -> PathBuf {
        self.root.join(AUDIT_LOG_FILE)
    }

    pub fn operation_log(&self) -> PathBuf {
        self.root.join(OPERATION_LOG_FILE)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.root.join(LOCK_DIR)
    }

    pub fn experiment_lock(&self) -> PathBuf {
        self.lock_dir().join("experiment.lock")
    }

    pub fn replication_lock(&self, replication: usize) -> PathBuf {
        self.lock_dir()
            .join(format!("{}.lock", run_dir_name(replication)))
    }

    pub fn run_dir(&self, replication: usize) -> PathBuf {
        self.root.join(run_dir_name(replication))
    }

    pub fn run_params(&self, replication: usize) -> PathBuf {
        self.run_dir(replication).join(RUN_PARAMS_FILE)
    }

    pub fn query(&self, replication: usize, trial: usize) -> PathBuf {
        self.run_dir(replication).join(indexed_name(QUERY_PREFIX, trial, "txt"))
    }

    pub fn manifest(&self, replication: usize, trial: usize) -> PathBuf {
        self.run_dir(replication).join(indexed_name(MANIFEST_PREFIX, trial, "json"))
    }

    pub fn response(&self, replication: usize, trial: usize) -> PathBuf {
        self.run_dir(replication).join(indexed_name(RESPONSE_PREFIX, trial, "txt"))
    }

    pub fn parsed_metrics(&self, replication: usize) -> PathBuf {
        self.run_dir(replication).join(PARSED_METRICS_FILE)
    }

    pub fn bias(&self, replication: usize) -> PathBuf {
        self.run_dir(replication).join(BIAS_FILE)
    }

    pub fn report(&self, replication: usize) -> PathBuf {
        self.run_dir(replication).join(REPORT_FILE)
    }
}

pub fn run_dir_name(replication: usize) -> String {
    format!("{}{}", RUN_PREFIX, replication)
}

fn indexed_name(prefix: &str, index: usize, ext: &str) -> String {
    format!("{}{}.{}", prefix, index, ext)
}

/// Index embedded in a name like `query_12.txt`.
///
/// Returns `Some((index, canonical))`, where `canonical` is false for
/// spellings such as `query_012.txt` that match the pattern but would never
/// be written by the driver.
pub fn parse_indexed(name: &str, prefix: &str, ext: &str) -> Option<(usize, bool)> {
    let rest = name.strip_prefix(prefix)?;
    let digits = match ext {
        "" => rest,
        _ => rest.strip_suffix(ext)?.strip_suffix('.')?,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index: usize = digits.parse().ok()?;
    let canonical = index > 0 && index.to_string() == digits;
    Some((index, canonical))
}

/// Candidate order and answer key for one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialManifest {
    pub trial: usize,
    pub group_size: usize,
    pub subject_id: String,
    pub candidates: Vec<String>,
    pub correct_position: usize,
}

impl TrialManifest {
    pub fn is_consistent(&self, trial: usize, group_size: usize) -> bool {
        self.trial == trial
            && self.group_size == group_size
            && self.candidates.len() == group_size
            && self.correct_position >= 1
            && self.correct_position <= group_size
            && self.candidates[self.correct_position - 1] == self.subject_id
    }
}

pub fn read_json<T: DeserializeOwned>(store: &dyn Store, path: &Path) -> Result<T> {
    let bytes = store.read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| anyhow!("parse {}: {}", path.display(), e))
}

pub fn write_json<T: Serialize + ?Sized>(store: &dyn Store, path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.atomic_write(path, &bytes)
}
