use crate::layout::{read_json, write_json, ExperimentLayout};
use anyhow::{anyhow, Result};
use chrono::Utc;
use replab_core::{canonical_json_digest, sha256_bytes, Store};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CURRENT_LAYOUT_VERSION: u32 = 2;
pub const CURRENT_METRICS_SCHEMA: &str = "replication_metrics_v2";
pub const SANDBOX_ENV: &str = "REPLAB_SANDBOX_DIR";

const DEFAULT_QUERY_TEMPLATE: &str = "\
You will be given the profile of one person and a numbered list of {k} candidate names.
Score every candidate from 0.0 to 1.0 for how likely it is that the profile describes them.
Answer with exactly one line per candidate in the form `<number>: <score>` and nothing else.

Profile:
{profile}

Candidates:
{candidates}
";

/// Identity of an experiment, frozen into `config_snapshot.json` on creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub schema_version: String,
    pub layout_version: u32,
    pub experiment_id: String,
    pub model: String,
    pub group_size: usize,
    pub trials_per_replication: usize,
    pub replications: usize,
    pub seed: u64,
    pub subject_pool_digest: String,
    pub query_template: String,
    pub created_at: String,
}

impl ExperimentConfig {
    pub fn same_identity(&self, other: &ExperimentConfig) -> bool {
        self.experiment_id == other.experiment_id
            && self.model == other.model
            && self.group_size == other.group_size
            && self.trials_per_replication == other.trials_per_replication
            && self.replications == other.replications
            && self.seed == other.seed
            && self.subject_pool_digest == other.subject_pool_digest
            && self.query_template == other.query_template
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub name: String,
    pub profile: String,
}

/// Parameters a replication was produced under, written at stage 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    pub replication: usize,
    pub model: String,
    pub group_size: usize,
    pub trials_per_replication: usize,
    pub seed: u64,
    pub schema_version: String,
}

impl RunParams {
    pub fn for_replication(config: &ExperimentConfig, replication: usize) -> Self {
        Self {
            replication,
            model: config.model.clone(),
            group_size: config.group_size,
            trials_per_replication: config.trials_per_replication,
            seed: config.seed,
            schema_version: config.schema_version.clone(),
        }
    }

    /// Human-readable differences against the snapshot; empty when consistent.
    pub fn mismatches(&self, config: &ExperimentConfig, replication: usize) -> Vec<String> {
        let expected = Self::for_replication(config, replication);
        let mut out = Vec::new();
        if self.replication != expected.replication {
            out.push(format!(
                "replication {} != {}",
                self.replication, expected.replication
            ));
        }
        if self.model != expected.model {
            out.push(format!("model '{}' != '{}'", self.model, expected.model));
        }
        if self.group_size != expected.group_size {
            out.push(format!("k {} != {}", self.group_size, expected.group_size));
        }
        if self.trials_per_replication != expected.trials_per_replication {
            out.push(format!(
                "m {} != {}",
                self.trials_per_replication, expected.trials_per_replication
            ));
        }
        if self.seed != expected.seed {
            out.push(format!("seed {} != {}", self.seed, expected.seed));
        }
        if self.schema_version != expected.schema_version {
            out.push(format!(
                "schema '{}' != '{}'",
                self.schema_version, expected.schema_version
            ));
        }
        out
    }
}

/// Operational knobs. None of these are part of an experiment's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerPolicy {
    pub max_workers: usize,
    pub max_parallel_repairs: usize,
    pub session_timeout_secs: u64,
    pub max_session_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_repair_iterations: usize,
    pub completion_notice_threshold: f64,
    pub completion_halt_threshold: f64,
    pub llm_endpoint: String,
    pub llm_api_key_env: String,
}

impl Default for RunnerPolicy {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_parallel_repairs: 2,
            session_timeout_secs: 120,
            max_session_attempts: 3,
            retry_backoff_ms: 500,
            max_repair_iterations: 3,
            completion_notice_threshold: 0.99,
            completion_halt_threshold: 0.95,
            llm_endpoint: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            llm_api_key_env: "OPENROUTER_API_KEY".to_string(),
        }
    }
}

impl RunnerPolicy {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.max_workers == 0 {
            errors.push("max_workers must be > 0".to_string());
        }
        if self.max_parallel_repairs == 0 {
            errors.push("max_parallel_repairs must be > 0".to_string());
        }
        if self.max_session_attempts == 0 {
            errors.push("max_session_attempts must be > 0".to_string());
        }
        if self.max_repair_iterations == 0 {
            errors.push("max_repair_iterations must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.completion_halt_threshold)
            || !(0.0..=1.0).contains(&self.completion_notice_threshold)
            || self.completion_halt_threshold > self.completion_notice_threshold
        {
            errors.push(format!(
                "completion thresholds must satisfy 0 <= halt ({}) <= notice ({}) <= 1",
                self.completion_halt_threshold, self.completion_notice_threshold
            ));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("invalid runner policy: {}", errors.join("; ")))
        }
    }
}

pub fn load_policy(path: Option<&Path>) -> Result<RunnerPolicy> {
    let policy = match path {
        Some(p) => {
            let raw = fs::read_to_string(p)
                .map_err(|e| anyhow!("policy file {}: {}", p.display(), e))?;
            serde_yaml::from_str::<RunnerPolicy>(&raw)?
        }
        None => RunnerPolicy::default(),
    };
    policy.validate()?;
    Ok(policy)
}

/// Resolves experiment paths, optionally re-rooting relative paths under a
/// sandbox directory so tests never touch a real project tree.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    sandbox_root: Option<PathBuf>,
}

impl ConfigResolver {
    pub fn new(sandbox_root: Option<PathBuf>) -> Self {
        Self { sandbox_root }
    }

    pub fn from_env() -> Self {
        let sandbox_root = std::env::var_os(SANDBOX_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self { sandbox_root }
    }

    pub fn sandbox_root(&self) -> Option<&Path> {
        self.sandbox_root.as_deref()
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        match &self.sandbox_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExperimentDefinition {
    experiment: DefinitionExperiment,
    design: DefinitionDesign,
    subjects: DefinitionSubjects,
    #[serde(default)]
    query: Option<DefinitionQuery>,
}

#[derive(Debug, Deserialize)]
struct DefinitionExperiment {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
}

#[derive(Debug, Deserialize)]
struct DefinitionDesign {
    #[serde(default)]
    group_size: usize,
    #[serde(default)]
    trials_per_replication: usize,
    #[serde(default)]
    replications: usize,
    #[serde(default)]
    seed: u64,
}

#[derive(Debug, Deserialize)]
struct DefinitionSubjects {
    path: String,
}

#[derive(Debug, Deserialize)]
struct DefinitionQuery {
    template: String,
}

/// A validated experiment definition together with its subject pool, ready
/// to be frozen into an experiment directory.
#[derive(Debug, Clone)]
pub struct ResolvedDefinition {
    pub config: ExperimentConfig,
    pub subjects: Vec<Subject>,
}

pub fn load_definition(path: &Path, resolver: &ConfigResolver) -> Result<ResolvedDefinition> {
    let path = resolver.resolve(path);
    let raw = fs::read_to_string(&path)
        .map_err(|e| anyhow!("experiment definition {}: {}", path.display(), e))?;
    let def: ExperimentDefinition = serde_yaml::from_str(&raw)?;
    let base = path.parent().unwrap_or(Path::new("."));
    let pool_path = {
        let p = PathBuf::from(&def.subjects.path);
        if p.is_absolute() {
            p
        } else {
            base.join(p)
        }
    };
    let pool_bytes = fs::read(&pool_path)
        .map_err(|e| anyhow!("subject pool {}: {}", pool_path.display(), e))?;
    let subjects: Vec<Subject> = serde_json::from_slice(&pool_bytes)?;
    let template = def
        .query
        .map(|q| q.template)
        .unwrap_or_else(|| DEFAULT_QUERY_TEMPLATE.to_string());
    let config = ExperimentConfig {
        schema_version: CURRENT_METRICS_SCHEMA.to_string(),
        layout_version: CURRENT_LAYOUT_VERSION,
        experiment_id: def.experiment.id,
        model: def.experiment.model,
        group_size: def.design.group_size,
        trials_per_replication: def.design.trials_per_replication,
        replications: def.design.replications,
        seed: def.design.seed,
        subject_pool_digest: subject_pool_digest(&subjects)?,
        query_template: template,
        created_at: Utc::now().to_rfc3339(),
    };
    validate_config(&config, &subjects)?;
    Ok(ResolvedDefinition { config, subjects })
}

/// Reports every problem at once rather than stopping at the first.
pub fn validate_config(config: &ExperimentConfig, subjects: &[Subject]) -> Result<()> {
    let mut errors = Vec::new();
    if config.experiment_id.trim().is_empty() {
        errors.push("/experiment/id is required".to_string());
    }
    if config.model.trim().is_empty() {
        errors.push("/experiment/model is required".to_string());
    }
    if config.model.contains([',', '\n', '\r', '"']) {
        errors.push("/experiment/model must not contain commas, quotes or newlines".to_string());
    }
    if config.experiment_id.contains([',', '\n', '\r', '"', '/', '\\']) {
        errors.push("/experiment/id must not contain separators, quotes or newlines".to_string());
    }
    if config.group_size < 2 {
        errors.push("/design/group_size must be >= 2".to_string());
    }
    if config.trials_per_replication == 0 {
        errors.push("/design/trials_per_replication must be > 0".to_string());
    }
    if config.replications == 0 {
        errors.push("/design/replications must be > 0".to_string());
    }
    if subjects.len() < config.group_size {
        errors.push(format!(
            "subject pool has {} subjects, fewer than group_size {}",
            subjects.len(),
            config.group_size
        ));
    }
    let mut ids: Vec<&str> = subjects.iter().map(|s| s.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.len() != subjects.len() {
        errors.push("subject ids must be unique".to_string());
    }
    for placeholder in ["{profile}", "{candidates}"] {
        if !config.query_template.contains(placeholder) {
            errors.push(format!("query template must contain {}", placeholder));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("invalid experiment definition: {}", errors.join("; ")))
    }
}

pub fn subject_pool_digest(subjects: &[Subject]) -> Result<String> {
    Ok(sha256_bytes(&serde_json::to_vec(subjects)?))
}

pub fn snapshot_digest(config: &ExperimentConfig) -> Result<String> {
    canonical_json_digest(&serde_json::to_value(config)?)
}

/// Result of reading an experiment's frozen configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotState {
    Missing,
    Unreadable(String),
    Tampered { expected: String, found: String },
    Ok(ExperimentConfig),
}

pub fn read_snapshot(store: &dyn Store, layout: &ExperimentLayout) -> SnapshotState {
    let path = layout.snapshot();
    if !store.exists(&path) {
        return SnapshotState::Missing;
    }
    let config: ExperimentConfig = match read_json(store, &path) {
        Ok(c) => c,
        Err(e) => return SnapshotState::Unreadable(format!("{:#}", e)),
    };
    let recorded = match store.read_to_string(&layout.snapshot_digest()) {
        Ok(s) => s.trim().to_string(),
        Err(_) => return SnapshotState::Unreadable("config_snapshot.digest missing".to_string()),
    };
    match snapshot_digest(&config) {
        Ok(actual) if actual == recorded => SnapshotState::Ok(config),
        Ok(actual) => SnapshotState::Tampered {
            expected: recorded,
            found: actual,
        },
        Err(e) => SnapshotState::Unreadable(format!("{:#}", e)),
    }
}

/// Freezes a definition into `layout`. Re-creating an experiment with the
/// same identity is a no-op; a different identity is refused.
pub fn write_snapshot(
    store: &dyn Store,
    layout: &ExperimentLayout,
    def: &ResolvedDefinition,
) -> Result<ExperimentConfig> {
    match read_snapshot(store, layout) {
        SnapshotState::Missing => {}
        SnapshotState::Ok(existing) => {
            if existing.same_identity(&def.config) {
                return Ok(existing);
            }
            return Err(anyhow!(
                "experiment already exists at {} with different parameters; the config snapshot is immutable",
                layout.root().display()
            ));
        }
        other => {
            return Err(anyhow!(
                "existing config snapshot at {} is not usable: {:?}",
                layout.root().display(),
                other
            ));
        }
    }
    store.create_dir_all(layout.root())?;
    write_json(store, &layout.subject_pool(), &def.subjects)?;
    write_json(store, &layout.snapshot(), &def.config)?;
    // digest last: a snapshot without digest reads as unusable, never as valid
    store.atomic_write(
        &layout.snapshot_digest(),
        snapshot_digest(&def.config)?.as_bytes(),
    )?;
    Ok(def.config.clone())
}

pub fn load_subjects(
    store: &dyn Store,
    layout: &ExperimentLayout,
    config: &ExperimentConfig,
) -> Result<Vec<Subject>> {
    let subjects: Vec<Subject> = read_json(store, &layout.subject_pool())?;
    let digest = subject_pool_digest(&subjects)?;
    if digest != config.subject_pool_digest {
        return Err(anyhow!(
            "subject_pool.json digest {} does not match snapshot {}",
            digest,
            config.subject_pool_digest
        ));
    }
    Ok(subjects)
}
