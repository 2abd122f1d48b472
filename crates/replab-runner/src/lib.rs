//! Experiment lifecycle: creating experiment directories, running
//! replications, auditing them, and converging them to a validated state.

pub mod aggregate;
pub mod audit;
mod cancel;
pub mod config;
pub mod driver;
pub mod layout;
pub mod llm;
mod lock;
pub mod oplog;
mod pool;
pub mod report;
pub mod state_machine;
pub mod study;

use anyhow::Result;
use replab_core::Store;
use std::path::Path;

pub use audit::{AuditFinding, Auditor, ExperimentAudit, ExperimentStatus, NextAction};
pub use cancel::CancelToken;
pub use config::{
    load_definition, load_policy, ConfigResolver, ExperimentConfig, ResolvedDefinition,
    RunnerPolicy,
};
pub use driver::{Driver, DriverError, DriverFailure, ExperimentContext, Stage};
pub use llm::{HttpLlmClient, LlmClient, LlmError};
pub use lock::{LockRegistry, OperationLock};
pub use state_machine::{plan, ConvergeOutcome, HaltReason, Plan, StateMachine};
pub use study::{audit_study, compile_study, StudyAudit};

/// Freezes `def` into a new experiment directory at `dir`. Creating the same
/// experiment twice is a no-op; changing an existing experiment's identity
/// is refused.
pub fn create_experiment(
    store: &dyn Store,
    dir: &Path,
    def: &ResolvedDefinition,
) -> Result<ExperimentConfig> {
    let layout = layout::ExperimentLayout::new(dir);
    let config = config::write_snapshot(store, &layout, def)?;
    tracing::info!(
        dir = %dir.display(),
        experiment = %config.experiment_id,
        model = %config.model,
        k = config.group_size,
        m = config.trials_per_replication,
        n = config.replications,
        "experiment created"
    );
    Ok(config)
}
