use anyhow::Result;
use chrono::Utc;
use replab_core::Store;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

/// One line of `experiment_operation_log.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<usize>,
    pub started_at: String,
    pub duration_ms: u64,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Append-only record of what the state machine did to an experiment.
pub struct OperationLog<'a> {
    store: &'a dyn Store,
    path: PathBuf,
}

/// An operation in progress; `finish` appends it to the log.
pub struct PendingOperation {
    op: String,
    replication: Option<usize>,
    started_at: String,
    started: Instant,
}

impl<'a> OperationLog<'a> {
    pub fn new(store: &'a dyn Store, path: PathBuf) -> Self {
        Self { store, path }
    }

    pub fn start(&self, op: &str, replication: Option<usize>) -> PendingOperation {
        PendingOperation {
            op: op.to_string(),
            replication,
            started_at: Utc::now().to_rfc3339(),
            started: Instant::now(),
        }
    }

    pub fn finish(&self, pending: PendingOperation, outcome: &str, detail: Option<String>) -> Result<()> {
        let record = OperationRecord {
            op: pending.op,
            replication: pending.replication,
            started_at: pending.started_at,
            duration_ms: pending.started.elapsed().as_millis() as u64,
            outcome: outcome.to_string(),
            detail,
        };
        // a crash may have left a torn last line; never glue onto it
        let torn_tail = self
            .store
            .read(&self.path)
            .ok()
            .and_then(|bytes| bytes.last().copied())
            .is_some_and(|last| last != b'\n');
        let mut line = Vec::new();
        if torn_tail {
            line.push(b'\n');
        }
        line.extend(serde_json::to_vec(&record)?);
        line.push(b'\n');
        self.store.append(&self.path, &line)
    }

    /// Every record that parses; a torn last line from a crash is skipped.
    pub fn records(&self) -> Result<Vec<OperationRecord>> {
        if !self.store.exists(&self.path) {
            return Ok(Vec::new());
        }
        let text = self.store.read_to_string(&self.path)?;
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}
