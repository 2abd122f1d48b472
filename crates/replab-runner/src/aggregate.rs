//! Experiment- and study-level roll-ups. Pure folds over replication
//! reports; the only side effect is the atomic write of the CSV.

use crate::audit::required_metric_keys;
use crate::config::ExperimentConfig;
use crate::layout::ExperimentLayout;
use crate::report::read_block;
use anyhow::{anyhow, Result};
use replab_core::Store;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

pub const EXPERIMENT_KEY_COLUMNS: [&str; 4] = ["replication", "model", "k", "m"];
pub const STUDY_KEY_COLUMNS: [&str; 5] = ["experiment", "model", "k", "m", "replications"];

pub fn experiment_columns(metric_keys: &[&str]) -> Vec<String> {
    EXPERIMENT_KEY_COLUMNS
        .iter()
        .chain(metric_keys.iter())
        .map(|s| s.to_string())
        .collect()
}

pub fn study_columns(metric_keys: &[&str]) -> Vec<String> {
    STUDY_KEY_COLUMNS
        .iter()
        .chain(metric_keys.iter())
        .map(|s| s.to_string())
        .collect()
}

pub fn format_value(value: &Value) -> Option<String> {
    if let Some(u) = value.as_u64() {
        return Some(u.to_string());
    }
    value.as_f64().filter(|f| f.is_finite()).map(|f| format!("{:.6}", f))
}

/// The experiment summary row a replication's report should produce.
pub fn summary_row(
    replication: usize,
    config: &ExperimentConfig,
    metrics: &BTreeMap<String, Value>,
    metric_keys: &[&str],
) -> Result<Vec<String>, String> {
    let mut row = vec![
        replication.to_string(),
        config.model.clone(),
        config.group_size.to_string(),
        config.trials_per_replication.to_string(),
    ];
    for key in metric_keys {
        let value = metrics
            .get(*key)
            .ok_or_else(|| format!("metric '{}' missing", key))?;
        row.push(format_value(value).ok_or_else(|| format!("metric '{}' is not a finite number", key))?);
    }
    Ok(row)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CsvTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl CsvTable {
    pub fn render(&self) -> String {
        let mut out = self.header.join(",");
        out.push('\n');
        for row in &self.rows {
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }
}

/// Parses the plain comma-separated tables this crate writes. Fields never
/// contain commas, quotes or newlines (config validation forbids them).
pub fn parse_csv(text: &str) -> Result<CsvTable> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header: Vec<String> = lines
        .next()
        .ok_or_else(|| anyhow!("empty table"))?
        .split(',')
        .map(|s| s.trim().to_string())
        .collect();
    let mut rows = Vec::new();
    for (n, line) in lines.enumerate() {
        let row: Vec<String> = line.split(',').map(|s| s.trim().to_string()).collect();
        if row.len() != header.len() {
            return Err(anyhow!(
                "row {} has {} fields, header has {}",
                n + 1,
                row.len(),
                header.len()
            ));
        }
        rows.push(row);
    }
    Ok(CsvTable { header, rows })
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationResult {
    pub path: PathBuf,
    pub rows: usize,
    pub skipped: Vec<usize>,
}

/// Rebuilds `experiment_summary.csv` from every replication whose report is
/// readable and carries the experiment's full metric set.
pub fn write_experiment_summary(
    store: &dyn Store,
    layout: &ExperimentLayout,
    config: &ExperimentConfig,
) -> Result<AggregationResult> {
    let keys = required_metric_keys(&config.schema_version)
        .ok_or_else(|| anyhow!("unknown metrics schema '{}'", config.schema_version))?;
    let mut rows = Vec::new();
    let mut skipped = Vec::new();
    for replication in 1..=config.replications {
        if !store.exists(&layout.report(replication)) {
            skipped.push(replication);
            continue;
        }
        let row = read_block(store, layout, replication)
            .map_err(|e| format!("{:#}", e))
            .and_then(|block| {
                if block.schema_version != config.schema_version {
                    return Err(format!("schema '{}'", block.schema_version));
                }
                summary_row(replication, config, &block.metrics, keys)
            });
        match row {
            Ok(row) => rows.push(row),
            Err(reason) => {
                debug!(replication, %reason, "replication left out of experiment summary");
                skipped.push(replication);
            }
        }
    }
    let table = CsvTable {
        header: experiment_columns(keys),
        rows,
    };
    let path = layout.summary();
    store.atomic_write(&path, table.render().as_bytes())?;
    info!(
        path = %path.display(),
        rows = table.rows.len(),
        skipped = skipped.len(),
        "experiment summary written"
    );
    Ok(AggregationResult {
        path,
        rows: table.rows.len(),
        skipped,
    })
}

/// One study row: identity columns plus each metric averaged over the
/// experiment's replications.
pub fn study_row(
    experiment: &str,
    config: &ExperimentConfig,
    summary: &CsvTable,
    metric_keys: &[&str],
) -> Result<Vec<String>> {
    if summary.header != experiment_columns(metric_keys) {
        return Err(anyhow!("experiment summary for {} has an unexpected header", experiment));
    }
    if summary.rows.is_empty() {
        return Err(anyhow!("experiment summary for {} has no rows", experiment));
    }
    let mut row = vec![
        experiment.to_string(),
        config.model.clone(),
        config.group_size.to_string(),
        config.trials_per_replication.to_string(),
        summary.rows.len().to_string(),
    ];
    for key in metric_keys {
        let col = summary
            .column(key)
            .ok_or_else(|| anyhow!("column '{}' missing", key))?;
        let mut total = 0.0;
        for r in &summary.rows {
            let v: f64 = r[col]
                .parse()
                .map_err(|_| anyhow!("{}: '{}' is not a number in column {}", experiment, r[col], key))?;
            total += v;
        }
        row.push(format!("{:.6}", total / summary.rows.len() as f64));
    }
    Ok(row)
}
