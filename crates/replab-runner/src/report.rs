use crate::layout::ExperimentLayout;
use anyhow::{anyhow, Result};
use replab_analysis::{BiasRecord, MetricsRecord};
use replab_core::{sha256_chunks, Store};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;

pub const BLOCK_START: &str = "<<<METRICS_JSON_START>>>";
pub const BLOCK_END: &str = "<<<METRICS_JSON_END>>>";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportParameters {
    pub model: String,
    pub group_size: usize,
    pub trials_per_replication: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub valid: usize,
    pub total: usize,
    pub ratio: f64,
    pub tier: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseFailure {
    pub trial: usize,
    pub reason: String,
}

/// Machine-readable block embedded in `replication_report.txt`; the single
/// source of truth for a replication's final numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportBlock {
    pub schema_version: String,
    pub experiment_id: String,
    pub replication: usize,
    pub parameters: ReportParameters,
    pub metrics: BTreeMap<String, Value>,
    pub completion: CompletionSummary,
    pub parse_failures: Vec<ParseFailure>,
    pub response_digest: String,
    pub generated_at: String,
}

pub fn metrics_map(metrics: &MetricsRecord, bias: &BiasRecord) -> Result<BTreeMap<String, Value>> {
    let Value::Object(obj) = serde_json::to_value(metrics)? else {
        return Err(anyhow!("metrics record did not serialize to an object"));
    };
    let mut out: BTreeMap<String, Value> = obj.into_iter().collect();
    out.insert("bias_slope".to_string(), finite(bias.bias_slope));
    out.insert("bias_intercept".to_string(), finite(bias.bias_intercept));
    out.insert("bias_p_value".to_string(), finite(bias.bias_p_value));
    Ok(out)
}

fn finite(v: f64) -> Value {
    if v.is_finite() {
        Value::from(v)
    } else {
        Value::from(0.0)
    }
}

fn num(metrics: &BTreeMap<String, Value>, key: &str) -> String {
    match metrics.get(key) {
        Some(v) if v.is_u64() => v.to_string(),
        Some(v) => v
            .as_f64()
            .map(|f| format!("{:.4}", f))
            .unwrap_or_else(|| "n/a".to_string()),
        None => "n/a".to_string(),
    }
}

pub fn render_report(block: &ReportBlock) -> Result<String> {
    let m = &block.metrics;
    let mut out = String::new();
    writeln!(out, "Replication Report")?;
    writeln!(out, "==================")?;
    writeln!(out, "Experiment:      {}", block.experiment_id)?;
    writeln!(out, "Replication:     {}", block.replication)?;
    writeln!(out, "Model:           {}", block.parameters.model)?;
    writeln!(out, "Group size (k):  {}", block.parameters.group_size)?;
    writeln!(out, "Trials (m):      {}", block.parameters.trials_per_replication)?;
    writeln!(out, "Generated:       {}", block.generated_at)?;
    writeln!(out)?;
    writeln!(
        out,
        "Completion: {}/{} valid responses ({:.1}%) [{}]",
        block.completion.valid,
        block.completion.total,
        block.completion.ratio * 100.0,
        block.completion.tier
    )?;
    if block.parse_failures.is_empty() {
        writeln!(out, "Parse failures: none")?;
    } else {
        writeln!(out, "Parse failures:")?;
        for f in &block.parse_failures {
            writeln!(out, "  trial {}: {}", f.trial, f.reason)?;
        }
    }
    writeln!(out)?;
    writeln!(out, "Performance")?;
    writeln!(out, "  Mean rank of correct id: {}", num(m, "mean_rank_of_correct_id"))?;
    writeln!(
        out,
        "  Mean MRR:                {} (lift {})",
        num(m, "mean_mrr"),
        num(m, "mean_mrr_lift")
    )?;
    writeln!(
        out,
        "  Mean top-1 accuracy:     {} (lift {})",
        num(m, "mean_top_1_acc"),
        num(m, "mean_top_1_acc_lift")
    )?;
    writeln!(
        out,
        "  Mean top-3 accuracy:     {} (lift {})",
        num(m, "mean_top_3_acc"),
        num(m, "mean_top_3_acc_lift")
    )?;
    writeln!(out, "  Median MRR:              {}", num(m, "median_mrr"))?;
    writeln!(out, "  Median top-1 accuracy:   {}", num(m, "median_top_1_acc"))?;
    writeln!(out, "  Median top-3 accuracy:   {}", num(m, "median_top_3_acc"))?;
    writeln!(out)?;
    writeln!(out, "Positional bias (reciprocal rank ~ trial index)")?;
    writeln!(out, "  Slope:     {}", num(m, "bias_slope"))?;
    writeln!(out, "  Intercept: {}", num(m, "bias_intercept"))?;
    writeln!(out, "  p-value:   {}", num(m, "bias_p_value"))?;
    writeln!(out)?;
    writeln!(out, "{}", BLOCK_START)?;
    writeln!(out, "{}", serde_json::to_string_pretty(block)?)?;
    writeln!(out, "{}", BLOCK_END)?;
    Ok(out)
}

/// The embedded JSON block, untyped so that schema problems can be
/// reported key by key.
pub fn extract_block(text: &str) -> Result<Value, String> {
    let start = text
        .find(BLOCK_START)
        .ok_or_else(|| "report has no metrics block start marker".to_string())?;
    let body_start = start + BLOCK_START.len();
    let end = text[body_start..]
        .find(BLOCK_END)
        .map(|e| body_start + e)
        .ok_or_else(|| "report has no metrics block end marker".to_string())?;
    serde_json::from_str(text[body_start..end].trim())
        .map_err(|e| format!("metrics block is not valid JSON: {}", e))
}

pub fn read_block(store: &dyn Store, layout: &ExperimentLayout, replication: usize) -> Result<ReportBlock> {
    let text = store.read_to_string(&layout.report(replication))?;
    let value = extract_block(&text).map_err(|e| anyhow!(e))?;
    Ok(serde_json::from_value(value)?)
}

/// Digest over every response file of a replication, in trial order.
pub fn response_digest(
    store: &dyn Store,
    layout: &ExperimentLayout,
    replication: usize,
    trials: usize,
) -> Result<String> {
    let mut contents = Vec::with_capacity(trials);
    for t in 1..=trials {
        contents.push(store.read(&layout.response(replication, t))?);
    }
    Ok(sha256_chunks(contents.iter().map(|c| c.as_slice())))
}
