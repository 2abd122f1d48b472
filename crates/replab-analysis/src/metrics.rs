use crate::parse::ParsedTrial;
use crate::stats::{harmonic, mean, median};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Expected value of each accuracy measure when the correct candidate's
/// rank is uniform over `1..=k`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChanceLevels {
    pub mean_rank: f64,
    pub mrr: f64,
    pub top_1: f64,
    pub top_3: f64,
}

pub fn chance_levels(k: usize) -> ChanceLevels {
    let k = k.max(1);
    let kf = k as f64;
    ChanceLevels {
        mean_rank: (kf + 1.0) / 2.0,
        mrr: harmonic(k) / kf,
        top_1: 1.0 / kf,
        top_3: 3.0_f64.min(kf) / kf,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub n_valid_responses: usize,
    pub mean_rank_of_correct_id: f64,
    pub mean_mrr: f64,
    pub mean_top_1_acc: f64,
    pub mean_top_3_acc: f64,
    pub median_mrr: f64,
    pub median_top_1_acc: f64,
    pub median_top_3_acc: f64,
    pub mean_mrr_lift: f64,
    pub mean_top_1_acc_lift: f64,
    pub mean_top_3_acc_lift: f64,
}

/// Folds the valid trials of a replication into ranking accuracy figures.
pub fn compute_metrics(trials: &[ParsedTrial], k: usize) -> Result<MetricsRecord> {
    let ranks: Vec<f64> = trials
        .iter()
        .filter(|t| t.valid)
        .filter_map(|t| t.rank)
        .collect();
    if ranks.is_empty() {
        return Err(anyhow!("no valid trials to compute metrics from"));
    }
    let rr: Vec<f64> = ranks.iter().map(|r| 1.0 / r).collect();
    let top_1: Vec<f64> = ranks.iter().map(|r| hit(*r <= 1.0)).collect();
    let top_3: Vec<f64> = ranks.iter().map(|r| hit(*r <= 3.0)).collect();

    let chance = chance_levels(k);
    let mean_mrr = mean(&rr).unwrap_or(0.0);
    let mean_top_1 = mean(&top_1).unwrap_or(0.0);
    let mean_top_3 = mean(&top_3).unwrap_or(0.0);
    Ok(MetricsRecord {
        n_valid_responses: ranks.len(),
        mean_rank_of_correct_id: mean(&ranks).unwrap_or(0.0),
        mean_mrr,
        mean_top_1_acc: mean_top_1,
        mean_top_3_acc: mean_top_3,
        median_mrr: median(&rr).unwrap_or(0.0),
        median_top_1_acc: median(&top_1).unwrap_or(0.0),
        median_top_3_acc: median(&top_3).unwrap_or(0.0),
        mean_mrr_lift: mean_mrr / chance.mrr,
        mean_top_1_acc_lift: mean_top_1 / chance.top_1,
        mean_top_3_acc_lift: mean_top_3 / chance.top_3,
    })
}

fn hit(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}
