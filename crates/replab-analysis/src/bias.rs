use crate::parse::ParsedTrial;
use crate::stats::linear_regression;
use serde::{Deserialize, Serialize};

/// Drift of reciprocal rank across the trial sequence of one replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasRecord {
    pub n_trials: usize,
    pub bias_slope: f64,
    pub bias_intercept: f64,
    pub bias_p_value: f64,
}

pub fn compute_bias(trials: &[ParsedTrial]) -> BiasRecord {
    let (xs, ys): (Vec<f64>, Vec<f64>) = trials
        .iter()
        .filter(|t| t.valid)
        .filter_map(|t| t.reciprocal_rank().map(|rr| (t.trial as f64, rr)))
        .unzip();
    let fit = linear_regression(&xs, &ys);
    BiasRecord {
        n_trials: xs.len(),
        bias_slope: fit.slope,
        bias_intercept: fit.intercept,
        bias_p_value: fit.p_value,
    }
}
