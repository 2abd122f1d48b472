//! Leaf analysis for a single replication: turning raw LLM responses into
//! ranked trials, and folding ranked trials into performance and positional
//! bias figures.

mod bias;
mod metrics;
mod parse;
pub mod stats;

pub use bias::{compute_bias, BiasRecord};
pub use metrics::{chance_levels, compute_metrics, ChanceLevels, MetricsRecord};
pub use parse::{parse_response, ParsedTrial, SESSION_FAILED_MARKER};
