use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix of a response file written for a session that exhausted its retries.
pub const SESSION_FAILED_MARKER: &str = "#SESSION_FAILED:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedTrial {
    pub trial: usize,
    pub valid: bool,
    /// 1-based rank of the correct candidate; ties share the mean rank.
    pub rank: Option<f64>,
    pub scores: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ParsedTrial {
    fn invalid(trial: usize, reason: impl Into<String>) -> Self {
        Self {
            trial,
            valid: false,
            rank: None,
            scores: Vec::new(),
            reason: Some(reason.into()),
        }
    }

    pub fn reciprocal_rank(&self) -> Option<f64> {
        self.rank.map(|r| 1.0 / r)
    }
}

/// Parses one response into a score per candidate position.
///
/// Score lines look like `3: 0.75`, `Candidate 3: 0.75` or `3 = 0.75`; any
/// other line is ignored. Exactly one finite score for every position
/// `1..=k` is required.
pub fn parse_response(trial: usize, text: &str, k: usize, correct_position: usize) -> ParsedTrial {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix(SESSION_FAILED_MARKER) {
        return ParsedTrial::invalid(trial, format!("session_failed: {}", rest.trim()));
    }
    if trimmed.is_empty() {
        return ParsedTrial::invalid(trial, "empty_response");
    }
    if correct_position == 0 || correct_position > k {
        return ParsedTrial::invalid(
            trial,
            format!("correct_position {} outside 1..={}", correct_position, k),
        );
    }

    let mut by_position: BTreeMap<usize, f64> = BTreeMap::new();
    for line in trimmed.lines() {
        let Some((position, score)) = parse_score_line(line) else {
            continue;
        };
        if position == 0 || position > k {
            return ParsedTrial::invalid(trial, format!("position {} outside 1..={}", position, k));
        }
        if !score.is_finite() {
            return ParsedTrial::invalid(trial, format!("non-finite score for position {}", position));
        }
        if by_position.insert(position, score).is_some() {
            return ParsedTrial::invalid(trial, format!("duplicate score for position {}", position));
        }
    }
    if by_position.len() != k {
        return ParsedTrial::invalid(
            trial,
            format!("expected {} scores, found {}", k, by_position.len()),
        );
    }

    let scores: Vec<f64> = by_position.into_values().collect();
    let correct = scores[correct_position - 1];
    let higher = scores.iter().filter(|s| **s > correct).count() as f64;
    let ties = scores.iter().filter(|s| **s == correct).count() as f64 - 1.0;
    ParsedTrial {
        trial,
        valid: true,
        rank: Some(1.0 + higher + ties / 2.0),
        scores,
        reason: None,
    }
}

fn parse_score_line(line: &str) -> Option<(usize, f64)> {
    let mut s = line.trim().trim_start_matches(['-', '*', '#']).trim_start();
    if s.get(..9).is_some_and(|head| head.eq_ignore_ascii_case("candidate")) {
        s = s[9..].trim_start();
    }
    let digits_end = s.find(|c: char| !c.is_ascii_digit())?;
    if digits_end == 0 {
        return None;
    }
    let position: usize = s[..digits_end].parse().ok()?;
    let rest = s[digits_end..].trim_start();
    let rest = rest.strip_prefix(':').or_else(|| rest.strip_prefix('='))?;
    let token = rest.split_whitespace().next()?;
    let score: f64 = token.trim_end_matches([',', ';']).parse().ok()?;
    Some((position, score))
}
