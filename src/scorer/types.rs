//! Data model for the scoring engine.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::prompts::RenderedPrompt;

/// Task-specific input fields for one instance, keyed by field name.
pub type TaskInputs = BTreeMap<String, String>;

/// Log-probability per label of a fixed vocabulary. `None` means the backend
/// could not score that label for this input.
pub type LabelLogprobMap = BTreeMap<String, Option<f64>>;

/// Flattened report: metric name to value, including the overall mean,
/// `num_failed_score_parses`, and `<metric>/<category>` entries.
pub type SummaryReport = BTreeMap<String, f64>;

/// Raw judge output kept for auditing.
#[derive(Debug, Clone, Serialize)]
pub enum JudgeOutput {
    /// Free-text completion from the judge.
    Completion(String),
    /// Per-label log-probabilities from constrained scoring.
    LabelLogprobs(LabelLogprobMap),
}

/// Per-instance scoring result with provenance.
///
/// `score` is absent on a parse or threshold failure. The rendered prompt
/// and raw judge output are carried unchanged into the final report.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreResult {
    pub score: Option<f64>,
    pub prompt: RenderedPrompt,
    pub output: JudgeOutput,
}

/// Reduced view over a full run's scores.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreSummary {
    /// Mean over instances that produced a score. `None` when no instance
    /// did; callers must treat that as "no result", not zero.
    pub mean: Option<f64>,
    /// Count of absent scores.
    pub num_failed_score_parses: usize,
    /// Mean per category value, over scored instances only.
    pub category_means: BTreeMap<String, f64>,
}

impl ScoreSummary {
    /// Flatten into a `<metric name> -> value` report.
    pub fn to_report(&self, metric: &str) -> SummaryReport {
        let mut report = SummaryReport::new();
        if let Some(mean) = self.mean {
            report.insert(metric.to_string(), mean);
        }
        report.insert(
            "num_failed_score_parses".to_string(),
            self.num_failed_score_parses as f64,
        );
        for (category, mean) in &self.category_means {
            report.insert(format!("{metric}/{category}"), *mean);
        }
        report
    }
}

/// Everything a scorer returns: the summary plus ordered per-instance
/// details, index-aligned with the evaluated outputs.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreOutcome {
    pub summary: ScoreSummary,
    pub instances: Vec<ScoreResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_omits_mean_when_no_scores_parsed() {
        let summary = ScoreSummary {
            mean: None,
            num_failed_score_parses: 3,
            category_means: BTreeMap::new(),
        };
        let report = summary.to_report("llm_score");
        assert!(!report.contains_key("llm_score"));
        assert_eq!(report["num_failed_score_parses"], 3.0);
    }

    #[test]
    fn report_flattens_categories() {
        let mut category_means = BTreeMap::new();
        category_means.insert("math".to_string(), 2.0);
        let summary = ScoreSummary {
            mean: Some(2.5),
            num_failed_score_parses: 0,
            category_means,
        };
        let report = summary.to_report("llm_score");
        assert_eq!(report["llm_score"], 2.5);
        assert_eq!(report["llm_score/math"], 2.0);
    }
}
