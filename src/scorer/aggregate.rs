//! Reduction of per-instance scores into a run summary.
//!
//! Stateless: takes the complete, already-materialized score sequence and
//! the parallel task inputs. The index correspondence between the two is
//! the caller's contract.

use std::collections::BTreeMap;

use tracing::warn;

use super::types::{ScoreSummary, TaskInputs};

/// Reduce optional scores into an overall mean, a failure count, and
/// per-category means keyed by `category_key`.
///
/// Means divide by the count of scored instances only. A run where nothing
/// parsed yields `mean: None` rather than a division by zero.
pub fn summarize_scores(
    scores: &[Option<f64>],
    task_inputs: &[TaskInputs],
    category_key: Option<&str>,
) -> ScoreSummary {
    let mut sum = 0.0;
    let mut count = 0usize;
    let mut category_sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();

    for (score, inputs) in scores.iter().zip(task_inputs) {
        let Some(score) = score else { continue };
        sum += score;
        count += 1;

        if let Some(key) = category_key {
            if let Some(category) = inputs.get(key) {
                let entry = category_sums.entry(category.clone()).or_insert((0.0, 0));
                entry.0 += score;
                entry.1 += 1;
            }
        }
    }

    let mean = if count > 0 {
        Some(sum / count as f64)
    } else {
        if !scores.is_empty() {
            warn!("no instance produced a parseable score; summary has no mean");
        }
        None
    };

    let category_means = category_sums
        .into_iter()
        .map(|(category, (sum, n))| (category, sum / n as f64))
        .collect();

    ScoreSummary {
        mean,
        num_failed_score_parses: scores.iter().filter(|s| s.is_none()).count(),
        category_means,
    }
}
