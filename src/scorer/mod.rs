//! Scoring engine: judge-driven metrics over model outputs.
//!
//! Two scorers share the same pipeline shape: assemble prompts per instance,
//! dispatch batches to the judge backend, parse raw judge output into
//! optional scores, and reduce with the aggregator. Parse failures are
//! recorded and counted, never fatal; only backend faults stop a run.

pub mod aggregate;
pub mod freetext;
pub mod types;
pub mod weighted;

use thiserror::Error;

use crate::gateway::ProviderError;

pub use aggregate::summarize_scores;
pub use freetext::{parse_score_from_judge_output, FreeTextScorer};
pub use types::{
    JudgeOutput, LabelLogprobMap, ScoreOutcome, ScoreResult, ScoreSummary, SummaryReport,
    TaskInputs,
};
pub use weighted::{weighted_label_average, WeightedLabelScorer};

/// Errors from the scoring engine.
///
/// Parse failures are not errors: they become absent scores. This type
/// covers backend faults (fatal, propagated) and configuration mistakes
/// (rejected eagerly, before any backend call).
#[derive(Debug, Error)]
pub enum ScoreError {
    /// Judge backend fault; aborts the run.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Invalid scorer configuration or mismatched input sequences.
    #[error("configuration error: {0}")]
    Config(String),
}
