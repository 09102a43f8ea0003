#![forbid(unsafe_code)]

//! # verdict-harness
//!
//! LLM-as-judge scoring over batches of model outputs.
//!
//! Two scoring strategies share one pipeline. A free-text judge completes an
//! evaluation prompt and the score is parsed out of the completion; a
//! weighted-label judge reads the token-level log probabilities of a fixed
//! label vocabulary and reports the probability-weighted expectation, giving
//! continuous scores from a discrete scale. Either way, per-instance scores
//! roll up into an overall mean, a parse-failure count, and per-category
//! means. A separate reward-bench driver judges chosen/rejected response
//! pairs and reports accuracy.
//!
//! Judges run behind the [`gateway::JudgeModel`] capability trait; the
//! bundled implementation is an OpenRouter gateway with retries, usage
//! accounting, and cost tracking.

pub mod batching;
pub mod gateway;
pub mod prompts;
pub mod reward;
pub mod scorer;

pub use gateway::{Attribution, ChatProvider, JudgeModel, ProviderGateway, UsageSink};
pub use prompts::{PlaceholderTemplate, PromptMode, PromptTemplate, SystemMessage};
pub use reward::{evaluate_reward_bench, LlmPairwiseJudge, RewardBenchInstance, RewardJudge};
pub use scorer::{FreeTextScorer, ScoreOutcome, ScoreSummary, WeightedLabelScorer};
