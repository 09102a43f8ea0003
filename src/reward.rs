//! Pairwise reward judging over chosen/rejected response pairs.
//!
//! A reward-bench dataset pairs each prompt with a preferred ("chosen") and
//! a dispreferred ("rejected") response. A judge decides per pair whether
//! chosen really is better; accuracy over the dataset is the headline
//! metric. The judge is a capability interface: an LLM preference judge and
//! a scalar reward-model judge are both provided.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::batching::batch_iter;
use crate::gateway::{JudgeModel, Message, ProviderError};
use crate::prompts::{
    assemble_prompt, FieldValue, PromptMode, PromptTemplate, RenderContext, RenderedPrompt,
    SystemMessage,
};
use crate::scorer::SummaryReport;

// =============================================================================
// Types
// =============================================================================

/// One reward-bench comparison: a prompt with a preferred and a
/// dispreferred response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardBenchInstance {
    pub prompt: String,
    pub chosen: String,
    pub rejected: String,
}

/// Position label a preference judge answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PairwiseChoice {
    A,
    B,
}

impl PairwiseChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairwiseChoice::A => "[[A]]",
            PairwiseChoice::B => "[[B]]",
        }
    }
}

/// Raw evidence behind a judgment.
#[derive(Debug, Clone, Serialize)]
pub enum JudgmentDetail {
    /// LLM preference verdicts, one per presentation order.
    Preference {
        /// Judge output with chosen presented as answer A.
        forward_output: String,
        /// Judge output with chosen presented as answer B.
        reversed_output: String,
    },
    /// Scalar rewards for each side.
    ScalarRewards { chosen: f64, rejected: f64 },
}

/// Per-pair judgment: the binary decision plus the raw outputs it came from.
#[derive(Debug, Clone, Serialize)]
pub struct RewardJudgment {
    pub chosen_is_better: bool,
    pub detail: JudgmentDetail,
}

/// Errors from reward judging.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("configuration error: {0}")]
    Config(String),
}

// =============================================================================
// Judge capability
// =============================================================================

/// Capability interface for pairwise judging. The decision rule (scalar
/// reward comparison vs. direct LLM preference) is the implementation's
/// business.
#[async_trait]
pub trait RewardJudge: Send + Sync {
    /// Judge a batch of pairs, one judgment per instance, in input order.
    async fn judge_batch(
        &self,
        batch: &[RewardBenchInstance],
    ) -> Result<Vec<RewardJudgment>, JudgeError>;
}

// =============================================================================
// LLM preference judge
// =============================================================================

/// Extract the judge's verdict: the last `[[A]]`/`[[B]]` marker wins.
pub fn parse_pairwise_choice(output: &str) -> Option<PairwiseChoice> {
    let a = output.rfind(PairwiseChoice::A.as_str());
    let b = output.rfind(PairwiseChoice::B.as_str());
    match (a, b) {
        (Some(a_pos), Some(b_pos)) => {
            if a_pos > b_pos {
                Some(PairwiseChoice::A)
            } else {
                Some(PairwiseChoice::B)
            }
        }
        (Some(_), None) => Some(PairwiseChoice::A),
        (None, Some(_)) => Some(PairwiseChoice::B),
        (None, None) => None,
    }
}

/// Preference judge backed by a chat judge model.
///
/// Each pair is presented in both orders to cancel position bias; chosen
/// wins only when the judge prefers it in both presentations. A split
/// verdict is a tie and counts as not-better, as does an unparseable
/// verdict (logged as a warning, never fatal).
pub struct LlmPairwiseJudge {
    judge: Arc<dyn JudgeModel>,
    template: Arc<dyn PromptTemplate>,
    system_message: Option<SystemMessage>,
}

impl LlmPairwiseJudge {
    /// The template must reference `{prompt}`, `{answer_a}`, and
    /// `{answer_b}`.
    pub fn new(judge: Arc<dyn JudgeModel>, template: Arc<dyn PromptTemplate>) -> Self {
        Self {
            judge,
            template,
            system_message: None,
        }
    }

    pub fn system_message(mut self, system: SystemMessage) -> Self {
        self.system_message = Some(system);
        self
    }

    fn build_chat(&self, prompt: &str, answer_a: &str, answer_b: &str) -> Vec<Message> {
        let mut ctx = RenderContext::new();
        ctx.insert("prompt", FieldValue::Text(prompt.to_string()));
        ctx.insert("answer_a", FieldValue::Text(answer_a.to_string()));
        ctx.insert("answer_b", FieldValue::Text(answer_b.to_string()));

        match assemble_prompt(
            self.template.as_ref(),
            &ctx,
            PromptMode::Chat,
            self.system_message.as_ref(),
        ) {
            RenderedPrompt::Chat(messages) => messages,
            RenderedPrompt::Text(s) => vec![Message::user(s)],
        }
    }
}

#[async_trait]
impl RewardJudge for LlmPairwiseJudge {
    async fn judge_batch(
        &self,
        batch: &[RewardBenchInstance],
    ) -> Result<Vec<RewardJudgment>, JudgeError> {
        // Two presentations per pair, interleaved: chosen as A, then
        // chosen as B.
        let mut chats = Vec::with_capacity(batch.len() * 2);
        for instance in batch {
            chats.push(self.build_chat(&instance.prompt, &instance.chosen, &instance.rejected));
            chats.push(self.build_chat(&instance.prompt, &instance.rejected, &instance.chosen));
        }

        let outputs = self.judge.chat_response(&chats).await?;

        let judgments = outputs
            .chunks(2)
            .map(|pair| {
                let forward_output = pair.first().cloned().unwrap_or_default();
                let reversed_output = pair.get(1).cloned().unwrap_or_default();

                let forward = parse_pairwise_choice(&forward_output);
                let reversed = parse_pairwise_choice(&reversed_output);
                if forward.is_none() || reversed.is_none() {
                    warn!(
                        forward = %forward_output,
                        reversed = %reversed_output,
                        "judge verdict missing [[A]]/[[B]] marker"
                    );
                }

                let chosen_is_better = forward == Some(PairwiseChoice::A)
                    && reversed == Some(PairwiseChoice::B);

                RewardJudgment {
                    chosen_is_better,
                    detail: JudgmentDetail::Preference {
                        forward_output,
                        reversed_output,
                    },
                }
            })
            .collect();

        Ok(judgments)
    }
}

// =============================================================================
// Scalar reward judge
// =============================================================================

/// A reward model producing one scalar per (prompt, response) pair.
#[async_trait]
pub trait ScalarRewardModel: Send + Sync {
    async fn score_responses(
        &self,
        prompts: &[String],
        responses: &[String],
    ) -> Result<Vec<f64>, JudgeError>;
}

/// Judge that compares scalar rewards for the two sides.
///
/// Chosen wins only with a strictly greater reward; equal rewards are a
/// tie and count as not-better.
pub struct ScalarRewardJudge<M: ScalarRewardModel> {
    model: M,
}

impl<M: ScalarRewardModel> ScalarRewardJudge<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

#[async_trait]
impl<M: ScalarRewardModel> RewardJudge for ScalarRewardJudge<M> {
    async fn judge_batch(
        &self,
        batch: &[RewardBenchInstance],
    ) -> Result<Vec<RewardJudgment>, JudgeError> {
        let prompts: Vec<String> = batch.iter().map(|i| i.prompt.clone()).collect();
        let chosen: Vec<String> = batch.iter().map(|i| i.chosen.clone()).collect();
        let rejected: Vec<String> = batch.iter().map(|i| i.rejected.clone()).collect();

        let chosen_rewards = self.model.score_responses(&prompts, &chosen).await?;
        let rejected_rewards = self.model.score_responses(&prompts, &rejected).await?;

        Ok(chosen_rewards
            .into_iter()
            .zip(rejected_rewards)
            .map(|(chosen, rejected)| RewardJudgment {
                chosen_is_better: chosen > rejected,
                detail: JudgmentDetail::ScalarRewards { chosen, rejected },
            })
            .collect())
    }
}

// =============================================================================
// Dataset evaluation
// =============================================================================

/// Run a reward judge over a dataset.
///
/// Batched without affecting results; judgments come back in dataset
/// order. `max_instances` truncates the dataset up front. An empty
/// dataset is a configuration error, not a division by zero.
pub async fn evaluate_reward_bench(
    judge: &dyn RewardJudge,
    dataset: &[RewardBenchInstance],
    batch_size: NonZeroUsize,
    max_instances: Option<usize>,
) -> Result<(SummaryReport, Vec<RewardJudgment>), JudgeError> {
    let instances = match max_instances {
        Some(max) => &dataset[..max.min(dataset.len())],
        None => dataset,
    };
    if instances.is_empty() {
        return Err(JudgeError::Config(
            "reward-bench dataset is empty".to_string(),
        ));
    }

    let mut judgments: Vec<RewardJudgment> = Vec::with_capacity(instances.len());
    for (i, batch) in batch_iter(instances, batch_size).enumerate() {
        let batch_judgments = judge.judge_batch(batch).await?;

        if i == 0 {
            if let (Some(instance), Some(judgment)) = (batch.first(), batch_judgments.first()) {
                debug!(
                    prompt = %instance.prompt,
                    chosen = %instance.chosen,
                    rejected = %instance.rejected,
                    judgment = ?judgment,
                    "first reward-bench example"
                );
            }
        }

        judgments.extend(batch_judgments);
    }

    let correct = judgments.iter().filter(|j| j.chosen_is_better).count();
    let accuracy = correct as f64 / judgments.len() as f64;

    let mut report = SummaryReport::new();
    report.insert("accuracy".to_string(), accuracy);
    Ok((report, judgments))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn verdict_parsing_takes_last_marker() {
        assert_eq!(parse_pairwise_choice("[[A]]"), Some(PairwiseChoice::A));
        assert_eq!(
            parse_pairwise_choice("leaning [[A]], but final: [[B]]"),
            Some(PairwiseChoice::B)
        );
        assert_eq!(parse_pairwise_choice("no verdict"), None);
    }

    struct FixedJudge {
        verdicts: Vec<bool>,
    }

    #[async_trait]
    impl RewardJudge for FixedJudge {
        async fn judge_batch(
            &self,
            batch: &[RewardBenchInstance],
        ) -> Result<Vec<RewardJudgment>, JudgeError> {
            Ok(batch
                .iter()
                .map(|instance| {
                    let index: usize = instance.prompt.parse().unwrap();
                    RewardJudgment {
                        chosen_is_better: self.verdicts[index],
                        detail: JudgmentDetail::ScalarRewards {
                            chosen: 0.0,
                            rejected: 0.0,
                        },
                    }
                })
                .collect())
        }
    }

    fn dataset(n: usize) -> Vec<RewardBenchInstance> {
        (0..n)
            .map(|i| RewardBenchInstance {
                prompt: i.to_string(),
                chosen: format!("chosen {i}"),
                rejected: format!("rejected {i}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn accuracy_is_exact_fraction() {
        let judge = FixedJudge {
            verdicts: vec![true, false, true],
        };
        let data = dataset(3);
        let (report, judgments) =
            evaluate_reward_bench(&judge, &data, NonZeroUsize::new(2).unwrap(), None)
                .await
                .unwrap();
        assert_eq!(judgments.len(), 3);
        assert!((report["accuracy"] - 2.0 / 3.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn batch_size_does_not_change_results() {
        let judge = FixedJudge {
            verdicts: vec![true, true, false, true, false],
        };
        let data = dataset(5);

        let mut reports = Vec::new();
        for bs in [1usize, 2, 5, 8] {
            let (report, judgments) =
                evaluate_reward_bench(&judge, &data, NonZeroUsize::new(bs).unwrap(), None)
                    .await
                    .unwrap();
            let flags: Vec<bool> = judgments.iter().map(|j| j.chosen_is_better).collect();
            assert_eq!(flags, vec![true, true, false, true, false]);
            reports.push(report["accuracy"]);
        }
        assert!(reports.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn max_instances_truncates() {
        let judge = FixedJudge {
            verdicts: vec![true, false, true],
        };
        let data = dataset(3);
        let (report, judgments) =
            evaluate_reward_bench(&judge, &data, NonZeroUsize::new(4).unwrap(), Some(2))
                .await
                .unwrap();
        assert_eq!(judgments.len(), 2);
        assert!((report["accuracy"] - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn empty_dataset_is_rejected() {
        let judge = FixedJudge { verdicts: vec![] };
        let result =
            evaluate_reward_bench(&judge, &[], NonZeroUsize::new(4).unwrap(), None).await;
        assert!(matches!(result, Err(JudgeError::Config(_))));
    }

    struct ScriptedRewards {
        rewards: Mutex<Vec<Vec<f64>>>,
    }

    #[async_trait]
    impl ScalarRewardModel for ScriptedRewards {
        async fn score_responses(
            &self,
            _prompts: &[String],
            _responses: &[String],
        ) -> Result<Vec<f64>, JudgeError> {
            let mut rewards = self.rewards.lock().unwrap();
            Ok(rewards.remove(0))
        }
    }

    #[tokio::test]
    async fn scalar_tie_counts_as_not_better() {
        let model = ScriptedRewards {
            rewards: Mutex::new(vec![vec![1.0, 2.0, 3.0], vec![0.5, 2.0, 4.0]]),
        };
        let judge = ScalarRewardJudge::new(model);
        let judgments = judge.judge_batch(&dataset(3)).await.unwrap();

        assert!(judgments[0].chosen_is_better); // 1.0 > 0.5
        assert!(!judgments[1].chosen_is_better); // tie
        assert!(!judgments[2].chosen_is_better); // 3.0 < 4.0
    }

    struct ScriptedChat {
        outputs: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JudgeModel for ScriptedChat {
        async fn complete_text(&self, _: &[String]) -> Result<Vec<String>, ProviderError> {
            unreachable!()
        }
        async fn chat_response(
            &self,
            chats: &[Vec<Message>],
        ) -> Result<Vec<String>, ProviderError> {
            let mut outputs = self.outputs.lock().unwrap();
            Ok(outputs.drain(..chats.len()).collect())
        }
        async fn compute_log_probs(
            &self,
            _: &[String],
            _: &[String],
        ) -> Result<Vec<Option<f64>>, ProviderError> {
            unreachable!()
        }
        async fn compute_chat_log_probs(
            &self,
            _: &[Vec<Message>],
            _: &[Message],
        ) -> Result<Vec<Option<f64>>, ProviderError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn llm_judge_requires_both_presentations_to_agree() {
        let outputs = vec![
            // pair 0: both presentations prefer chosen
            "[[A]]".to_string(),
            "[[B]]".to_string(),
            // pair 1: split verdict (position bias) -> tie
            "[[A]]".to_string(),
            "[[A]]".to_string(),
            // pair 2: unparseable forward verdict -> tie
            "cannot decide".to_string(),
            "[[B]]".to_string(),
        ];
        let judge = LlmPairwiseJudge::new(
            Arc::new(ScriptedChat {
                outputs: Mutex::new(outputs),
            }),
            Arc::new(crate::prompts::PlaceholderTemplate::new(
                "Q: {prompt}\nA: {answer_a}\nB: {answer_b}\nAnswer [[A]] or [[B]].",
            )),
        );

        let judgments = judge.judge_batch(&dataset(3)).await.unwrap();
        assert!(judgments[0].chosen_is_better);
        assert!(!judgments[1].chosen_is_better);
        assert!(!judgments[2].chosen_is_better);
    }
}
