//! Constrained-label scoring via probability-weighted expectation.
//!
//! Instead of parsing a single completion, the judge is queried for a
//! log-probability over every label in a fixed vocabulary (the string
//! integers of the configured score range). The score is the
//! probability-weighted mean of the surviving labels, which uses the full
//! probability mass over plausible verdicts rather than the single
//! highest-likelihood completion.

use std::num::NonZeroUsize;
use std::sync::Arc;

use tracing::warn;

use crate::batching::{batch_iter, DEFAULT_BATCH_SIZE};
use crate::gateway::{JudgeModel, Message, PROVIDER_TOP_LOGPROBS_CAP};
use crate::prompts::{
    assemble_prompt, PromptMode, PromptTemplate, RenderContext, RenderedPrompt, SystemMessage,
};

use super::aggregate::summarize_scores;
use super::freetext::build_contexts;
use super::types::{JudgeOutput, LabelLogprobMap, ScoreOutcome, ScoreResult, TaskInputs};
use super::ScoreError;

/// Probability-weighted mean over a label logprob map.
///
/// Labels are dropped when the backend returned no logprob, when they do
/// not parse as an integer, or when they fall outside the valid range.
/// Probabilities come from exponentiating logprobs shifted by the maximum
/// survivor, so deep-negative distributions keep a well-defined mean
/// instead of underflowing to 0/0. Returns `None` when no label survives.
pub fn weighted_label_average(
    label_logprobs: &LabelLogprobMap,
    valid_score_range: Option<(i64, i64)>,
) -> Option<f64> {
    let mut survivors: Vec<(i64, f64)> = Vec::with_capacity(label_logprobs.len());
    for (label, logprob) in label_logprobs {
        let Some(logprob) = logprob else { continue };
        let Ok(score) = label.trim().parse::<i64>() else {
            continue;
        };
        if let Some((lo, hi)) = valid_score_range {
            if score < lo || score > hi {
                continue;
            }
        }
        survivors.push((score, *logprob));
    }

    if survivors.is_empty() {
        return None;
    }

    let max_logprob = survivors
        .iter()
        .map(|(_, lp)| *lp)
        .fold(f64::NEG_INFINITY, f64::max);

    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    for (score, logprob) in &survivors {
        let weight = (logprob - max_logprob).exp();
        weighted_sum += *score as f64 * weight;
        total_weight += weight;
    }
    Some(weighted_sum / total_weight)
}

/// Judge scorer over a constrained label vocabulary.
pub struct WeightedLabelScorer {
    judge: Arc<dyn JudgeModel>,
    template: Arc<dyn PromptTemplate>,
    system_message: Option<SystemMessage>,
    mode: PromptMode,
    batch_size: NonZeroUsize,
    valid_score_range: (i64, i64),
    labels: Vec<String>,
    category_key: Option<String>,
}

impl WeightedLabelScorer {
    /// Create a scorer for the inclusive score range `[lo, hi]`.
    ///
    /// The label vocabulary is the string form of every integer in the
    /// range; its size is validated against the provider's logprob cap
    /// here, not mid-run.
    pub fn new(
        judge: Arc<dyn JudgeModel>,
        template: Arc<dyn PromptTemplate>,
        valid_score_range: (i64, i64),
    ) -> Result<Self, ScoreError> {
        let (lo, hi) = valid_score_range;
        if lo > hi {
            return Err(ScoreError::Config(format!(
                "invalid score range: [{lo}, {hi}]"
            )));
        }
        let labels: Vec<String> = (lo..=hi).map(|score| score.to_string()).collect();
        let cap = PROVIDER_TOP_LOGPROBS_CAP as usize;
        if labels.len() > cap {
            return Err(ScoreError::Config(format!(
                "label vocabulary of {} exceeds the provider cap of {cap}",
                labels.len()
            )));
        }

        Ok(Self {
            judge,
            template,
            system_message: None,
            mode: PromptMode::Text,
            batch_size: NonZeroUsize::new(DEFAULT_BATCH_SIZE).unwrap_or(NonZeroUsize::MIN),
            valid_score_range,
            labels,
            category_key: None,
        })
    }

    /// Present prompts as chat turns instead of flat text.
    pub fn chat_mode(mut self) -> Self {
        self.mode = PromptMode::Chat;
        self
    }

    /// System message prepended in chat mode.
    pub fn system_message(mut self, system: SystemMessage) -> Self {
        self.system_message = Some(system);
        self
    }

    pub fn batch_size(mut self, batch_size: NonZeroUsize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Task-input field used for per-category means.
    pub fn category_key(mut self, key: impl Into<String>) -> Self {
        self.category_key = Some(key.into());
        self
    }

    /// Score each model output as the weighted expectation over the label
    /// vocabulary.
    ///
    /// Per instance, the same prompt is paired once against every label in
    /// one backend query. Instances where every label is dropped get an
    /// absent score and a warning, never an error.
    pub async fn evaluate(
        &self,
        lm_outputs: &[String],
        references: Option<&[Vec<String>]>,
        task_inputs: Option<&[TaskInputs]>,
    ) -> Result<ScoreOutcome, ScoreError> {
        let contexts = build_contexts(lm_outputs, references, task_inputs)?;
        let (prompts, logprob_maps) = self.query_logprobs(&contexts).await?;

        let scores: Vec<Option<f64>> = logprob_maps
            .iter()
            .map(|label_logprobs| {
                let score =
                    weighted_label_average(label_logprobs, Some(self.valid_score_range));
                if score.is_none() {
                    warn!(
                        logprobs = ?label_logprobs,
                        "no label survived filtering for judge logprobs"
                    );
                }
                score
            })
            .collect();

        let empty_inputs;
        let inputs_for_summary: &[TaskInputs] = match task_inputs {
            Some(inputs) => inputs,
            None => {
                empty_inputs = vec![TaskInputs::new(); lm_outputs.len()];
                &empty_inputs
            }
        };
        let summary =
            summarize_scores(&scores, inputs_for_summary, self.category_key.as_deref());

        let instances = scores
            .into_iter()
            .zip(prompts)
            .zip(logprob_maps)
            .map(|((score, prompt), label_logprobs)| ScoreResult {
                score,
                prompt,
                output: JudgeOutput::LabelLogprobs(label_logprobs),
            })
            .collect();

        Ok(ScoreOutcome { summary, instances })
    }

    /// One logprob query per instance: the prompt repeated against every
    /// label, batched across instances.
    async fn query_logprobs(
        &self,
        contexts: &[RenderContext],
    ) -> Result<(Vec<RenderedPrompt>, Vec<LabelLogprobMap>), ScoreError> {
        let prompts: Vec<RenderedPrompt> = contexts
            .iter()
            .map(|ctx| {
                assemble_prompt(
                    self.template.as_ref(),
                    ctx,
                    self.mode,
                    self.system_message.as_ref(),
                )
            })
            .collect();

        let num_labels = self.labels.len();
        let mut flat_logprobs: Vec<Option<f64>> = Vec::with_capacity(prompts.len() * num_labels);

        match self.mode {
            PromptMode::Text => {
                let flat: Vec<String> = prompts
                    .iter()
                    .map(|p| match p {
                        RenderedPrompt::Text(s) => s.clone(),
                        RenderedPrompt::Chat(_) => p.display_text(),
                    })
                    .collect();
                for batch in batch_iter(&flat, self.batch_size) {
                    let mut contexts_repeated = Vec::with_capacity(batch.len() * num_labels);
                    let mut continuations = Vec::with_capacity(batch.len() * num_labels);
                    for prompt in batch {
                        for label in &self.labels {
                            contexts_repeated.push(prompt.clone());
                            continuations.push(label.clone());
                        }
                    }
                    flat_logprobs.extend(
                        self.judge
                            .compute_log_probs(&contexts_repeated, &continuations)
                            .await?,
                    );
                }
            }
            PromptMode::Chat => {
                let chats: Vec<Vec<Message>> = prompts
                    .iter()
                    .map(|p| match p {
                        RenderedPrompt::Chat(messages) => messages.clone(),
                        RenderedPrompt::Text(s) => vec![Message::user(s)],
                    })
                    .collect();
                for batch in batch_iter(&chats, self.batch_size) {
                    let mut chats_repeated = Vec::with_capacity(batch.len() * num_labels);
                    let mut continuations = Vec::with_capacity(batch.len() * num_labels);
                    for chat in batch {
                        for label in &self.labels {
                            chats_repeated.push(chat.clone());
                            continuations.push(Message::assistant(label));
                        }
                    }
                    flat_logprobs.extend(
                        self.judge
                            .compute_chat_log_probs(&chats_repeated, &continuations)
                            .await?,
                    );
                }
            }
        }

        let maps: Vec<LabelLogprobMap> = flat_logprobs
            .chunks(num_labels)
            .map(|chunk| {
                self.labels
                    .iter()
                    .cloned()
                    .zip(chunk.iter().copied())
                    .collect()
            })
            .collect();
        Ok((prompts, maps))
    }
}

// =============================================================================
// TESTS
// =============================================================================
