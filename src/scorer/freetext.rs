//! Free-text judge scoring.
//!
//! Sends assembled prompts to the judge for open-ended completion and
//! extracts the numeric verdict from the response. Judges are usually
//! instructed to emit the verdict at the end as `[[N]]`, e.g.
//! "... so the score is [[4]]".

use std::num::NonZeroUsize;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::batching::{batch_iter, DEFAULT_BATCH_SIZE};
use crate::gateway::{JudgeModel, Message};
use crate::prompts::{
    assemble_prompt, PromptMode, PromptTemplate, RenderContext, RenderedPrompt, SystemMessage,
};

use super::aggregate::summarize_scores;
use super::types::{JudgeOutput, ScoreOutcome, ScoreResult, TaskInputs};
use super::ScoreError;

static DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
static BRACKETED_VERDICT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\[(\d+)\]\]").unwrap());

/// Extract the numeric verdict from judge output.
///
/// Judges are instructed to emit their verdict as `[[N]]`; the last such
/// marker wins. Without a marker, falls back to the last run of decimal
/// digits anywhere in the completion. Returns `None` when neither occurs,
/// when the digits do not fit an `i64`, or when a valid range is configured
/// and the value falls outside it (out-of-range values are dropped, never
/// clamped).
pub fn parse_score_from_judge_output(
    output: &str,
    valid_score_range: Option<(i64, i64)>,
) -> Option<i64> {
    let digits = match BRACKETED_VERDICT.captures_iter(output).last() {
        Some(caps) => caps.get(1).map(|m| m.as_str()),
        None => DIGIT_RUN.find_iter(output).last().map(|m| m.as_str()),
    }?;
    let parsed: i64 = digits.parse().ok()?;
    if let Some((lo, hi)) = valid_score_range {
        if parsed < lo || parsed > hi {
            return None;
        }
    }
    Some(parsed)
}

/// Build per-instance rendering contexts, defaulting absent references and
/// task inputs and rejecting length mismatches eagerly.
pub(crate) fn build_contexts(
    lm_outputs: &[String],
    references: Option<&[Vec<String>]>,
    task_inputs: Option<&[TaskInputs]>,
) -> Result<Vec<RenderContext>, ScoreError> {
    let n = lm_outputs.len();
    if let Some(refs) = references {
        if refs.len() != n {
            return Err(ScoreError::Config(format!(
                "references length {} does not match lm_outputs length {n}",
                refs.len()
            )));
        }
    }
    if let Some(inputs) = task_inputs {
        if inputs.len() != n {
            return Err(ScoreError::Config(format!(
                "task_inputs length {} does not match lm_outputs length {n}",
                inputs.len()
            )));
        }
    }

    static EMPTY_REFS: Vec<String> = Vec::new();
    static EMPTY_INPUTS: Lazy<TaskInputs> = Lazy::new(TaskInputs::new);

    Ok(lm_outputs
        .iter()
        .enumerate()
        .map(|(i, lm_output)| {
            let refs = references.map(|r| &r[i]).unwrap_or(&EMPTY_REFS);
            let inputs = task_inputs.map(|t| &t[i]).unwrap_or(&EMPTY_INPUTS);
            RenderContext::for_instance(lm_output, refs, inputs.iter())
        })
        .collect())
}

/// Judge scorer over free-text completions.
pub struct FreeTextScorer {
    judge: Arc<dyn JudgeModel>,
    template: Arc<dyn PromptTemplate>,
    system_message: Option<SystemMessage>,
    mode: PromptMode,
    batch_size: NonZeroUsize,
    valid_score_range: Option<(i64, i64)>,
    category_key: Option<String>,
}

impl FreeTextScorer {
    pub fn new(judge: Arc<dyn JudgeModel>, template: Arc<dyn PromptTemplate>) -> Self {
        Self {
            judge,
            template,
            system_message: None,
            mode: PromptMode::Text,
            batch_size: NonZeroUsize::new(DEFAULT_BATCH_SIZE).unwrap_or(NonZeroUsize::MIN),
            valid_score_range: None,
            category_key: None,
        }
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

    /// Inclusive range outside which parsed scores are discarded.
    pub fn valid_score_range(mut self, lo: i64, hi: i64) -> Result<Self, ScoreError> {
        if lo > hi {
            return Err(ScoreError::Config(format!(
                "invalid score range: [{lo}, {hi}]"
            )));
        }
        self.valid_score_range = Some((lo, hi));
        Ok(self)
    }

    /// Task-input field used for per-category means.
    pub fn category_key(mut self, key: impl Into<String>) -> Self {
        self.category_key = Some(key.into());
        self
    }

    /// Score each model output with the judge.
    ///
    /// Returns one result per input, in input order, regardless of batch
    /// size. Unparseable judge output yields an absent score and a warning,
    /// never an error.
    pub async fn evaluate(
        &self,
        lm_outputs: &[String],
        references: Option<&[Vec<String>]>,
        task_inputs: Option<&[TaskInputs]>,
    ) -> Result<ScoreOutcome, ScoreError> {
        let contexts = build_contexts(lm_outputs, references, task_inputs)?;
        let (prompts, judge_outputs) = self.run_judge(&contexts).await?;

        let scores: Vec<Option<f64>> = judge_outputs
            .iter()
            .map(|output| {
                let score = parse_score_from_judge_output(output, self.valid_score_range);
                if score.is_none() {
                    warn!(output = %output, "failed to parse score from judge output");
                }
                score.map(|s| s as f64)
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
            .zip(judge_outputs)
            .map(|((score, prompt), output)| ScoreResult {
                score,
                prompt,
                output: JudgeOutput::Completion(output),
            })
            .collect();

        Ok(ScoreOutcome { summary, instances })
    }

    async fn run_judge(
        &self,
        contexts: &[RenderContext],
    ) -> Result<(Vec<RenderedPrompt>, Vec<String>), ScoreError> {
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

        let mut outputs = Vec::with_capacity(prompts.len());
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
                    outputs.extend(self.judge.complete_text(batch).await?);
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
                    outputs.extend(self.judge.chat_response(batch).await?);
                }
            }
        }
        Ok((prompts, outputs))
    }
}

// =============================================================================
// TESTS
// =============================================================================
