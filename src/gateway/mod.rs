//! Judge-model gateway: the backend capability the scoring engine consumes.
//!
//! The scorers talk to the judge exclusively through the [`JudgeModel`] trait.
//! [`ProviderGateway`] is the production implementation: it wraps the
//! OpenRouter adapter with retries and usage accounting and realizes
//! constrained-label logprob queries via single-token completions with
//! `top_logprobs`.

pub mod error;
pub mod openrouter;
pub mod pricing;
pub mod types;
pub mod usage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use usage::{CallStatus, ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use openrouter::{ChatProvider, OpenRouterAdapter};
pub use pricing::{chat_cost, get_pricing, ModelPricing};
pub use types::*;
pub use usage::{NoopUsageSink, ProviderCallRecord as CallRecord, StderrUsageSink, UsageSink};

/// Provider-imposed cap on `top_logprobs` alternatives per position.
/// OpenAI-compatible APIs reject values above 20; label vocabularies
/// larger than this cannot be scored in one call.
pub const PROVIDER_TOP_LOGPROBS_CAP: u32 = 20;

// =============================================================================
// JUDGE MODEL CAPABILITY
// =============================================================================

/// The judge-model backend capability.
///
/// All methods preserve input order in output order and tolerate the
/// repeated-context pattern used by constrained-label scoring (the same
/// context zipped against every label in a vocabulary). Backend faults
/// surface as [`ProviderError`] and are fatal to the evaluation run; the
/// core performs no retry of its own.
#[async_trait]
pub trait JudgeModel: Send + Sync {
    /// Free-text completion for each flat prompt.
    async fn complete_text(&self, prompts: &[String]) -> Result<Vec<String>, ProviderError>;

    /// Free-text completion for each chat-turn sequence.
    async fn chat_response(&self, chats: &[Vec<Message>]) -> Result<Vec<String>, ProviderError>;

    /// Log-probability of each continuation given its zipped context.
    ///
    /// `contexts` and `continuations` must have equal length. A `None` entry
    /// means the backend could not score that continuation for that input.
    async fn compute_log_probs(
        &self,
        contexts: &[String],
        continuations: &[String],
    ) -> Result<Vec<Option<f64>>, ProviderError>;

    /// Chat variant: log-probability of each assistant continuation given
    /// its zipped chat context.
    async fn compute_chat_log_probs(
        &self,
        chats: &[Vec<Message>],
        continuations: &[Message],
    ) -> Result<Vec<Option<f64>>, ProviderError>;
}

// =============================================================================
// GATEWAY
// =============================================================================

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Alternatives requested per position for logprob queries.
    pub top_logprobs: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            top_logprobs: PROVIDER_TOP_LOGPROBS_CAP,
        }
    }
}

/// Production judge backend: OpenRouter adapter + retries + usage accounting.
pub struct ProviderGateway<U: UsageSinkTrait> {
    openrouter: OpenRouterAdapter,
    model: JudgeModelId,
    usage_sink: Arc<U>,
    attribution: Attribution,
    config: GatewayConfig,
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    /// Create from environment, bound to a judge model.
    pub fn from_env(model: JudgeModelId, usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let openrouter = OpenRouterAdapter::from_env()?;
        Ok(Self {
            openrouter,
            model,
            usage_sink,
            attribution: Attribution::new("gateway"),
            config: GatewayConfig::default(),
        })
    }

    pub fn with_config(
        openrouter: OpenRouterAdapter,
        model: JudgeModelId,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            openrouter,
            model,
            usage_sink,
            attribution: Attribution::new("gateway"),
            config,
        }
    }

    /// Set the attribution attached to every call from this gateway.
    pub fn attribution(mut self, attribution: Attribution) -> Self {
        self.attribution = attribution;
        self
    }

    /// Single chat completion with retry on transient faults.
    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            let result = self.openrouter.chat(&req).await;
            match result {
                Ok(resp) => {
                    self.record_usage(&req, &resp, CallStatus::Success, None)
                        .await;
                    return Ok(resp);
                }
                Err(err) => {
                    let code = err.code().to_string();
                    self.record_usage(&req, &ChatResponse::empty(), CallStatus::Error, Some(code))
                        .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::provider("openrouter", "unknown error", false)))
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        status: CallStatus,
        error_code: Option<String>,
    ) {
        let record = ProviderCallRecord::new(
            req.model.provider(),
            "chat/completions",
            req.model.model_id(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens as i32, resp.output_tokens as i32)
        .cost(resp.cost_nanodollars)
        .user(req.attribution.user_id)
        .run(req.attribution.run_id)
        .latency(resp.latency.as_millis() as i32);

        let record = if status == CallStatus::Error {
            record.error(error_code.unwrap_or_else(|| "provider_error".to_string()))
        } else {
            record
        };

        self.usage_sink.record(record).await;
    }

    fn request(&self, messages: Vec<Message>) -> ChatRequest {
        ChatRequest::new(self.model.clone(), messages, self.attribution.clone())
    }

    /// Distribution over first-output-token candidates for the given chat.
    ///
    /// Maps trimmed token text to its logprob; the sampled token itself is
    /// included alongside the alternatives.
    async fn first_token_distribution(
        &self,
        messages: Vec<Message>,
    ) -> Result<HashMap<String, f64>, ProviderError> {
        let req = self
            .request(messages)
            .max_tokens(1)
            .with_logprobs(self.config.top_logprobs);
        let resp = self.chat(req).await?;

        let mut dist = HashMap::new();
        if let Some(entries) = resp.output_logprobs {
            if let Some(first) = entries.first() {
                dist.insert(first.token.trim().to_string(), first.logprob);
                for alt in &first.top_alternatives {
                    // First insert wins: the sampled token's own logprob is
                    // authoritative when it also appears as an alternative.
                    dist.entry(alt.token.trim().to_string()).or_insert(alt.logprob);
                }
            }
        }
        Ok(dist)
    }
}

#[async_trait]
impl<U: UsageSinkTrait> JudgeModel for ProviderGateway<U> {
    async fn complete_text(&self, prompts: &[String]) -> Result<Vec<String>, ProviderError> {
        let mut outputs = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let resp = self.chat(self.request(vec![Message::user(prompt)])).await?;
            outputs.push(resp.content);
        }
        Ok(outputs)
    }

    async fn chat_response(&self, chats: &[Vec<Message>]) -> Result<Vec<String>, ProviderError> {
        let mut outputs = Vec::with_capacity(chats.len());
        for chat in chats {
            let resp = self.chat(self.request(chat.clone())).await?;
            outputs.push(resp.content);
        }
        Ok(outputs)
    }

    async fn compute_log_probs(
        &self,
        contexts: &[String],
        continuations: &[String],
    ) -> Result<Vec<Option<f64>>, ProviderError> {
        if contexts.len() != continuations.len() {
            return Err(ProviderError::invalid_request(format!(
                "contexts and continuations must be zipped: {} vs {}",
                contexts.len(),
                continuations.len()
            )));
        }

        // Repeated contexts (the label-vocabulary pattern) share one
        // upstream call each.
        let mut cached: Option<(&str, HashMap<String, f64>)> = None;
        let mut out = Vec::with_capacity(contexts.len());
        for (context, continuation) in contexts.iter().zip(continuations) {
            let hit = matches!(&cached, Some((key, _)) if *key == context.as_str());
            if !hit {
                let dist = self
                    .first_token_distribution(vec![Message::user(context)])
                    .await?;
                cached = Some((context.as_str(), dist));
            }
            let logprob = match &cached {
                Some((_, dist)) => dist.get(continuation.trim()).copied(),
                None => None,
            };
            out.push(logprob);
        }
        Ok(out)
    }

    async fn compute_chat_log_probs(
        &self,
        chats: &[Vec<Message>],
        continuations: &[Message],
    ) -> Result<Vec<Option<f64>>, ProviderError> {
        if chats.len() != continuations.len() {
            return Err(ProviderError::invalid_request(format!(
                "chats and continuations must be zipped: {} vs {}",
                chats.len(),
                continuations.len()
            )));
        }

        let mut cached: Option<(String, HashMap<String, f64>)> = None;
        let mut out = Vec::with_capacity(chats.len());
        for (chat, continuation) in chats.iter().zip(continuations) {
            let key = serde_json::to_string(chat)
                .map_err(|e| ProviderError::invalid_request(format!("unserializable chat: {e}")))?;
            let hit = matches!(&cached, Some((k, _)) if *k == key);
            if !hit {
                let dist = self.first_token_distribution(chat.clone()).await?;
                cached = Some((key, dist));
            }
            let logprob = match &cached {
                Some((_, dist)) => dist.get(continuation.content.trim()).copied(),
                None => None,
            };
            out.push(logprob);
        }
        Ok(out)
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}

impl ChatResponse {
    fn empty() -> Self {
        Self {
            content: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            latency: Duration::from_millis(0),
            finish_reason: FinishReason::Unknown("error".to_string()),
            output_logprobs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 10), Duration::from_secs(32));
    }
}
