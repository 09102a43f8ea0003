use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use verdict_harness::gateway::{
    chat_cost, Attribution, ChatProvider, ChatRequest, FinishReason, GatewayConfig, JudgeModel,
    JudgeModelId, Message, NoopUsageSink, OpenRouterAdapter, ProviderError, ProviderGateway,
};

fn adapter_for(server: &MockServer) -> OpenRouterAdapter {
    OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap()
}

fn request(content: &str) -> ChatRequest {
    ChatRequest::new(
        JudgeModelId::openrouter("openai/gpt-4o-mini"),
        vec![Message::user(content)],
        Attribution::new("test"),
    )
}

#[tokio::test]
async fn parses_success_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "the score is [[4]]" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
        })))
        .mount(&server)
        .await;

    let resp = adapter_for(&server).chat(&request("hi")).await.unwrap();
    assert_eq!(resp.content, "the score is [[4]]");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 20);
    assert_eq!(
        resp.cost_nanodollars,
        chat_cost("openai/gpt-4o-mini", 10, 20)
    );
}

#[tokio::test]
async fn rate_limit_is_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "slow down", "code": "rate_limited" }
        })))
        .mount(&server)
        .await;

    let err = adapter_for(&server).chat(&request("hi")).await.unwrap_err();
    assert!(matches!(err, ProviderError::RateLimited { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn invalid_request_is_not_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "bad model id", "code": "invalid_model" }
        })))
        .mount(&server)
        .await;

    let err = adapter_for(&server).chat(&request("hi")).await.unwrap_err();
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn oversized_input_is_rejected_before_any_network_call() {
    // Server with no mounted mocks: any request would 404.
    let server = MockServer::start().await;
    let huge = "x".repeat(600_000);

    let err = adapter_for(&server).chat(&request(&huge)).await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidRequest { .. }));
}

struct FlakyThenOk {
    calls: Arc<AtomicUsize>,
    failures: usize,
}

impl Respond for FlakyThenOk {
    fn respond(&self, _req: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            ResponseTemplate::new(500).set_body_json(json!({
                "error": { "message": "upstream exploded" }
            }))
        } else {
            ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": { "content": "recovered" },
                    "finish_reason": "stop"
                }],
                "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
            }))
        }
    }
}

#[tokio::test]
async fn gateway_retries_transient_faults() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlakyThenOk {
            calls: calls.clone(),
            failures: 2,
        })
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter_for(&server),
        JudgeModelId::openrouter("openai/gpt-4o-mini"),
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
            ..GatewayConfig::default()
        },
    );

    let outputs = gateway.complete_text(&["hi".to_string()]).await.unwrap();
    assert_eq!(outputs, vec!["recovered".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn logprob_queries_share_one_call_per_repeated_context() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));

    struct LogprobResponder {
        calls: Arc<AtomicUsize>,
    }
    impl Respond for LogprobResponder {
        fn respond(&self, _req: &Request) -> ResponseTemplate {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": { "content": "2" },
                    "finish_reason": "length",
                    "logprobs": {
                        "content": [{
                            "token": "2",
                            "logprob": -0.4,
                            "top_logprobs": [
                                { "token": "2", "logprob": -0.4 },
                                { "token": " 1", "logprob": -1.2 },
                                { "token": "3", "logprob": -2.5 }
                            ]
                        }]
                    }
                }],
                "usage": { "prompt_tokens": 50, "completion_tokens": 1 }
            }))
        }
    }

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(LogprobResponder {
            calls: calls.clone(),
        })
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter_for(&server),
        JudgeModelId::openrouter("openai/gpt-4o-mini"),
        Arc::new(NoopUsageSink),
        GatewayConfig::default(),
    );

    let contexts: Vec<String> = vec!["rate this".into(); 3];
    let continuations: Vec<String> = vec!["1".into(), "2".into(), "3".into()];
    let logprobs = gateway
        .compute_log_probs(&contexts, &continuations)
        .await
        .unwrap();

    // One upstream call for the shared context; token text is trimmed.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(logprobs, vec![Some(-1.2), Some(-0.4), Some(-2.5)]);
}

#[tokio::test]
async fn labels_outside_the_returned_alternatives_are_absent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "5" },
                "finish_reason": "length",
                "logprobs": {
                    "content": [{
                        "token": "5",
                        "logprob": -0.1,
                        "top_logprobs": [{ "token": "5", "logprob": -0.1 }]
                    }]
                }
            }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter_for(&server),
        JudgeModelId::openrouter("openai/gpt-4o-mini"),
        Arc::new(NoopUsageSink),
        GatewayConfig::default(),
    );

    let contexts: Vec<String> = vec!["rate this".into(); 2];
    let continuations: Vec<String> = vec!["4".into(), "5".into()];
    let logprobs = gateway
        .compute_log_probs(&contexts, &continuations)
        .await
        .unwrap();
    assert_eq!(logprobs, vec![None, Some(-0.1)]);
}

#[tokio::test]
async fn zipped_length_mismatch_is_rejected() {
    let server = MockServer::start().await;
    let gateway = ProviderGateway::with_config(
        adapter_for(&server),
        JudgeModelId::openrouter("openai/gpt-4o-mini"),
        Arc::new(NoopUsageSink),
        GatewayConfig::default(),
    );

    let err = gateway
        .compute_log_probs(&["a".to_string()], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::InvalidRequest { .. }));
}
