use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use verdict_harness::gateway::{JudgeModel, Message, ProviderError, Role};
use verdict_harness::prompts::{PlaceholderTemplate, SystemMessage};
use verdict_harness::reward::{
    evaluate_reward_bench, JudgeError, LlmPairwiseJudge, RewardBenchInstance,
};

/// Judge that prefers the lexicographically larger answer, recording every
/// chat it sees.
struct LargerAnswerJudge {
    chats: Mutex<Vec<Vec<Message>>>,
}

impl LargerAnswerJudge {
    fn new() -> Self {
        Self {
            chats: Mutex::new(Vec::new()),
        }
    }

    fn verdict_for(user_turn: &str) -> String {
        // The template lays out "A: ..." and "B: ..." on their own lines.
        let answer = |tag: &str| {
            user_turn
                .lines()
                .find_map(|l| l.strip_prefix(tag))
                .unwrap_or_default()
                .to_string()
        };
        let a = answer("A: ");
        let b = answer("B: ");
        if a > b {
            "the better answer is [[A]]".to_string()
        } else {
            "the better answer is [[B]]".to_string()
        }
    }
}

#[async_trait]
impl JudgeModel for LargerAnswerJudge {
    async fn complete_text(&self, _: &[String]) -> Result<Vec<String>, ProviderError> {
        unreachable!("pairwise judging is chat-only")
    }

    async fn chat_response(&self, chats: &[Vec<Message>]) -> Result<Vec<String>, ProviderError> {
        self.chats.lock().unwrap().extend(chats.iter().cloned());
        Ok(chats
            .iter()
            .map(|chat| Self::verdict_for(&chat.last().unwrap().content))
            .collect())
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

fn template() -> Arc<PlaceholderTemplate> {
    Arc::new(PlaceholderTemplate::new(
        "Q: {prompt}\nA: {answer_a}\nB: {answer_b}\nAnswer [[A]] or [[B]].",
    ))
}

fn pair(prompt: &str, chosen: &str, rejected: &str) -> RewardBenchInstance {
    RewardBenchInstance {
        prompt: prompt.to_string(),
        chosen: chosen.to_string(),
        rejected: rejected.to_string(),
    }
}

#[tokio::test]
async fn accuracy_counts_pairs_where_chosen_wins_both_orders() {
    let judge_model = Arc::new(LargerAnswerJudge::new());
    let judge = LlmPairwiseJudge::new(judge_model.clone(), template());

    // The judge prefers the larger string, so chosen wins exactly when
    // chosen > rejected, in both presentation orders.
    let dataset = vec![
        pair("q0", "zebra", "apple"),
        pair("q1", "apple", "zebra"),
        pair("q2", "walrus", "badger"),
    ];

    let (report, judgments) = evaluate_reward_bench(
        &judge,
        &dataset,
        NonZeroUsize::new(2).unwrap(),
        None,
    )
    .await
    .unwrap();

    let flags: Vec<bool> = judgments.iter().map(|j| j.chosen_is_better).collect();
    assert_eq!(flags, vec![true, false, true]);
    assert!((report["accuracy"] - 2.0 / 3.0).abs() < 1e-12);

    // Both presentation orders were sent for every pair.
    assert_eq!(judge_model.chats.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn system_message_leads_every_presentation() {
    let judge_model = Arc::new(LargerAnswerJudge::new());
    let judge = LlmPairwiseJudge::new(judge_model.clone(), template())
        .system_message(SystemMessage::Literal("You are an impartial judge.".into()));

    let dataset = vec![pair("q", "b", "a")];
    evaluate_reward_bench(&judge, &dataset, NonZeroUsize::new(4).unwrap(), None)
        .await
        .unwrap();

    let chats = judge_model.chats.lock().unwrap();
    assert_eq!(chats.len(), 2);
    for chat in chats.iter() {
        assert_eq!(chat[0].role, Role::System);
        assert_eq!(chat[0].content, "You are an impartial judge.");
        assert_eq!(chat[1].role, Role::User);
    }
}

#[tokio::test]
async fn provider_faults_abort_the_run() {
    struct FailingJudge;

    #[async_trait]
    impl JudgeModel for FailingJudge {
        async fn complete_text(&self, _: &[String]) -> Result<Vec<String>, ProviderError> {
            unreachable!()
        }
        async fn chat_response(&self, _: &[Vec<Message>]) -> Result<Vec<String>, ProviderError> {
            Err(ProviderError::provider("openrouter", "boom", false))
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

    let judge = LlmPairwiseJudge::new(Arc::new(FailingJudge), template());
    let dataset = vec![pair("q", "b", "a")];
    let result =
        evaluate_reward_bench(&judge, &dataset, NonZeroUsize::new(1).unwrap(), None).await;
    assert!(matches!(result, Err(JudgeError::Provider(_))));
}
