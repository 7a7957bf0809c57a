//! Post-interview scoring.
//!
//! Evaluation is handed off through [`EvaluationQueue`] and borrows its own pool
//! connections, so it outlives the websocket that triggered it.

use crate::llm::{ChatModel, ResponseFormat};
use crate::model::{EvaluationStatus, InterviewMessage, MessageType};
use crate::prompts::{self, QaPair};
use crate::store::InterviewRepository;
use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::mpsc;

pub const NO_ANSWERS_FEEDBACK: &str = "No questions and answers were recorded in this interview.";
pub const DEFAULT_SCORE: i64 = 50;

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced json pattern")
});
static SCORE_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""score"\s*:\s*(\d+)"#).expect("score pattern"));
static FEEDBACK_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)"feedback"\s*:\s*"(.*?)"(?:,|\})"#).expect("feedback pattern")
});

/// Pairs each question with the answer that follows it. A question with no answer
/// before the next question (or the end) is dropped.
pub fn pair_questions_with_answers(messages: &[InterviewMessage]) -> Vec<QaPair> {
    let mut pairs = Vec::new();
    let mut pending: Option<&str> = None;
    for message in messages {
        match message.message_type {
            MessageType::Question => pending = Some(message.content.as_str()),
            MessageType::Answer => {
                if let Some(question) = pending.take() {
                    pairs.push(QaPair {
                        question: question.to_string(),
                        answer: message.content.clone(),
                    });
                }
            }
            _ => {}
        }
    }
    pairs
}

fn score_from(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn from_json_object(text: &str) -> Option<(i64, String)> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    let object = value.as_object()?;
    let score = object.get("score").map(score_from).unwrap_or(0);
    let feedback = match object.get("feedback") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    Some((score, feedback))
}

/// Extracts `(score, feedback)` from a model reply, trying strict JSON, then a fenced
/// JSON block, then field-by-field pattern matching. The score is clamped to 0..=100.
pub fn parse_evaluation(response: &str) -> (i64, String) {
    let fenced = || {
        FENCED_JSON
            .captures(response)
            .and_then(|caps| caps.get(1))
            .and_then(|block| from_json_object(block.as_str()))
    };

    let (score, feedback) = from_json_object(response)
        .or_else(fenced)
        .unwrap_or_else(|| {
            let score = SCORE_FIELD
                .captures(response)
                .and_then(|caps| caps[1].parse().ok())
                .unwrap_or(DEFAULT_SCORE);
            let feedback = FEEDBACK_FIELD
                .captures(response)
                .map(|caps| caps[1].to_string())
                .unwrap_or_else(|| response.to_string());
            (score, feedback)
        });

    (score.clamp(0, 100), feedback)
}

pub struct EvaluationWorker {
    pool: SqlitePool,
    model: Arc<dyn ChatModel>,
    timeout: Duration,
    repo: InterviewRepository,
}

impl EvaluationWorker {
    pub fn new(pool: SqlitePool, model: Arc<dyn ChatModel>, timeout: Duration) -> Self {
        Self {
            pool,
            model,
            timeout,
            repo: InterviewRepository,
        }
    }

    /// Scores one session. Never fails; problems end up as `evaluation_status = failed`.
    pub async fn run(&self, session_id: i64) {
        match self.evaluate(session_id).await {
            Ok(score) => tracing::info!("Evaluation completed for session {}: score={}", session_id, score),
            Err(e) => {
                tracing::error!("Evaluation failed for session {}: {:#}", session_id, e);
                if let Err(e) = self.record_failure(session_id, &e).await {
                    tracing::error!(
                        "could not record evaluation failure for session {}: {:#}",
                        session_id,
                        e
                    );
                }
            }
        }
    }

    async fn evaluate(&self, session_id: i64) -> Result<i64> {
        let (session, messages) = {
            let mut conn = self.pool.acquire().await.context("acquire connection")?;
            self.repo
                .set_evaluation_status(&mut conn, session_id, EvaluationStatus::Processing)
                .await?;
            let session = self
                .repo
                .get_session(&mut conn, session_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("session {} not found", session_id))?;
            let messages = self.repo.list_messages(&mut conn, session_id).await?;
            (session, messages)
        };

        let pairs = pair_questions_with_answers(&messages);
        let (score, feedback) = if pairs.is_empty() {
            tracing::warn!("No Q&A pairs found for session {}", session_id);
            (0, NO_ANSWERS_FEEDBACK.to_string())
        } else {
            tracing::debug!("Evaluating session {} with {} Q&A pairs", session_id, pairs.len());
            // No connection is held while the model works.
            let response = self
                .model
                .chat(
                    prompts::evaluation(&session.config(), &pairs),
                    ResponseFormat::JsonObject,
                    self.timeout,
                )
                .await?;
            parse_evaluation(&response)
        };

        let mut conn = self.pool.acquire().await.context("acquire connection")?;
        self.repo
            .save_evaluation(
                &mut conn,
                session_id,
                Some(score),
                &feedback,
                EvaluationStatus::Completed,
            )
            .await?;
        Ok(score)
    }

    async fn record_failure(&self, session_id: i64, error: &anyhow::Error) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        self.repo
            .save_evaluation(
                &mut conn,
                session_id,
                None,
                &format!("Evaluation failed: {error:#}"),
                EvaluationStatus::Failed,
            )
            .await?;
        Ok(())
    }
}

/// Hand-off point between live connections and the evaluation worker.
#[derive(Clone)]
pub struct EvaluationQueue {
    tx: mpsc::UnboundedSender<i64>,
}

impl EvaluationQueue {
    /// A queue whose receiving end is driven by the caller.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<i64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Starts a dispatcher that runs every queued session on its own detached task.
    pub fn spawn(worker: Arc<EvaluationWorker>) -> Self {
        let (queue, mut rx) = Self::channel();
        tokio::spawn(async move {
            while let Some(session_id) = rx.recv().await {
                let worker = worker.clone();
                tokio::spawn(async move {
                    worker.run(session_id).await;
                });
            }
            tracing::debug!("evaluation dispatcher stopped");
        });
        queue
    }

    pub fn enqueue(&self, session_id: i64) {
        if self.tx.send(session_id).is_err() {
            tracing::error!(
                "evaluation dispatcher is gone; session {} will not be scored",
                session_id
            );
        } else {
            tracing::info!("Evaluation scheduled for session {}", session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockChatModel;
    use crate::model::NewMessage;
    use crate::store::tests::{config, test_pool};

    async fn session_with(pool: &SqlitePool, messages: Vec<NewMessage>) -> i64 {
        let repo = InterviewRepository;
        let mut conn = pool.acquire().await.unwrap();
        let session = repo.create_session(&mut conn, 1, &config(2)).await.unwrap();
        for message in messages {
            repo.add_message(&mut conn, session.id, message).await.unwrap();
        }
        repo.end_session(&mut conn, session.id).await.unwrap();
        session.id
    }

    #[test]
    fn test_pairing_drops_unanswered_questions() {
        let now = chrono::Utc::now();
        let msg = |id, message_type, content: &str| InterviewMessage {
            id,
            session_id: 1,
            sender: crate::model::Sender::Ai,
            role: crate::model::MessageRole::Assistant,
            content: content.to_string(),
            message_type,
            created_at: now,
        };
        let messages = vec![
            msg(1, MessageType::Intro, "Hello"),
            msg(2, MessageType::Question, "Q1?"),
            msg(3, MessageType::Answer, "A1"),
            msg(4, MessageType::Feedback, "Good"),
            msg(5, MessageType::Question, "Q2?"),
        ];

        let pairs = pair_questions_with_answers(&messages);

        assert_eq!(
            pairs,
            vec![QaPair {
                question: "Q1?".to_string(),
                answer: "A1".to_string()
            }]
        );
    }

    #[test]
    fn test_parse_plain_json() {
        assert_eq!(
            parse_evaluation(r#"{"score": 87, "feedback": "Clear and structured."}"#),
            (87, "Clear and structured.".to_string())
        );
    }

    #[test]
    fn test_parse_fenced_json_and_clamp() {
        let response = "Here you go:\n```json\n{\"score\": 140, \"feedback\": \"Excellent.\"}\n```";
        assert_eq!(parse_evaluation(response), (100, "Excellent.".to_string()));
    }

    #[test]
    fn test_parse_falls_back_to_field_patterns() {
        let response = r#"Result -> "score": 72, "feedback": "Decent depth", trailing"#;
        assert_eq!(parse_evaluation(response), (72, "Decent depth".to_string()));

        let unrecoverable = "I cannot score this.";
        assert_eq!(
            parse_evaluation(unrecoverable),
            (DEFAULT_SCORE, unrecoverable.to_string())
        );
    }

    #[tokio::test]
    async fn test_zero_pairs_completes_without_model_call() {
        // --- Arrange ---
        let (pool, _dir) = test_pool().await;
        let session_id = session_with(
            &pool,
            vec![
                NewMessage::ai(MessageType::Intro, "Welcome"),
                NewMessage::ai(MessageType::Question, "Q1?"),
            ],
        )
        .await;
        let mut model = MockChatModel::new();
        model.expect_chat().never();
        let worker = EvaluationWorker::new(pool.clone(), Arc::new(model), Duration::from_secs(60));

        // --- Act ---
        worker.run(session_id).await;

        // --- Assert ---
        let mut conn = pool.acquire().await.unwrap();
        let session = InterviewRepository
            .get_session(&mut conn, session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.ai_score, Some(0));
        assert_eq!(session.ai_feedback.as_deref(), Some(NO_ANSWERS_FEEDBACK));
        assert_eq!(session.evaluation_status, EvaluationStatus::Completed);
    }

    #[tokio::test]
    async fn test_scored_session_uses_json_mode_and_timeout() {
        let (pool, _dir) = test_pool().await;
        let session_id = session_with(
            &pool,
            vec![
                NewMessage::ai(MessageType::Question, "Q1?"),
                NewMessage::answer("A1"),
            ],
        )
        .await;
        let mut model = MockChatModel::new();
        model
            .expect_chat()
            .withf(|messages, format, timeout| {
                *format == ResponseFormat::JsonObject
                    && *timeout == Duration::from_secs(60)
                    && messages[1].content.contains("Question 1: Q1?\nAnswer: A1")
            })
            .times(1)
            .returning(|_, _, _| Ok(r#"{"score": 87, "feedback": "Strong answers."}"#.to_string()));
        let worker = EvaluationWorker::new(pool.clone(), Arc::new(model), Duration::from_secs(60));

        worker.run(session_id).await;

        let mut conn = pool.acquire().await.unwrap();
        let session = InterviewRepository
            .get_session(&mut conn, session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.ai_score, Some(87));
        assert_eq!(session.ai_feedback.as_deref(), Some("Strong answers."));
        assert_eq!(session.evaluation_status, EvaluationStatus::Completed);
    }

    #[tokio::test]
    async fn test_model_failure_marks_evaluation_failed() {
        let (pool, _dir) = test_pool().await;
        let session_id = session_with(
            &pool,
            vec![
                NewMessage::ai(MessageType::Question, "Q1?"),
                NewMessage::answer("A1"),
            ],
        )
        .await;
        let mut model = MockChatModel::new();
        model
            .expect_chat()
            .returning(|_, _, _| Err(anyhow::anyhow!("upstream timed out")));
        let worker = EvaluationWorker::new(pool.clone(), Arc::new(model), Duration::from_secs(60));

        worker.run(session_id).await;

        let mut conn = pool.acquire().await.unwrap();
        let session = InterviewRepository
            .get_session(&mut conn, session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.evaluation_status, EvaluationStatus::Failed);
        assert!(session.ai_score.is_none());
        assert_eq!(
            session.ai_feedback.as_deref(),
            Some("Evaluation failed: upstream timed out")
        );
    }

    #[tokio::test]
    async fn test_queue_hands_off_session_ids() {
        let (queue, mut rx) = EvaluationQueue::channel();
        queue.enqueue(4);
        queue.clone().enqueue(5);
        assert_eq!(rx.recv().await, Some(4));
        assert_eq!(rx.recv().await, Some(5));
    }
}
