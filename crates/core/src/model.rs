use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Who a message is attributed to in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Ai,
    User,
}

/// The chat role a message takes when it is replayed as model history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    Assistant,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Intro,
    Question,
    Answer,
    Transcript,
    System,
    Feedback,
}

/// Immutable configuration captured when a session is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub position: String,
    pub level: String,
    pub total_questions: i64,
    #[serde(rename = "type")]
    pub interview_type: String,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct InterviewSession {
    pub id: i64,
    pub user_id: i64,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub position: String,
    pub level: String,
    pub total_questions: i64,
    pub interview_type: String,
    pub question_count: i64,
    pub current_question_index: i64,
    pub current_question_id: Option<i64>,
    pub ai_score: Option<i64>,
    pub ai_feedback: Option<String>,
    pub evaluation_status: EvaluationStatus,
}

impl InterviewSession {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// True once the question currently on the table is the last one in the budget.
    pub fn on_last_question(&self) -> bool {
        self.current_question_index >= self.total_questions
    }

    pub fn config(&self) -> SessionConfig {
        SessionConfig {
            position: self.position.clone(),
            level: self.level.clone(),
            total_questions: self.total_questions,
            interview_type: self.interview_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct InterviewMessage {
    pub id: i64,
    pub session_id: i64,
    pub sender: Sender,
    pub role: MessageRole,
    pub content: String,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
}

/// A message that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: Sender,
    pub role: MessageRole,
    pub content: String,
    pub message_type: MessageType,
}

impl NewMessage {
    /// An assistant-authored message of the given type.
    pub fn ai(message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            sender: Sender::Ai,
            role: MessageRole::Assistant,
            content: content.into(),
            message_type,
        }
    }

    pub fn answer(content: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            role: MessageRole::User,
            content: content.into(),
            message_type: MessageType::Answer,
        }
    }
}
