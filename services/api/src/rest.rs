//! Session management over plain HTTP. The live interview itself runs over the
//! websocket in [`crate::ws`].

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use interview_core::InterviewRepository;
use interview_core::model::{
    EvaluationStatus, InterviewMessage, InterviewSession, MessageRole, MessageType, Sender,
    SessionConfig, SessionStatus,
};
use serde::Serialize;
use serde_json::json;

pub const MAX_TOTAL_QUESTIONS: i64 = 50;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: i64,
    pub status: SessionStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationView {
    pub status: EvaluationStatus,
    pub score: Option<i64>,
    pub feedback: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: i64,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub config: SessionConfig,
    pub current_question_index: i64,
    /// Present once the session has ended.
    pub evaluation: Option<EvaluationView>,
}

impl From<&InterviewSession> for SessionSummary {
    fn from(session: &InterviewSession) -> Self {
        let evaluation = (!session.is_active()).then(|| EvaluationView {
            status: session.evaluation_status,
            score: session.ai_score,
            feedback: session.ai_feedback.clone(),
        });
        Self {
            id: session.id,
            status: session.status,
            started_at: session.started_at,
            ended_at: session.ended_at,
            config: session.config(),
            current_question_index: session.current_question_index,
            evaluation,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: i64,
    pub sender: Sender,
    pub role: MessageRole,
    pub content: String,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
}

impl From<InterviewMessage> for MessageView {
    fn from(message: InterviewMessage) -> Self {
        Self {
            id: message.id,
            sender: message.sender,
            role: message.role,
            content: message.content,
            message_type: message.message_type,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub messages: Vec<MessageView>,
}

fn validate(config: &SessionConfig) -> ApiResult<()> {
    if !(1..=MAX_TOTAL_QUESTIONS).contains(&config.total_questions) {
        return Err(ApiError::BadRequest(format!(
            "totalQuestions must be between 1 and {}",
            MAX_TOTAL_QUESTIONS
        )));
    }
    for (field, value) in [
        ("position", &config.position),
        ("level", &config.level),
        ("type", &config.interview_type),
    ] {
        if value.trim().is_empty() {
            return Err(ApiError::BadRequest(format!("{} must not be empty", field)));
        }
    }
    Ok(())
}

fn not_found(session_id: i64) -> ApiError {
    ApiError::NotFound(format!("interview session {}", session_id))
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn create_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<SessionConfig>,
) -> ApiResult<(StatusCode, Json<CreatedSession>)> {
    validate(&request)?;
    let config = SessionConfig {
        position: request.position.trim().to_string(),
        level: request.level.trim().to_string(),
        total_questions: request.total_questions,
        interview_type: request.interview_type.trim().to_string(),
    };

    let mut conn = state.pool.acquire().await?;
    let session = InterviewRepository
        .create_session(&mut conn, user_id, &config)
        .await?;
    tracing::info!("Created interview session {} for user {}", session.id, user_id);

    Ok((
        StatusCode::CREATED,
        Json(CreatedSession {
            session_id: session.id,
            status: session.status,
        }),
    ))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    let mut conn = state.pool.acquire().await?;
    let sessions = InterviewRepository
        .list_sessions_for_user(&mut conn, user_id)
        .await?;
    Ok(Json(sessions.iter().map(SessionSummary::from).collect()))
}

async fn load_detail(
    state: &AppState,
    user_id: i64,
    session_id: i64,
    full_transcript: bool,
) -> ApiResult<SessionDetail> {
    let repo = InterviewRepository;
    let mut conn = state.pool.acquire().await?;
    let session = repo
        .get_owned_session(&mut conn, session_id, user_id)
        .await?
        .ok_or_else(|| not_found(session_id))?;

    // Prompts are withheld while the interview is still running.
    let hide_prompts = session.is_active() && !full_transcript;
    let messages = repo
        .list_messages(&mut conn, session_id)
        .await?
        .into_iter()
        .filter(|m| {
            !(hide_prompts && matches!(m.message_type, MessageType::Intro | MessageType::Question))
        })
        .map(MessageView::from)
        .collect();

    Ok(SessionDetail {
        summary: SessionSummary::from(&session),
        messages,
    })
}

pub async fn get_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(session_id): Path<i64>,
) -> ApiResult<Json<SessionDetail>> {
    Ok(Json(load_detail(&state, user_id, session_id, false).await?))
}

pub async fn get_history(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(session_id): Path<i64>,
) -> ApiResult<Json<SessionDetail>> {
    Ok(Json(load_detail(&state, user_id, session_id, true).await?))
}

/// Ends an active session. Repeating the call is a no-op.
pub async fn end_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(session_id): Path<i64>,
) -> ApiResult<StatusCode> {
    let repo = InterviewRepository;
    let mut conn = state.pool.acquire().await?;
    repo.get_owned_session(&mut conn, session_id, user_id)
        .await?
        .ok_or_else(|| not_found(session_id))?;

    if repo.end_session(&mut conn, session_id).await? {
        tracing::info!("Session {} ended over REST", session_id);
        state.services.evaluations.enqueue(session_id);
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(session_id): Path<i64>,
) -> ApiResult<StatusCode> {
    let mut conn = state.pool.acquire().await?;
    if InterviewRepository
        .delete_session(&mut conn, session_id, user_id)
        .await?
    {
        tracing::info!("Deleted session {}", session_id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(session_id))
    }
}
