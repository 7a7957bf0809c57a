//! Durable record of interview sessions and their transcripts.
//!
//! Every operation takes a `&mut SqliteConnection`. Callers borrow one from the pool per
//! operation (or open a transaction) and give it back straight away, so a live interview
//! never pins a connection while it waits on the client.

use crate::model::{
    EvaluationStatus, InterviewMessage, InterviewSession, MessageType, NewMessage, SessionConfig,
    SessionStatus,
};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use std::str::FromStr;
use tracing::info;

/// Opens (creating if needed) the database at `url` and makes sure the schema exists.
pub async fn connect(url: &str, max_connections: u32) -> sqlx::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;
    info!("Database ready at {}", url);
    Ok(pool)
}

/// Creates the interview tables. Idempotent.
pub async fn init_schema(pool: &SqlitePool) -> sqlx::Result<()> {
    create_sessions_table(pool).await?;
    create_messages_table(pool).await?;
    Ok(())
}

async fn create_sessions_table(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS interview_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'ended')),
            started_at TEXT NOT NULL,
            ended_at TEXT,
            position TEXT NOT NULL,
            level TEXT NOT NULL,
            total_questions INTEGER NOT NULL CHECK (total_questions >= 1),
            interview_type TEXT NOT NULL,
            question_count INTEGER NOT NULL DEFAULT 0,
            current_question_index INTEGER NOT NULL DEFAULT 0,
            current_question_id INTEGER
                REFERENCES interview_messages(id) ON DELETE SET NULL,
            ai_score INTEGER CHECK (ai_score IS NULL OR (ai_score >= 0 AND ai_score <= 100)),
            ai_feedback TEXT,
            evaluation_status TEXT NOT NULL DEFAULT 'pending'
                CHECK (evaluation_status IN ('pending', 'processing', 'completed', 'failed')),
            CHECK (current_question_index <= total_questions)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_interview_sessions_user ON interview_sessions(user_id, started_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_messages_table(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS interview_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL
                REFERENCES interview_sessions(id) ON DELETE CASCADE,
            sender TEXT NOT NULL CHECK (sender IN ('ai', 'user')),
            role TEXT NOT NULL CHECK (role IN ('system', 'assistant', 'user')),
            content TEXT NOT NULL,
            message_type TEXT NOT NULL
                CHECK (message_type IN ('intro', 'question', 'answer', 'transcript', 'system', 'feedback')),
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_interview_messages_session ON interview_messages(session_id, id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Stateless repository over the two interview tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterviewRepository;

impl InterviewRepository {
    pub async fn create_session(
        &self,
        conn: &mut SqliteConnection,
        user_id: i64,
        config: &SessionConfig,
    ) -> sqlx::Result<InterviewSession> {
        let id = sqlx::query(
            r#"
            INSERT INTO interview_sessions
                (user_id, status, started_at, position, level, total_questions,
                 interview_type, question_count, current_question_index, evaluation_status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(user_id)
        .bind(SessionStatus::Active)
        .bind(Utc::now())
        .bind(&config.position)
        .bind(&config.level)
        .bind(config.total_questions)
        .bind(&config.interview_type)
        .bind(config.total_questions)
        .bind(EvaluationStatus::Pending)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        self.get_session(conn, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn get_session(
        &self,
        conn: &mut SqliteConnection,
        session_id: i64,
    ) -> sqlx::Result<Option<InterviewSession>> {
        sqlx::query_as::<_, InterviewSession>("SELECT * FROM interview_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(conn)
            .await
    }

    /// Fetches a session only if it belongs to `user_id`.
    pub async fn get_owned_session(
        &self,
        conn: &mut SqliteConnection,
        session_id: i64,
        user_id: i64,
    ) -> sqlx::Result<Option<InterviewSession>> {
        sqlx::query_as::<_, InterviewSession>(
            "SELECT * FROM interview_sessions WHERE id = ? AND user_id = ?",
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(conn)
        .await
    }

    /// Newest first.
    pub async fn list_sessions_for_user(
        &self,
        conn: &mut SqliteConnection,
        user_id: i64,
    ) -> sqlx::Result<Vec<InterviewSession>> {
        sqlx::query_as::<_, InterviewSession>(
            "SELECT * FROM interview_sessions WHERE user_id = ? ORDER BY started_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(conn)
        .await
    }

    /// Appends a message to an active session.
    ///
    /// Returns `None` without writing when the session has ended or does not exist. The
    /// status check and the insert are one statement, so a concurrent end cannot slip
    /// between them.
    pub async fn add_message(
        &self,
        conn: &mut SqliteConnection,
        session_id: i64,
        message: NewMessage,
    ) -> sqlx::Result<Option<InterviewMessage>> {
        sqlx::query_as::<_, InterviewMessage>(
            r#"
            INSERT INTO interview_messages (session_id, sender, role, content, message_type, created_at)
            SELECT id, ?, ?, ?, ?, ?
            FROM interview_sessions
            WHERE id = ? AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(message.sender)
        .bind(message.role)
        .bind(message.content)
        .bind(message.message_type)
        .bind(Utc::now())
        .bind(session_id)
        .fetch_optional(conn)
        .await
    }

    pub async fn get_message(
        &self,
        conn: &mut SqliteConnection,
        message_id: i64,
    ) -> sqlx::Result<Option<InterviewMessage>> {
        sqlx::query_as::<_, InterviewMessage>("SELECT * FROM interview_messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(conn)
            .await
    }

    /// Whether the candidate has already answered the question with id `question_id`.
    pub async fn has_answer_after(
        &self,
        conn: &mut SqliteConnection,
        session_id: i64,
        question_id: i64,
    ) -> sqlx::Result<bool> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM interview_messages
                WHERE session_id = ? AND message_type = ? AND id > ?
            )
            "#,
        )
        .bind(session_id)
        .bind(MessageType::Answer)
        .bind(question_id)
        .fetch_one(conn)
        .await
    }

    /// The full transcript in causal order. Row ids are assigned in insertion
    /// order, so they break ties between equal timestamps.
    pub async fn list_messages(
        &self,
        conn: &mut SqliteConnection,
        session_id: i64,
    ) -> sqlx::Result<Vec<InterviewMessage>> {
        sqlx::query_as::<_, InterviewMessage>(
            "SELECT * FROM interview_messages WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(conn)
        .await
    }

    pub async fn count_messages(
        &self,
        conn: &mut SqliteConnection,
        session_id: i64,
    ) -> sqlx::Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM interview_messages WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(conn)
            .await
    }

    pub async fn latest_message_of_type(
        &self,
        conn: &mut SqliteConnection,
        session_id: i64,
        message_type: MessageType,
    ) -> sqlx::Result<Option<InterviewMessage>> {
        sqlx::query_as::<_, InterviewMessage>(
            r#"
            SELECT * FROM interview_messages
            WHERE session_id = ? AND message_type = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(session_id)
        .bind(message_type)
        .fetch_optional(conn)
        .await
    }

    /// Moves the explicit current-question pointer and its 1-based index together.
    ///
    /// Returns `false` when the session is no longer active and nothing was updated.
    pub async fn set_current_question(
        &self,
        conn: &mut SqliteConnection,
        session_id: i64,
        question_index: i64,
        question_id: i64,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE interview_sessions
            SET current_question_index = ?, current_question_id = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(question_index)
        .bind(question_id)
        .bind(session_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Transitions an active session to `ended`.
    ///
    /// Returns `false` when the session was already ended (or does not exist), which
    /// lets callers schedule evaluation exactly once per terminal transition.
    pub async fn end_session(
        &self,
        conn: &mut SqliteConnection,
        session_id: i64,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE interview_sessions SET status = ?, ended_at = ? WHERE id = ? AND status = 'active'",
        )
        .bind(SessionStatus::Ended)
        .bind(Utc::now())
        .bind(session_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_evaluation_status(
        &self,
        conn: &mut SqliteConnection,
        session_id: i64,
        status: EvaluationStatus,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE interview_sessions SET evaluation_status = ? WHERE id = ?")
            .bind(status)
            .bind(session_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Writes only the evaluation columns.
    pub async fn save_evaluation(
        &self,
        conn: &mut SqliteConnection,
        session_id: i64,
        score: Option<i64>,
        feedback: &str,
        status: EvaluationStatus,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE interview_sessions
            SET ai_score = COALESCE(?, ai_score), ai_feedback = ?, evaluation_status = ?
            WHERE id = ?
            "#,
        )
        .bind(score)
        .bind(feedback)
        .bind(status)
        .bind(session_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Deletes a session and, through the cascade, its transcript.
    pub async fn delete_session(
        &self,
        conn: &mut SqliteConnection,
        session_id: i64,
        user_id: i64,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM interview_sessions WHERE id = ? AND user_id = ?")
            .bind(session_id)
            .bind(user_id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
