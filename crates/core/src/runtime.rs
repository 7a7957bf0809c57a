//! The per-connection interview state machine.
//!
//! An [`InterviewRuntime`] is owned by the task serving one websocket. It talks to the
//! client only through an `mpsc` channel of [`ServerEvent`]s, so it never touches the
//! socket itself.

use crate::evaluation::EvaluationQueue;
use crate::events::{AudioMessageType, ClientEvent, DEFAULT_AUDIO_MIME, ServerEvent};
use crate::llm::{ChatMessage, ChatModel, ResponseFormat};
use crate::model::{InterviewMessage, InterviewSession, MessageType, NewMessage};
use crate::prompts;
use crate::speech::{AudioSink, SpeechToText, TextToSpeech};
use crate::store::InterviewRepository;
use crate::validator::{self, clean_question_text};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const HANGUP_MESSAGE: &str = "Interview ended by user.";
pub const ALREADY_ENDED_MESSAGE: &str = "This interview has already ended.";

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Timeout for every in-turn model call.
    pub llm_timeout: Duration,
    /// Language hint passed to speech-to-text.
    pub stt_language: String,
    /// Upper bound on one buffered utterance.
    pub max_audio_bytes: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            llm_timeout: Duration::from_secs(30),
            stt_language: "en".to_string(),
            max_audio_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Process-wide collaborators shared by every connection.
#[derive(Clone)]
pub struct InterviewServices {
    pub model: Arc<dyn ChatModel>,
    pub stt: Arc<dyn SpeechToText>,
    pub tts: Arc<dyn TextToSpeech>,
    pub evaluations: EvaluationQueue,
    pub settings: RuntimeSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimePhase {
    NotStarted,
    Introducing,
    AwaitingAnswer { question_number: i64 },
    Ended,
}

/// What the connection loop should do after an event has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

struct AudioBuffer {
    bytes: Vec<u8>,
    mime_type: String,
}

/// Forwards synthesized audio to the client as base64 `AUDIO_CHUNK`/`AUDIO_END` events.
struct EventAudioSink<'a> {
    events: &'a mpsc::Sender<ServerEvent>,
    message_type: AudioMessageType,
}

#[async_trait]
impl<'a> AudioSink for EventAudioSink<'a> {
    async fn on_chunk(&mut self, chunk: &[u8], index: usize) -> Result<()> {
        self.events
            .send(ServerEvent::AudioChunk {
                chunk: BASE64.encode(chunk),
                message_type: self.message_type,
                index,
            })
            .await
            .context("client channel closed")
    }

    async fn on_complete(&mut self, total_chunks: usize) -> Result<()> {
        self.events
            .send(ServerEvent::AudioEnd {
                message_type: self.message_type,
                total_chunks,
            })
            .await
            .context("client channel closed")
    }
}

pub struct InterviewRuntime {
    pool: SqlitePool,
    repo: InterviewRepository,
    session: InterviewSession,
    services: InterviewServices,
    events: mpsc::Sender<ServerEvent>,
    phase: RuntimePhase,
    audio: Option<AudioBuffer>,
}

impl InterviewRuntime {
    pub fn new(
        pool: SqlitePool,
        session: InterviewSession,
        services: InterviewServices,
        events: mpsc::Sender<ServerEvent>,
    ) -> Self {
        Self {
            pool,
            repo: InterviewRepository,
            session,
            services,
            events,
            phase: RuntimePhase::NotStarted,
            audio: None,
        }
    }

    pub fn phase(&self) -> RuntimePhase {
        self.phase
    }

    pub fn session(&self) -> &InterviewSession {
        &self.session
    }

    /// Dispatches one inbound event.
    pub async fn handle(&mut self, event: ClientEvent) -> Result<Flow> {
        match event {
            ClientEvent::UserTextAnswer { message } => self.handle_text_answer(&message).await?,
            ClientEvent::UserAudioChunk {
                chunk,
                is_first,
                mime_type,
            } => {
                self.handle_audio_chunk(chunk.as_deref(), is_first, mime_type.as_deref())
                    .await?
            }
            ClientEvent::UserAudioEnd => self.handle_audio_end().await?,
            ClientEvent::ControlUpdate(payload) => self.handle_control_update(&payload),
            ClientEvent::Hangup => {
                self.handle_hangup().await?;
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    /// Starts a fresh interview or resumes one that already has a transcript.
    ///
    /// Resuming never regenerates the introduction.
    pub async fn start(&mut self) -> Result<()> {
        self.refresh().await?;
        let existing = {
            let mut conn = self.conn().await?;
            self.repo.count_messages(&mut conn, self.session.id).await?
        };
        if existing > 0 {
            return self.resume(existing).await;
        }

        info!("Starting session {}", self.session.id);
        self.phase = RuntimePhase::Introducing;
        let config = self.session.config();

        let intro = self.chat(prompts::intro(&config)).await?;
        if self
            .persist(NewMessage::ai(MessageType::Intro, intro.clone()))
            .await?
            .is_none()
        {
            return self.ended_elsewhere().await;
        }
        self.emit_with_audio(
            ServerEvent::Intro {
                message: intro.clone(),
            },
            AudioMessageType::Intro,
            &intro,
        )
        .await?;

        let raw = self.chat(prompts::first_question(&config)).await?;
        let question = self.shaped_question(&raw, 1).await?;
        self.ask(question, 1).await
    }

    /// Re-sends the current question. If it was already answered (the turn failed before
    /// the next question was stored), the interview moves on instead.
    async fn resume(&mut self, existing: i64) -> Result<()> {
        let number = self.session.current_question_index;
        if !self.session.is_active() {
            self.phase = RuntimePhase::Ended;
            return Ok(());
        }
        info!(
            "Resuming session {} at question {} ({} messages)",
            self.session.id, number, existing
        );

        let Some(question) = self.current_question().await? else {
            // The intro went out but the first question never did.
            let raw = self
                .chat(prompts::first_question(&self.session.config()))
                .await?;
            let question = self.shaped_question(&raw, 1).await?;
            return self.ask(question, 1).await;
        };

        let answered = {
            let mut conn = self.conn().await?;
            self.repo
                .has_answer_after(&mut conn, self.session.id, question.id)
                .await?
        };
        if answered {
            info!(
                "Question {} of session {} is already answered; moving on",
                number, self.session.id
            );
            return self.advance().await;
        }

        self.phase = RuntimePhase::AwaitingAnswer {
            question_number: number,
        };
        self.emit_with_audio(
            ServerEvent::Question {
                message: question.content.clone(),
                question_number: number,
            },
            AudioMessageType::Question,
            &question.content,
        )
        .await
    }

    pub async fn handle_text_answer(&mut self, text: &str) -> Result<()> {
        let answer = text.trim();
        if answer.is_empty() {
            return Ok(());
        }

        // Fresh read: audio delivery may have interleaved with other writes.
        self.refresh().await?;
        if !self.session.is_active() {
            self.phase = RuntimePhase::Ended;
            self.send_error(ALREADY_ENDED_MESSAGE).await;
            return Ok(());
        }

        let question = self
            .current_question()
            .await?
            .map(|q| q.content)
            .unwrap_or_default();

        if self.persist(NewMessage::answer(answer)).await?.is_none() {
            return self.ended_elsewhere().await;
        }

        if !self.session.on_last_question() && !self.give_feedback(&question, answer).await? {
            return self.ended_elsewhere().await;
        }
        self.advance().await
    }

    pub async fn handle_audio_chunk(
        &mut self,
        chunk: Option<&str>,
        is_first: bool,
        mime_type: Option<&str>,
    ) -> Result<()> {
        let Some(chunk) = chunk else {
            return Ok(());
        };
        if is_first || self.audio.is_none() {
            self.audio = Some(AudioBuffer {
                bytes: Vec::new(),
                mime_type: mime_type.unwrap_or(DEFAULT_AUDIO_MIME).to_string(),
            });
        }

        let decoded = match BASE64.decode(chunk) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Dropping undecodable audio chunk: {}", e);
                self.send_error("Audio chunk is not valid base64.").await;
                return Ok(());
            }
        };

        let limit = self.services.settings.max_audio_bytes;
        if let Some(buffer) = self.audio.as_mut() {
            if buffer.bytes.len() + decoded.len() > limit {
                self.audio = None;
                self.send_error("Audio message is too large.").await;
                return Ok(());
            }
            buffer.bytes.extend_from_slice(&decoded);
        }
        Ok(())
    }

    /// Transcribes the buffered utterance and treats it as a typed answer.
    pub async fn handle_audio_end(&mut self) -> Result<()> {
        let Some(buffer) = self.audio.take() else {
            return Ok(());
        };
        if buffer.bytes.is_empty() {
            return Ok(());
        }

        debug!(
            "Transcribing {} bytes of {} for session {}",
            buffer.bytes.len(),
            buffer.mime_type,
            self.session.id
        );
        let text = self
            .services
            .stt
            .transcribe(
                &buffer.bytes,
                &buffer.mime_type,
                &self.services.settings.stt_language,
            )
            .await
            .context("transcription failed")?;

        self.emit(ServerEvent::TranscriptFinal { text: text.clone() })
            .await?;
        self.handle_text_answer(&text).await
    }

    pub fn handle_control_update(&mut self, payload: &serde_json::Value) {
        debug!("Control update for session {}: {}", self.session.id, payload);
    }

    /// Ends the interview at the user's request. The caller closes the connection afterwards.
    pub async fn handle_hangup(&mut self) -> Result<()> {
        self.refresh().await?;
        if self.session.is_active() {
            info!("Session {} ended by user", self.session.id);
            self.finish().await?;
        }
        self.phase = RuntimePhase::Ended;
        self.emit_with_audio(
            ServerEvent::EndInterview {
                message: HANGUP_MESSAGE.to_string(),
                session_id: self.session.id,
            },
            AudioMessageType::End,
            HANGUP_MESSAGE,
        )
        .await
    }

    /// The session stays active so the client can reconnect and resume.
    pub fn handle_disconnect(&mut self) {
        info!(
            "Client disconnected from session {} in phase {:?}",
            self.session.id, self.phase
        );
    }

    /// Best-effort `ERROR` event. A failure to deliver it is only logged.
    pub async fn send_error(&self, message: &str) {
        if let Err(e) = self.emit(ServerEvent::error(message)).await {
            debug!("could not deliver error event: {:#}", e);
        }
    }

    /// Stores and sends feedback on the current answer. Returns `false` if the session
    /// was ended elsewhere before the feedback could be stored.
    async fn give_feedback(&mut self, question: &str, answer: &str) -> Result<bool> {
        let number = self.session.current_question_index;
        let feedback = self
            .chat(prompts::feedback(&self.session.config(), number, question, answer))
            .await?;
        if self
            .persist(NewMessage::ai(MessageType::Feedback, feedback.clone()))
            .await?
            .is_none()
        {
            return Ok(false);
        }
        self.emit_with_audio(
            ServerEvent::Feedback {
                message: feedback.clone(),
            },
            AudioMessageType::Feedback,
            &feedback,
        )
        .await?;
        Ok(true)
    }

    /// Moves past the current question once its answer is stored: asks the next question,
    /// or closes the interview after the last one.
    async fn advance(&mut self) -> Result<()> {
        if self.session.on_last_question() {
            return self.close_interview().await;
        }

        let next = self.session.current_question_index + 1;
        let transcript = {
            let mut conn = self.conn().await?;
            self.repo.list_messages(&mut conn, self.session.id).await?
        };
        let raw = self
            .chat(prompts::next_question(&self.session.config(), next, &transcript))
            .await?;
        let question = self.shaped_question(&raw, next).await?;
        self.ask(question, next).await
    }

    async fn close_interview(&mut self) -> Result<()> {
        let config = self.session.config();
        let mut closing = self.chat(prompts::closing(&config)).await?;
        if let Err(violation) = validator::check_closing(&closing) {
            warn!(
                "Closing for session {} looked like a question ({:?}); retrying once",
                self.session.id, violation
            );
            closing = self.chat(prompts::strict_closing()).await?;
        }

        if self
            .persist(NewMessage::ai(MessageType::System, closing.clone()))
            .await?
            .is_none()
        {
            return self.ended_elsewhere().await;
        }
        self.finish().await?;

        self.emit_with_audio(
            ServerEvent::EndInterview {
                message: closing.clone(),
                session_id: self.session.id,
            },
            AudioMessageType::End,
            &closing,
        )
        .await
    }

    /// Persists `question` as question number `number`, moves the current-question
    /// pointer to it and sends it to the client.
    ///
    /// The insert and the pointer move share one transaction, so a session ended
    /// elsewhere gets neither.
    async fn ask(&mut self, question: String, number: i64) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin transaction")?;
        let message = self
            .repo
            .add_message(
                &mut *tx,
                self.session.id,
                NewMessage::ai(MessageType::Question, question.clone()),
            )
            .await?;
        let stored = match message {
            Some(message) => {
                self.repo
                    .set_current_question(&mut *tx, self.session.id, number, message.id)
                    .await?
            }
            None => false,
        };
        if !stored {
            tx.rollback().await?;
            return self.ended_elsewhere().await;
        }
        tx.commit().await?;

        self.refresh().await?;
        self.phase = RuntimePhase::AwaitingAnswer {
            question_number: number,
        };

        self.emit_with_audio(
            ServerEvent::Question {
                message: question.clone(),
                question_number: number,
            },
            AudioMessageType::Question,
            &question,
        )
        .await
    }

    /// Cleans a generated question and, if it still does not look like one, asks
    /// again once with a stricter prompt. The retry is used as-is.
    async fn shaped_question(&self, raw: &str, number: i64) -> Result<String> {
        let cleaned = clean_question_text(raw);
        match validator::check_question(&cleaned) {
            Ok(()) => Ok(cleaned),
            Err(violation) => {
                warn!(
                    "Question {} for session {} rejected ({:?}); retrying once",
                    number, self.session.id, violation
                );
                let strict_raw = self
                    .chat(prompts::strict_question(&self.session.config(), number))
                    .await?;
                let strict = clean_question_text(&strict_raw);
                Ok(if strict.is_empty() {
                    strict_raw.trim().to_string()
                } else {
                    strict
                })
            }
        }
    }

    /// Marks the session ended and schedules evaluation if this call made the transition.
    async fn finish(&mut self) -> Result<()> {
        let transitioned = {
            let mut conn = self.conn().await?;
            self.repo.end_session(&mut conn, self.session.id).await?
        };
        if transitioned {
            self.services.evaluations.enqueue(self.session.id);
        }
        self.phase = RuntimePhase::Ended;
        self.refresh().await
    }

    /// Another party (the REST end endpoint, say) ended the session while this turn was
    /// in flight. Nothing more is written for it.
    async fn ended_elsewhere(&mut self) -> Result<()> {
        warn!(
            "Session {} was ended elsewhere mid-turn; dropping the rest of the turn",
            self.session.id
        );
        self.phase = RuntimePhase::Ended;
        self.refresh().await?;
        self.send_error(ALREADY_ENDED_MESSAGE).await;
        Ok(())
    }

    /// Appends a message. `None` means the session is no longer active and nothing was written.
    async fn persist(&self, message: NewMessage) -> Result<Option<InterviewMessage>> {
        let mut conn = self.conn().await?;
        Ok(self
            .repo
            .add_message(&mut conn, self.session.id, message)
            .await?)
    }

    /// Resolves the authoritative current question through the explicit pointer,
    /// falling back to the latest question only when the pointer is unset or dangling.
    async fn current_question(&self) -> Result<Option<InterviewMessage>> {
        let mut conn = self.conn().await?;
        if let Some(id) = self.session.current_question_id {
            if let Some(message) = self.repo.get_message(&mut conn, id).await? {
                if message.session_id == self.session.id {
                    return Ok(Some(message));
                }
            }
        }
        Ok(self
            .repo
            .latest_message_of_type(&mut conn, self.session.id, MessageType::Question)
            .await?)
    }

    async fn refresh(&mut self) -> Result<()> {
        let id = self.session.id;
        let mut conn = self.conn().await?;
        self.session = self
            .repo
            .get_session(&mut conn, id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session {} no longer exists", id))?;
        Ok(())
    }

    /// Borrows a pool connection for a single operation. Nothing holds one across an
    /// await on the client or a vendor.
    async fn conn(&self) -> Result<PoolConnection<Sqlite>> {
        self.pool.acquire().await.context("acquire connection")
    }

    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String> {
        self.services
            .model
            .chat(
                messages,
                ResponseFormat::Text,
                self.services.settings.llm_timeout,
            )
            .await
    }

    async fn emit(&self, event: ServerEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .context("client channel closed")
    }

    /// Sends the text event right away, then streams its audio. Speech failures are
    /// logged and never fail the turn.
    async fn emit_with_audio(
        &self,
        event: ServerEvent,
        message_type: AudioMessageType,
        text: &str,
    ) -> Result<()> {
        self.emit(event).await?;

        let mut sink = EventAudioSink {
            events: &self.events,
            message_type,
        };
        match self.services.tts.synthesize_streaming(text, &mut sink).await {
            Ok(total) => debug!("Streamed {} {:?} audio chunks", total, message_type),
            Err(e) => warn!("Audio for {:?} was not delivered: {:#}", message_type, e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockChatModel;
    use crate::model::{EvaluationStatus, SessionStatus};
    use crate::speech::MockSpeechToText;
    use crate::store::tests::{config, test_pool};
    use sqlx::SqlitePool;
    use std::collections::VecDeque;
    use std::sync::{Mutex, OnceLock};
    use tempfile::TempDir;

    /// Emits the text as two fixed chunks.
    struct TwoChunkSpeech;

    #[async_trait]
    impl TextToSpeech for TwoChunkSpeech {
        async fn synthesize_streaming(&self, text: &str, sink: &mut dyn AudioSink) -> Result<usize> {
            let bytes = text.as_bytes();
            let mid = bytes.len() / 2;
            sink.on_chunk(&bytes[..mid], 0).await?;
            sink.on_chunk(&bytes[mid..], 1).await?;
            sink.on_complete(2).await?;
            Ok(2)
        }
    }

    struct BrokenSpeech;

    #[async_trait]
    impl TextToSpeech for BrokenSpeech {
        async fn synthesize_streaming(&self, _text: &str, _sink: &mut dyn AudioSink) -> Result<usize> {
            Err(anyhow::anyhow!("speech vendor down"))
        }
    }

    /// A model that replays scripted replies in order and records every prompt.
    fn scripted_model(replies: &[&str]) -> (MockChatModel, Arc<Mutex<Vec<Vec<ChatMessage>>>>) {
        let queue = Arc::new(Mutex::new(
            replies.iter().map(|r| r.to_string()).collect::<VecDeque<_>>(),
        ));
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let recorded = prompts.clone();
        let mut model = MockChatModel::new();
        model.expect_chat().returning(move |messages, format, _| {
            assert_eq!(format, ResponseFormat::Text);
            recorded.lock().unwrap().push(messages);
            queue
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("model called more times than scripted"))
        });
        (model, prompts)
    }

    /// Replays scripted replies. On call number `end_on_call` it first ends the session
    /// through the store, the way the REST end endpoint does mid-turn.
    struct EndsSessionOnCall {
        replies: Mutex<VecDeque<String>>,
        calls: Mutex<usize>,
        end_on_call: usize,
        target: Arc<OnceLock<(SqlitePool, i64)>>,
    }

    impl EndsSessionOnCall {
        fn new(replies: &[&str], end_on_call: usize) -> (Self, Arc<OnceLock<(SqlitePool, i64)>>) {
            let target = Arc::new(OnceLock::new());
            let model = Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                calls: Mutex::new(0),
                end_on_call,
                target: target.clone(),
            };
            (model, target)
        }
    }

    #[async_trait]
    impl ChatModel for EndsSessionOnCall {
        async fn chat(
            &self,
            _messages: Vec<ChatMessage>,
            _format: ResponseFormat,
            _timeout: Duration,
        ) -> Result<String> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call == self.end_on_call {
                let (pool, session_id) = self.target.get().expect("session target set");
                let mut conn = pool.acquire().await?;
                InterviewRepository.end_session(&mut conn, *session_id).await?;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("model called more times than scripted"))
        }
    }

    struct Harness {
        runtime: InterviewRuntime,
        events: mpsc::Receiver<ServerEvent>,
        evaluations: mpsc::UnboundedReceiver<i64>,
        pool: SqlitePool,
        _dir: TempDir,
    }

    impl Harness {
        async fn new(total_questions: i64, model: MockChatModel) -> Self {
            Self::with(
                total_questions,
                Arc::new(model),
                MockSpeechToText::new(),
                Arc::new(TwoChunkSpeech),
            )
            .await
        }

        async fn with(
            total_questions: i64,
            model: Arc<dyn ChatModel>,
            stt: MockSpeechToText,
            tts: Arc<dyn TextToSpeech>,
        ) -> Self {
            let (pool, dir) = test_pool().await;
            let mut conn = pool.acquire().await.unwrap();
            let session = InterviewRepository
                .create_session(&mut conn, 1, &config(total_questions))
                .await
                .unwrap();
            drop(conn);
            let (queue, evaluations) = EvaluationQueue::channel();
            let services = InterviewServices {
                model,
                stt: Arc::new(stt),
                tts,
                evaluations: queue,
                settings: RuntimeSettings::default(),
            };
            let (tx, events) = mpsc::channel(256);
            Self {
                runtime: InterviewRuntime::new(pool.clone(), session, services, tx),
                events,
                evaluations,
                pool,
                _dir: dir,
            }
        }

        /// Drains queued events, dropping the audio frames.
        fn text_events(&mut self) -> Vec<ServerEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if !matches!(event, ServerEvent::AudioChunk { .. } | ServerEvent::AudioEnd { .. }) {
                    out.push(event);
                }
            }
            out
        }

        async fn messages(&self) -> Vec<InterviewMessage> {
            let mut conn = self.pool.acquire().await.unwrap();
            InterviewRepository
                .list_messages(&mut conn, self.runtime.session().id)
                .await
                .unwrap()
        }

        async fn session(&self) -> InterviewSession {
            let mut conn = self.pool.acquire().await.unwrap();
            InterviewRepository
                .get_session(&mut conn, self.runtime.session().id)
                .await
                .unwrap()
                .unwrap()
        }
    }

    fn count(messages: &[InterviewMessage], message_type: MessageType) -> usize {
        messages.iter().filter(|m| m.message_type == message_type).count()
    }

    #[tokio::test]
    async fn test_two_question_interview_runs_to_completion() {
        // --- Arrange ---
        let (model, _) = scripted_model(&[
            "Hi, I'm your interviewer. We'll cover two questions.",
            "What drew you to backend engineering?",
            "Thanks, that is a clear motivation.",
            "How do you approach debugging a production outage?",
            "Thank you for your time. The interview is complete and your results will be processed soon.",
        ]);
        let mut h = Harness::new(2, model).await;

        // --- Act ---
        h.runtime.start().await.unwrap();
        let started = h.text_events();
        h.runtime
            .handle_text_answer("I have 3 years of experience")
            .await
            .unwrap();
        let middle = h.text_events();
        h.runtime.handle_text_answer("I read the logs first").await.unwrap();
        let finished = h.text_events();

        // --- Assert ---
        assert_eq!(
            started,
            vec![
                ServerEvent::Intro {
                    message: "Hi, I'm your interviewer. We'll cover two questions.".to_string()
                },
                ServerEvent::Question {
                    message: "What drew you to backend engineering?".to_string(),
                    question_number: 1
                },
            ]
        );
        assert_eq!(
            middle,
            vec![
                ServerEvent::Feedback {
                    message: "Thanks, that is a clear motivation.".to_string()
                },
                ServerEvent::Question {
                    message: "How do you approach debugging a production outage?".to_string(),
                    question_number: 2
                },
            ]
        );
        let session_id = h.runtime.session().id;
        assert_eq!(
            finished,
            vec![ServerEvent::EndInterview {
                message: "Thank you for your time. The interview is complete and your results will be processed soon.".to_string(),
                session_id,
            }]
        );

        let session = h.session().await;
        assert_eq!(session.status, SessionStatus::Ended);
        assert!(session.ended_at.is_some());
        assert_eq!(session.current_question_index, 2);
        assert_eq!(session.evaluation_status, EvaluationStatus::Pending);
        assert_eq!(h.runtime.phase(), RuntimePhase::Ended);

        let messages = h.messages().await;
        assert_eq!(count(&messages, MessageType::Intro), 1);
        assert_eq!(count(&messages, MessageType::Question), 2);
        assert_eq!(count(&messages, MessageType::Answer), 2);
        assert_eq!(count(&messages, MessageType::Feedback), 1);
        assert_eq!(count(&messages, MessageType::System), 1);

        assert_eq!(h.evaluations.try_recv().ok(), Some(session_id));
        assert!(h.evaluations.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_feedback_prompt_uses_current_question_and_answer() {
        let (model, prompts) = scripted_model(&[
            "Welcome.",
            "What is ownership in Rust?",
            "Good explanation of moves.",
            "How does borrowing differ from ownership?",
        ]);
        let mut h = Harness::new(3, model).await;
        h.runtime.start().await.unwrap();

        h.runtime.handle_text_answer("Values have one owner").await.unwrap();

        let prompts = prompts.lock().unwrap();
        let feedback_turn = &prompts[2][1].content;
        assert!(feedback_turn.contains("Interview question: What is ownership in Rust?"));
        assert!(feedback_turn.contains("Candidate's answer: Values have one owner"));
        let next_prompt = &prompts[3];
        assert!(next_prompt[0].content.contains("Next question number: 2."));
        assert!(next_prompt.iter().all(|m| m.content != "Good explanation of moves."));
        assert!(next_prompt.iter().all(|m| m.content != "Welcome."));
    }

    #[tokio::test]
    async fn test_resume_resends_current_question_without_new_intro() {
        let (model, _) = scripted_model(&["Welcome.", "What is a closure?"]);
        let mut h = Harness::new(2, model).await;
        h.runtime.start().await.unwrap();
        h.text_events();

        // A reconnect builds a new runtime over the same session; any model call would fail.
        let session = h.session().await;
        let mut model = MockChatModel::new();
        model.expect_chat().never();
        let (tx, mut rx) = mpsc::channel(64);
        let services = InterviewServices {
            model: Arc::new(model),
            stt: Arc::new(MockSpeechToText::new()),
            tts: Arc::new(TwoChunkSpeech),
            evaluations: EvaluationQueue::channel().0,
            settings: RuntimeSettings::default(),
        };
        let mut resumed = InterviewRuntime::new(h.pool.clone(), session, services, tx);

        resumed.start().await.unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(
            first,
            ServerEvent::Question {
                message: "What is a closure?".to_string(),
                question_number: 1
            }
        );
        assert_eq!(
            resumed.phase(),
            RuntimePhase::AwaitingAnswer { question_number: 1 }
        );
        assert_eq!(count(&h.messages().await, MessageType::Intro), 1);
    }

    #[tokio::test]
    async fn test_resume_after_intro_only_asks_first_question() {
        let (model, prompts) = scripted_model(&["What is an enum?"]);
        let mut h = Harness::new(2, model).await;
        let mut conn = h.pool.acquire().await.unwrap();
        InterviewRepository
            .add_message(
                &mut conn,
                h.runtime.session().id,
                NewMessage::ai(MessageType::Intro, "Welcome."),
            )
            .await
            .unwrap();

        h.runtime.start().await.unwrap();

        assert_eq!(
            h.text_events(),
            vec![ServerEvent::Question {
                message: "What is an enum?".to_string(),
                question_number: 1
            }]
        );
        assert_eq!(prompts.lock().unwrap().len(), 1);
        assert_eq!(h.session().await.current_question_index, 1);
        assert_eq!(count(&h.messages().await, MessageType::Intro), 1);
    }

    #[tokio::test]
    async fn test_feedback_shaped_question_is_retried_exactly_once() {
        let (model, prompts) = scripted_model(&[
            "Welcome.",
            "What is a trait?",
            "Nice answer.",
            "Great job explaining traits, keep up the good work.",
            "Still not a question",
        ]);
        let mut h = Harness::new(3, model).await;
        h.runtime.start().await.unwrap();
        h.text_events();

        h.runtime.handle_text_answer("Shared behaviour").await.unwrap();

        let events = h.text_events();
        assert_eq!(
            events.last(),
            Some(&ServerEvent::Question {
                message: "Still not a question".to_string(),
                question_number: 2
            })
        );
        let prompts = prompts.lock().unwrap();
        assert_eq!(prompts.len(), 5);
        assert!(prompts[4][0].content.contains("single sentence that ends with '?'"));
    }

    #[tokio::test]
    async fn test_question_like_closing_is_replaced() {
        let (model, _) = scripted_model(&[
            "Welcome.",
            "What is async in Rust?",
            "Any questions for me?",
            "Thank you and goodbye.",
        ]);
        let mut h = Harness::new(1, model).await;
        h.runtime.start().await.unwrap();
        h.text_events();

        h.runtime.handle_text_answer("Futures and executors").await.unwrap();

        let session_id = h.runtime.session().id;
        assert_eq!(
            h.text_events(),
            vec![ServerEvent::EndInterview {
                message: "Thank you and goodbye.".to_string(),
                session_id
            }]
        );
        let messages = h.messages().await;
        assert_eq!(messages.last().unwrap().message_type, MessageType::System);
        assert_eq!(messages.last().unwrap().content, "Thank you and goodbye.");
    }

    #[tokio::test]
    async fn test_hangup_mid_interview_ends_and_schedules_evaluation() {
        let (model, _) = scripted_model(&[
            "Welcome.",
            "What is a lifetime?",
            "Clear.",
            "What is a smart pointer?",
        ]);
        let mut h = Harness::new(2, model).await;
        h.runtime.start().await.unwrap();
        h.runtime.handle_text_answer("A scope for references").await.unwrap();
        h.text_events();

        let flow = h.runtime.handle(ClientEvent::Hangup).await.unwrap();

        assert_eq!(flow, Flow::Close);
        let session_id = h.runtime.session().id;
        assert_eq!(
            h.text_events(),
            vec![ServerEvent::EndInterview {
                message: HANGUP_MESSAGE.to_string(),
                session_id
            }]
        );
        assert_eq!(h.session().await.status, SessionStatus::Ended);
        assert_eq!(h.evaluations.try_recv().ok(), Some(session_id));

        // A second hangup does not schedule evaluation again.
        h.runtime.handle_hangup().await.unwrap();
        assert!(h.evaluations.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_answer_after_end_is_rejected_without_writes() {
        let (model, _) = scripted_model(&["Welcome.", "What is a crate?"]);
        let mut h = Harness::new(2, model).await;
        h.runtime.start().await.unwrap();
        h.runtime.handle_hangup().await.unwrap();
        h.text_events();
        let before = h.messages().await.len();

        h.runtime.handle_text_answer("Too late").await.unwrap();

        assert_eq!(
            h.text_events(),
            vec![ServerEvent::error(ALREADY_ENDED_MESSAGE)]
        );
        assert_eq!(h.messages().await.len(), before);
    }

    #[tokio::test]
    async fn test_audio_answer_matches_text_answer_after_transcript() {
        let (model, _) = scripted_model(&[
            "Welcome.",
            "What is a slice?",
            "Good.",
            "What is a vector?",
        ]);
        let mut stt = MockSpeechToText::new();
        stt.expect_transcribe()
            .withf(|audio, mime, language| {
                audio == &[1u8, 2, 3, 4][..] && mime == "audio/wav" && language == "en"
            })
            .times(1)
            .returning(|_, _, _| Ok("A view into a sequence".to_string()));
        let mut h = Harness::with(2, Arc::new(model), stt, Arc::new(TwoChunkSpeech)).await;
        h.runtime.start().await.unwrap();
        h.text_events();

        h.runtime
            .handle(ClientEvent::UserAudioChunk {
                chunk: Some(BASE64.encode([1u8, 2])),
                is_first: true,
                mime_type: Some("audio/wav".to_string()),
            })
            .await
            .unwrap();
        h.runtime
            .handle(ClientEvent::UserAudioChunk {
                chunk: Some(BASE64.encode([3u8, 4])),
                is_first: false,
                mime_type: None,
            })
            .await
            .unwrap();
        h.runtime.handle(ClientEvent::UserAudioEnd).await.unwrap();

        assert_eq!(
            h.text_events(),
            vec![
                ServerEvent::TranscriptFinal {
                    text: "A view into a sequence".to_string()
                },
                ServerEvent::Feedback {
                    message: "Good.".to_string()
                },
                ServerEvent::Question {
                    message: "What is a vector?".to_string(),
                    question_number: 2
                },
            ]
        );
        let messages = h.messages().await;
        let answer = messages
            .iter()
            .find(|m| m.message_type == MessageType::Answer)
            .unwrap();
        assert_eq!(answer.content, "A view into a sequence");

        // Buffer is cleared; a second end is a no-op.
        h.runtime.handle_audio_end().await.unwrap();
        assert!(h.text_events().is_empty());
    }

    #[tokio::test]
    async fn test_audio_is_streamed_after_text_and_tts_failure_is_tolerated() {
        let (model, _) = scripted_model(&["Welcome aboard.", "What is Cargo?"]);
        let mut h = Harness::new(2, model).await;
        h.runtime.start().await.unwrap();

        let intro_frames: Vec<_> = std::iter::from_fn(|| h.events.try_recv().ok())
            .take(4)
            .collect();
        assert!(matches!(intro_frames[0], ServerEvent::Intro { .. }));
        assert!(matches!(
            intro_frames[1],
            ServerEvent::AudioChunk { message_type: AudioMessageType::Intro, index: 0, .. }
        ));
        assert!(matches!(
            intro_frames[3],
            ServerEvent::AudioEnd { message_type: AudioMessageType::Intro, total_chunks: 2 }
        ));

        let (model, _) = scripted_model(&["Welcome.", "What is rustup?"]);
        let mut broken = Harness::with(
            2,
            Arc::new(model),
            MockSpeechToText::new(),
            Arc::new(BrokenSpeech),
        )
        .await;
        broken.runtime.start().await.unwrap();
        assert_eq!(broken.text_events().len(), 2);
    }

    #[tokio::test]
    async fn test_blank_answer_is_ignored() {
        let (model, _) = scripted_model(&["Welcome.", "What is a module?"]);
        let mut h = Harness::new(2, model).await;
        h.runtime.start().await.unwrap();
        h.text_events();

        h.runtime.handle_text_answer("   ").await.unwrap();

        assert!(h.text_events().is_empty());
        assert_eq!(count(&h.messages().await, MessageType::Answer), 0);
    }

    #[tokio::test]
    async fn test_end_during_feedback_stops_the_turn() {
        // --- Arrange ---
        let (model, target) = EndsSessionOnCall::new(
            &["Welcome.", "What is X?", "Good point.", "What is Y?"],
            3,
        );
        let mut h = Harness::with(
            3,
            Arc::new(model),
            MockSpeechToText::new(),
            Arc::new(TwoChunkSpeech),
        )
        .await;
        assert!(target.set((h.pool.clone(), h.runtime.session().id)).is_ok());
        h.runtime.start().await.unwrap();
        h.text_events();

        // --- Act ---
        h.runtime.handle_text_answer("X is a thing").await.unwrap();

        // --- Assert ---
        assert_eq!(
            h.text_events(),
            vec![ServerEvent::error(ALREADY_ENDED_MESSAGE)]
        );
        assert_eq!(h.runtime.phase(), RuntimePhase::Ended);
        let session = h.session().await;
        assert_eq!(session.status, SessionStatus::Ended);
        assert_eq!(session.current_question_index, 1);
        let messages = h.messages().await;
        assert_eq!(messages.last().unwrap().message_type, MessageType::Answer);
        assert_eq!(count(&messages, MessageType::Question), 1);
        assert_eq!(count(&messages, MessageType::Feedback), 0);
        // Whoever ended the session owns its evaluation.
        assert!(h.evaluations.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_end_during_next_question_writes_no_question() {
        let (model, target) = EndsSessionOnCall::new(
            &["Welcome.", "What is X?", "Good point.", "What is Y?"],
            4,
        );
        let mut h = Harness::with(
            3,
            Arc::new(model),
            MockSpeechToText::new(),
            Arc::new(TwoChunkSpeech),
        )
        .await;
        assert!(target.set((h.pool.clone(), h.runtime.session().id)).is_ok());
        h.runtime.start().await.unwrap();
        h.text_events();

        h.runtime.handle_text_answer("X is a thing").await.unwrap();

        assert_eq!(
            h.text_events(),
            vec![
                ServerEvent::Feedback {
                    message: "Good point.".to_string()
                },
                ServerEvent::error(ALREADY_ENDED_MESSAGE),
            ]
        );
        assert_eq!(h.runtime.phase(), RuntimePhase::Ended);
        let session = h.session().await;
        assert_eq!(session.current_question_index, 1);
        let messages = h.messages().await;
        assert_eq!(count(&messages, MessageType::Question), 1);
        assert_eq!(messages.last().unwrap().message_type, MessageType::Feedback);
    }

    #[tokio::test]
    async fn test_resume_after_failed_next_question_moves_on() {
        // --- Arrange ---
        // The model runs dry after the feedback, so the next question is never stored.
        let (model, _) = scripted_model(&["Welcome.", "What is X?", "Good."]);
        let mut h = Harness::new(2, model).await;
        h.runtime.start().await.unwrap();
        assert!(h.runtime.handle_text_answer("X is a thing").await.is_err());
        assert_eq!(h.session().await.current_question_index, 1);

        let (model, _) = scripted_model(&["What is Y?"]);
        let (tx, mut rx) = mpsc::channel(64);
        let services = InterviewServices {
            model: Arc::new(model),
            stt: Arc::new(MockSpeechToText::new()),
            tts: Arc::new(TwoChunkSpeech),
            evaluations: EvaluationQueue::channel().0,
            settings: RuntimeSettings::default(),
        };
        let mut resumed = InterviewRuntime::new(h.pool.clone(), h.session().await, services, tx);

        // --- Act ---
        resumed.start().await.unwrap();

        // --- Assert ---
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::Question {
                message: "What is Y?".to_string(),
                question_number: 2
            }
        );
        assert_eq!(
            resumed.phase(),
            RuntimePhase::AwaitingAnswer { question_number: 2 }
        );
        assert_eq!(h.session().await.current_question_index, 2);
        let messages = h.messages().await;
        assert_eq!(count(&messages, MessageType::Intro), 1);
        assert_eq!(count(&messages, MessageType::Question), 2);
        assert_eq!(count(&messages, MessageType::Answer), 1);
        assert_eq!(
            crate::evaluation::pair_questions_with_answers(&messages).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_live_runtime_leaves_the_pool_free_for_evaluation() {
        // --- Arrange ---
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("single.db").display());
        let pool = crate::store::connect(&url, 1).await.unwrap();
        let session = {
            let mut conn = pool.acquire().await.unwrap();
            InterviewRepository
                .create_session(&mut conn, 1, &config(1))
                .await
                .unwrap()
        };
        let (model, _) = scripted_model(&[
            "Welcome.",
            "What is a trait object?",
            "Thank you, that concludes our interview today.",
        ]);
        let (queue, mut scheduled) = EvaluationQueue::channel();
        let services = InterviewServices {
            model: Arc::new(model),
            stt: Arc::new(MockSpeechToText::new()),
            tts: Arc::new(TwoChunkSpeech),
            evaluations: queue,
            settings: RuntimeSettings::default(),
        };
        let (tx, _events) = mpsc::channel(64);
        let mut runtime = InterviewRuntime::new(pool.clone(), session, services, tx);
        runtime.start().await.unwrap();
        runtime
            .handle_text_answer("A vtable behind a pointer")
            .await
            .unwrap();
        let session_id = scheduled.try_recv().unwrap();

        let mut judge = MockChatModel::new();
        judge
            .expect_chat()
            .returning(|_, _, _| Ok(r#"{"score": 80, "feedback": "Clear."}"#.to_string()));
        let worker =
            crate::evaluation::EvaluationWorker::new(pool.clone(), Arc::new(judge), Duration::from_secs(5));

        // --- Act ---
        // The runtime is still alive, as it is while the socket stays open.
        tokio::time::timeout(Duration::from_secs(5), worker.run(session_id))
            .await
            .expect("evaluation should not wait on the live connection");

        // --- Assert ---
        let mut conn = pool.acquire().await.unwrap();
        let stored = InterviewRepository
            .get_session(&mut conn, session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.evaluation_status, EvaluationStatus::Completed);
        assert_eq!(stored.ai_score, Some(80));
        drop(runtime);
    }
}
