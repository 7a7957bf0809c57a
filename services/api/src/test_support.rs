//! Shared fixtures for the handler tests: an on-disk database, canned model replies and
//! silent speech services.

use crate::auth::StaticTokens;
use crate::routes::router;
use crate::state::AppState;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use interview_core::llm::{ChatMessage, ChatModel, ResponseFormat};
use interview_core::speech::{AudioSink, SpeechToText, TextToSpeech};
use interview_core::{EvaluationQueue, InterviewServices, RuntimeSettings, store};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;

pub const TOKEN: &str = "candidate-token";
pub const OTHER_TOKEN: &str = "someone-else";

/// Replies with the given texts in order and fails once they run out.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedModel {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn chat(
        &self,
        _messages: Vec<ChatMessage>,
        _format: ResponseFormat,
        _timeout: Duration,
    ) -> Result<String> {
        self.replies
            .lock()
            .map_err(|_| anyhow!("script poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted reply left"))
    }
}

struct SilentSpeech;

#[async_trait]
impl SpeechToText for SilentSpeech {
    async fn transcribe(&self, _audio: &[u8], _mime: &str, _language: &str) -> Result<String> {
        Ok(String::new())
    }
}

#[async_trait]
impl TextToSpeech for SilentSpeech {
    async fn synthesize_streaming(&self, _text: &str, sink: &mut dyn AudioSink) -> Result<usize> {
        sink.on_complete(0).await?;
        Ok(0)
    }
}

pub struct TestApp {
    pub state: AppState,
    pub evaluations: mpsc::UnboundedReceiver<i64>,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_model(ScriptedModel::new(&[])).await
    }

    pub async fn with_model(model: ScriptedModel) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("api.db").display());
        let pool = store::connect(&url, 4).await.unwrap();
        let (queue, evaluations) = EvaluationQueue::channel();

        let services = InterviewServices {
            model: Arc::new(model),
            stt: Arc::new(SilentSpeech),
            tts: Arc::new(SilentSpeech),
            evaluations: queue,
            settings: RuntimeSettings::default(),
        };
        let identity = StaticTokens::new(HashMap::from([
            (TOKEN.to_string(), 1),
            (OTHER_TOKEN.to_string(), 2),
        ]));

        Self {
            state: AppState {
                pool,
                services,
                identity: Arc::new(identity),
            },
            evaluations,
            _dir: dir,
        }
    }

    pub async fn request(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Option<Value>) {
        let mut builder = Request::builder()
            .method(Method::from_bytes(method.as_bytes()).unwrap())
            .uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router(self.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = (!bytes.is_empty()).then(|| serde_json::from_slice(&bytes).unwrap());
        (status, json)
    }

    /// Creates a session owned by [`TOKEN`] and returns its id.
    pub async fn create_session(&self, total_questions: i64) -> i64 {
        let body = serde_json::json!({
            "position": "Backend Engineer",
            "level": "Mid",
            "totalQuestions": total_questions,
            "type": "technical"
        });
        let (status, created) = self
            .request("POST", "/api/v1/interview/sessions", Some(TOKEN), Some(body))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        created.unwrap()["sessionId"].as_i64().unwrap()
    }

    /// Serves the router on an ephemeral port for websocket tests.
    pub async fn serve(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(self.state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}
