//! The websocket wire protocol: `{ "type": ..., "payload": { ... } }` in both directions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mime type assumed for recorded audio when the client does not say otherwise.
pub const DEFAULT_AUDIO_MIME: &str = "audio/webm";

/// Which text event an audio stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioMessageType {
    Intro,
    Question,
    Feedback,
    End,
}

/// Events the runtime sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    Intro {
        message: String,
    },
    Question {
        message: String,
        question_number: i64,
    },
    Feedback {
        message: String,
    },
    EndInterview {
        message: String,
        session_id: i64,
    },
    AudioChunk {
        chunk: String,
        message_type: AudioMessageType,
        index: usize,
    },
    AudioEnd {
        message_type: AudioMessageType,
        total_chunks: usize,
    },
    TranscriptFinal {
        text: String,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }
}

/// Events the client sends to the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    UserTextAnswer {
        message: String,
    },
    UserAudioChunk {
        chunk: Option<String>,
        is_first: bool,
        mime_type: Option<String>,
    },
    UserAudioEnd,
    ControlUpdate(Value),
    Hangup,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct TextAnswerPayload {
    message: String,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct AudioChunkPayload {
    chunk: Option<String>,
    is_first: bool,
    mime_type: Option<String>,
}

impl ClientEvent {
    /// Parses one inbound text frame.
    ///
    /// Returns `Ok(None)` for event types the runtime does not know about. A missing
    /// or `null` payload is treated as `{}`.
    pub fn parse(text: &str) -> Result<Option<Self>, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let payload = match envelope.payload {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        let event = match envelope.kind.as_str() {
            "USER_TEXT_ANSWER" => {
                let p: TextAnswerPayload = serde_json::from_value(payload)?;
                ClientEvent::UserTextAnswer { message: p.message }
            }
            "USER_AUDIO_CHUNK" => {
                let p: AudioChunkPayload = serde_json::from_value(payload)?;
                ClientEvent::UserAudioChunk {
                    chunk: p.chunk,
                    is_first: p.is_first,
                    mime_type: p.mime_type,
                }
            }
            "USER_AUDIO_END" => ClientEvent::UserAudioEnd,
            "CONTROL_UPDATE" => ClientEvent::ControlUpdate(payload),
            "HANGUP" => ClientEvent::Hangup,
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}
