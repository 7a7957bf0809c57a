use crate::audio::{self, PSEUDO_STREAM_CHUNK_BYTES, TTS_SAMPLE_RATE, ToBinary};
use crate::config::{AUTHORIZATION_HEADER, DeepgramConfig, OfflineSpeechConfig};
use crate::error::SpeechError;
use crate::process::run_program;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use interview_core::speech::{AudioSink, TextToSpeech};
use serde::Serialize;
use std::ffi::OsStr;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;

const PROVIDER: &str = "deepgram";

/// Longest wait for the next frame on the speak stream before the call is abandoned.
pub const SPEAK_FRAME_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum SpeakCommand<'a> {
    Speak { text: &'a str },
    Flush,
    Close,
}

impl SpeakCommand<'_> {
    fn to_message(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

/// Streaming synthesis over the provider's speak websocket. Audio arrives as linear16
/// at 24 kHz and is forwarded to the sink frame by frame.
pub struct DeepgramTts {
    config: DeepgramConfig,
    frame_timeout: Duration,
}

impl DeepgramTts {
    pub fn new(config: DeepgramConfig) -> Self {
        Self {
            config,
            frame_timeout: SPEAK_FRAME_TIMEOUT,
        }
    }

    pub fn with_frame_timeout(mut self, frame_timeout: Duration) -> Self {
        self.frame_timeout = frame_timeout;
        self
    }

    fn speak_url(&self) -> String {
        format!(
            "{}/speak?model={}&encoding=linear16&sample_rate={}",
            self.config.ws_base_url(),
            self.config.tts_voice(),
            TTS_SAMPLE_RATE
        )
    }

    fn build_request(&self) -> Result<Request> {
        let mut request = self.speak_url().into_client_request()?;
        let token = HeaderValue::from_str(&self.config.authorization())
            .map_err(|e| tokio_tungstenite::tungstenite::Error::HttpFormat(e.into()))?;
        request.headers_mut().insert(AUTHORIZATION_HEADER, token);
        Ok(request)
    }
}

#[async_trait]
impl TextToSpeech for DeepgramTts {
    async fn synthesize_streaming(&self, text: &str, sink: &mut dyn AudioSink) -> Result<usize> {
        if !self.config.has_api_key() {
            return Err(SpeechError::NotConfigured(PROVIDER).into());
        }

        let request = self.build_request()?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(SpeechError::from)?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(SpeakCommand::Speak { text }.to_message()?)
            .await
            .map_err(SpeechError::from)?;
        write
            .send(SpeakCommand::Flush.to_message()?)
            .await
            .map_err(SpeechError::from)?;

        let mut chunks = 0usize;
        let mut completed = false;
        loop {
            let Some(message) = tokio::time::timeout(self.frame_timeout, read.next())
                .await
                .map_err(|_| SpeechError::Vendor {
                    provider: PROVIDER,
                    message: format!(
                        "no speak frame within {:?} after {} chunks",
                        self.frame_timeout, chunks
                    ),
                })?
            else {
                break;
            };
            match message.map_err(SpeechError::from)? {
                Message::Binary(bytes) => {
                    sink.on_chunk(&bytes, chunks).await?;
                    chunks += 1;
                }
                Message::Text(text) => {
                    let json: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
                    match json.get("type").and_then(|v| v.as_str()) {
                        Some("Flushed") => {
                            sink.on_complete(chunks).await?;
                            completed = true;
                            break;
                        }
                        Some("Warning") => {
                            tracing::warn!("deepgram warning: {}", text);
                        }
                        Some("Error") => {
                            let message = json
                                .get("description")
                                .or_else(|| json.get("err_msg"))
                                .and_then(|v| v.as_str())
                                .unwrap_or(&text)
                                .to_string();
                            return Err(SpeechError::Vendor {
                                provider: PROVIDER,
                                message,
                            }
                            .into());
                        }
                        other => {
                            tracing::debug!("deepgram event: {}", other.unwrap_or("unknown"));
                        }
                    }
                }
                Message::Close(reason) => {
                    tracing::debug!("deepgram closed the speak stream: {:?}", reason);
                    break;
                }
                _ => {}
            }
        }

        if !completed {
            if chunks == 0 {
                return Err(SpeechError::Vendor {
                    provider: PROVIDER,
                    message: "speak stream closed before any audio".to_string(),
                }
                .into());
            }
            if let Err(e) = sink.on_complete(chunks).await {
                tracing::warn!("failed to finish audio after early close: {:#}", e);
            }
        }

        if let Ok(close) = SpeakCommand::Close.to_message() {
            if let Err(e) = write.send(close).await {
                tracing::debug!("failed to send close: {}", e);
            }
        }
        let _ = write.close().await;

        Ok(chunks)
    }
}

/// Local synthesis through espeak-ng, replayed in fixed-size chunks so clients see the
/// same framing as the hosted stream.
pub struct EspeakTts {
    config: OfflineSpeechConfig,
}

impl EspeakTts {
    pub fn new(config: OfflineSpeechConfig) -> Self {
        Self { config }
    }

    async fn render(&self, text: &str) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let text_path = dir.path().join("utterance.txt");
        let wav_path = dir.path().join("utterance.wav");
        tokio::fs::write(&text_path, text).await?;

        let args: [&OsStr; 4] = [
            OsStr::new("-w"),
            wav_path.as_os_str(),
            OsStr::new("-f"),
            text_path.as_os_str(),
        ];
        run_program(&self.config.espeak_bin, args).await?;

        let wav = tokio::fs::read(&wav_path).await?;
        let pcm = tokio::task::spawn_blocking(move || -> crate::error::Result<Vec<u8>> {
            let (samples, rate) = audio::read_wav(&wav)?;
            let samples = audio::resample(&samples, rate, TTS_SAMPLE_RATE)?;
            Ok(samples.as_slice().to_binary())
        })
        .await??;
        Ok(pcm)
    }
}

#[async_trait]
impl TextToSpeech for EspeakTts {
    async fn synthesize_streaming(&self, text: &str, sink: &mut dyn AudioSink) -> Result<usize> {
        let pcm = self.render(text).await?;

        let mut chunks = 0usize;
        for chunk in pcm.chunks(PSEUDO_STREAM_CHUNK_BYTES) {
            sink.on_chunk(chunk, chunks).await?;
            chunks += 1;
        }
        sink.on_complete(chunks).await?;
        Ok(chunks)
    }
}
