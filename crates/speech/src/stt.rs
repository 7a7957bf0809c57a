use crate::audio::{self, STT_SAMPLE_RATE};
use crate::config::{AUTHORIZATION_HEADER, DeepgramConfig, OfflineSpeechConfig};
use crate::error::SpeechError;
use crate::process::run_program;
use anyhow::Result;
use async_trait::async_trait;
use interview_core::speech::SpeechToText;
use serde::Deserialize;
use std::ffi::OsStr;
use std::path::Path;

const PROVIDER: &str = "deepgram";

#[derive(Debug, Default, Deserialize)]
struct ListenResponse {
    #[serde(default)]
    results: ListenResults,
}

#[derive(Debug, Default, Deserialize)]
struct ListenResults {
    #[serde(default)]
    channels: Vec<ListenChannel>,
}

#[derive(Debug, Deserialize)]
struct ListenChannel {
    #[serde(default)]
    alternatives: Vec<ListenAlternative>,
}

#[derive(Debug, Deserialize)]
struct ListenAlternative {
    #[serde(default)]
    transcript: String,
}

impl ListenResponse {
    fn transcript(self) -> String {
        self.results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next())
            .map(|a| a.transcript.trim().to_string())
            .unwrap_or_default()
    }
}

/// Prerecorded transcription against the hosted provider.
pub struct DeepgramStt {
    client: reqwest::Client,
    config: DeepgramConfig,
}

impl DeepgramStt {
    pub fn new(config: DeepgramConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn listen_url(&self, language: &str) -> String {
        format!(
            "{}/listen?model={}&smart_format=true&punctuate=true&diarize=false&language={}",
            self.config.http_base_url(),
            self.config.stt_model(),
            language
        )
    }
}

#[async_trait]
impl SpeechToText for DeepgramStt {
    async fn transcribe(&self, audio: &[u8], mime_type: &str, language: &str) -> Result<String> {
        if !self.config.has_api_key() {
            return Err(SpeechError::NotConfigured(PROVIDER).into());
        }

        let response = self
            .client
            .post(self.listen_url(language))
            .header(AUTHORIZATION_HEADER, self.config.authorization())
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(audio.to_vec())
            .send()
            .await
            .map_err(|source| SpeechError::Http {
                provider: PROVIDER,
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SpeechError::Status {
                provider: PROVIDER,
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let parsed: ListenResponse = response.json().await.map_err(|source| SpeechError::Http {
            provider: PROVIDER,
            source,
        })?;
        let transcript = parsed.transcript();
        tracing::debug!("deepgram transcript ({} chars)", transcript.len());
        Ok(transcript)
    }
}

/// Offline transcription through a local whisper.cpp binary.
pub struct WhisperCliStt {
    config: OfflineSpeechConfig,
}

impl WhisperCliStt {
    pub fn new(config: OfflineSpeechConfig) -> Self {
        Self { config }
    }

    /// Writes `audio` as a 16 kHz mono WAV at `target`. Containers symphonia cannot read
    /// (webm/opus from browsers) are handed to ffmpeg.
    async fn write_whisper_wav(&self, audio: &[u8], mime_type: &str, target: &Path) -> Result<()> {
        let owned = audio.to_vec();
        let mime = mime_type.to_string();
        let decoded = tokio::task::spawn_blocking(move || -> crate::error::Result<Vec<u8>> {
            let (samples, rate) = audio::decode_to_mono(&owned, &mime)?;
            let samples = audio::resample(&samples, rate, STT_SAMPLE_RATE)?;
            audio::encode_wav(&samples, STT_SAMPLE_RATE)
        })
        .await?;

        match decoded {
            Ok(wav) => {
                tokio::fs::write(target, wav).await?;
                Ok(())
            }
            Err(SpeechError::Decode(reason)) => {
                tracing::debug!("native decode failed ({}), converting with ffmpeg", reason);
                self.convert_with_ffmpeg(audio, target).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn convert_with_ffmpeg(&self, audio: &[u8], target: &Path) -> Result<()> {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let input = dir.join("input.audio");
        tokio::fs::write(&input, audio).await?;

        let rate = STT_SAMPLE_RATE.to_string();
        let args: [&OsStr; 13] = [
            OsStr::new("-hide_banner"),
            OsStr::new("-loglevel"),
            OsStr::new("error"),
            OsStr::new("-y"),
            OsStr::new("-i"),
            input.as_os_str(),
            OsStr::new("-ar"),
            OsStr::new(&rate),
            OsStr::new("-ac"),
            OsStr::new("1"),
            OsStr::new("-c:a"),
            OsStr::new("pcm_s16le"),
            target.as_os_str(),
        ];
        run_program(&self.config.ffmpeg_bin, args).await?;
        Ok(())
    }
}

/// Joins whisper's per-segment lines into a single transcript.
fn clean_whisper_output(stdout: &str) -> String {
    stdout.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl SpeechToText for WhisperCliStt {
    async fn transcribe(&self, audio: &[u8], mime_type: &str, language: &str) -> Result<String> {
        let dir = tempfile::tempdir()?;
        let wav_path = dir.path().join("utterance.wav");
        self.write_whisper_wav(audio, mime_type, &wav_path).await?;

        let args: [&OsStr; 8] = [
            OsStr::new("-m"),
            OsStr::new(&self.config.whisper_model),
            OsStr::new("-f"),
            wav_path.as_os_str(),
            OsStr::new("-l"),
            OsStr::new(language),
            OsStr::new("-nt"),
            OsStr::new("-np"),
        ];
        let output = run_program(&self.config.whisper_bin, args).await?;

        let transcript = clean_whisper_output(&String::from_utf8_lossy(&output.stdout));
        tracing::debug!("whisper transcript ({} chars)", transcript.len());
        Ok(transcript)
    }
}
