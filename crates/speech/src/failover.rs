//! Primary/fallback wiring for the speech capabilities.
//!
//! Every call goes to the hosted provider until a billing failure is seen. From then on
//! the shared [`FallbackSwitch`] stays tripped for the life of the process and all
//! calls, STT and TTS alike, go straight to the offline implementations. Other failures
//! fall back for that one call only.

use crate::credit::is_credit_failure;
use anyhow::Result;
use async_trait::async_trait;
use interview_core::speech::{AudioSink, SpeechToText, TextToSpeech};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Default)]
pub struct FallbackSwitch(Arc<AtomicBool>);

impl FallbackSwitch {
    pub fn new(tripped: bool) -> Self {
        Self(Arc::new(AtomicBool::new(tripped)))
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn trip(&self) {
        if !self.0.swap(true, Ordering::SeqCst) {
            tracing::warn!("speech provider out of credit, using offline speech from now on");
        }
    }

    fn record(&self, capability: &str, error: &anyhow::Error) {
        if is_credit_failure(error) {
            self.trip();
        } else {
            tracing::warn!("{} provider failed, falling back for this call: {:#}", capability, error);
        }
    }
}

pub struct FailoverSpeechToText {
    primary: Arc<dyn SpeechToText>,
    fallback: Arc<dyn SpeechToText>,
    switch: FallbackSwitch,
}

impl FailoverSpeechToText {
    pub fn new(
        primary: Arc<dyn SpeechToText>,
        fallback: Arc<dyn SpeechToText>,
        switch: FallbackSwitch,
    ) -> Self {
        Self {
            primary,
            fallback,
            switch,
        }
    }
}

#[async_trait]
impl SpeechToText for FailoverSpeechToText {
    async fn transcribe(&self, audio: &[u8], mime_type: &str, language: &str) -> Result<String> {
        if !self.switch.is_tripped() {
            match self.primary.transcribe(audio, mime_type, language).await {
                Ok(transcript) => return Ok(transcript),
                Err(e) => self.switch.record("stt", &e),
            }
        }
        self.fallback.transcribe(audio, mime_type, language).await
    }
}

/// Counts chunks that reach the real sink so a half-delivered stream is never replayed.
struct CountingSink<'a> {
    inner: &'a mut dyn AudioSink,
    delivered: usize,
}

#[async_trait]
impl<'a> AudioSink for CountingSink<'a> {
    async fn on_chunk(&mut self, chunk: &[u8], index: usize) -> Result<()> {
        self.inner.on_chunk(chunk, index).await?;
        self.delivered += 1;
        Ok(())
    }

    async fn on_complete(&mut self, total_chunks: usize) -> Result<()> {
        self.inner.on_complete(total_chunks).await
    }
}

pub struct FailoverTextToSpeech {
    primary: Arc<dyn TextToSpeech>,
    fallback: Arc<dyn TextToSpeech>,
    switch: FallbackSwitch,
}

impl FailoverTextToSpeech {
    pub fn new(
        primary: Arc<dyn TextToSpeech>,
        fallback: Arc<dyn TextToSpeech>,
        switch: FallbackSwitch,
    ) -> Self {
        Self {
            primary,
            fallback,
            switch,
        }
    }
}

#[async_trait]
impl TextToSpeech for FailoverTextToSpeech {
    async fn synthesize_streaming(&self, text: &str, sink: &mut dyn AudioSink) -> Result<usize> {
        if !self.switch.is_tripped() {
            let mut counting = CountingSink {
                inner: sink,
                delivered: 0,
            };
            let result = self.primary.synthesize_streaming(text, &mut counting).await;
            let delivered = counting.delivered;
            match result {
                Ok(chunks) => return Ok(chunks),
                Err(e) => {
                    self.switch.record("tts", &e);
                    if delivered > 0 {
                        return Err(e.context("speech stream failed part-way"));
                    }
                }
            }
        }
        self.fallback.synthesize_streaming(text, sink).await
    }
}
