//! Speech capabilities the runtime depends on. Vendor and offline implementations
//! live in the `interview-speech` crate.

use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribes one complete utterance.
    async fn transcribe(&self, audio: &[u8], mime_type: &str, language: &str) -> Result<String>;
}

/// Receives synthesized audio as it is produced.
#[async_trait]
pub trait AudioSink: Send {
    async fn on_chunk(&mut self, chunk: &[u8], index: usize) -> Result<()>;

    /// Called once after the last chunk, before the producer releases its stream.
    async fn on_complete(&mut self, total_chunks: usize) -> Result<()>;
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Streams `text` as audio into `sink` and returns the number of chunks delivered.
    async fn synthesize_streaming(&self, text: &str, sink: &mut dyn AudioSink) -> Result<usize>;
}
