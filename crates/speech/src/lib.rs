pub mod audio;
pub mod config;
pub mod credit;
pub mod error;
pub mod failover;
mod process;
pub mod stt;
pub mod tts;

pub use config::{DeepgramConfig, OfflineSpeechConfig};
pub use error::SpeechError;
pub use failover::{FailoverSpeechToText, FailoverTextToSpeech, FallbackSwitch};

use interview_core::speech::{SpeechToText, TextToSpeech};
use std::sync::Arc;

/// Builds the STT and TTS services with the hosted provider as primary. Without an API
/// key the shared switch starts tripped and every call goes offline.
pub fn speech_services(
    deepgram: DeepgramConfig,
    offline: OfflineSpeechConfig,
) -> (Arc<dyn SpeechToText>, Arc<dyn TextToSpeech>) {
    let switch = FallbackSwitch::new(!deepgram.has_api_key());
    if switch.is_tripped() {
        tracing::info!("no deepgram key configured, using offline speech");
    }

    let stt = FailoverSpeechToText::new(
        Arc::new(stt::DeepgramStt::new(deepgram.clone())),
        Arc::new(stt::WhisperCliStt::new(offline.clone())),
        switch.clone(),
    );
    let tts = FailoverTextToSpeech::new(
        Arc::new(tts::DeepgramTts::new(deepgram)),
        Arc::new(tts::EspeakTts::new(offline)),
        switch,
    );
    (Arc::new(stt), Arc::new(tts))
}
