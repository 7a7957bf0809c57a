use secrecy::{ExposeSecret, SecretString};

pub const DEEPGRAM_HTTP_BASE_URL: &str = "https://api.deepgram.com/v1";
pub const DEEPGRAM_WS_BASE_URL: &str = "wss://api.deepgram.com/v1";
pub const DEFAULT_STT_MODEL: &str = "nova-2";
pub const DEFAULT_TTS_VOICE: &str = "aura-2-odysseus-en";

pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Connection settings for the hosted speech provider.
#[derive(Clone)]
pub struct DeepgramConfig {
    http_base_url: String,
    ws_base_url: String,
    api_key: SecretString,
    stt_model: String,
    tts_voice: String,
}

pub struct DeepgramConfigBuilder {
    config: DeepgramConfig,
}

impl DeepgramConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DeepgramConfig::new(),
        }
    }

    pub fn with_http_base_url(mut self, base_url: &str) -> Self {
        self.config.http_base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_ws_base_url(mut self, base_url: &str) -> Self {
        self.config.ws_base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.config.api_key = SecretString::from(api_key.to_string());
        self
    }

    pub fn with_stt_model(mut self, model: &str) -> Self {
        self.config.stt_model = model.to_string();
        self
    }

    pub fn with_tts_voice(mut self, voice: &str) -> Self {
        self.config.tts_voice = voice.to_string();
        self
    }

    pub fn build(self) -> DeepgramConfig {
        self.config
    }
}

impl Default for DeepgramConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeepgramConfig {
    fn new() -> Self {
        Self {
            http_base_url: DEEPGRAM_HTTP_BASE_URL.to_string(),
            ws_base_url: DEEPGRAM_WS_BASE_URL.to_string(),
            api_key: SecretString::from(String::new()),
            stt_model: DEFAULT_STT_MODEL.to_string(),
            tts_voice: DEFAULT_TTS_VOICE.to_string(),
        }
    }

    pub fn builder() -> DeepgramConfigBuilder {
        DeepgramConfigBuilder::new()
    }

    pub fn http_base_url(&self) -> &str {
        &self.http_base_url
    }

    pub fn ws_base_url(&self) -> &str {
        &self.ws_base_url
    }

    pub fn api_key(&self) -> &SecretString {
        &self.api_key
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.expose_secret().trim().is_empty()
    }

    pub fn stt_model(&self) -> &str {
        &self.stt_model
    }

    pub fn tts_voice(&self) -> &str {
        &self.tts_voice
    }

    /// Value for the `Authorization` header.
    pub(crate) fn authorization(&self) -> String {
        format!("Token {}", self.api_key.expose_secret())
    }
}

/// Paths to the local binaries used when the hosted provider is unavailable.
#[derive(Debug, Clone)]
pub struct OfflineSpeechConfig {
    pub whisper_bin: String,
    pub whisper_model: String,
    pub ffmpeg_bin: String,
    pub espeak_bin: String,
}

impl Default for OfflineSpeechConfig {
    fn default() -> Self {
        Self {
            whisper_bin: "whisper-cli".to_string(),
            whisper_model: "models/ggml-base.en.bin".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
            espeak_bin: "espeak-ng".to_string(),
        }
    }
}
