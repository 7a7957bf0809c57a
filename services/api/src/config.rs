use secrecy::SecretString;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub openrouter_api_key: SecretString,
    pub openrouter_model: String,
    pub openrouter_base_url: String,
    pub llm_timeout: Duration,
    pub evaluation_timeout: Duration,
    pub deepgram_api_key: Option<SecretString>,
    pub deepgram_tts_voice: String,
    pub whisper_bin: String,
    pub whisper_model: String,
    pub ffmpeg_bin: String,
    pub espeak_bin: String,
    pub stt_language: String,
    pub api_tokens: HashMap<String, i64>,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// This function will look for a `.env` file in the current directory
    /// and load the following variables:
    ///
    /// *   `BIND_ADDRESS`: The address and port to bind the server to. Defaults to "0.0.0.0:3000".
    /// *   `DATABASE_URL`: SQLite connection string. Defaults to "sqlite://interview.db".
    /// *   `OPENROUTER_API_KEY`: Key for the chat completion endpoint. Required.
    /// *   `OPENROUTER_MODEL` / `OPENROUTER_BASE_URL`: (Optional) Model and endpoint overrides.
    /// *   `LLM_TIMEOUT_SECS` / `EVALUATION_TIMEOUT_SECS`: (Optional) Defaults 30 and 60.
    /// *   `DEEPGRAM_API_KEY`: (Optional) Without it speech runs offline from the start.
    /// *   `DEEPGRAM_TTS_VOICE`: (Optional) Voice model for synthesis.
    /// *   `WHISPER_BIN`, `WHISPER_MODEL`, `FFMPEG_BIN`, `ESPEAK_BIN`: (Optional) Offline tools.
    /// *   `STT_LANGUAGE`: (Optional) Transcription language. Defaults to "en".
    /// *   `API_TOKENS`: Comma separated `token:user_id` pairs accepted as bearer tokens.
    /// *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let bind_address = parse::<SocketAddr>("BIND_ADDRESS", &or("BIND_ADDRESS", "0.0.0.0:3000"))?;
        let database_url = or("DATABASE_URL", "sqlite://interview.db");

        let openrouter_api_key = var("OPENROUTER_API_KEY")
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingVar("OPENROUTER_API_KEY".to_string()))?;
        let openrouter_model = or("OPENROUTER_MODEL", interview_core::llm::DEFAULT_CHAT_MODEL);
        let openrouter_base_url = or("OPENROUTER_BASE_URL", interview_core::llm::OPENROUTER_BASE_URL);

        let llm_timeout = Duration::from_secs(parse("LLM_TIMEOUT_SECS", &or("LLM_TIMEOUT_SECS", "30"))?);
        let evaluation_timeout = Duration::from_secs(parse(
            "EVALUATION_TIMEOUT_SECS",
            &or("EVALUATION_TIMEOUT_SECS", "60"),
        )?);

        let deepgram_api_key = var("DEEPGRAM_API_KEY").map(SecretString::from);
        let deepgram_tts_voice = or("DEEPGRAM_TTS_VOICE", interview_speech::config::DEFAULT_TTS_VOICE);

        let offline = interview_speech::OfflineSpeechConfig::default();
        let whisper_bin = or("WHISPER_BIN", &offline.whisper_bin);
        let whisper_model = or("WHISPER_MODEL", &offline.whisper_model);
        let ffmpeg_bin = or("FFMPEG_BIN", &offline.ffmpeg_bin);
        let espeak_bin = or("ESPEAK_BIN", &offline.espeak_bin);
        let stt_language = or("STT_LANGUAGE", "en");

        let api_tokens = parse_api_tokens(&or("API_TOKENS", ""))?;
        if api_tokens.is_empty() {
            tracing::warn!("API_TOKENS is empty; every request will be rejected");
        }

        let log_level_str = or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            database_url,
            openrouter_api_key,
            openrouter_model,
            openrouter_base_url,
            llm_timeout,
            evaluation_timeout,
            deepgram_api_key,
            deepgram_tts_voice,
            whisper_bin,
            whisper_model,
            ffmpeg_bin,
            espeak_bin,
            stt_language,
            api_tokens,
            log_level,
        })
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string()))
}

/// Parses `token:user_id` pairs separated by commas.
pub fn parse_api_tokens(raw: &str) -> Result<HashMap<String, i64>, ConfigError> {
    let mut tokens = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (token, user) = entry.rsplit_once(':').ok_or_else(|| {
            ConfigError::InvalidValue("API_TOKENS".to_string(), format!("'{}' is not token:user_id", entry))
        })?;
        let user_id = parse::<i64>("API_TOKENS", user)?;
        if token.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "API_TOKENS".to_string(),
                "empty token".to_string(),
            ));
        }
        tokens.insert(token.trim().to_string(), user_id);
    }
    Ok(tokens)
}
