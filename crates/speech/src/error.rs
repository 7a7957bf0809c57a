use crate::credit;

#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("{provider} request failed: {source}")]
    Http {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("{provider} reported an error: {message}")]
    Vendor {
        provider: &'static str,
        message: String,
    },
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    ProcessFailed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("could not decode audio: {0}")]
    Decode(String),
    #[error("resampling failed: {0}")]
    Resample(String),
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SpeechError {
    /// Whether the vendor rejected the call for billing reasons (credit, quota, payment).
    pub fn is_credit_error(&self) -> bool {
        match self {
            SpeechError::Status { status: 402, .. } => true,
            other => credit::looks_like_credit_error(&other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SpeechError>;
