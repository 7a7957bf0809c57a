mod auth;
mod config;
mod error;
mod rest;
mod routes;
mod state;
#[cfg(test)]
mod test_support;
mod ws;

use crate::auth::StaticTokens;
use crate::config::Config;
use crate::state::AppState;
use anyhow::{Context, Result};
use interview_core::llm::{ChatModel, OpenRouterClient};
use interview_core::{EvaluationQueue, EvaluationWorker, InterviewServices, RuntimeSettings, store};
use interview_speech::{DeepgramConfig, OfflineSpeechConfig};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;

const DB_MAX_CONNECTIONS: u32 = 16;

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    info!("Configuration loaded successfully. Starting interview service...");

    // --- 3. Open the Store ---
    let pool = store::connect(&config.database_url, DB_MAX_CONNECTIONS)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;

    // --- 4. Initialize API Clients ---
    let model: Arc<dyn ChatModel> = Arc::new(
        OpenRouterClient::new(config.openrouter_api_key.clone(), config.openrouter_model.clone())
            .with_base_url(&config.openrouter_base_url),
    );

    let mut deepgram = DeepgramConfig::builder().with_tts_voice(&config.deepgram_tts_voice);
    if let Some(key) = &config.deepgram_api_key {
        deepgram = deepgram.with_api_key(key.expose_secret());
    }
    let offline = OfflineSpeechConfig {
        whisper_bin: config.whisper_bin.clone(),
        whisper_model: config.whisper_model.clone(),
        ffmpeg_bin: config.ffmpeg_bin.clone(),
        espeak_bin: config.espeak_bin.clone(),
    };
    let (stt, tts) = interview_speech::speech_services(deepgram.build(), offline);

    // --- 5. Start the Evaluation Worker ---
    let worker = Arc::new(EvaluationWorker::new(
        pool.clone(),
        model.clone(),
        config.evaluation_timeout,
    ));
    let evaluations = EvaluationQueue::spawn(worker);

    let services = InterviewServices {
        model,
        stt,
        tts,
        evaluations,
        settings: RuntimeSettings {
            llm_timeout: config.llm_timeout,
            stt_language: config.stt_language.clone(),
            ..RuntimeSettings::default()
        },
    };
    let state = AppState {
        pool,
        services,
        identity: Arc::new(StaticTokens::new(config.api_tokens.clone())),
    };

    // Configure a permissive CORS policy so a separately hosted frontend can connect.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    info!("Starting interview server, listening on {}", config.bind_address);
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
