use crate::state::AppState;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use interview_core::{ClientEvent, Flow, InterviewRepository, InterviewRuntime, ServerEvent};
use interview_core::model::InterviewSession;
use serde::Deserialize;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// The bearer token did not resolve to a user.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;
/// The session does not exist, belongs to someone else, or has ended.
pub const CLOSE_SESSION_UNAVAILABLE: u16 = 4404;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred. Please reconnect to continue.";

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn interview_ws(
    ws: WebSocketUpgrade,
    Path(session_id): Path<i64>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    info!("WebSocket upgrade request received for session {}", session_id);
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, query.token))
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    }))
}

async fn reject(mut socket: WebSocket, code: u16, reason: &'static str) {
    if let Err(e) = socket.send(close_frame(code, reason)).await {
        debug!("failed to send close frame: {}", e);
    }
}

/// Serializes runtime events onto the socket until every sender is gone, then hands the
/// sink back so the caller can close the connection.
async fn forward_events(
    mut sink: SplitSink<WebSocket, Message>,
    mut events: mpsc::Receiver<ServerEvent>,
) -> SplitSink<WebSocket, Message> {
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(text) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!("client went away while sending: {}", e);
                    break;
                }
            }
            Err(e) => error!("failed to serialize event: {}", e),
        }
    }
    sink
}

/// Looks the session up on a connection that goes back to the pool straight away.
async fn load_session(
    pool: &SqlitePool,
    session_id: i64,
    user_id: i64,
) -> sqlx::Result<Option<InterviewSession>> {
    let mut conn = pool.acquire().await?;
    InterviewRepository
        .get_owned_session(&mut conn, session_id, user_id)
        .await
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: i64, token: Option<String>) {
    let Some(user_id) = token.as_deref().and_then(|t| state.identity.resolve(t)) else {
        warn!("Rejected websocket for session {}: unauthorized", session_id);
        reject(socket, CLOSE_UNAUTHORIZED, "Unauthorized").await;
        return;
    };

    let session = match load_session(&state.pool, session_id, user_id).await {
        Ok(Some(session)) if session.is_active() => session,
        Ok(_) => {
            warn!("Rejected websocket for session {}: not available to user {}", session_id, user_id);
            reject(socket, CLOSE_SESSION_UNAVAILABLE, "Session not found or not active").await;
            return;
        }
        Err(e) => {
            error!("failed to load session {}: {}", session_id, e);
            reject(socket, close_code::ERROR, "Internal error").await;
            return;
        }
    };

    info!("WebSocket connection established for session {}", session_id);
    let (sink, mut stream) = socket.split();
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let writer = tokio::spawn(forward_events(sink, events_rx));

    let mut runtime =
        InterviewRuntime::new(state.pool.clone(), session, state.services.clone(), events_tx);
    let close = run_connection(&mut runtime, &mut stream).await;
    drop(runtime);

    match writer.await {
        Ok(mut sink) => {
            if let Some((code, reason)) = close {
                if let Err(e) = sink.send(close_frame(code, reason)).await {
                    debug!("failed to send close frame: {}", e);
                }
            }
        }
        Err(e) => error!("event writer task failed: {}", e),
    }
    info!("WebSocket connection closed for session {}", session_id);
}

/// Drives one runtime until the client leaves or the interview is hung up. Returns the
/// close frame to send, if the server is the one closing.
async fn run_connection(
    runtime: &mut InterviewRuntime,
    stream: &mut futures_util::stream::SplitStream<WebSocket>,
) -> Option<(u16, &'static str)> {
    if let Err(e) = runtime.start().await {
        error!("failed to start session {}: {:#}", runtime.session().id, e);
        runtime.send_error(INTERNAL_ERROR_MESSAGE).await;
        return Some((close_code::ERROR, "Internal error"));
    }

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("websocket read failed: {}", e);
                break;
            }
        };

        let event = match ClientEvent::parse(text.as_str()) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("ignoring unknown event: {}", text.as_str());
                continue;
            }
            Err(e) => {
                warn!("malformed client message: {}", e);
                runtime.send_error("Malformed message").await;
                continue;
            }
        };

        match runtime.handle(event).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => return Some((close_code::NORMAL, "Interview ended")),
            Err(e) => {
                error!("session {} failed: {:#}", runtime.session().id, e);
                runtime.send_error(INTERNAL_ERROR_MESSAGE).await;
                return Some((close_code::ERROR, "Internal error"));
            }
        }
    }

    runtime.handle_disconnect();
    None
}
