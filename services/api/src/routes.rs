use crate::state::AppState;
use crate::{rest, ws};
use axum::Router;
use axum::routing::{get, post};

pub const API_PREFIX: &str = "/api/v1";

pub fn router(state: AppState) -> Router {
    let interview = Router::new()
        .route("/health", get(rest::health))
        .route("/sessions", post(rest::create_session).get(rest::list_sessions))
        .route(
            "/sessions/{session_id}",
            get(rest::get_session).delete(rest::delete_session),
        )
        .route("/sessions/{session_id}/end", post(rest::end_session))
        .route("/history/{session_id}", get(rest::get_history));

    Router::new()
        .nest(&format!("{API_PREFIX}/interview"), interview)
        .route(
            &format!("{API_PREFIX}/ws/interview/{{session_id}}"),
            get(ws::interview_ws),
        )
        .with_state(state)
}
