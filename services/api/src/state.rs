use crate::auth::IdentityProvider;
use interview_core::InterviewServices;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared by every request handler and websocket connection.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub services: InterviewServices,
    pub identity: Arc<dyn IdentityProvider>,
}
