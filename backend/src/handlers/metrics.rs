use axum::{
    extract::{Extension, Path, State},
    Json,
};

use crate::{
    error::AppError,
    middleware::AuthUser,
    models::metrics::{AggregateMetrics, SessionMetrics},
    state::AppState,
    types::SessionId,
};

const NO_SESSION_METRICS: &str = "No metrics found for this session";

pub async fn get_metrics(State(state): State<AppState>) -> Json<AggregateMetrics> {
    Json(state.metrics.snapshot())
}

pub async fn get_session_metrics(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionMetrics>, AppError> {
    let session_id = SessionId::parse(&session_id)
        .ok_or_else(|| AppError::NotFound(NO_SESSION_METRICS.to_string()))?;

    state
        .metrics
        .session(&session_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(NO_SESSION_METRICS.to_string()))
}

/// Mints a fresh session id for the caller's next conversation.
pub async fn new_session_id(Extension(AuthUser(user_id)): Extension<AuthUser>) -> Json<SessionId> {
    let session_id = SessionId::generate();
    tracing::debug!(%user_id, %session_id, "Issued session id");
    Json(session_id)
}
