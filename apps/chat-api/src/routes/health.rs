use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::{ApiError, ApiErrorBody};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    /// Live WebSocket sessions on this instance.
    pub sessions: usize,
    /// Rooms with at least one local member.
    pub rooms: usize,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Hub is not running", body = ApiErrorBody),
    ),
)]
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let stats = state
        .hub
        .stats()
        .await
        .map_err(|_| ApiError::unavailable("Hub is not running"))?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        sessions: stats.sessions,
        rooms: stats.rooms,
    }))
}
