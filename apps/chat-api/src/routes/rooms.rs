//! Room management and history endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::jwt::Identity;
use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiErrorBody, FieldError};
use crate::models::message::Message;
use crate::models::room::Room;
use crate::store::history_limit;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms", post(create_room).get(list_rooms))
        .route("/rooms/{room_id}/messages", get(list_messages))
        .route("/rooms/{room_id}/members", get(list_members))
}

// ---------------------------------------------------------------------------
// POST /api/rooms
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateRoomRequest {
    pub name: String,
    pub description: Option<String>,
}

const NAME_MIN: usize = 3;
const NAME_MAX: usize = 100;
const DESCRIPTION_MAX: usize = 1000;

fn validate(body: &CreateRoomRequest) -> Result<(String, Option<String>), ApiError> {
    let name = body.name.trim().to_string();
    let description = body
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string);

    let mut errors = Vec::new();
    let name_len = name.chars().count();
    if name_len < NAME_MIN || name_len > NAME_MAX {
        errors.push(FieldError {
            field: "name".to_string(),
            message: format!("Room name must be between {NAME_MIN} and {NAME_MAX} characters"),
        });
    }
    if description
        .as_ref()
        .is_some_and(|d| d.chars().count() > DESCRIPTION_MAX)
    {
        errors.push(FieldError {
            field: "description".to_string(),
            message: format!("Description must be {DESCRIPTION_MAX} characters or fewer"),
        });
    }
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }

    Ok((name, description))
}

#[utoipa::path(
    post,
    path = "/api/rooms",
    tag = "Rooms",
    security(("bearer" = [])),
    request_body = CreateRoomRequest,
    responses(
        (status = 201, description = "Room created", body = Room),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn create_room(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Json(body): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<Room>), ApiError> {
    let (name, description) = validate(&body)?;

    let room = state
        .store
        .create_room(&name, description.as_deref(), &user.user_id)
        .await?;

    tracing::info!(room_id = %room.id, user_id = %user.user_id, "room created");

    Ok((StatusCode::CREATED, Json(room)))
}

// ---------------------------------------------------------------------------
// GET /api/rooms
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/rooms",
    tag = "Rooms",
    responses(
        (status = 200, description = "Rooms, newest first", body = Vec<Room>),
    ),
)]
pub async fn list_rooms(State(state): State<AppState>) -> Result<Json<Vec<Room>>, ApiError> {
    Ok(Json(state.store.list_rooms().await?))
}

// ---------------------------------------------------------------------------
// GET /api/rooms/:room_id/messages
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, IntoParams)]
pub struct HistoryParams {
    /// Page size, 1-100. Anything else falls back to 50.
    #[param(value_type = Option<i64>)]
    pub limit: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/rooms/{room_id}/messages",
    tag = "Rooms",
    params(
        ("room_id" = String, Path, description = "Room ID"),
        HistoryParams,
    ),
    responses(
        (status = 200, description = "Messages, newest first", body = Vec<Message>),
    ),
)]
pub async fn list_messages(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let limit = history_limit(params.limit.as_deref().and_then(|l| l.parse().ok()));
    Ok(Json(state.store.room_history(&room_id, limit).await?))
}

// ---------------------------------------------------------------------------
// GET /api/rooms/:room_id/members
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct RoomMembersResponse {
    pub room_id: String,
    /// Users connected to this room on this instance.
    pub members: Vec<Identity>,
}

#[utoipa::path(
    get,
    path = "/api/rooms/{room_id}/members",
    tag = "Rooms",
    params(("room_id" = String, Path, description = "Room ID")),
    responses(
        (status = 200, description = "Live members", body = RoomMembersResponse),
        (status = 503, description = "Hub is not running", body = ApiErrorBody),
    ),
)]
pub async fn list_members(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomMembersResponse>, ApiError> {
    let members = state
        .hub
        .room_members(&room_id)
        .await
        .map_err(|_| ApiError::unavailable("Hub is not running"))?;

    Ok(Json(RoomMembersResponse { room_id, members }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, description: Option<&str>) -> CreateRoomRequest {
        CreateRoomRequest {
            name: name.to_string(),
            description: description.map(str::to_string),
        }
    }

    #[test]
    fn name_is_trimmed_and_bounded() {
        let (name, _) = validate(&request("  general  ", None)).unwrap();
        assert_eq!(name, "general");

        assert!(validate(&request("ab", None)).is_err());
        assert!(validate(&request("   ab   ", None)).is_err());
        assert!(validate(&request(&"x".repeat(100), None)).is_ok());
        assert!(validate(&request(&"x".repeat(101), None)).is_err());
    }

    #[test]
    fn blank_description_becomes_none() {
        let (_, description) = validate(&request("general", Some("   "))).unwrap();
        assert_eq!(description, None);

        let (_, description) = validate(&request("general", Some(" chat "))).unwrap();
        assert_eq!(description.as_deref(), Some("chat"));
    }

    #[test]
    fn validation_error_lists_fields() {
        let err = validate(&request("x", Some(&"d".repeat(1001)))).unwrap_err();
        assert_eq!(err.code, "VALIDATION_ERROR");
        let fields: Vec<_> = err
            .details
            .unwrap()
            .into_iter()
            .map(|f| f.field)
            .collect();
        assert_eq!(fields, ["name", "description"]);
    }
}
