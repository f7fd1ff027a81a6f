use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get, post};

use super::{AuthToken, validate_token};
use crate::config::ChatConfig;
use crate::db::Db;
use crate::engine::{Engine, LockOutcome};
use crate::models::{LockRequest, RegisterUser, Room, RoomSummary};

type ErrorResponse = (Status, Json<serde_json::Value>);

fn internal_error(e: rusqlite::Error) -> ErrorResponse {
    (
        Status::InternalServerError,
        Json(serde_json::json!({"error": e.to_string()})),
    )
}

fn room_not_found() -> ErrorResponse {
    (
        Status::NotFound,
        Json(serde_json::json!({"error": "Room not found"})),
    )
}

#[get("/api/v1/rooms")]
pub fn list_rooms(db: &State<Db>) -> Result<Json<Vec<RoomSummary>>, ErrorResponse> {
    db.list_rooms().map(Json).map_err(internal_error)
}

#[get("/api/v1/rooms/<room_id>")]
pub fn get_room(db: &State<Db>, room_id: &str) -> Result<Json<Room>, ErrorResponse> {
    match db.get_room(room_id) {
        Ok(Some(room)) => Ok(Json(room)),
        Ok(None) => Err(room_not_found()),
        Err(e) => Err(internal_error(e)),
    }
}

#[post("/api/v1/rooms/<room_id>/register-user", format = "json", data = "<body>")]
pub fn register_user(
    db: &State<Db>,
    cfg: &State<ChatConfig>,
    token: AuthToken,
    room_id: &str,
    body: Json<RegisterUser>,
) -> Result<Json<Room>, ErrorResponse> {
    if validate_token(cfg, &token.0).is_err() {
        return Err((
            Status::Unauthorized,
            Json(serde_json::json!({"error": "Invalid or expired token"})),
        ));
    }

    let user_id = body.user_id.trim();
    let nickname = body.nickname.trim();
    if user_id.is_empty() || user_id.len() > 100 {
        return Err((
            Status::BadRequest,
            Json(serde_json::json!({"error": "User id must be 1-100 characters"})),
        ));
    }
    if nickname.is_empty() || nickname.len() > 100 {
        return Err((
            Status::BadRequest,
            Json(serde_json::json!({"error": "Nickname must be 1-100 characters"})),
        ));
    }
    if room_id.len() > 100 {
        return Err((
            Status::BadRequest,
            Json(serde_json::json!({"error": "Room id must be 1-100 characters"})),
        ));
    }

    db.add_member(room_id, user_id, nickname)
        .map(Json)
        .map_err(internal_error)
}

#[post("/api/v1/rooms/<room_id>/lock", format = "json", data = "<body>")]
pub async fn lock_room(
    db: &State<Db>,
    engine: &State<Engine>,
    cfg: &State<ChatConfig>,
    token: AuthToken,
    room_id: &str,
    body: Json<LockRequest>,
) -> Result<Json<serde_json::Value>, ErrorResponse> {
    if validate_token(cfg, &token.0).is_err() {
        return Err((
            Status::Unauthorized,
            Json(serde_json::json!({"error": "Invalid or expired token"})),
        ));
    }

    match engine.try_lock(db, room_id, body.user_id.trim()).await {
        Ok(LockOutcome::Locked) => Ok(Json(
            serde_json::json!({"room_id": room_id, "status": "locked"}),
        )),
        Ok(LockOutcome::Unlocked) => Ok(Json(
            serde_json::json!({"room_id": room_id, "status": "unlocked"}),
        )),
        Ok(LockOutcome::Forbidden) => Err((
            Status::Forbidden,
            Json(serde_json::json!({
                "error": "Room is locked by another member or the user is not a member"
            })),
        )),
        Ok(LockOutcome::NotFound) => Err(room_not_found()),
        Err(e) => Err(internal_error(e)),
    }
}
