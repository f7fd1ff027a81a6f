use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get};

use crate::db::Db;
use crate::models::MessagesPage;

#[get("/api/v1/rooms/<room_id>/messages?<page>&<limit>&<order>")]
pub fn get_messages(
    db: &State<Db>,
    room_id: &str,
    page: Option<i64>,
    limit: Option<i64>,
    order: Option<&str>,
) -> Result<Json<MessagesPage>, (Status, Json<serde_json::Value>)> {
    match db.get_room(room_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return Err((
                Status::NotFound,
                Json(serde_json::json!({"error": "Room not found"})),
            ));
        }
        Err(e) => {
            return Err((
                Status::InternalServerError,
                Json(serde_json::json!({"error": e.to_string()})),
            ));
        }
    }

    let page = page.unwrap_or(1).max(1);
    let limit = limit.unwrap_or(50).clamp(1, 100);
    let ascending = matches!(order, Some("asc"));
    let skip = (page - 1) * limit;

    let messages = db
        .list_messages(room_id, limit, skip, ascending)
        .map_err(|e| {
            (
                Status::InternalServerError,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        })?;

    Ok(Json(MessagesPage {
        count: messages.len(),
        messages,
        page,
        limit,
    }))
}
