use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{State, get};

use crate::bus::{Bus, keys};
use crate::db::Db;

#[get("/api/v1/health")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chat-relay",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[get("/api/v1/stats")]
pub async fn stats(db: &State<Db>, bus: &State<Arc<Bus>>) -> Json<serde_json::Value> {
    let (room_count, message_count, user_count) = {
        let conn = db.conn();
        let rooms: i64 = conn
            .query_row("SELECT COUNT(*) FROM rooms", [], |r| r.get(0))
            .unwrap_or(0);
        let messages: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap_or(0);
        let users: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap_or(0);
        (rooms, messages, users)
    };

    let online = bus.scard(keys::USERS_ONLINE).await.unwrap_or(0);

    Json(serde_json::json!({
        "rooms": room_count,
        "messages": message_count,
        "users": user_count,
        "online": online,
    }))
}

#[rocket::catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Not found"}))
}

#[rocket::catch(401)]
pub fn unauthorized() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Authentication required"}))
}
