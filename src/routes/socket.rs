use std::sync::Arc;

use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get};
use rocket_ws as ws;

use super::{AuthToken, UpgradeOrigin, validate_token};
use crate::bus::Bus;
use crate::config::ChatConfig;
use crate::db::Db;
use crate::engine::Engine;
use crate::presence::Presence;
use crate::session::{self, Session};

type ErrorResponse = (Status, Json<serde_json::Value>);

/// Socket upgrade. Authorization happens before the upgrade: missing token
/// 401, unknown room 404, non-member 403. The accepted socket is handed to
/// the session supervisor.
#[get("/api/v1/ws?<room_id>&<user_id>&<nickname>")]
pub fn chat_socket<'r>(
    ws: ws::WebSocket,
    db: &'r State<Db>,
    bus: &'r State<Arc<Bus>>,
    engine: &'r State<Engine>,
    presence: &'r State<Presence>,
    cfg: &'r State<ChatConfig>,
    token: AuthToken,
    origin: UpgradeOrigin,
    room_id: &str,
    user_id: &str,
    nickname: &str,
) -> Result<ws::Channel<'r>, ErrorResponse> {
    if !cfg.origin_allowed(origin.0.as_deref()) {
        return Err((
            Status::Forbidden,
            Json(serde_json::json!({"error": "Origin not allowed"})),
        ));
    }
    if validate_token(cfg, &token.0).is_err() {
        return Err((
            Status::Unauthorized,
            Json(serde_json::json!({"error": "Invalid or expired token"})),
        ));
    }

    let room = match db.get_room(room_id) {
        Ok(Some(room)) => room,
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
    };
    if !room.is_member(user_id) {
        return Err((
            Status::Forbidden,
            Json(serde_json::json!({"error": "User is not a member of this room"})),
        ));
    }

    let nickname = {
        let n = nickname.trim();
        if n.is_empty() {
            room.member_nickname(user_id).unwrap_or(user_id).to_string()
        } else {
            n.to_string()
        }
    };

    let session = Arc::new(Session::new(room_id, user_id, &nickname));
    let db = db.inner();
    let bus = bus.inner().clone();
    let engine = engine.inner().clone();
    let presence = presence.inner().clone();

    Ok(ws.channel(move |stream| {
        Box::pin(async move {
            session::run(stream, session, db, bus.as_ref(), &engine, &presence).await
        })
    }))
}
