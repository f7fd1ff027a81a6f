use rocket::http::{ContentType, Status};

use crate::common::{bearer, register_user, test_client};

// --- Registration & room metadata ---

#[test]
fn test_register_user_creates_room_and_member() {
    let client = test_client();
    let res = client
        .post("/api/v1/rooms/lobby/register-user")
        .header(ContentType::JSON)
        .header(bearer("u1"))
        .body(r#"{"user_id": "u1", "nickname": "Alice"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let room: serde_json::Value = res.into_json().unwrap();
    assert_eq!(room["id"], "lobby");
    assert_eq!(room["locked_by"], "");
    let members = room["members"].as_array().unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0]["user_id"], "u1");
    assert_eq!(members[0]["nickname"], "Alice");
}

#[test]
fn test_register_requires_token() {
    let client = test_client();
    let res = client
        .post("/api/v1/rooms/lobby/register-user")
        .header(ContentType::JSON)
        .body(r#"{"user_id": "u1", "nickname": "Alice"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn test_register_rejects_garbage_token() {
    let client = test_client();
    let res = client
        .post("/api/v1/rooms/lobby/register-user")
        .header(ContentType::JSON)
        .header(rocket::http::Header::new("Authorization", "Bearer nope"))
        .body(r#"{"user_id": "u1", "nickname": "Alice"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn test_reregistration_is_noop() {
    let client = test_client();
    register_user(&client, "lobby", "u1", "Alice");
    register_user(&client, "lobby", "u1", "Alice");

    let res = client.get("/api/v1/rooms/lobby").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let room: serde_json::Value = res.into_json().unwrap();
    assert_eq!(room["members"].as_array().unwrap().len(), 1);
}

#[test]
fn test_register_empty_user_id() {
    let client = test_client();
    let res = client
        .post("/api/v1/rooms/lobby/register-user")
        .header(ContentType::JSON)
        .header(bearer("u1"))
        .body(r#"{"user_id": "  ", "nickname": "Alice"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_list_rooms() {
    let client = test_client();
    register_user(&client, "alpha", "u1", "Alice");
    register_user(&client, "beta", "u1", "Alice");
    register_user(&client, "beta", "u2", "Bob");

    let res = client.get("/api/v1/rooms").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let rooms: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(rooms.len(), 2);
    let beta = rooms.iter().find(|r| r["id"] == "beta").unwrap();
    assert_eq!(beta["member_count"], 2);
    assert_eq!(beta["message_count"], 0);
}

#[test]
fn test_get_room_not_found() {
    let client = test_client();
    let res = client.get("/api/v1/rooms/nonexistent").dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_health() {
    let client = test_client();
    let res = client.get("/api/v1/health").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "chat-relay");
}

#[test]
fn test_stats_counts() {
    let client = test_client();
    register_user(&client, "lobby", "u1", "Alice");
    register_user(&client, "lobby", "u2", "Bob");

    let res = client.get("/api/v1/stats").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["rooms"], 1);
    assert_eq!(body["users"], 2);
    assert_eq!(body["online"], 0);
}
