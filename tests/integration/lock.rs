use rocket::http::{ContentType, Status};

use crate::common::{bearer, register_user, test_client};

fn lock(client: &rocket::local::blocking::Client, room: &str, user: &str) -> (Status, serde_json::Value) {
    let res = client
        .post(format!("/api/v1/rooms/{room}/lock"))
        .header(ContentType::JSON)
        .header(bearer(user))
        .body(format!(r#"{{"user_id": "{user}"}}"#))
        .dispatch();
    let status = res.status();
    let body: serde_json::Value = res.into_json().unwrap();
    (status, body)
}

#[test]
fn test_lock_then_unlock_by_holder() {
    let client = test_client();
    register_user(&client, "lobby", "u1", "Alice");

    let (status, body) = lock(&client, "lobby", "u1");
    assert_eq!(status, Status::Ok);
    assert_eq!(body["status"], "locked");

    let res = client.get("/api/v1/rooms/lobby").dispatch();
    let room: serde_json::Value = res.into_json().unwrap();
    assert_eq!(room["locked_by"], "u1");

    let (status, body) = lock(&client, "lobby", "u1");
    assert_eq!(status, Status::Ok);
    assert_eq!(body["status"], "unlocked");

    let res = client.get("/api/v1/rooms/lobby").dispatch();
    let room: serde_json::Value = res.into_json().unwrap();
    assert_eq!(room["locked_by"], "");
}

#[test]
fn test_lock_emits_system_messages_in_order() {
    let client = test_client();
    register_user(&client, "lobby", "u1", "Alice");

    lock(&client, "lobby", "u1");
    lock(&client, "lobby", "u1");

    let res = client
        .get("/api/v1/rooms/lobby/messages?order=asc")
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let page: serde_json::Value = res.into_json().unwrap();
    let messages = page["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["type"], "system");
    assert_eq!(messages[0]["content"], "Room has been locked by Alice");
    assert_eq!(messages[0]["sender_id"], "");
    assert_eq!(messages[1]["content"], "Room has been unlocked by Alice");
}

#[test]
fn test_lock_held_refuses_other_member() {
    let client = test_client();
    register_user(&client, "lobby", "u1", "Alice");
    register_user(&client, "lobby", "u2", "Bob");

    let (status, _) = lock(&client, "lobby", "u1");
    assert_eq!(status, Status::Ok);

    let (status, _) = lock(&client, "lobby", "u2");
    assert_eq!(status, Status::Forbidden);

    // Still locked by u1.
    let res = client.get("/api/v1/rooms/lobby").dispatch();
    let room: serde_json::Value = res.into_json().unwrap();
    assert_eq!(room["locked_by"], "u1");
}

#[test]
fn test_lock_forbidden_for_non_member() {
    let client = test_client();
    register_user(&client, "lobby", "u1", "Alice");

    let (status, _) = lock(&client, "lobby", "u2");
    assert_eq!(status, Status::Forbidden);
}

#[test]
fn test_lock_room_not_found() {
    let client = test_client();
    let (status, _) = lock(&client, "ghost", "u1");
    assert_eq!(status, Status::NotFound);
}

#[test]
fn test_lock_requires_token() {
    let client = test_client();
    register_user(&client, "lobby", "u1", "Alice");
    let res = client
        .post("/api/v1/rooms/lobby/lock")
        .header(ContentType::JSON)
        .body(r#"{"user_id": "u1"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}
