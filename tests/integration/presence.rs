use std::sync::Arc;
use std::time::Duration;

use chat_relay::bus::{Bus, keys};
use chat_relay::config::ChatConfig;
use chat_relay::engine::Engine;
use chat_relay::models::{ChatMessage, MessageKind};
use chat_relay::presence::{Presence, bootstrap_online, sweep_stale};
use chat_relay::session::Session;

use crate::common::test_db;

const DAY: Duration = Duration::from_secs(86400);

#[rocket::async_test]
async fn test_register_writes_presence_keys() {
    let bus = Arc::new(Bus::memory());
    let presence = Presence::new(bus.clone(), DAY);
    let session = Session::new("lobby", "u1", "Alice");

    presence.register(&session).await.unwrap();

    let hash = bus.hgetall(&keys::client("u1")).await.unwrap();
    assert_eq!(hash.get("room_id").unwrap(), "lobby");
    assert_eq!(hash.get("nickname").unwrap(), "Alice");
    assert_eq!(hash.get("connection_id").unwrap(), &session.connection_id);
    assert!(hash.contains_key("last_seen"));

    let members = bus.smembers(&keys::room_members("lobby")).await.unwrap();
    assert_eq!(members, vec!["u1".to_string()]);
    let clients = bus.smembers(&keys::room_clients("lobby")).await.unwrap();
    assert_eq!(clients, vec!["u1".to_string()]);
    assert_eq!(bus.scard(keys::USERS_ONLINE).await.unwrap(), 1);
}

#[rocket::async_test]
async fn test_heartbeat_advances_last_seen() {
    let bus = Arc::new(Bus::memory());
    let presence = Presence::new(bus.clone(), DAY);
    let session = Session::new("lobby", "u1", "Alice");

    presence.register(&session).await.unwrap();
    let before = bus.hgetall(&keys::client("u1")).await.unwrap();
    let before = chrono::DateTime::parse_from_rfc3339(before.get("last_seen").unwrap()).unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    presence.heartbeat(&session).await.unwrap();

    let after = bus.hgetall(&keys::client("u1")).await.unwrap();
    let after = chrono::DateTime::parse_from_rfc3339(after.get("last_seen").unwrap()).unwrap();
    assert!(after > before);
}

#[rocket::async_test]
async fn test_unregister_clears_presence_keys() {
    let bus = Arc::new(Bus::memory());
    let presence = Presence::new(bus.clone(), DAY);
    let session = Session::new("lobby", "u1", "Alice");

    presence.register(&session).await.unwrap();
    presence.unregister(&session).await.unwrap();

    assert!(bus.hgetall(&keys::client("u1")).await.unwrap().is_empty());
    assert!(bus.smembers(&keys::room_members("lobby")).await.unwrap().is_empty());
    assert_eq!(bus.scard(keys::USERS_ONLINE).await.unwrap(), 0);
    // The historical index keeps the user.
    assert_eq!(
        bus.smembers(&keys::room_clients("lobby")).await.unwrap(),
        vec!["u1".to_string()]
    );
}

#[rocket::async_test]
async fn test_unregister_yields_to_newer_connection() {
    let bus = Arc::new(Bus::memory());
    let presence = Presence::new(bus.clone(), DAY);

    let old = Session::new("lobby", "u1", "Alice");
    presence.register(&old).await.unwrap();
    let new = Session::new("lobby", "u1", "Alice");
    presence.register(&new).await.unwrap();

    // The stale session's cleanup must not clobber the live registration.
    presence.unregister(&old).await.unwrap();
    let hash = bus.hgetall(&keys::client("u1")).await.unwrap();
    assert_eq!(hash.get("connection_id").unwrap(), &new.connection_id);
    assert_eq!(bus.scard(keys::USERS_ONLINE).await.unwrap(), 1);
}

#[rocket::async_test]
async fn test_reaper_expires_stale_presence_once() {
    let bus = Arc::new(Bus::memory());
    let presence = Presence::new(bus.clone(), DAY);
    let engine = Engine::new(bus.clone(), &ChatConfig::default());
    let db = test_db();
    db.db.add_member("lobby", "u1", "Alice").unwrap();
    db.db.set_user_activity("u1", "online").unwrap();

    let session = Session::new("lobby", "u1", "Alice");
    presence.register(&session).await.unwrap();

    // Age the heartbeat past the staleness threshold.
    let stale = (chrono::Utc::now() - chrono::Duration::seconds(300)).to_rfc3339();
    bus.hset(&keys::client("u1"), &[("last_seen".to_string(), stale)])
        .await
        .unwrap();

    let mut sub = bus.subscribe(&keys::room_topic("lobby")).await.unwrap();
    let reaped = sweep_stale(&bus, &engine, &db.db, Duration::from_secs(120)).await;
    assert_eq!(reaped, 1);

    assert!(bus.hgetall(&keys::client("u1")).await.unwrap().is_empty());
    assert!(bus.smembers(&keys::room_members("lobby")).await.unwrap().is_empty());
    assert_eq!(bus.scard(keys::USERS_ONLINE).await.unwrap(), 0);

    let raw = sub.recv().await.unwrap();
    let frame: ChatMessage = serde_json::from_str(&raw).unwrap();
    assert_eq!(frame.kind, MessageKind::System);
    assert_eq!(frame.content, "Alice has disconnected (timeout)");
    assert_eq!(frame.sender_id, "");

    // A second sweep finds nothing; the broadcast happened exactly once.
    let reaped = sweep_stale(&bus, &engine, &db.db, Duration::from_secs(120)).await;
    assert_eq!(reaped, 0);
}

#[rocket::async_test]
async fn test_reaper_keeps_fresh_presence() {
    let bus = Arc::new(Bus::memory());
    let presence = Presence::new(bus.clone(), DAY);
    let engine = Engine::new(bus.clone(), &ChatConfig::default());
    let db = test_db();

    let session = Session::new("lobby", "u1", "Alice");
    presence.register(&session).await.unwrap();

    let reaped = sweep_stale(&bus, &engine, &db.db, Duration::from_secs(120)).await;
    assert_eq!(reaped, 0);
    assert!(!bus.hgetall(&keys::client("u1")).await.unwrap().is_empty());
}

#[rocket::async_test]
async fn test_bootstrap_reconciles_activity_with_presence() {
    let bus = Arc::new(Bus::memory());
    let presence = Presence::new(bus.clone(), DAY);
    let db = test_db();
    db.db.add_member("lobby", "u1", "Alice").unwrap();
    db.db.add_member("lobby", "u2", "Bob").unwrap();
    db.db.set_user_activity("u2", "online").unwrap();

    // Only u1 has a live presence hash.
    let session = Session::new("lobby", "u1", "Alice");
    presence.register(&session).await.unwrap();

    let online = bootstrap_online(&bus, &db.db).await;
    assert_eq!(online, 1);

    let activity = |user: &str| -> String {
        db.db
            .conn()
            .query_row(
                "SELECT activity FROM users WHERE external_id = ?1",
                rusqlite::params![user],
                |r| r.get(0),
            )
            .unwrap()
    };
    assert_eq!(activity("u1"), "online");
    assert_eq!(activity("u2"), "offline");
}
