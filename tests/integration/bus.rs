use std::time::Duration;

use chat_relay::bus::{Bus, BusPipeline};

#[rocket::async_test]
async fn test_publish_reaches_all_subscribers_in_order() {
    let bus = Bus::memory();
    let mut sub_a = bus.subscribe("room:lobby").await.unwrap();
    let mut sub_b = bus.subscribe("room:lobby").await.unwrap();

    bus.publish("room:lobby", "one").await.unwrap();
    bus.publish("room:lobby", "two").await.unwrap();

    assert_eq!(sub_a.recv().await.unwrap(), "one");
    assert_eq!(sub_a.recv().await.unwrap(), "two");
    assert_eq!(sub_b.recv().await.unwrap(), "one");
    assert_eq!(sub_b.recv().await.unwrap(), "two");
}

#[rocket::async_test]
async fn test_publish_is_scoped_to_topic() {
    let bus = Bus::memory();
    let mut lobby = bus.subscribe("room:lobby").await.unwrap();
    let _other = bus.subscribe("room:other").await.unwrap();

    bus.publish("room:other", "elsewhere").await.unwrap();
    bus.publish("room:lobby", "here").await.unwrap();

    assert_eq!(lobby.recv().await.unwrap(), "here");
}

#[rocket::async_test]
async fn test_publish_survives_dropped_subscriber() {
    let bus = Bus::memory();
    let sub = bus.subscribe("room:lobby").await.unwrap();
    drop(sub);
    bus.publish("room:lobby", "into the void").await.unwrap();
}

#[rocket::async_test]
async fn test_zset_orders_by_score_with_stable_ties() {
    let bus = Bus::memory();
    bus.zadd("hist", 2.0, "b").await.unwrap();
    bus.zadd("hist", 1.0, "a").await.unwrap();
    bus.zadd("hist", 2.0, "c").await.unwrap();

    // Newest first; equal scores keep insertion order among themselves.
    let newest = bus.zrevrangebyscore("hist", 10).await.unwrap();
    assert_eq!(newest, vec!["c".to_string(), "b".to_string(), "a".to_string()]);

    let top_two = bus.zrevrangebyscore("hist", 2).await.unwrap();
    assert_eq!(top_two.len(), 2);
}

#[rocket::async_test]
async fn test_ztrim_keeps_newest() {
    let bus = Bus::memory();
    for i in 0..10 {
        bus.zadd("hist", i as f64, &format!("m{i}")).await.unwrap();
    }
    bus.ztrim("hist", 3).await.unwrap();
    let rest = bus.zrevrangebyscore("hist", 10).await.unwrap();
    assert_eq!(rest, vec!["m9".to_string(), "m8".to_string(), "m7".to_string()]);
}

#[rocket::async_test]
async fn test_set_operations() {
    let bus = Bus::memory();
    bus.sadd("online", "u1").await.unwrap();
    bus.sadd("online", "u2").await.unwrap();
    bus.sadd("online", "u1").await.unwrap();
    assert_eq!(bus.scard("online").await.unwrap(), 2);

    bus.srem("online", "u1").await.unwrap();
    assert_eq!(bus.smembers("online").await.unwrap(), vec!["u2".to_string()]);
}

#[rocket::async_test]
async fn test_hash_and_del() {
    let bus = Bus::memory();
    bus.hset(
        "client:u1",
        &[
            ("room_id".to_string(), "lobby".to_string()),
            ("nickname".to_string(), "Alice".to_string()),
        ],
    )
    .await
    .unwrap();

    let hash = bus.hgetall("client:u1").await.unwrap();
    assert_eq!(hash.len(), 2);
    assert_eq!(hash.get("room_id").unwrap(), "lobby");

    bus.del("client:u1").await.unwrap();
    assert!(bus.hgetall("client:u1").await.unwrap().is_empty());
}

#[rocket::async_test]
async fn test_kv_ttl_expires() {
    let bus = Bus::memory();
    bus.set_with_ttl("k", "v", Duration::from_millis(40)).await.unwrap();
    assert_eq!(bus.get("k").await.unwrap(), Some("v".to_string()));

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(bus.get("k").await.unwrap(), None);
}

#[rocket::async_test]
async fn test_expire_applies_to_existing_keys() {
    let bus = Bus::memory();
    bus.sadd("s", "m").await.unwrap();
    bus.expire("s", Duration::from_millis(40)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(bus.scard("s").await.unwrap(), 0);
}

#[rocket::async_test]
async fn test_scan_matches_prefix() {
    let bus = Bus::memory();
    bus.hset("client:u1", &[("a".to_string(), "1".to_string())]).await.unwrap();
    bus.hset("client:u2", &[("a".to_string(), "1".to_string())]).await.unwrap();
    bus.sadd("room:lobby:members", "u1").await.unwrap();

    let mut keys = bus.scan("client:*").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["client:u1".to_string(), "client:u2".to_string()]);
}

#[rocket::async_test]
async fn test_pipeline_applies_every_command() {
    let bus = Bus::memory();
    bus.sadd("stale", "x").await.unwrap();

    let pipe = BusPipeline::new()
        .hset("client:u1", vec![("room_id".to_string(), "lobby".to_string())])
        .expire("client:u1", Duration::from_secs(60))
        .sadd("room:lobby:members", "u1")
        .del("stale");
    bus.exec(pipe).await.unwrap();

    assert_eq!(bus.hgetall("client:u1").await.unwrap().len(), 1);
    assert_eq!(bus.smembers("room:lobby:members").await.unwrap(), vec!["u1".to_string()]);
    assert_eq!(bus.scard("stale").await.unwrap(), 0);
}
