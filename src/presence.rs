use std::sync::Arc;
use std::time::Duration;

use crate::bus::{Bus, BusPipeline, BusResult, keys};
use crate::db::Db;
use crate::engine::Engine;
use crate::session::Session;

/// Presence and membership registry: a thin typed facade over the bus keys.
/// Membership in the room document is persistent and orthogonal; these keys
/// only track who is connected right now.
#[derive(Clone)]
pub struct Presence {
    bus: Arc<Bus>,
    ttl: Duration,
}

impl Presence {
    pub fn new(bus: Arc<Bus>, ttl: Duration) -> Self {
        Presence { bus, ttl }
    }

    /// One atomic pipeline: presence hash + TTL, room member/client sets +
    /// TTL, global online set.
    pub async fn register(&self, session: &Session) -> BusResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let client_key = keys::client(&session.user_id);
        let members_key = keys::room_members(&session.room_id);
        let clients_key = keys::room_clients(&session.room_id);
        let pipe = BusPipeline::new()
            .hset(
                client_key.as_str(),
                vec![
                    ("room_id".to_string(), session.room_id.clone()),
                    ("nickname".to_string(), session.nickname.clone()),
                    ("connection_id".to_string(), session.connection_id.clone()),
                    ("last_seen".to_string(), now),
                ],
            )
            .expire(client_key.as_str(), self.ttl)
            .sadd(members_key.as_str(), session.user_id.as_str())
            .expire(members_key.as_str(), self.ttl)
            .sadd(clients_key.as_str(), session.user_id.as_str())
            .expire(clients_key.as_str(), self.ttl)
            .sadd(keys::USERS_ONLINE, session.user_id.as_str());
        self.bus.exec(pipe).await
    }

    /// Refresh `last_seen` and the key TTLs. Runs every 30 s per session.
    pub async fn heartbeat(&self, session: &Session) -> BusResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let client_key = keys::client(&session.user_id);
        let pipe = BusPipeline::new()
            .hset(client_key.as_str(), vec![("last_seen".to_string(), now)])
            .expire(client_key.as_str(), self.ttl)
            .expire(keys::room_members(&session.room_id), self.ttl)
            .expire(keys::room_clients(&session.room_id), self.ttl);
        self.bus.exec(pipe).await
    }

    pub async fn unregister(&self, session: &Session) -> BusResult<()> {
        let client_key = keys::client(&session.user_id);
        // A newer connection may have replaced this user's presence entry;
        // its registration wins and this session leaves it alone.
        let current = self.bus.hgetall(&client_key).await?;
        if let Some(conn) = current.get("connection_id")
            && conn != &session.connection_id
        {
            return Ok(());
        }
        let pipe = BusPipeline::new()
            .del(client_key.as_str())
            .srem(keys::room_members(&session.room_id), session.user_id.as_str())
            .srem(keys::USERS_ONLINE, session.user_id.as_str());
        self.bus.exec(pipe).await
    }
}

/// Spawns the singleton presence reaper: sweeps `client:*` hashes every
/// `period` and expires entries whose heartbeat stopped more than
/// `stale_after` ago. Deployments run one instance of this task.
pub fn spawn_reaper(
    bus: Arc<Bus>,
    engine: Engine,
    db_path: String,
    stale_after: Duration,
    period: Duration,
) {
    tokio::spawn(async move {
        let db = match Db::open(&db_path) {
            Ok(db) => db,
            Err(e) => {
                eprintln!("⚠️  Reaper: failed to open DB: {e}");
                return;
            }
        };
        loop {
            tokio::time::sleep(period).await;
            sweep_stale(&bus, &engine, &db, stale_after).await;
        }
    });
}

/// One reaper pass. Returns how many presence entries were expired.
pub async fn sweep_stale(bus: &Bus, engine: &Engine, db: &Db, stale_after: Duration) -> usize {
    let client_keys = match bus.scan("client:*").await {
        Ok(keys) => keys,
        Err(e) => {
            eprintln!("⚠️  Reaper: presence scan failed: {e}");
            return 0;
        }
    };

    let now = chrono::Utc::now();
    let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
    let mut reaped = 0;

    for key in client_keys {
        let hash = match bus.hgetall(&key).await {
            Ok(h) => h,
            Err(_) => continue,
        };
        if hash.is_empty() {
            continue;
        }
        let Some(last_seen) = hash
            .get("last_seen")
            .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
        else {
            continue;
        };
        if now.signed_duration_since(last_seen.with_timezone(&chrono::Utc)) <= stale_after {
            continue;
        }

        let Some(user_id) = key.strip_prefix("client:") else {
            continue;
        };
        let room_id = hash.get("room_id").cloned().unwrap_or_default();
        let nickname = hash
            .get("nickname")
            .cloned()
            .unwrap_or_else(|| user_id.to_string());

        let mut pipe = BusPipeline::new()
            .del(key.as_str())
            .srem(keys::USERS_ONLINE, user_id);
        if !room_id.is_empty() {
            pipe = pipe.srem(keys::room_members(&room_id), user_id);
        }
        if let Err(e) = bus.exec(pipe).await {
            eprintln!("⚠️  Reaper: failed to expire {key}: {e}");
            continue;
        }
        if let Err(e) = db.set_user_activity(user_id, "offline") {
            eprintln!("⚠️  Reaper: activity update failed for {user_id}: {e}");
        }
        if !room_id.is_empty()
            && let Err(e) = engine
                .system_broadcast(db, &room_id, format!("{nickname} has disconnected (timeout)"))
                .await
        {
            eprintln!("⚠️  Reaper: disconnect broadcast failed for room {room_id}: {e}");
        }
        eprintln!("🧹 Reaper: expired presence for {user_id} (room {room_id})");
        reaped += 1;
    }

    reaped
}

/// Process-start reconciliation: everyone is offline except users with a
/// live presence hash on the bus.
pub async fn bootstrap_online(bus: &Bus, db: &Db) -> usize {
    if let Err(e) = db.mark_all_offline() {
        eprintln!("⚠️  Presence bootstrap: offline reset failed: {e}");
        return 0;
    }
    let client_keys = match bus.scan("client:*").await {
        Ok(keys) => keys,
        Err(e) => {
            eprintln!("⚠️  Presence bootstrap: scan failed: {e}");
            return 0;
        }
    };
    let mut online = 0;
    for key in client_keys {
        if let Some(user_id) = key.strip_prefix("client:")
            && db.set_user_activity(user_id, "online").is_ok()
        {
            online += 1;
        }
    }
    online
}
