use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bus::{Bus, BusError, keys};
use crate::config::ChatConfig;
use crate::db::Db;
use crate::models::ChatMessage;
use crate::rate_limit::{RateLimitDecision, RateLimiter};

/// Private reply sent to a non-holder trying to speak in a locked room.
pub const ROOM_LOCKED_REPLY: &str = "Room is locked. Messages cannot be sent.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Locked,
    Unlocked,
    Forbidden,
    NotFound,
}

/// Result of the lock gate on an inbound text message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextGate {
    /// The message may be broadcast (any implicit unlock already happened).
    Clear,
    /// The room is locked by someone else; the message is dropped.
    Refused,
}

/// Room state engine: broadcast pipeline, lock state machine, replay reads.
/// Cheap to clone; all clones share the per-room lock registry.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    bus: Arc<Bus>,
    rate_limiter: RateLimiter,
    replay_count: usize,
    max_message_len: usize,
    history_ttl: Duration,
    room_guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Engine {
    pub fn new(bus: Arc<Bus>, cfg: &ChatConfig) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                rate_limiter: RateLimiter::new(bus.clone(), cfg.message_delay),
                bus,
                replay_count: cfg.replay_count,
                max_message_len: cfg.max_message_len,
                history_ttl: cfg.presence_ttl,
                room_guards: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn replay_count(&self) -> usize {
        self.inner.replay_count
    }

    pub fn max_message_len(&self) -> usize {
        self.inner.max_message_len
    }

    pub async fn check_rate(&self, user_id: &str) -> RateLimitDecision {
        self.inner.rate_limiter.check(user_id).await
    }

    /// Lock transitions serialize per room; taking the guard here keeps the
    /// read-modify-write window consistent at room granularity.
    fn room_guard(&self, room_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut guards = self
            .inner
            .room_guards
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guards.entry(room_id.to_string()).or_default().clone()
    }

    /// Persist-then-publish. The durable append and the replay-buffer write
    /// are best effort; only the publish result reaches the caller.
    pub async fn broadcast(&self, db: &Db, msg: &ChatMessage) -> Result<(), BusError> {
        if let Err(e) = db.append_message(msg) {
            eprintln!("⚠️  History append failed for room {}: {e}", msg.room_id);
        }

        let payload = serde_json::to_string(msg).unwrap();
        let history_key = keys::room_history(&msg.room_id);
        match self
            .inner
            .bus
            .zadd(&history_key, score_for(&msg.timestamp), &payload)
            .await
        {
            Ok(()) => {
                let _ = self.inner.bus.ztrim(&history_key, self.inner.replay_count).await;
                let _ = self.inner.bus.expire(&history_key, self.inner.history_ttl).await;
            }
            Err(e) => {
                eprintln!("⚠️  Replay buffer append failed for room {}: {e}", msg.room_id);
            }
        }

        self.inner
            .bus
            .publish(&keys::room_topic(&msg.room_id), &payload)
            .await
    }

    pub async fn system_broadcast(
        &self,
        db: &Db,
        room_id: &str,
        content: impl Into<String>,
    ) -> Result<(), BusError> {
        self.broadcast(db, &ChatMessage::system(room_id, content)).await
    }

    /// Lock state machine driven from the moderation endpoint.
    pub async fn try_lock(
        &self,
        db: &Db,
        room_id: &str,
        user_id: &str,
    ) -> rusqlite::Result<LockOutcome> {
        let guard = self.room_guard(room_id);
        let _held = guard.lock().await;

        let Some(room) = db.get_room(room_id)? else {
            return Ok(LockOutcome::NotFound);
        };
        if !room.is_member(user_id) {
            return Ok(LockOutcome::Forbidden);
        }
        let nickname = room.member_nickname(user_id).unwrap_or(user_id).to_string();

        if room.locked_by.is_empty() {
            db.update_room_locked(room_id, user_id)?;
            if let Err(e) = self
                .system_broadcast(db, room_id, format!("Room has been locked by {nickname}"))
                .await
            {
                eprintln!("⚠️  Lock broadcast failed for room {room_id}: {e}");
            }
            Ok(LockOutcome::Locked)
        } else if room.locked_by == user_id {
            db.update_room_locked(room_id, "")?;
            if let Err(e) = self
                .system_broadcast(db, room_id, format!("Room has been unlocked by {nickname}"))
                .await
            {
                eprintln!("⚠️  Unlock broadcast failed for room {room_id}: {e}");
            }
            Ok(LockOutcome::Unlocked)
        } else {
            Ok(LockOutcome::Forbidden)
        }
    }

    /// Lock gate for an inbound text message: the holder sending implicitly
    /// unlocks the room (with the system broadcast), anyone else is refused
    /// while a lock is held.
    pub async fn gate_text(
        &self,
        db: &Db,
        room_id: &str,
        user_id: &str,
        nickname: &str,
    ) -> rusqlite::Result<TextGate> {
        let guard = self.room_guard(room_id);
        let _held = guard.lock().await;

        let Some(room) = db.get_room(room_id)? else {
            return Ok(TextGate::Clear);
        };

        if room.locked_by.is_empty() {
            return Ok(TextGate::Clear);
        }
        if room.locked_by == user_id {
            db.update_room_locked(room_id, "")?;
            if let Err(e) = self
                .system_broadcast(db, room_id, format!("Room has been unlocked by {nickname}"))
                .await
            {
                eprintln!("⚠️  Unlock broadcast failed for room {room_id}: {e}");
            }
            return Ok(TextGate::Clear);
        }
        Ok(TextGate::Refused)
    }

    /// Newest `count` messages of the room's replay buffer, oldest first.
    /// Entries that fail to decode are skipped.
    pub async fn load_replay(&self, room_id: &str, count: usize) -> Vec<ChatMessage> {
        let raw = match self
            .inner
            .bus
            .zrevrangebyscore(&keys::room_history(room_id), count)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                eprintln!("⚠️  Replay read failed for room {room_id}: {e}");
                return Vec::new();
            }
        };
        let mut messages: Vec<ChatMessage> = raw
            .iter()
            .filter_map(|payload| serde_json::from_str(payload).ok())
            .collect();
        messages.reverse();
        messages
    }
}

/// Replay-buffer score: unix seconds with a fractional part so same-second
/// messages keep their order.
fn score_for(timestamp: &str) -> f64 {
    chrono::DateTime::parse_from_rfc3339(timestamp)
        .map(|t| t.timestamp_millis() as f64 / 1000.0)
        .unwrap_or_else(|_| chrono::Utc::now().timestamp_millis() as f64 / 1000.0)
}
