use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::mpsc;

/// Shared-state key layout. Literal and stable; other processes and the
/// legacy tooling address the same keys.
pub mod keys {
    pub const USERS_ONLINE: &str = "users:online";

    /// Historical index of every user that ever connected to the room.
    pub fn room_clients(room_id: &str) -> String {
        format!("room:{room_id}:clients")
    }

    /// Currently connected users of the room.
    pub fn room_members(room_id: &str) -> String {
        format!("room:{room_id}:members")
    }

    /// Replay buffer: sorted set scored by unix seconds.
    pub fn room_history(room_id: &str) -> String {
        format!("room:{room_id}:history")
    }

    /// Pub/sub topic for live fan-out.
    pub fn room_topic(room_id: &str) -> String {
        format!("room:{room_id}")
    }

    /// Presence hash for one user.
    pub fn client(user_id: &str) -> String {
        format!("client:{user_id}")
    }

    pub fn rate_limit(user_id: &str) -> String {
        format!("rate_limit:{user_id}:last_msg")
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type BusResult<T> = Result<T, BusError>;

/// A live pub/sub subscription. Payloads arrive in publish order; dropping
/// the subscription closes it (and stops the Redis forwarder task).
pub struct Subscription {
    rx: mpsc::Receiver<String>,
    forwarder: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}

/// Commands batched atomically-per-connection (MULTI/EXEC on Redis, one
/// lock acquisition on the memory backend). No multi-key transaction
/// semantics beyond that.
#[derive(Debug, Default)]
pub struct BusPipeline {
    cmds: Vec<PipeCmd>,
}

#[derive(Debug)]
enum PipeCmd {
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    HSet { key: String, fields: Vec<(String, String)> },
    Expire { key: String, ttl: Duration },
    Del { key: String },
}

impl BusPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sadd(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.cmds.push(PipeCmd::SAdd { key: key.into(), member: member.into() });
        self
    }

    pub fn srem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.cmds.push(PipeCmd::SRem { key: key.into(), member: member.into() });
        self
    }

    pub fn hset(mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        self.cmds.push(PipeCmd::HSet { key: key.into(), fields });
        self
    }

    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.cmds.push(PipeCmd::Expire { key: key.into(), ttl });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.cmds.push(PipeCmd::Del { key: key.into() });
        self
    }
}

/// The only shared-state dependency of the core. Redis in production; the
/// memory backend keeps identical semantics for `BUS_DSN=memory` and the
/// test suite.
pub enum Bus {
    Redis(RedisBus),
    Memory(MemoryBus),
}

impl Bus {
    pub async fn connect(dsn: &str) -> BusResult<Bus> {
        if dsn == "memory" {
            Ok(Bus::Memory(MemoryBus::new()))
        } else {
            Ok(Bus::Redis(RedisBus::connect(dsn).await?))
        }
    }

    pub fn memory() -> Bus {
        Bus::Memory(MemoryBus::new())
    }

    pub async fn publish(&self, topic: &str, payload: &str) -> BusResult<()> {
        match self {
            Bus::Redis(r) => {
                let mut conn = r.conn.clone();
                let _: () = conn.publish(topic, payload).await?;
                Ok(())
            }
            Bus::Memory(m) => {
                m.publish(topic, payload);
                Ok(())
            }
        }
    }

    pub async fn subscribe(&self, topic: &str) -> BusResult<Subscription> {
        match self {
            Bus::Redis(r) => r.subscribe(topic).await,
            Bus::Memory(m) => Ok(m.subscribe(topic)),
        }
    }

    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> BusResult<()> {
        match self {
            Bus::Redis(r) => {
                let mut conn = r.conn.clone();
                let _: () = conn.zadd(key, member, score).await?;
                Ok(())
            }
            Bus::Memory(m) => {
                m.zadd(key, score, member);
                Ok(())
            }
        }
    }

    /// Newest `limit` members by score, highest score first.
    pub async fn zrevrangebyscore(&self, key: &str, limit: usize) -> BusResult<Vec<String>> {
        match self {
            Bus::Redis(r) => {
                let mut conn = r.conn.clone();
                let members: Vec<String> = conn
                    .zrevrangebyscore_limit(key, "+inf", "-inf", 0, limit as isize)
                    .await?;
                Ok(members)
            }
            Bus::Memory(m) => Ok(m.zrevrangebyscore(key, limit)),
        }
    }

    /// Trim a sorted set to its newest `keep` members.
    pub async fn ztrim(&self, key: &str, keep: usize) -> BusResult<()> {
        match self {
            Bus::Redis(r) => {
                let mut conn = r.conn.clone();
                let stop = -(keep as isize) - 1;
                let _: () = conn.zremrangebyrank(key, 0, stop).await?;
                Ok(())
            }
            Bus::Memory(m) => {
                m.ztrim(key, keep);
                Ok(())
            }
        }
    }

    pub async fn sadd(&self, key: &str, member: &str) -> BusResult<()> {
        match self {
            Bus::Redis(r) => {
                let mut conn = r.conn.clone();
                let _: () = conn.sadd(key, member).await?;
                Ok(())
            }
            Bus::Memory(m) => {
                m.sadd(key, member);
                Ok(())
            }
        }
    }

    pub async fn srem(&self, key: &str, member: &str) -> BusResult<()> {
        match self {
            Bus::Redis(r) => {
                let mut conn = r.conn.clone();
                let _: () = conn.srem(key, member).await?;
                Ok(())
            }
            Bus::Memory(m) => {
                m.srem(key, member);
                Ok(())
            }
        }
    }

    pub async fn scard(&self, key: &str) -> BusResult<i64> {
        match self {
            Bus::Redis(r) => {
                let mut conn = r.conn.clone();
                let n: i64 = conn.scard(key).await?;
                Ok(n)
            }
            Bus::Memory(m) => Ok(m.scard(key)),
        }
    }

    pub async fn smembers(&self, key: &str) -> BusResult<Vec<String>> {
        match self {
            Bus::Redis(r) => {
                let mut conn = r.conn.clone();
                let members: Vec<String> = conn.smembers(key).await?;
                Ok(members)
            }
            Bus::Memory(m) => Ok(m.smembers(key)),
        }
    }

    pub async fn hset(&self, key: &str, fields: &[(String, String)]) -> BusResult<()> {
        match self {
            Bus::Redis(r) => {
                let mut conn = r.conn.clone();
                let _: () = conn.hset_multiple(key, fields).await?;
                Ok(())
            }
            Bus::Memory(m) => {
                m.hset(key, fields);
                Ok(())
            }
        }
    }

    pub async fn hgetall(&self, key: &str) -> BusResult<HashMap<String, String>> {
        match self {
            Bus::Redis(r) => {
                let mut conn = r.conn.clone();
                let map: HashMap<String, String> = conn.hgetall(key).await?;
                Ok(map)
            }
            Bus::Memory(m) => Ok(m.hgetall(key)),
        }
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> BusResult<()> {
        match self {
            Bus::Redis(r) => {
                let mut conn = r.conn.clone();
                let _: () = conn.expire(key, ttl.as_secs() as i64).await?;
                Ok(())
            }
            Bus::Memory(m) => {
                m.expire(key, ttl);
                Ok(())
            }
        }
    }

    pub async fn del(&self, key: &str) -> BusResult<()> {
        match self {
            Bus::Redis(r) => {
                let mut conn = r.conn.clone();
                let _: () = conn.del(key).await?;
                Ok(())
            }
            Bus::Memory(m) => {
                m.del(key);
                Ok(())
            }
        }
    }

    pub async fn get(&self, key: &str) -> BusResult<Option<String>> {
        match self {
            Bus::Redis(r) => {
                let mut conn = r.conn.clone();
                let val: Option<String> = conn.get(key).await?;
                Ok(val)
            }
            Bus::Memory(m) => Ok(m.get(key)),
        }
    }

    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BusResult<()> {
        match self {
            Bus::Redis(r) => {
                let mut conn = r.conn.clone();
                let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
                Ok(())
            }
            Bus::Memory(m) => {
                m.set_with_ttl(key, value, ttl);
                Ok(())
            }
        }
    }

    /// Cursor-based key scan. Collects every key matching `pattern`.
    pub async fn scan(&self, pattern: &str) -> BusResult<Vec<String>> {
        match self {
            Bus::Redis(r) => {
                let mut conn = r.conn.clone();
                let mut keys = Vec::new();
                let mut cursor: u64 = 0;
                loop {
                    let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn)
                        .await?;
                    keys.extend(batch);
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                Ok(keys)
            }
            Bus::Memory(m) => Ok(m.scan(pattern)),
        }
    }

    pub async fn exec(&self, pipeline: BusPipeline) -> BusResult<()> {
        match self {
            Bus::Redis(r) => {
                let mut pipe = redis::pipe();
                pipe.atomic();
                for cmd in &pipeline.cmds {
                    match cmd {
                        PipeCmd::SAdd { key, member } => {
                            pipe.sadd(key, member).ignore();
                        }
                        PipeCmd::SRem { key, member } => {
                            pipe.srem(key, member).ignore();
                        }
                        PipeCmd::HSet { key, fields } => {
                            pipe.hset_multiple(key, fields).ignore();
                        }
                        PipeCmd::Expire { key, ttl } => {
                            pipe.expire(key, ttl.as_secs() as i64).ignore();
                        }
                        PipeCmd::Del { key } => {
                            pipe.del(key).ignore();
                        }
                    }
                }
                let mut conn = r.conn.clone();
                let _: () = pipe.query_async(&mut conn).await?;
                Ok(())
            }
            Bus::Memory(m) => {
                m.exec(pipeline);
                Ok(())
            }
        }
    }
}

pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBus {
    /// Fails when the server is unreachable; callers treat that as fatal
    /// for process startup.
    pub async fn connect(dsn: &str) -> BusResult<Self> {
        let client = redis::Client::open(dsn)?;
        let conn = client.get_connection_manager().await?;
        Ok(RedisBus { client, conn })
    }

    async fn subscribe(&self, topic: &str) -> BusResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        let (tx, rx) = mpsc::channel(1024);
        let forwarder = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription { rx, forwarder: Some(forwarder) })
    }
}

/// Single-process backend with the same observable semantics as the Redis
/// one: lazy TTL expiry, stable ordering for equal sorted-set scores,
/// bounded per-subscriber buffers that drop frames for slow consumers.
pub struct MemoryBus {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    topics: HashMap<String, Vec<mpsc::Sender<String>>>,
    zsets: HashMap<String, Vec<(f64, String)>>,
    sets: HashMap<String, HashSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
    expiries: HashMap<String, Instant>,
}

impl MemoryState {
    fn drop_if_expired(&mut self, key: &str) {
        if let Some(deadline) = self.expiries.get(key)
            && *deadline <= Instant::now()
        {
            self.expiries.remove(key);
            self.zsets.remove(key);
            self.sets.remove(key);
            self.hashes.remove(key);
            self.strings.remove(key);
        }
    }

    fn key_exists(&self, key: &str) -> bool {
        self.zsets.contains_key(key)
            || self.sets.contains_key(key)
            || self.hashes.contains_key(key)
            || self.strings.contains_key(key)
    }

    fn apply(&mut self, cmd: &PipeCmd) {
        match cmd {
            PipeCmd::SAdd { key, member } => {
                self.drop_if_expired(key);
                self.sets.entry(key.clone()).or_default().insert(member.clone());
            }
            PipeCmd::SRem { key, member } => {
                self.drop_if_expired(key);
                if let Some(set) = self.sets.get_mut(key) {
                    set.remove(member);
                }
            }
            PipeCmd::HSet { key, fields } => {
                self.drop_if_expired(key);
                let hash = self.hashes.entry(key.clone()).or_default();
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
            }
            PipeCmd::Expire { key, ttl } => {
                if self.key_exists(key) {
                    self.expiries.insert(key.clone(), Instant::now() + *ttl);
                }
            }
            PipeCmd::Del { key } => {
                self.expiries.remove(key);
                self.zsets.remove(key);
                self.sets.remove(key);
                self.hashes.remove(key);
                self.strings.remove(key);
            }
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        MemoryBus { state: Mutex::new(MemoryState::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, topic: &str, payload: &str) {
        let mut state = self.lock();
        if let Some(senders) = state.topics.get_mut(topic) {
            senders.retain(|tx| {
                match tx.try_send(payload.to_string()) {
                    Ok(()) => true,
                    // Slow consumer: drop this frame, keep the subscriber.
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(1024);
        self.lock().topics.entry(topic.to_string()).or_default().push(tx);
        Subscription { rx, forwarder: None }
    }

    fn zadd(&self, key: &str, score: f64, member: &str) {
        let mut state = self.lock();
        state.drop_if_expired(key);
        let zset = state.zsets.entry(key.to_string()).or_default();
        zset.retain(|(_, m)| m != member);
        zset.push((score, member.to_string()));
        zset.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    }

    fn zrevrangebyscore(&self, key: &str, limit: usize) -> Vec<String> {
        let mut state = self.lock();
        state.drop_if_expired(key);
        state
            .zsets
            .get(key)
            .map(|zset| zset.iter().rev().take(limit).map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }

    fn ztrim(&self, key: &str, keep: usize) {
        let mut state = self.lock();
        state.drop_if_expired(key);
        if let Some(zset) = state.zsets.get_mut(key)
            && zset.len() > keep
        {
            let excess = zset.len() - keep;
            zset.drain(0..excess);
        }
    }

    fn sadd(&self, key: &str, member: &str) {
        self.lock().apply(&PipeCmd::SAdd { key: key.to_string(), member: member.to_string() });
    }

    fn srem(&self, key: &str, member: &str) {
        self.lock().apply(&PipeCmd::SRem { key: key.to_string(), member: member.to_string() });
    }

    fn scard(&self, key: &str) -> i64 {
        let mut state = self.lock();
        state.drop_if_expired(key);
        state.sets.get(key).map(|s| s.len() as i64).unwrap_or(0)
    }

    fn smembers(&self, key: &str) -> Vec<String> {
        let mut state = self.lock();
        state.drop_if_expired(key);
        state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn hset(&self, key: &str, fields: &[(String, String)]) {
        self.lock().apply(&PipeCmd::HSet { key: key.to_string(), fields: fields.to_vec() });
    }

    fn hgetall(&self, key: &str) -> HashMap<String, String> {
        let mut state = self.lock();
        state.drop_if_expired(key);
        state.hashes.get(key).cloned().unwrap_or_default()
    }

    fn expire(&self, key: &str, ttl: Duration) {
        self.lock().apply(&PipeCmd::Expire { key: key.to_string(), ttl });
    }

    fn del(&self, key: &str) {
        self.lock().apply(&PipeCmd::Del { key: key.to_string() });
    }

    fn get(&self, key: &str) -> Option<String> {
        let mut state = self.lock();
        state.drop_if_expired(key);
        state.strings.get(key).cloned()
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) {
        let mut state = self.lock();
        state.strings.insert(key.to_string(), value.to_string());
        state.expiries.insert(key.to_string(), Instant::now() + ttl);
    }

    fn scan(&self, pattern: &str) -> Vec<String> {
        let mut state = self.lock();
        let all: Vec<String> = state
            .zsets
            .keys()
            .chain(state.sets.keys())
            .chain(state.hashes.keys())
            .chain(state.strings.keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        let mut out = Vec::new();
        for key in all {
            state.drop_if_expired(&key);
            if state.key_exists(&key) && !out.contains(&key) {
                out.push(key);
            }
        }
        out
    }

    fn exec(&self, pipeline: BusPipeline) {
        let mut state = self.lock();
        for cmd in &pipeline.cmds {
            state.apply(cmd);
        }
    }
}

/// Minimal glob: a single trailing `*` wildcard, which is all the key
/// layout needs (`client:*`).
fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => pattern == key,
    }
}
