use std::env;
use std::time::Duration;

/// Runtime configuration. All values read from environment variables with
/// sensible defaults.
///
/// Environment variables:
/// - `BUS_DSN` — Pub/sub endpoint, `redis://...` or `memory` (default: memory)
/// - `DATABASE_PATH` — SQLite file path (default: data/chat.db)
/// - `JWT_SECRET` — HS256 verification key; empty rejects every token
/// - `ALLOWED_ORIGINS` — CSV of origins accepted at the socket upgrade; empty allows any
/// - `REPLAY_COUNT` — Messages replayed to a new subscriber (default: 50)
/// - `MESSAGE_DELAY_MS` — Minimum gap between sends per user (default: 1500)
/// - `MAX_MESSAGE_LEN` — Max message length in characters (default: 5000)
/// - `PRESENCE_TTL_S` — TTL on presence keys (default: 86400)
/// - `STALE_AFTER_S` — Heartbeat age treated as disconnected (default: 120)
/// - `REAPER_PERIOD_S` — Presence sweep interval (default: 60)
///
/// The listening address is Rocket's own `ROCKET_ADDRESS`/`ROCKET_PORT`.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub bus_dsn: String,
    pub db_path: String,
    pub jwt_secret: String,
    pub allowed_origins: Vec<String>,
    pub replay_count: usize,
    pub message_delay: Duration,
    pub max_message_len: usize,
    pub presence_ttl: Duration,
    pub stale_after: Duration,
    pub reaper_period: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            bus_dsn: "memory".to_string(),
            db_path: "data/chat.db".to_string(),
            jwt_secret: String::new(),
            allowed_origins: Vec::new(),
            replay_count: 50,
            message_delay: Duration::from_millis(1500),
            max_message_len: 5000,
            presence_ttl: Duration::from_secs(86400),
            stale_after: Duration::from_secs(120),
            reaper_period: Duration::from_secs(60),
        }
    }
}

impl ChatConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("BUS_DSN")
            && !val.trim().is_empty()
        {
            config.bus_dsn = val.trim().to_string();
        }
        if let Ok(val) = env::var("DATABASE_PATH")
            && !val.trim().is_empty()
        {
            config.db_path = val.trim().to_string();
        }
        if let Ok(val) = env::var("JWT_SECRET") {
            config.jwt_secret = val;
        }
        if let Ok(val) = env::var("ALLOWED_ORIGINS") {
            config.allowed_origins = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(val) = env::var("REPLAY_COUNT")
            && let Ok(n) = val.parse::<usize>()
        {
            config.replay_count = n;
        }
        if let Ok(val) = env::var("MESSAGE_DELAY_MS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.message_delay = Duration::from_millis(n);
        }
        if let Ok(val) = env::var("MAX_MESSAGE_LEN")
            && let Ok(n) = val.parse::<usize>()
        {
            config.max_message_len = n;
        }
        if let Ok(val) = env::var("PRESENCE_TTL_S")
            && let Ok(n) = val.parse::<u64>()
        {
            config.presence_ttl = Duration::from_secs(n);
        }
        if let Ok(val) = env::var("STALE_AFTER_S")
            && let Ok(n) = val.parse::<u64>()
        {
            config.stale_after = Duration::from_secs(n);
        }
        if let Ok(val) = env::var("REAPER_PERIOD_S")
            && let Ok(n) = val.parse::<u64>()
        {
            config.reaper_period = Duration::from_secs(n);
        }

        config
    }

    /// True when `origin` passes the upgrade handshake check.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        match origin {
            Some(o) => self.allowed_origins.iter().any(|a| a == o),
            // Non-browser clients send no Origin header; only browsers are
            // subject to the origin allowlist.
            None => true,
        }
    }
}
