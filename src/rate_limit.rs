use std::sync::Arc;
use std::time::Duration;

use crate::bus::{Bus, keys};

/// Per-user send limiter backed by the bus kv, so the limit holds across
/// server instances. The key stores the last accepted send as an
/// RFC3339Nano timestamp with TTL twice the delay window.
#[derive(Clone)]
pub struct RateLimiter {
    bus: Arc<Bus>,
    delay: Duration,
}

/// Outcome of a rate-limit check. `wait` is how long the user must hold off
/// before the next send is accepted; zero when allowed.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub wait: Duration,
}

impl RateLimiter {
    pub fn new(bus: Arc<Bus>, delay: Duration) -> Self {
        RateLimiter { bus, delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Missing or aged entry: allowed, stamp rewritten. Fresh entry: refused
    /// with the remaining wait. Bus failures fail open.
    pub async fn check(&self, user_id: &str) -> RateLimitDecision {
        let key = keys::rate_limit(user_id);
        let now = chrono::Utc::now();

        let last = match self.bus.get(&key).await {
            Ok(v) => v,
            Err(e) => {
                eprintln!("⚠️  Rate limiter: bus read failed for {user_id}: {e}");
                None
            }
        };

        if let Some(raw) = last
            && let Ok(ts) = chrono::DateTime::parse_from_rfc3339(&raw)
        {
            let elapsed = now.signed_duration_since(ts.with_timezone(&chrono::Utc));
            let delay = chrono::Duration::from_std(self.delay).unwrap_or(chrono::Duration::MAX);
            if elapsed >= chrono::Duration::zero() && elapsed < delay {
                let wait = (delay - elapsed).to_std().unwrap_or_default();
                return RateLimitDecision { allowed: false, wait };
            }
        }

        let stamp = now.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
        if let Err(e) = self.bus.set_with_ttl(&key, &stamp, self.delay * 2).await {
            eprintln!("⚠️  Rate limiter: bus write failed for {user_id}: {e}");
        }

        RateLimitDecision { allowed: true, wait: Duration::ZERO }
    }
}
