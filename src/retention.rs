use rusqlite::params;

use crate::db::Db;

/// Interval between retention sweeps (seconds).
const RETENTION_INTERVAL_SECS: u64 = 3600;

/// Messages are retained for this long; the sweep below is the SQLite
/// realization of a TTL index on `messages.timestamp`.
const MESSAGE_TTL_DAYS: i64 = 90;

/// Spawns a background task that periodically prunes messages past the
/// retention window.
pub fn spawn_retention_task(db_path: String) {
    tokio::spawn(async move {
        let db = match Db::open(&db_path) {
            Ok(db) => db,
            Err(e) => {
                eprintln!("⚠️  Retention task: failed to open DB: {e}");
                return;
            }
        };

        // Initial delay: let the server start up before the first sweep
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;

        loop {
            let pruned = run_retention(&db);
            if pruned > 0 {
                eprintln!("🧹 Retention: pruned {pruned} messages older than {MESSAGE_TTL_DAYS} days");
            }
            tokio::time::sleep(std::time::Duration::from_secs(RETENTION_INTERVAL_SECS)).await;
        }
    });
}

/// Execute one retention sweep. Returns the number of messages pruned.
pub fn run_retention(db: &Db) -> i64 {
    let cutoff = (chrono::Utc::now() - chrono::Duration::days(MESSAGE_TTL_DAYS)).to_rfc3339();
    let conn = db.conn();
    match conn.execute("DELETE FROM messages WHERE timestamp < ?1", params![cutoff]) {
        Ok(n) => n as i64,
        Err(e) => {
            eprintln!("⚠️  Retention sweep failed: {e}");
            0
        }
    }
}
