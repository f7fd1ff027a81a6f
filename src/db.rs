use rusqlite::{Connection, OptionalExtension, params};
use std::sync::{Mutex, MutexGuard};

use crate::models::{ChatMessage, Member, MessageKind, Room, RoomSummary};

pub struct Db {
    pub conn: Mutex<Connection>,
}

impl Db {
    pub fn new(path: &str) -> Self {
        Self::open(path).expect("Failed to open database")
    }

    /// Fallible variant for background tasks that open their own handle.
    pub fn open(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) -> rusqlite::Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rooms (
                id TEXT PRIMARY KEY,
                locked_by TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS room_members (
                room_id TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                nickname TEXT NOT NULL,
                joined_at TEXT NOT NULL,
                PRIMARY KEY (room_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                nickname TEXT NOT NULL,
                activity TEXT NOT NULL DEFAULT 'offline',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                sender_id TEXT NOT NULL DEFAULT '',
                nickname TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'text',
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_room_timestamp ON messages(room_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
            CREATE INDEX IF NOT EXISTS idx_room_members_user ON room_members(user_id);",
        )
    }

    /// Durable append of a broadcast frame. Callers treat failures as
    /// best-effort (logged, not propagated to the sender).
    pub fn append_message(&self, msg: &ChatMessage) -> rusqlite::Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO messages (id, room_id, sender_id, nickname, content, kind, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                uuid::Uuid::new_v4().to_string(),
                &msg.room_id,
                &msg.sender_id,
                &msg.nickname,
                &msg.content,
                msg.kind.as_str(),
                &msg.timestamp,
            ],
        )?;
        conn.execute(
            "UPDATE rooms SET updated_at = ?1 WHERE id = ?2",
            params![&msg.timestamp, &msg.room_id],
        )
        .ok();
        Ok(())
    }

    /// Paged history for a room. `ascending=false` returns newest first.
    pub fn list_messages(
        &self,
        room_id: &str,
        limit: i64,
        skip: i64,
        ascending: bool,
    ) -> rusqlite::Result<Vec<ChatMessage>> {
        let conn = self.conn();
        let sql = if ascending {
            "SELECT room_id, sender_id, nickname, content, kind, timestamp
             FROM messages WHERE room_id = ?1 ORDER BY timestamp ASC, rowid ASC LIMIT ?2 OFFSET ?3"
        } else {
            "SELECT room_id, sender_id, nickname, content, kind, timestamp
             FROM messages WHERE room_id = ?1 ORDER BY timestamp DESC, rowid DESC LIMIT ?2 OFFSET ?3"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![room_id, limit, skip], |row| {
            let kind: String = row.get(4)?;
            Ok(ChatMessage {
                kind: MessageKind::parse(&kind),
                content: row.get(3)?,
                room_id: row.get(0)?,
                sender_id: row.get(1)?,
                nickname: row.get(2)?,
                timestamp: row.get(5)?,
                metadata: serde_json::Map::new(),
            })
        })?;
        rows.collect()
    }

    pub fn get_room(&self, room_id: &str) -> rusqlite::Result<Option<Room>> {
        let conn = self.conn();
        let room = conn
            .query_row(
                "SELECT id, locked_by, created_at, updated_at FROM rooms WHERE id = ?1",
                params![room_id],
                |row| {
                    Ok(Room {
                        id: row.get(0)?,
                        members: Vec::new(),
                        locked_by: row.get(1)?,
                        created_at: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;

        let Some(mut room) = room else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT user_id, nickname, joined_at FROM room_members WHERE room_id = ?1 ORDER BY joined_at ASC",
        )?;
        let members = stmt.query_map(params![room_id], |row| {
            Ok(Member {
                user_id: row.get(0)?,
                nickname: row.get(1)?,
                joined_at: row.get(2)?,
            })
        })?;
        room.members = members.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some(room))
    }

    /// Single-field SET of the room lock holder; last writer wins by design
    /// of the lock state machine's persistence contract.
    pub fn update_room_locked(&self, room_id: &str, user_id: &str) -> rusqlite::Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "UPDATE rooms SET locked_by = ?1, updated_at = ?2 WHERE id = ?3",
            params![user_id, &now, room_id],
        )?;
        Ok(())
    }

    /// Authorize a user into a room: creates the room on first registration,
    /// creates the user row if the external id is new, inserts the member.
    /// Re-registration is a no-op on the member row.
    pub fn add_member(&self, room_id: &str, user_id: &str, nickname: &str) -> rusqlite::Result<Room> {
        let now = chrono::Utc::now().to_rfc3339();
        {
            let conn = self.conn();
            conn.execute(
                "INSERT OR IGNORE INTO rooms (id, locked_by, created_at, updated_at) VALUES (?1, '', ?2, ?2)",
                params![room_id, &now],
            )?;
            conn.execute(
                "INSERT INTO users (id, external_id, nickname, activity, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'offline', ?4, ?4)
                 ON CONFLICT(external_id) DO UPDATE SET nickname = excluded.nickname, updated_at = excluded.updated_at",
                params![uuid::Uuid::new_v4().to_string(), user_id, nickname, &now],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO room_members (room_id, user_id, nickname, joined_at) VALUES (?1, ?2, ?3, ?4)",
                params![room_id, user_id, nickname, &now],
            )?;
            conn.execute(
                "UPDATE rooms SET updated_at = ?1 WHERE id = ?2",
                params![&now, room_id],
            )?;
        }
        match self.get_room(room_id)? {
            Some(room) => Ok(room),
            None => Err(rusqlite::Error::QueryReturnedNoRows),
        }
    }

    pub fn set_user_activity(&self, user_id: &str, activity: &str) -> rusqlite::Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "UPDATE users SET activity = ?1, updated_at = ?2 WHERE external_id = ?3",
            params![activity, &now, user_id],
        )?;
        Ok(())
    }

    pub fn mark_all_offline(&self) -> rusqlite::Result<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "UPDATE users SET activity = 'offline', updated_at = ?1 WHERE activity != 'offline'",
            params![&now],
        )
    }

    pub fn list_rooms(&self) -> rusqlite::Result<Vec<RoomSummary>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.locked_by, r.created_at, r.updated_at,
                    (SELECT COUNT(*) FROM room_members WHERE room_id = r.id) as member_count,
                    (SELECT COUNT(*) FROM messages WHERE room_id = r.id) as message_count,
                    (SELECT MAX(timestamp) FROM messages WHERE room_id = r.id) as last_activity
             FROM rooms r ORDER BY last_activity IS NULL, last_activity DESC, r.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RoomSummary {
                id: row.get(0)?,
                locked_by: row.get(1)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
                member_count: row.get(4)?,
                message_count: row.get(5)?,
                last_activity: row.get(6)?,
            })
        })?;
        rows.collect()
    }
}
