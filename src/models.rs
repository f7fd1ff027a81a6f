use serde::{Deserialize, Serialize};

/// Key inside a frame's metadata bag that carries the producing connection's id.
/// The inbound path overwrites it before broadcast, so clients cannot spoof it.
pub const METADATA_CONNECTION_ID: &str = "connectionID";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> MessageKind {
        match s {
            "system" => MessageKind::System,
            _ => MessageKind::Text,
        }
    }
}

/// Wire frame, both directions. Client-to-server frames only need `type` and
/// `content`; the server fills the rest authoritatively before broadcast.
/// Unknown metadata keys are preserved on re-emit.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatMessage {
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ChatMessage {
    /// Server-generated system message addressed to a room. `sender_id` stays
    /// empty by construction.
    pub fn system(room_id: &str, content: impl Into<String>) -> Self {
        ChatMessage {
            kind: MessageKind::System,
            content: content.into(),
            room_id: room_id.to_string(),
            sender_id: String::new(),
            nickname: String::new(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.metadata
            .get(METADATA_CONNECTION_ID)
            .and_then(|v| v.as_str())
    }

    pub fn set_connection_id(&mut self, connection_id: &str) {
        self.metadata.insert(
            METADATA_CONNECTION_ID.to_string(),
            serde_json::Value::String(connection_id.to_string()),
        );
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Member {
    pub user_id: String,
    pub nickname: String,
    pub joined_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Room {
    pub id: String,
    pub members: Vec<Member>,
    pub locked_by: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Room {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }

    pub fn member_nickname(&self, user_id: &str) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.user_id == user_id)
            .map(|m| m.nickname.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RoomSummary {
    pub id: String,
    pub member_count: i64,
    pub locked_by: String,
    pub message_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterUser {
    pub user_id: String,
    pub nickname: String,
}

#[derive(Debug, Deserialize)]
pub struct LockRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesPage {
    pub messages: Vec<ChatMessage>,
    pub count: usize,
    pub page: i64,
    pub limit: i64,
}

/// Claims carried by the collaborator-issued bearer token. The core treats
/// them as opaque identity; only signature and expiry are checked.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub nickname: String,
    pub exp: usize,
}
