//! Conversation summary models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageType, UserRef};

/// Snapshot of the newest message, as embedded in a conversation summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Conversation summary (read-only, derived server-side)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub participants: Vec<UserRef>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Display name: the customer participant, else the first participant, else the id.
    pub fn display_name(&self) -> String {
        self.participants
            .iter()
            .find(|p| p.role == super::UserRole::Customer)
            .or_else(|| self.participants.first())
            .map(|p| p.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.id.clone())
    }
}
