//! Message-related models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserRef;

/// Message type tag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    System,
    #[serde(other)]
    Other,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::System => "system",
            MessageType::Other => "other",
        }
    }
}

/// Attachment details carried by image messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

/// Read receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    #[serde(alias = "userId")]
    pub user: String,
    pub read_at: DateTime<Utc>,
}

/// Chat message as stored by the server.
///
/// Only `read_by` and `is_deleted` change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(alias = "conversation")]
    pub conversation_id: String,
    pub sender: UserRef,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    #[serde(default)]
    pub read_by: Vec<ReadReceipt>,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Borrowed view of what a message displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody<'a> {
    Text(&'a str),
    Image {
        url: &'a str,
        file_name: Option<&'a str>,
    },
    Deleted,
}

impl Message {
    pub fn body(&self) -> MessageBody<'_> {
        if self.is_deleted {
            return MessageBody::Deleted;
        }
        match self.message_type {
            MessageType::Image => {
                let meta = self.metadata.as_ref();
                let url = meta
                    .and_then(|m| m.image_url.as_deref())
                    .unwrap_or(&self.content);
                MessageBody::Image {
                    url,
                    file_name: meta.and_then(|m| m.file_name.as_deref()),
                }
            }
            _ => MessageBody::Text(&self.content),
        }
    }

    /// One-line rendering for terminal output.
    pub fn display_line(&self) -> String {
        let body = match self.body() {
            MessageBody::Text(text) => text.to_string(),
            MessageBody::Image { url, file_name } => match file_name {
                Some(name) => format!("[image {}] {}", name, url),
                None => format!("[image] {}", url),
            },
            MessageBody::Deleted => "(message deleted)".to_string(),
        };
        format!(
            "[{}] {} ({}): {}",
            self.created_at.format("%Y-%m-%d %H:%M"),
            self.sender.name,
            self.sender.role.as_str(),
            body
        )
    }
}
