//! Typed socket events, both directions

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ChatError, ChatResult};
use crate::models::{Message, MessageMetadata, MessageType};

/// Transport-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Payload of `image-message-sent`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageAck {
    pub success: bool,
    /// The stored message on success, an error string on failure.
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ImageAck {
    pub fn into_message(self) -> ChatResult<Message> {
        if !self.success {
            let reason = self
                .error
                .or_else(|| self.message.and_then(|m| m.as_str().map(String::from)))
                .unwrap_or_else(|| "image was not stored".to_string());
            return Err(ChatError::Rejected(reason));
        }
        let value = self
            .message
            .ok_or_else(|| ChatError::Decode("image ack without message".to_string()))?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Payload of `user-typing`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    pub is_typing: bool,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Payload of `user-joined` / `user-left`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageEnvelope {
    Wrapped { message: Message },
    Bare(Message),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JoinedPayload {
    Object {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    Id(String),
}

/// Everything a subscriber can observe from the transport.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    MessageReceived(Message),
    ImageMessageReceived(Message),
    ImageMessageSent(ImageAck),
    UserTyping(TypingEvent),
    UserJoined(PresenceEvent),
    UserLeft(PresenceEvent),
    ConversationJoined(String),
    Error(String),
    ConnectionChange(ConnectionState),
}

/// Subscription key; one per `SocketEvent` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    MessageReceived,
    ImageMessageReceived,
    ImageMessageSent,
    UserTyping,
    UserJoined,
    UserLeft,
    ConversationJoined,
    Error,
    ConnectionChange,
}

impl SocketEvent {
    pub fn topic(&self) -> Topic {
        match self {
            SocketEvent::MessageReceived(_) => Topic::MessageReceived,
            SocketEvent::ImageMessageReceived(_) => Topic::ImageMessageReceived,
            SocketEvent::ImageMessageSent(_) => Topic::ImageMessageSent,
            SocketEvent::UserTyping(_) => Topic::UserTyping,
            SocketEvent::UserJoined(_) => Topic::UserJoined,
            SocketEvent::UserLeft(_) => Topic::UserLeft,
            SocketEvent::ConversationJoined(_) => Topic::ConversationJoined,
            SocketEvent::Error(_) => Topic::Error,
            SocketEvent::ConnectionChange(_) => Topic::ConnectionChange,
        }
    }

    /// Map a server-sent Socket.IO event. Unknown event names yield `None`.
    pub fn from_wire(name: &str, data: Value) -> ChatResult<Option<Self>> {
        let event = match name {
            "message-received" => SocketEvent::MessageReceived(parse_message(data)?),
            "image-message-received" => SocketEvent::ImageMessageReceived(parse_message(data)?),
            "image-message-sent" => SocketEvent::ImageMessageSent(serde_json::from_value(data)?),
            "user-typing" => SocketEvent::UserTyping(serde_json::from_value(data)?),
            "user-joined" => SocketEvent::UserJoined(serde_json::from_value(data)?),
            "user-left" => SocketEvent::UserLeft(serde_json::from_value(data)?),
            "conversation-joined" => {
                let id = match serde_json::from_value(data)? {
                    JoinedPayload::Object { conversation_id } => conversation_id,
                    JoinedPayload::Id(id) => id,
                };
                SocketEvent::ConversationJoined(id)
            }
            "error" => {
                let message = match data {
                    Value::String(s) => s,
                    other => other
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown server error")
                        .to_string(),
                };
                SocketEvent::Error(message)
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

fn parse_message(data: Value) -> ChatResult<Message> {
    Ok(match serde_json::from_value(data)? {
        MessageEnvelope::Wrapped { message } => message,
        MessageEnvelope::Bare(message) => message,
    })
}

/// Client-to-server events.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    JoinConversation {
        conversation_id: String,
    },
    SendMessage {
        conversation_id: String,
        message: String,
        message_type: MessageType,
        metadata: Option<MessageMetadata>,
    },
    SendImageMessage {
        conversation_id: String,
        image_data: String,
        file_name: String,
        file_size: u64,
        file_type: String,
    },
    Typing {
        conversation_id: String,
        is_typing: bool,
    },
    MarkAsRead {
        conversation_id: String,
        message_id: Option<String>,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinConversation { .. } => "join-conversation",
            ClientEvent::SendMessage { .. } => "send-message",
            ClientEvent::SendImageMessage { .. } => "send-image-message",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::MarkAsRead { .. } => "mark-as-read",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            ClientEvent::JoinConversation { conversation_id } => {
                serde_json::json!({ "conversationId": conversation_id })
            }
            ClientEvent::SendMessage {
                conversation_id,
                message,
                message_type,
                metadata,
            } => serde_json::json!({
                "conversationId": conversation_id,
                "message": message,
                "messageType": message_type.as_str(),
                "metadata": metadata,
            }),
            ClientEvent::SendImageMessage {
                conversation_id,
                image_data,
                file_name,
                file_size,
                file_type,
            } => serde_json::json!({
                "conversationId": conversation_id,
                "imageData": image_data,
                "fileName": file_name,
                "fileSize": file_size,
                "fileType": file_type,
            }),
            ClientEvent::Typing {
                conversation_id,
                is_typing,
            } => serde_json::json!({
                "conversationId": conversation_id,
                "isTyping": is_typing,
            }),
            ClientEvent::MarkAsRead {
                conversation_id,
                message_id,
            } => {
                let mut payload = serde_json::json!({ "conversationId": conversation_id });
                if let Some(id) = message_id {
                    payload["messageId"] = Value::String(id.clone());
                }
                payload
            }
        }
    }
}
