//! Error taxonomy for the chat transport, session and REST layers

use std::time::Duration;

use thiserror::Error;

use crate::api::validation::ValidationError;

/// Errors produced by the chat client.
///
/// `Clone` so a single connection outcome can be handed to every caller
/// waiting on the same attempt.
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    /// Connection attempt did not complete in time.
    #[error("connection timed out after {}s", .0.as_secs())]
    ConnectTimeout(Duration),

    /// WebSocket or Socket.IO handshake failed.
    #[error("connection handshake failed: {0}")]
    Handshake(String),

    /// A newer attempt (or a disconnect) replaced this one before it finished.
    #[error("connection attempt was superseded")]
    Superseded,

    /// The server pushed an `error` event.
    #[error("server error: {0}")]
    Server(String),

    /// Emit requested while the socket is not connected.
    #[error("not connected to chat server")]
    NotConnected,

    /// The server refused a send.
    #[error("message rejected: {0}")]
    Rejected(String),

    /// No acknowledgment arrived for a send that requires one.
    #[error("no acknowledgment after {}s", .0.as_secs())]
    AckTimeout(Duration),

    /// Blank text send.
    #[error("message is empty")]
    EmptyMessage,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Local file could not be read.
    #[error("file error: {0}")]
    File(String),

    /// 401/403 from the REST API; the caller should drop the stored token.
    #[error("unauthorized ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    /// Non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Network-level failure talking to the REST API.
    #[error("request failed: {0}")]
    Request(String),

    /// Response or frame body could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),
}

impl ChatError {
    /// Short text suitable for showing next to the compose box.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::ConnectTimeout(_) | ChatError::Handshake(_) | ChatError::Superseded => {
                "Could not connect to chat. Please try again.".to_string()
            }
            ChatError::NotConnected => "Not connected to chat. Please try again.".to_string(),
            ChatError::AckTimeout(_) => "The server did not confirm the message.".to_string(),
            ChatError::Server(msg) | ChatError::Rejected(msg) => msg.clone(),
            ChatError::EmptyMessage => "Message cannot be empty.".to_string(),
            ChatError::Validation(e) => e.to_string(),
            ChatError::File(msg) => msg.clone(),
            ChatError::Unauthorized { .. } => "Your session has expired. Please log in again.".to_string(),
            ChatError::Http { message, .. } if !message.is_empty() => message.clone(),
            ChatError::Http { .. } | ChatError::Request(_) | ChatError::Decode(_) => {
                "Something went wrong talking to the server.".to_string()
            }
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ChatError::Unauthorized { .. })
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ChatError::Decode(e.to_string())
        } else {
            ChatError::Request(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Decode(e.to_string())
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
