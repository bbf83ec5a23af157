//! Engine.IO v4 / Socket.IO v5 text packet codec
//!
//! Framing used on the websocket:
//! `0{..}` open, `1` close, `2` ping, `3` pong,
//! `40{..}` connect / connect-ack, `41` disconnect,
//! `42["event",payload]` event, `44{..}` connect error.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChatError, ChatResult};

/// Engine.IO pong, sent in reply to a server ping.
pub const PONG: &str = "3";

/// Session parameters from the Engine.IO open packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

impl OpenInfo {
    /// Longest the server may stay quiet before the connection counts as
    /// dead: one ping interval plus the ping timeout. `None` if the server
    /// did not advertise a heartbeat.
    pub fn silence_limit(&self) -> Option<Duration> {
        let limit = self.ping_interval.saturating_add(self.ping_timeout);
        (limit > 0).then(|| Duration::from_millis(limit))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, data: Value },
    ConnectError(String),
    Unknown(String),
}

pub fn decode(frame: &str) -> ChatResult<Packet> {
    let mut chars = frame.chars();
    let Some(kind) = chars.next() else {
        return Err(ChatError::Decode("empty frame".to_string()));
    };
    let rest = chars.as_str();

    match kind {
        '0' => Ok(Packet::Open(serde_json::from_str(rest)?)),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => decode_socket_packet(rest),
        _ => Ok(Packet::Unknown(frame.to_string())),
    }
}

/// Decode the Socket.IO packet carried inside an Engine.IO message.
fn decode_socket_packet(body: &str) -> ChatResult<Packet> {
    let mut chars = body.chars();
    let Some(kind) = chars.next() else {
        return Ok(Packet::Unknown(format!("4{}", body)));
    };
    let payload = strip_namespace(chars.as_str());

    match kind {
        '0' => {
            if payload.is_empty() {
                Ok(Packet::Connect(None))
            } else {
                Ok(Packet::Connect(Some(serde_json::from_str(payload)?)))
            }
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            // Optional ack id precedes the JSON array.
            let json = payload.trim_start_matches(|c: char| c.is_ascii_digit());
            let value: Value = serde_json::from_str(json)?;
            let mut items = match value {
                Value::Array(items) => items.into_iter(),
                other => {
                    return Err(ChatError::Decode(format!(
                        "event payload is not an array: {}",
                        other
                    )))
                }
            };
            let name = match items.next() {
                Some(Value::String(name)) => name,
                _ => return Err(ChatError::Decode("event has no name".to_string())),
            };
            let data = items.next().unwrap_or(Value::Null);
            Ok(Packet::Event { name, data })
        }
        '4' => {
            let message = serde_json::from_str::<Value>(payload)
                .ok()
                .and_then(|v| match v {
                    Value::String(s) => Some(s),
                    v => v.get("message").and_then(|m| m.as_str()).map(String::from),
                })
                .unwrap_or_else(|| payload.to_string());
            Ok(Packet::ConnectError(message))
        }
        _ => Ok(Packet::Unknown(format!("4{}", body))),
    }
}

/// Skip a `/namespace,` prefix; only the default namespace is used.
fn strip_namespace(payload: &str) -> &str {
    if payload.starts_with('/') {
        match payload.find(',') {
            Some(pos) => &payload[pos + 1..],
            None => "",
        }
    } else {
        payload
    }
}

/// Socket.IO connect packet with an auth payload.
pub fn encode_connect(auth: Option<&Value>) -> String {
    match auth {
        Some(auth) => format!("40{}", auth),
        None => "40".to_string(),
    }
}

pub fn encode_event<T: Serialize>(name: &str, data: &T) -> ChatResult<String> {
    let array = serde_json::to_string(&(name, data))?;
    Ok(format!("42{}", array))
}
