//! Authoritative, de-duplicated message list for one conversation

use std::collections::HashSet;

use crate::models::Message;

/// Ordered messages keyed by server-assigned id. Every insertion goes through
/// [`MessageLog::admit`], so an id can appear at most once no matter which
/// path (history, socket event, HTTP upload) delivered it.
#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn admit(&mut self, message: &Message) -> bool {
        self.ids.insert(message.id.clone())
    }

    /// Append in arrival order. Returns false if the id was already present.
    pub fn push(&mut self, message: Message) -> bool {
        if !self.admit(&message) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Insert an older page ahead of the current list. Returns how many were new.
    pub fn prepend(&mut self, older: Vec<Message>) -> usize {
        let mut fresh = Vec::with_capacity(older.len());
        for message in older {
            if self.admit(&message) {
                fresh.push(message);
            }
        }
        let added = fresh.len();
        fresh.append(&mut self.messages);
        self.messages = fresh;
        added
    }

    /// Set the soft-delete flag. Returns the updated message if it is known.
    pub fn mark_deleted(&mut self, message_id: &str) -> Option<Message> {
        let message = self.messages.iter_mut().find(|m| m.id == message_id)?;
        message.is_deleted = true;
        Some(message.clone())
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.clone()
    }
}
