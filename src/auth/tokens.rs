//! Token storage and management

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Stored bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: String,
    /// Unix seconds; `None` means the token does not expire client-side
    pub expires_at: Option<i64>,
}

impl StoredToken {
    pub fn new(token: String, expires_in_secs: Option<u64>) -> Self {
        let expires_at = expires_in_secs
            .map(|secs| Utc::now().timestamp().saturating_add(i64::try_from(secs).unwrap_or(i64::MAX)));

        Self { token, expires_at }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            // Consider expired if less than 5 minutes remaining
            Some(exp) => Utc::now().timestamp() + 300 >= exp,
            None => false,
        }
    }
}

/// Token store trait for different storage backends
pub trait TokenStore {
    fn get_token(&self) -> Option<StoredToken>;
    fn set_token(&mut self, token: String, expires_in: Option<u64>);
    fn clear_tokens(&mut self);
}
