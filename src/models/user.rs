//! User-related models

use serde::{Deserialize, Serialize};

/// Account role on the booking platform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Customer,
    Admin,
    Staff,
    #[default]
    #[serde(other)]
    Unknown,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Customer => "customer",
            UserRole::Admin => "admin",
            UserRole::Staff => "staff",
            UserRole::Unknown => "unknown",
        }
    }
}

/// A user as embedded in messages and conversations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: UserRole,
}
