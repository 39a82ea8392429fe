//! Session model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A login session. `expires_at` is fixed at creation and never extended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
    /// Opaque bearer token
    #[serde(skip_serializing)]
    pub token: String,
    /// Free-text device/client descriptor
    pub device_info: String,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Whether the session is past its hard expiry at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Short, non-secret prefix of the token for operator output
    pub fn token_prefix(&self) -> &str {
        let end = self
            .token
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.token.len());
        &self.token[..end]
    }
}

/// Fields for a session insert.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: i64,
    pub token: String,
    pub device_info: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
