//! Password reset token model

use chrono::{DateTime, Utc};

/// A single-use password reset token.
#[derive(Debug, Clone)]
pub struct PasswordReset {
    pub id: i64,
    pub user_id: i64,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

impl PasswordReset {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Fields for a reset token insert.
#[derive(Debug, Clone)]
pub struct NewPasswordReset {
    pub user_id: i64,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
