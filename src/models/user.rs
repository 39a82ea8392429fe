//! User model
//!
//! The identity record owned by the credential store, plus the minimal
//! projection handed back to clients and the partial-update set used by
//! `UserRepository::update_fields`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A registered identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier
    pub id: i64,
    /// Lowercased, trimmed e-mail address (unique)
    pub email: String,
    /// Argon2id PHC string
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: UserRole,
    pub is_verified: bool,
    pub is_active: bool,
    /// Outstanding verification token, cleared once consumed
    #[serde(skip_serializing)]
    pub verification_token: Option<String>,
    pub verification_token_expires: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
    /// Owning distributor, if any
    pub distributor_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Build an unverified, active `user` account awaiting verification.
    ///
    /// `id` is assigned by the store on insert.
    pub fn new_pending(
        email: String,
        password_hash: String,
        verification_token: String,
        verification_token_expires: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            email,
            password_hash,
            role: UserRole::default(),
            is_verified: false,
            is_active: true,
            verification_token: Some(verification_token),
            verification_token_expires: Some(verification_token_expires),
            last_login: None,
            distributor_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The outward-facing projection of this user
    pub fn profile(&self) -> UserProfile {
        UserProfile::from(self)
    }
}

/// User role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    User,
    Distributor,
    Maintenance,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Distributor => "distributor",
            UserRole::Maintenance => "maintenance",
            UserRole::Admin => "admin",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(UserRole::User),
            "distributor" => Ok(UserRole::Distributor),
            "maintenance" => Ok(UserRole::Maintenance),
            "admin" => Ok(UserRole::Admin),
            _ => Err(anyhow::anyhow!("Invalid user role: {}", s)),
        }
    }
}

/// Minimal user projection returned by login and session validation.
///
/// Never carries the password hash or any token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub email: String,
    pub role: UserRole,
    pub distributor_id: Option<String>,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            role: user.role,
            distributor_id: user.distributor_id.clone(),
        }
    }
}

/// Partial field set for a single-row user update.
///
/// `None` leaves a column untouched. The nested options on the token fields
/// distinguish "leave alone" (`None`) from "set to NULL" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub password_hash: Option<String>,
    pub role: Option<UserRole>,
    pub is_verified: Option<bool>,
    pub is_active: Option<bool>,
    pub verification_token: Option<Option<String>>,
    pub verification_token_expires: Option<Option<DateTime<Utc>>>,
    pub last_login: Option<DateTime<Utc>>,
}

impl UserUpdate {
    /// Mark verified and clear the verification token with its expiry
    pub fn verified() -> Self {
        Self {
            is_verified: Some(true),
            verification_token: Some(None),
            verification_token_expires: Some(None),
            ..Default::default()
        }
    }

    /// Replace the outstanding verification token
    pub fn reissue_token(token: String, expires: DateTime<Utc>) -> Self {
        Self {
            verification_token: Some(Some(token)),
            verification_token_expires: Some(Some(expires)),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.password_hash.is_none()
            && self.role.is_none()
            && self.is_verified.is_none()
            && self.is_active.is_none()
            && self.verification_token.is_none()
            && self.verification_token_expires.is_none()
            && self.last_login.is_none()
    }
}
