//! Data models
//!
//! Entities persisted by the credential store and the session table, and the
//! projections handed to callers.

mod password_reset;
mod session;
mod user;

pub use password_reset::{NewPasswordReset, PasswordReset};
pub use session::{NewSession, Session};
pub use user::{User, UserProfile, UserRole, UserUpdate};
