//! Database repositories
//!
//! Repository pattern implementations for database access.

pub mod password_reset;
pub mod session;
pub mod user;

pub use password_reset::{PasswordResetRepository, SqlxPasswordResetRepository};
pub use session::{SessionRepository, SqlxSessionRepository};
pub use user::{DuplicateEmail, SqlxUserRepository, UserRepository};
