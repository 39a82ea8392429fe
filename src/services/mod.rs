//! Services layer - Business logic
//!
//! This module contains the business logic of the authentication service:
//! - Password hashing and the token issuer
//! - Verification and password reset e-mail delivery
//! - Login throttling
//! - The auth service coordinating the credential and session stores

pub mod auth;
pub mod email;
pub mod password;
pub mod rate_limiter;
pub mod token;

pub use auth::{
    normalize_email, validate_email, AuthError, AuthErrorKind, AuthService, LoginOutcome,
    ProvisionOutcome, RegisterOutcome, ResendOutcome, ResetRequestOutcome, VerifyOutcome,
};
pub use email::{build_notifier, DeliveryError, EmailKind, Notifier};
pub use password::{hash_password, verify_password};
pub use rate_limiter::LoginRateLimiter;
pub use token::{generate_token, IssuedToken, TokenIssuer, TokenPurpose};
