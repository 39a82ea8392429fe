//! Auth service
//!
//! Registration, e-mail verification, login, session validation, logout,
//! password reset and the expired-session sweep, plus the operator helpers
//! used by the admin CLI.
//!
//! Every store call is bounded by the configured store timeout. Store
//! failures surface as [`AuthError::StoreUnavailable`] and are logged here;
//! callers never see raw store text.

use crate::config::AuthConfig;
use crate::db::repositories::{
    DuplicateEmail, PasswordResetRepository, SessionRepository, UserRepository,
};
use crate::models::{
    NewPasswordReset, NewSession, Session, User, UserProfile, UserRole, UserUpdate,
};
use crate::services::email::{EmailKind, Notifier};
use crate::services::password::{hash_password, verify_against_dummy, verify_password};
use crate::services::token::{TokenIssuer, TokenPurpose};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Sessions shown per user by `list_sessions`
pub const SESSION_LIST_LIMIT: i64 = 10;

pub const MSG_REGISTERED: &str =
    "Registration successful. Please check your email to verify your account.";
pub const MSG_REGISTERED_DELIVERY_FAILED: &str = "Registration successful, but the verification email could not be sent. Request a new verification email to try again.";
pub const MSG_VERIFIED: &str = "Email verified successfully. You can now log in.";
pub const MSG_ALREADY_VERIFIED: &str = "Email already verified";
pub const MSG_RESEND_ACCEPTED: &str = "If the email exists, a verification link has been sent";
pub const MSG_RESET_REQUESTED: &str = "If that email exists, a reset link has been sent";
pub const MSG_PASSWORD_RESET: &str = "Password reset successfully";

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern is valid")
});

/// Error kinds of the auth service.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Malformed or missing input; raised before any store access
    #[error("{0}")]
    Validation(String),

    #[error("Email already registered")]
    DuplicateEmail,

    /// Unknown e-mail or wrong password, deliberately indistinguishable
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Account is disabled")]
    AccountDisabled,

    #[error("Please verify your email before logging in")]
    EmailNotVerified,

    #[error("Invalid verification token")]
    InvalidToken,

    #[error("Verification token expired")]
    TokenExpired,

    /// Unknown or already spent reset token
    #[error("Invalid or expired reset token")]
    InvalidResetToken,

    #[error("Reset token has expired")]
    ResetTokenExpired,

    #[error("Invalid session")]
    InvalidSession,

    #[error("Session expired")]
    SessionExpired,

    #[error("User not found or inactive")]
    UserUnavailable,

    #[error("Too many login attempts, retry in {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: i64 },

    #[error("The request timed out, please try again")]
    Timeout,

    #[error("Service temporarily unavailable")]
    StoreUnavailable(#[source] anyhow::Error),
}

/// Fieldless mirror of [`AuthError`] for comparing outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    Validation,
    DuplicateEmail,
    InvalidCredentials,
    AccountDisabled,
    EmailNotVerified,
    InvalidToken,
    TokenExpired,
    InvalidResetToken,
    ResetTokenExpired,
    InvalidSession,
    SessionExpired,
    UserUnavailable,
    RateLimited,
    Timeout,
    StoreUnavailable,
}

impl AuthError {
    pub fn kind(&self) -> AuthErrorKind {
        match self {
            AuthError::Validation(_) => AuthErrorKind::Validation,
            AuthError::DuplicateEmail => AuthErrorKind::DuplicateEmail,
            AuthError::InvalidCredentials => AuthErrorKind::InvalidCredentials,
            AuthError::AccountDisabled => AuthErrorKind::AccountDisabled,
            AuthError::EmailNotVerified => AuthErrorKind::EmailNotVerified,
            AuthError::InvalidToken => AuthErrorKind::InvalidToken,
            AuthError::TokenExpired => AuthErrorKind::TokenExpired,
            AuthError::InvalidResetToken => AuthErrorKind::InvalidResetToken,
            AuthError::ResetTokenExpired => AuthErrorKind::ResetTokenExpired,
            AuthError::InvalidSession => AuthErrorKind::InvalidSession,
            AuthError::SessionExpired => AuthErrorKind::SessionExpired,
            AuthError::UserUnavailable => AuthErrorKind::UserUnavailable,
            AuthError::RateLimited { .. } => AuthErrorKind::RateLimited,
            AuthError::Timeout => AuthErrorKind::Timeout,
            AuthError::StoreUnavailable(_) => AuthErrorKind::StoreUnavailable,
        }
    }
}

/// Result of a registration.
#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub user_id: i64,
    /// The account exists but the verification e-mail was not handed off
    pub delivery_warning: bool,
}

impl RegisterOutcome {
    pub fn message(&self) -> &'static str {
        if self.delivery_warning {
            MSG_REGISTERED_DELIVERY_FAILED
        } else {
            MSG_REGISTERED
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    AlreadyVerified,
}

impl VerifyOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            VerifyOutcome::Verified => MSG_VERIFIED,
            VerifyOutcome::AlreadyVerified => MSG_ALREADY_VERIFIED,
        }
    }
}

/// A new session and the user it belongs to.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub session_token: String,
    pub expires_at: chrono::DateTime<Utc>,
    pub user: UserProfile,
}

/// Result of a resend request. Unknown and unverified addresses both map to
/// `Accepted`; only the latter can carry a delivery warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendOutcome {
    Accepted { delivery_warning: bool },
    AlreadyVerified,
}

impl ResendOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            ResendOutcome::Accepted { .. } => MSG_RESEND_ACCEPTED,
            ResendOutcome::AlreadyVerified => MSG_ALREADY_VERIFIED,
        }
    }
}

/// Result of a password reset request. The same for unknown addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetRequestOutcome {
    pub delivery_warning: bool,
}

impl ResetRequestOutcome {
    pub fn message(&self) -> &'static str {
        MSG_RESET_REQUESTED
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Created(i64),
    Promoted(i64),
}

/// Auth service orchestrating the credential store, the session table,
/// the token issuer and the notifier.
pub struct AuthService {
    users: Arc<dyn UserRepository>,
    sessions: Arc<dyn SessionRepository>,
    resets: Arc<dyn PasswordResetRepository>,
    notifier: Arc<dyn Notifier>,
    issuer: TokenIssuer,
    min_password_length: usize,
    store_timeout: Duration,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        sessions: Arc<dyn SessionRepository>,
        resets: Arc<dyn PasswordResetRepository>,
        notifier: Arc<dyn Notifier>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            users,
            sessions,
            resets,
            notifier,
            issuer: TokenIssuer::from_config(config),
            min_password_length: config.min_password_length,
            store_timeout: config.store_timeout(),
        }
    }

    /// Register a new, unverified account and dispatch its verification e-mail.
    ///
    /// A delivery failure does not undo the registration; it is reported
    /// through [`RegisterOutcome::delivery_warning`].
    pub async fn register(&self, email: &str, password: &str) -> Result<RegisterOutcome, AuthError> {
        let email = normalize_email(email);
        validate_email(&email)?;
        self.validate_password(password)?;

        if self.store(self.users.find_by_email(&email)).await?.is_some() {
            return Err(AuthError::DuplicateEmail);
        }

        let password_hash = hash_off_thread(password).await?;
        let verification = self.issue(TokenPurpose::Verification)?;

        let user = self
            .store(self.users.insert(&User::new_pending(
                email.clone(),
                password_hash,
                verification.token.clone(),
                verification.expires_at,
            )))
            .await?;

        tracing::info!("Registered user {} ({})", user.id, email);

        let delivery_warning = !self
            .dispatch(EmailKind::Verification, &email, &verification.token)
            .await;

        Ok(RegisterOutcome {
            user_id: user.id,
            delivery_warning,
        })
    }

    /// Consume a verification token.
    ///
    /// Expired tokens are left in place so a later attempt still reports
    /// `TokenExpired` rather than `InvalidToken`.
    pub async fn verify(&self, token: &str) -> Result<VerifyOutcome, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Validation("Verification token required".to_string()));
        }

        let user = self
            .store(self.users.find_by_verification_token(token))
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if user.is_verified {
            return Ok(VerifyOutcome::AlreadyVerified);
        }

        match user.verification_token_expires {
            Some(expires) if expires >= Utc::now() => {}
            _ => return Err(AuthError::TokenExpired),
        }

        self.store(self.users.update_fields(user.id, &UserUpdate::verified()))
            .await?;

        tracing::info!("Verified user {}", user.id);
        Ok(VerifyOutcome::Verified)
    }

    /// Check credentials and open a session.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        device_info: &str,
    ) -> Result<LoginOutcome, AuthError> {
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() {
            return Err(AuthError::Validation("Email and password required".to_string()));
        }

        let user = match self.store(self.users.find_by_email(&email)).await? {
            Some(user) => user,
            None => {
                let password = password.to_string();
                let _ = tokio::task::spawn_blocking(move || verify_against_dummy(&password)).await;
                return Err(AuthError::InvalidCredentials);
            }
        };

        if !verify_off_thread(password, &user).await {
            return Err(AuthError::InvalidCredentials);
        }

        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }
        if !user.is_verified {
            return Err(AuthError::EmailNotVerified);
        }

        let issued = self.issue(TokenPurpose::Session)?;

        // Recorded before the session exists, so a failure leaves no live session
        let last_login = UserUpdate {
            last_login: Some(issued.issued_at),
            ..Default::default()
        };
        self.store(self.users.update_fields(user.id, &last_login))
            .await?;

        let session = NewSession {
            user_id: user.id,
            token: issued.token,
            device_info: device_info.to_string(),
            expires_at: issued.expires_at,
            created_at: issued.issued_at,
        };
        let session = self.store(self.sessions.create(&session)).await?;

        tracing::info!("User {} logged in", user.id);
        Ok(LoginOutcome {
            session_token: session.token,
            expires_at: session.expires_at,
            user: user.profile(),
        })
    }

    /// Resolve a session token to its user, recording activity.
    ///
    /// The owning account is re-checked on every call, so disabling a user
    /// takes effect on their next validation.
    pub async fn validate_session(&self, token: &str) -> Result<UserProfile, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Validation("Session token required".to_string()));
        }

        let session = self
            .store(self.sessions.find_by_token(token))
            .await?
            .ok_or(AuthError::InvalidSession)?;

        let now = Utc::now();
        if session.is_expired_at(now) {
            if let Err(e) = self.store(self.sessions.delete(token)).await {
                tracing::warn!("Failed to remove expired session {}: {}", session.id, e);
            }
            return Err(AuthError::SessionExpired);
        }

        let user = self
            .store(self.users.get_by_id(session.user_id))
            .await?
            .filter(|u| u.is_active)
            .ok_or(AuthError::UserUnavailable)?;

        self.store(self.sessions.touch(token, now)).await?;

        Ok(user.profile())
    }

    /// Delete the session, if any. Never fails; returns whether a row was removed.
    pub async fn logout(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        match self.store(self.sessions.delete(token)).await {
            Ok(removed) => {
                if removed {
                    tracing::info!("Session logged out");
                }
                removed
            }
            Err(e) => {
                tracing::warn!("Logout could not delete session: {}", e);
                false
            }
        }
    }

    /// Issue a fresh verification token for an unverified account.
    pub async fn resend_verification(&self, email: &str) -> Result<ResendOutcome, AuthError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(AuthError::Validation("Email required".to_string()));
        }

        let user = match self.store(self.users.find_by_email(&email)).await? {
            Some(user) => user,
            None => {
                return Ok(ResendOutcome::Accepted {
                    delivery_warning: false,
                })
            }
        };

        if user.is_verified {
            return Ok(ResendOutcome::AlreadyVerified);
        }

        let verification = self.issue(TokenPurpose::Verification)?;
        self.store(self.users.update_fields(
            user.id,
            &UserUpdate::reissue_token(verification.token.clone(), verification.expires_at),
        ))
        .await?;

        tracing::info!("Reissued verification token for user {}", user.id);
        let delivery_warning = !self
            .dispatch(EmailKind::Verification, &email, &verification.token)
            .await;

        Ok(ResendOutcome::Accepted { delivery_warning })
    }

    /// Issue a single-use password reset token and mail it.
    ///
    /// Unknown and disabled accounts get the same outcome as active ones,
    /// without a token being created.
    pub async fn request_password_reset(
        &self,
        email: &str,
    ) -> Result<ResetRequestOutcome, AuthError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(AuthError::Validation("Email required".to_string()));
        }

        let user = match self.store(self.users.find_by_email(&email)).await? {
            Some(user) if user.is_active => user,
            _ => {
                return Ok(ResetRequestOutcome {
                    delivery_warning: false,
                })
            }
        };

        let issued = self.issue(TokenPurpose::PasswordReset)?;
        self.store(self.resets.create(&NewPasswordReset {
            user_id: user.id,
            token: issued.token.clone(),
            expires_at: issued.expires_at,
            created_at: issued.issued_at,
        }))
        .await?;

        tracing::info!("Issued password reset token for user {}", user.id);
        let delivery_warning = !self
            .dispatch(EmailKind::PasswordReset, &email, &issued.token)
            .await;

        Ok(ResetRequestOutcome { delivery_warning })
    }

    /// Spend a reset token and replace the account's password.
    ///
    /// All sessions of the account are revoked. The new hash is always
    /// Argon2id, so this also upgrades accounts with an unusable stored hash.
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), AuthError> {
        if token.is_empty() || new_password.is_empty() {
            return Err(AuthError::Validation(
                "Token and new password required".to_string(),
            ));
        }
        self.validate_password(new_password)?;

        let reset = self
            .store(self.resets.find_by_token(token))
            .await?
            .filter(|r| !r.used)
            .ok_or(AuthError::InvalidResetToken)?;

        if reset.is_expired_at(Utc::now()) {
            return Err(AuthError::ResetTokenExpired);
        }

        let password_hash = hash_off_thread(new_password).await?;

        // A concurrent reset with the same token loses here
        if !self.store(self.resets.mark_used(reset.id)).await? {
            return Err(AuthError::InvalidResetToken);
        }

        let update = UserUpdate {
            password_hash: Some(password_hash),
            ..Default::default()
        };
        if !self.store(self.users.update_fields(reset.user_id, &update)).await? {
            return Err(AuthError::InvalidResetToken);
        }

        let revoked = self
            .store(self.sessions.delete_by_user(reset.user_id))
            .await?;
        tracing::info!(
            "Password reset for user {}, revoked {} session(s)",
            reset.user_id,
            revoked
        );
        Ok(())
    }

    /// Delete every expired session and every stale reset token.
    /// Returns the number of sessions removed.
    pub async fn sweep_expired_sessions(&self) -> Result<u64, AuthError> {
        let now = Utc::now();
        let removed = self.store(self.sessions.delete_expired(now)).await?;
        if removed > 0 {
            tracing::info!("Swept {} expired session(s)", removed);
        }

        let resets = self.store(self.resets.delete_stale(now)).await?;
        if resets > 0 {
            tracing::info!("Swept {} stale password reset token(s)", resets);
        }
        Ok(removed)
    }

    // ========================================================================
    // Operator helpers
    // ========================================================================

    /// Disable an account and revoke all of its sessions.
    pub async fn deactivate_user(&self, user_id: i64) -> Result<u64, AuthError> {
        let update = UserUpdate {
            is_active: Some(false),
            ..Default::default()
        };
        if !self.store(self.users.update_fields(user_id, &update)).await? {
            return Err(AuthError::UserUnavailable);
        }

        let revoked = self.store(self.sessions.delete_by_user(user_id)).await?;
        tracing::info!("Deactivated user {}, revoked {} session(s)", user_id, revoked);
        Ok(revoked)
    }

    pub async fn reactivate_user(&self, user_id: i64) -> Result<(), AuthError> {
        let update = UserUpdate {
            is_active: Some(true),
            ..Default::default()
        };
        if !self.store(self.users.update_fields(user_id, &update)).await? {
            return Err(AuthError::UserUnavailable);
        }
        tracing::info!("Reactivated user {}", user_id);
        Ok(())
    }

    /// The most recent sessions of a user, newest first
    pub async fn list_sessions(&self, user_id: i64) -> Result<Vec<Session>, AuthError> {
        self.store(self.sessions.list_by_user(user_id, SESSION_LIST_LIMIT))
            .await
    }

    pub async fn list_users(&self, page: i64, per_page: i64) -> Result<(Vec<User>, i64), AuthError> {
        self.store(self.users.list(page, per_page)).await
    }

    pub async fn find_user(&self, email: &str) -> Result<Option<User>, AuthError> {
        self.store(self.users.find_by_email(&normalize_email(email)))
            .await
    }

    /// Create a verified, active admin, or promote the existing account.
    ///
    /// An existing account keeps its password.
    pub async fn provision_admin(
        &self,
        email: &str,
        password: &str,
    ) -> Result<ProvisionOutcome, AuthError> {
        let email = normalize_email(email);
        validate_email(&email)?;

        if let Some(existing) = self.store(self.users.find_by_email(&email)).await? {
            let update = UserUpdate {
                role: Some(UserRole::Admin),
                is_verified: Some(true),
                is_active: Some(true),
                verification_token: Some(None),
                verification_token_expires: Some(None),
                ..Default::default()
            };
            self.store(self.users.update_fields(existing.id, &update))
                .await?;
            tracing::info!("Promoted user {} to admin", existing.id);
            return Ok(ProvisionOutcome::Promoted(existing.id));
        }

        self.validate_password(password)?;
        let password_hash = hash_off_thread(password).await?;

        let mut admin = User::new_pending(email, password_hash, String::new(), Utc::now());
        admin.role = UserRole::Admin;
        admin.is_verified = true;
        admin.verification_token = None;
        admin.verification_token_expires = None;

        let created = self.store(self.users.insert(&admin)).await?;
        tracing::info!("Created admin user {}", created.id);
        Ok(ProvisionOutcome::Created(created.id))
    }

    // ========================================================================
    // Private helper methods
    // ========================================================================

    fn validate_password(&self, password: &str) -> Result<(), AuthError> {
        if password.is_empty() {
            return Err(AuthError::Validation("Email and password required".to_string()));
        }
        if password.chars().count() < self.min_password_length {
            return Err(AuthError::Validation(format!(
                "Password must be at least {} characters",
                self.min_password_length
            )));
        }
        Ok(())
    }

    fn issue(&self, purpose: TokenPurpose) -> Result<crate::services::token::IssuedToken, AuthError> {
        self.issuer.issue(purpose).map_err(|e| {
            tracing::error!("Token generation failed: {:#}", e);
            AuthError::StoreUnavailable(e)
        })
    }

    /// Hand an e-mail to the notifier. Returns false on failure.
    async fn dispatch(&self, kind: EmailKind, email: &str, token: &str) -> bool {
        match tokio::time::timeout(self.store_timeout, self.notifier.send(kind, email, token)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!("{:?} email to {} not dispatched: {}", kind, email, e);
                false
            }
            Err(_) => {
                tracing::warn!("{:?} email to {} timed out", kind, email);
                false
            }
        }
    }

    /// Run a store call under the store timeout and classify its failure.
    async fn store<T, F>(&self, call: F) -> Result<T, AuthError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.is::<DuplicateEmail>() => Err(AuthError::DuplicateEmail),
            Ok(Err(e)) => {
                tracing::error!("Store call failed: {:#}", e);
                Err(AuthError::StoreUnavailable(e))
            }
            Err(_) => {
                tracing::error!("Store call exceeded {:?}", self.store_timeout);
                Err(AuthError::Timeout)
            }
        }
    }
}

/// Trim and lowercase an e-mail address
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Check a normalized e-mail for presence and basic shape
pub fn validate_email(email: &str) -> Result<(), AuthError> {
    if email.is_empty() {
        return Err(AuthError::Validation("Email and password required".to_string()));
    }
    if !EMAIL_RE.is_match(email) {
        return Err(AuthError::Validation("Invalid email format".to_string()));
    }
    Ok(())
}

async fn hash_off_thread(password: &str) -> Result<String, AuthError> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| anyhow::anyhow!("Password hashing task failed: {}", e))
        .and_then(|r| r)
        .map_err(|e| {
            tracing::error!("Password hashing failed: {:#}", e);
            AuthError::StoreUnavailable(e)
        })
}

/// Verify `password` against the user's stored hash. Malformed hashes fail closed.
async fn verify_off_thread(password: &str, user: &User) -> bool {
    let password = password.to_string();
    let hash = user.password_hash.clone();
    let user_id = user.id;

    match tokio::task::spawn_blocking(move || verify_password(&password, &hash)).await {
        Ok(Ok(matches)) => matches,
        Ok(Err(e)) => {
            tracing::warn!("Unusable password hash for user {}: {:#}", user_id, e);
            false
        }
        Err(e) => {
            tracing::error!("Password verification task failed: {}", e);
            false
        }
    }
}
