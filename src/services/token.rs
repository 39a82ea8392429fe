//! Token issuer
//!
//! Opaque, URL-safe tokens for e-mail verification, password reset and
//! session authentication. Each token is 32 bytes from the operating system's
//! CSPRNG, base64url-encoded without padding (43 characters).

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use data_encoding::BASE64URL_NOPAD;

use crate::config::AuthConfig;

/// Random bytes per token
pub const TOKEN_BYTES: usize = 32;

/// What a token is for; selects its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPurpose {
    Verification,
    PasswordReset,
    Session,
}

/// A freshly generated token and its validity window.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Generates tokens with a per-purpose lifetime. Pure: persisting the token
/// is up to the caller.
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    verification_ttl: Duration,
    reset_ttl: Duration,
    session_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(verification_ttl: Duration, reset_ttl: Duration, session_ttl: Duration) -> Self {
        Self {
            verification_ttl,
            reset_ttl,
            session_ttl,
        }
    }

    /// Out-of-range lifetimes saturate; `issue` then fails instead of
    /// producing a token.
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            Duration::try_hours(config.verification_ttl_hours).unwrap_or(Duration::MAX),
            Duration::try_minutes(config.reset_ttl_minutes).unwrap_or(Duration::MAX),
            Duration::try_days(config.session_ttl_days).unwrap_or(Duration::MAX),
        )
    }

    pub fn ttl(&self, purpose: TokenPurpose) -> Duration {
        match purpose {
            TokenPurpose::Verification => self.verification_ttl,
            TokenPurpose::PasswordReset => self.reset_ttl,
            TokenPurpose::Session => self.session_ttl,
        }
    }

    /// Issue a token for `purpose`, expiring `ttl(purpose)` from now.
    pub fn issue(&self, purpose: TokenPurpose) -> Result<IssuedToken> {
        let issued_at = Utc::now();
        let expires_at = issued_at
            .checked_add_signed(self.ttl(purpose))
            .with_context(|| format!("{:?} token lifetime out of range", purpose))?;

        Ok(IssuedToken {
            token: generate_token()?,
            issued_at,
            expires_at,
        })
    }
}

impl Default for TokenIssuer {
    fn default() -> Self {
        Self::from_config(&AuthConfig::default())
    }
}

/// Generate a random URL-safe token.
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::fill(&mut bytes)
        .map_err(|e| anyhow::anyhow!("Failed to read system randomness: {}", e))?;
    Ok(BASE64URL_NOPAD.encode(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_lifetimes() {
        let issuer = TokenIssuer::default();
        assert_eq!(issuer.ttl(TokenPurpose::Verification), Duration::hours(24));
        assert_eq!(issuer.ttl(TokenPurpose::PasswordReset), Duration::hours(1));
        assert_eq!(issuer.ttl(TokenPurpose::Session), Duration::days(30));
    }

    #[test]
    fn test_oversized_lifetime_is_an_error() {
        let config = AuthConfig {
            session_ttl_days: 100_000_000,
            verification_ttl_hours: i64::MAX,
            ..Default::default()
        };
        let issuer = TokenIssuer::from_config(&config);

        assert!(issuer.issue(TokenPurpose::Session).is_err());
        assert!(issuer.issue(TokenPurpose::Verification).is_err());
        assert!(issuer.issue(TokenPurpose::PasswordReset).is_ok());
    }

    #[test]
    fn test_issue_sets_expiry() {
        let issuer = TokenIssuer::default();
        let before = Utc::now();
        let issued = issuer.issue(TokenPurpose::Session).unwrap();
        let after = Utc::now();

        assert!(issued.expires_at >= before + Duration::days(30));
        assert!(issued.expires_at <= after + Duration::days(30));
        assert_eq!(issued.expires_at - issued.issued_at, Duration::days(30));
    }

    #[test]
    fn test_tokens_are_unique() {
        let tokens: HashSet<String> = (0..1000).map(|_| generate_token().unwrap()).collect();
        assert_eq!(tokens.len(), 1000);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        /// Every token decodes back to exactly 32 bytes and uses only URL-safe characters.
        #[test]
        fn token_is_url_safe_and_full_entropy(_seed in any::<u8>()) {
            let token = generate_token().unwrap();

            prop_assert_eq!(token.len(), 43);
            prop_assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));

            let decoded = BASE64URL_NOPAD.decode(token.as_bytes()).unwrap();
            prop_assert_eq!(decoded.len(), TOKEN_BYTES);
        }

        /// Lifetimes follow the configured TTLs.
        #[test]
        fn issued_expiry_tracks_ttl(hours in 1i64..200, days in 1i64..365) {
            let issuer = TokenIssuer::new(Duration::hours(hours), Duration::hours(1), Duration::days(days));
            let now = Utc::now();

            let v = issuer.issue(TokenPurpose::Verification).unwrap();
            let s = issuer.issue(TokenPurpose::Session).unwrap();

            prop_assert!(v.expires_at >= now + Duration::hours(hours));
            prop_assert!(v.expires_at < now + Duration::hours(hours) + Duration::seconds(5));
            prop_assert!(s.expires_at >= now + Duration::days(days));
            prop_assert!(s.expires_at < now + Duration::days(days) + Duration::seconds(5));
        }
    }
}
