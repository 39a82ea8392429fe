//! Authentication API endpoints
//!
//! Handles HTTP requests for the account lifecycle:
//! - POST /api/register - Create an unverified account
//! - POST /api/verify - Consume a verification token
//! - POST /api/login - Open a session
//! - POST /api/validate-session - Resolve a session token to its user
//! - POST /api/resend-verification - Reissue a verification token
//! - POST /api/logout - Close a session
//! - POST /api/password-reset/request - Mail a password reset link
//! - POST /api/password-reset/confirm - Spend a reset token

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::middleware::{
    extract_ip_address, extract_session_token, ApiError, ApiJson, AppState,
};
use crate::models::UserProfile;
use crate::services::auth::MSG_PASSWORD_RESET;
use crate::services::{normalize_email, AuthError};

/// Request body for registration
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// Request body for e-mail verification
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub token: String,
}

/// Request body for login
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    pub device_info: Option<String>,
}

/// Request body for resending the verification e-mail
#[derive(Debug, Deserialize)]
pub struct ResendRequest {
    #[serde(default)]
    pub email: String,
}

/// Request body for a password reset link
#[derive(Debug, Deserialize)]
pub struct ResetRequestBody {
    #[serde(default)]
    pub email: String,
}

/// Request body for completing a password reset
#[derive(Debug, Deserialize)]
pub struct ResetConfirmRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub new_password: String,
}

/// Optional body of validate-session and logout
#[derive(Debug, Default, Deserialize)]
pub struct SessionTokenRequest {
    pub session_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserProfile,
}

#[derive(Debug, Serialize)]
pub struct ValidateSessionResponse {
    pub valid: bool,
    pub user: UserProfile,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub success: bool,
}

/// Build the auth router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/verify", post(verify))
        .route("/login", post(login))
        .route("/validate-session", post(validate_session))
        .route("/resend-verification", post(resend_verification))
        .route("/logout", post(logout))
        .route("/password-reset/request", post(request_password_reset))
        .route("/password-reset/confirm", post(confirm_password_reset))
}

/// POST /api/register
async fn register(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .auth_service
        .register(&body.email, &body.password)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            success: true,
            message: outcome.message().to_string(),
            warning: outcome.delivery_warning.then(|| "email_failed".to_string()),
        }),
    ))
}

/// POST /api/verify
async fn verify(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<VerifyRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let outcome = state.auth_service.verify(body.token.trim()).await?;

    Ok(Json(MessageResponse {
        success: true,
        message: outcome.message().to_string(),
    }))
}

/// POST /api/login
///
/// Throttled per client IP and per e-mail before credentials are checked.
async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    if let Some(ip) = extract_ip_address(&headers) {
        if let Some(retry_after_secs) = state.rate_limiter.check_ip(ip).await {
            tracing::warn!("Login rate limit hit for {}", ip);
            return Err(AuthError::RateLimited { retry_after_secs }.into());
        }
    }

    let email = normalize_email(&body.email);
    if let Some(retry_after_secs) = state.rate_limiter.email_retry_after(&email).await {
        tracing::warn!("Too many failed logins for {}", email);
        return Err(AuthError::RateLimited { retry_after_secs }.into());
    }

    let device_info = body
        .device_info
        .or_else(|| {
            headers
                .get(header::USER_AGENT)
                .and_then(|h| h.to_str().ok())
                .map(String::from)
        })
        .unwrap_or_default();

    match state
        .auth_service
        .login(&email, &body.password, &device_info)
        .await
    {
        Ok(outcome) => {
            state.rate_limiter.clear(&email).await;
            Ok(Json(LoginResponse {
                success: true,
                session_token: outcome.session_token,
                expires_at: outcome.expires_at,
                user: outcome.user,
            }))
        }
        Err(e) => {
            if matches!(e, AuthError::InvalidCredentials) {
                state.rate_limiter.record_failure(&email).await;
                tracing::warn!("Failed login for {}", email);
            }
            Err(e.into())
        }
    }
}

/// POST /api/validate-session
async fn validate_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ValidateSessionResponse>, ApiError> {
    let token = session_token(&headers, &body)
        .ok_or_else(|| ApiError::validation_error("Session token required"))?;

    let user = state.auth_service.validate_session(&token).await?;

    Ok(Json(ValidateSessionResponse { valid: true, user }))
}

/// POST /api/resend-verification
async fn resend_verification(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ResendRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let outcome = state.auth_service.resend_verification(&body.email).await?;

    Ok(Json(MessageResponse {
        success: true,
        message: outcome.message().to_string(),
    }))
}

/// POST /api/password-reset/request
///
/// Same response for unknown addresses; delivery failures are only logged.
async fn request_password_reset(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ResetRequestBody>,
) -> Result<Json<MessageResponse>, ApiError> {
    let outcome = state.auth_service.request_password_reset(&body.email).await?;

    Ok(Json(MessageResponse {
        success: true,
        message: outcome.message().to_string(),
    }))
}

/// POST /api/password-reset/confirm
async fn confirm_password_reset(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ResetConfirmRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .auth_service
        .reset_password(body.token.trim(), &body.new_password)
        .await?;

    Ok(Json(MessageResponse {
        success: true,
        message: MSG_PASSWORD_RESET.to_string(),
    }))
}

/// POST /api/logout
///
/// Always reports success, including for unknown tokens and unreadable bodies.
async fn logout(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Json<LogoutResponse> {
    if let Some(token) = session_token(&headers, &body) {
        state.auth_service.logout(&token).await;
    }
    Json(LogoutResponse { success: true })
}

/// Session token from the headers, else from the JSON body
fn session_token(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    extract_session_token(headers).or_else(|| {
        serde_json::from_slice::<SessionTokenRequest>(body)
            .unwrap_or_default()
            .session_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_session_token_header_wins_over_body() {
        let mut headers = HeaderMap::new();
        let body = br#"{"session_token":"from-body"}"#;

        assert_eq!(session_token(&headers, body).as_deref(), Some("from-body"));

        headers.insert("x-session-token", HeaderValue::from_static("from-header"));
        assert_eq!(session_token(&headers, body).as_deref(), Some("from-header"));
    }

    #[test]
    fn test_session_token_missing_or_unreadable_body() {
        let headers = HeaderMap::new();
        assert_eq!(session_token(&headers, b""), None);
        assert_eq!(session_token(&headers, b"not json"), None);
        assert_eq!(session_token(&headers, br#"{"session_token":"  "}"#), None);
    }
}
