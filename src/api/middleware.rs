//! API middleware
//!
//! Shared application state, the JSON error envelope and the request
//! helpers used by the handlers:
//! - `ApiError` and its mapping from `AuthError`
//! - `ApiJson`, a JSON body extractor whose rejections use the envelope
//! - Session token extraction (header or body)
//! - Client IP extraction for login throttling

use axum::{
    extract::{rejection::JsonRejection, FromRequest},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

use crate::services::{AuthError, AuthService, LoginRateLimiter};

/// Header carrying the session token
pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

/// Application state containing shared services
#[derive(Clone)]
pub struct AppState {
    pub auth_service: Arc<AuthService>,
    pub rate_limiter: Arc<LoginRateLimiter>,
}

/// `Json` extractor that reports malformed bodies as `VALIDATION_ERROR`
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// Error response for API errors
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("UNAUTHORIZED", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("FORBIDDEN", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", message)
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new("VALIDATION_ERROR", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }

    pub fn status(&self) -> StatusCode {
        match self.error.code.as_str() {
            "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
            "FORBIDDEN" => StatusCode::FORBIDDEN,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "VALIDATION_ERROR" | "TOKEN_EXPIRED" => StatusCode::BAD_REQUEST,
            "CONFLICT" => StatusCode::CONFLICT,
            "RATE_LIMIT" => StatusCode::TOO_MANY_REQUESTS,
            "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let retry_after = self
            .error
            .details
            .as_ref()
            .and_then(|d| d.get("retry_after"))
            .and_then(|v| v.as_i64());

        match retry_after {
            Some(secs) => (
                status,
                [(header::RETRY_AFTER, secs.to_string())],
                Json(self),
            )
                .into_response(),
            None => (status, Json(self)).into_response(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::validation_error(rejection.body_text())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let message = err.to_string();
        match err {
            AuthError::Validation(_) => ApiError::validation_error(message),
            AuthError::DuplicateEmail => ApiError::new("CONFLICT", message),
            AuthError::InvalidCredentials
            | AuthError::InvalidSession
            | AuthError::SessionExpired
            | AuthError::UserUnavailable => ApiError::unauthorized(message),
            AuthError::AccountDisabled | AuthError::EmailNotVerified => {
                ApiError::forbidden(message)
            }
            AuthError::InvalidToken => ApiError::not_found(message),
            AuthError::TokenExpired | AuthError::ResetTokenExpired => {
                ApiError::new("TOKEN_EXPIRED", message)
            }
            AuthError::InvalidResetToken => ApiError::validation_error(message),
            AuthError::RateLimited { retry_after_secs } => ApiError::with_details(
                "RATE_LIMIT",
                message,
                serde_json::json!({ "retry_after": retry_after_secs }),
            ),
            AuthError::Timeout => ApiError::new("TIMEOUT", message),
            // Already logged by the service; never echo store text
            AuthError::StoreUnavailable(_) => ApiError::internal_error(message),
        }
    }
}

/// Extract the session token from the request headers.
///
/// `X-Session-Token` is preferred over `Authorization: Bearer`.
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(SESSION_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

/// Extract the client IP from proxy headers.
///
/// Checks X-Forwarded-For (first hop) and then X-Real-IP.
pub fn extract_ip_address(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(ip) = forwarded_str.split(',').next() {
                if let Ok(ip) = ip.trim().parse() {
                    return Some(ip);
                }
            }
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_auth_error_status_mapping() {
        let cases = [
            (AuthError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (AuthError::DuplicateEmail, StatusCode::CONFLICT),
            (AuthError::InvalidCredentials, StatusCode::UNAUTHORIZED),
            (AuthError::AccountDisabled, StatusCode::FORBIDDEN),
            (AuthError::EmailNotVerified, StatusCode::FORBIDDEN),
            (AuthError::InvalidToken, StatusCode::NOT_FOUND),
            (AuthError::TokenExpired, StatusCode::BAD_REQUEST),
            (AuthError::InvalidResetToken, StatusCode::BAD_REQUEST),
            (AuthError::ResetTokenExpired, StatusCode::BAD_REQUEST),
            (AuthError::InvalidSession, StatusCode::UNAUTHORIZED),
            (AuthError::SessionExpired, StatusCode::UNAUTHORIZED),
            (AuthError::UserUnavailable, StatusCode::UNAUTHORIZED),
            (AuthError::RateLimited { retry_after_secs: 30 }, StatusCode::TOO_MANY_REQUESTS),
            (AuthError::Timeout, StatusCode::GATEWAY_TIMEOUT),
            (
                AuthError::StoreUnavailable(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            let label = format!("{:?}", err.kind());
            assert_eq!(ApiError::from(err).status(), status, "{}", label);
        }
    }

    #[test]
    fn test_store_error_text_not_exposed() {
        let err = ApiError::from(AuthError::StoreUnavailable(anyhow::anyhow!(
            "password authentication failed for user \"svc\""
        )));
        assert!(!err.error.message.contains("svc"));
    }

    #[test]
    fn test_rate_limit_sets_retry_after() {
        let response = ApiError::from(AuthError::RateLimited { retry_after_secs: 42 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }

    #[test]
    fn test_extract_session_token_prefers_custom_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-bearer"));
        assert_eq!(extract_session_token(&headers).as_deref(), Some("from-bearer"));

        headers.insert(SESSION_TOKEN_HEADER, HeaderValue::from_static("from-header"));
        assert_eq!(extract_session_token(&headers).as_deref(), Some("from-header"));

        assert_eq!(extract_session_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_extract_ip_address() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_ip_address(&headers), None);

        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.9"));
        assert_eq!(extract_ip_address(&headers), Some("10.0.0.9".parse().unwrap()));

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        assert_eq!(extract_ip_address(&headers), Some("203.0.113.7".parse().unwrap()));

        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        assert_eq!(extract_ip_address(&headers), Some("10.0.0.9".parse().unwrap()));
    }
}
