//! HTTP surface tests for the account and session endpoints.

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use fleet_auth::{
    api::{build_router, AppState},
    config::AuthConfig,
    db::{
        create_test_pool, migrations,
        repositories::{
            SessionRepository, SqlxPasswordResetRepository, SqlxSessionRepository,
            SqlxUserRepository, UserRepository,
        },
        DynDatabasePool,
    },
    models::{NewSession, UserUpdate},
    services::{AuthService, DeliveryError, EmailKind, LoginRateLimiter, Notifier},
};

/// Keeps the last token of each kind handed to the notifier.
#[derive(Default)]
struct CapturingNotifier {
    verification: Mutex<Option<String>>,
    reset: Mutex<Option<String>>,
    fail: bool,
}

impl CapturingNotifier {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn token(&self) -> String {
        self.verification
            .lock()
            .unwrap()
            .clone()
            .expect("no verification token sent")
    }

    fn reset_token(&self) -> String {
        self.reset.lock().unwrap().clone().expect("no reset token sent")
    }
}

#[async_trait]
impl Notifier for CapturingNotifier {
    async fn send(&self, kind: EmailKind, _to: &str, token: &str) -> Result<(), DeliveryError> {
        if self.fail {
            return Err(DeliveryError::Transport("connection reset".to_string()));
        }
        let slot = match kind {
            EmailKind::Verification => &self.verification,
            EmailKind::PasswordReset => &self.reset,
        };
        *slot.lock().unwrap() = Some(token.to_string());
        Ok(())
    }
}

struct TestApp {
    server: TestServer,
    notifier: Arc<CapturingNotifier>,
    users: Arc<dyn UserRepository>,
    sessions: Arc<dyn SessionRepository>,
    _pool: DynDatabasePool,
}

async fn spawn_app_with(notifier: CapturingNotifier) -> TestApp {
    let pool = create_test_pool().await.expect("Failed to create test pool");
    migrations::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let notifier = Arc::new(notifier);
    let users = SqlxUserRepository::boxed(pool.clone());
    let sessions = SqlxSessionRepository::boxed(pool.clone());
    let auth_service = Arc::new(AuthService::new(
        users.clone(),
        sessions.clone(),
        SqlxPasswordResetRepository::boxed(pool.clone()),
        notifier.clone(),
        &AuthConfig::default(),
    ));

    let state = AppState {
        auth_service,
        rate_limiter: Arc::new(LoginRateLimiter::new()),
    };
    let app = build_router(state, "*").expect("Failed to build router");

    TestApp {
        server: TestServer::new(app).expect("Failed to start test server"),
        notifier,
        users,
        sessions,
        _pool: pool,
    }
}

async fn spawn_app() -> TestApp {
    spawn_app_with(CapturingNotifier::default()).await
}

fn session_header() -> HeaderName {
    HeaderName::from_static("x-session-token")
}

impl TestApp {
    async fn register(&self, email: &str, password: &str) -> axum_test::TestResponse {
        self.server
            .post("/api/register")
            .json(&json!({ "email": email, "password": password }))
            .await
    }

    async fn login(&self, email: &str, password: &str) -> axum_test::TestResponse {
        self.server
            .post("/api/login")
            .json(&json!({ "email": email, "password": password, "device_info": "test-suite" }))
            .await
    }

    async fn validate(&self, token: &str) -> axum_test::TestResponse {
        self.server
            .post("/api/validate-session")
            .json(&json!({ "session_token": token }))
            .await
    }

    /// Register, verify and log in; returns the session token.
    async fn signed_in(&self, email: &str, password: &str) -> String {
        self.register(email, password).await.assert_status(StatusCode::CREATED);
        self.server
            .post("/api/verify")
            .json(&json!({ "token": self.notifier.token() }))
            .await
            .assert_status_ok();

        let body: Value = self.login(email, password).await.json();
        body["session_token"].as_str().expect("session token").to_string()
    }
}

fn error_code(body: &Value) -> &str {
    body["error"]["code"].as_str().unwrap_or_default()
}

#[tokio::test]
async fn test_health() {
    let app = spawn_app().await;

    let response = app.server.get("/health").await;
    response.assert_status_ok();
    response.assert_json(&json!({ "status": "ok" }));
}

#[tokio::test]
async fn test_register_returns_created() {
    let app = spawn_app().await;

    let response = app.register("a@b.com", "password1").await;
    response.assert_status(StatusCode::CREATED);

    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert!(body["message"].as_str().unwrap().contains("check your email"));
    assert!(body.get("warning").is_none());
}

#[tokio::test]
async fn test_register_duplicate_is_conflict() {
    let app = spawn_app().await;
    app.register("a@b.com", "password1").await;

    let response = app.register("A@B.com", "password1").await;
    response.assert_status(StatusCode::CONFLICT);
    assert_eq!(error_code(&response.json()), "CONFLICT");
}

#[tokio::test]
async fn test_register_short_password_leaves_no_row() {
    let app = spawn_app().await;

    let response = app.register("x@y.com", "short").await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&response.json()), "VALIDATION_ERROR");

    app.register("x@y.com", "password1").await.assert_status(StatusCode::CREATED);
}

#[tokio::test]
async fn test_register_missing_fields() {
    let app = spawn_app().await;

    app.server
        .post("/api/register")
        .json(&json!({ "email": "a@b.com" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_register_delivery_failure_reports_warning() {
    let app = spawn_app_with(CapturingNotifier::failing()).await;

    let response = app.register("a@b.com", "password1").await;
    response.assert_status(StatusCode::CREATED);

    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["warning"], "email_failed");
    assert!(app.users.find_by_email("a@b.com").await.unwrap().is_some());
}

#[tokio::test]
async fn test_verify_status_codes() {
    let app = spawn_app().await;
    app.register("a@b.com", "password1").await;
    let token = app.notifier.token();

    app.server
        .post("/api/verify")
        .json(&json!({ "token": "" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    app.server
        .post("/api/verify")
        .json(&json!({ "token": "unknown" }))
        .await
        .assert_status(StatusCode::NOT_FOUND);

    let response = app.server.post("/api/verify").json(&json!({ "token": token })).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["message"], "Email verified successfully. You can now log in.");

    // Consumed
    app.server
        .post("/api/verify")
        .json(&json!({ "token": token }))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_verify_expired_token() {
    let app = spawn_app().await;
    app.register("a@b.com", "password1").await;
    let token = app.notifier.token();
    let user = app.users.find_by_email("a@b.com").await.unwrap().unwrap();

    let backdate = UserUpdate {
        verification_token_expires: Some(Some(Utc::now() - Duration::hours(1))),
        ..Default::default()
    };
    app.users.update_fields(user.id, &backdate).await.unwrap();

    let response = app.server.post("/api/verify").json(&json!({ "token": token })).await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&response.json()), "TOKEN_EXPIRED");

    let user = app.users.get_by_id(user.id).await.unwrap().unwrap();
    assert!(!user.is_verified);
}

#[tokio::test]
async fn test_login_before_verification_is_forbidden() {
    let app = spawn_app().await;
    app.register("a@b.com", "password1").await;

    let response = app.login("a@b.com", "password1").await;
    response.assert_status(StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_login_failures_are_indistinguishable() {
    let app = spawn_app().await;
    app.signed_in("a@b.com", "password1").await;

    let wrong_password = app.login("a@b.com", "password2").await;
    let unknown_email = app.login("nobody@b.com", "password1").await;

    wrong_password.assert_status(StatusCode::UNAUTHORIZED);
    unknown_email.assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(wrong_password.json::<Value>(), unknown_email.json::<Value>());
}

#[tokio::test]
async fn test_login_response_never_echoes_hash() {
    let app = spawn_app().await;
    app.signed_in("a@b.com", "password1").await;

    let response = app.login("a@b.com", "password1").await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["user"]["email"], "a@b.com");
    assert_eq!(body["user"]["role"], "user");
    assert!(body["user"].get("password_hash").is_none());
    assert!(!response.text().contains("$argon2"));
}

#[tokio::test]
async fn test_login_missing_fields() {
    let app = spawn_app().await;

    app.server
        .post("/api/login")
        .json(&json!({ "email": "a@b.com" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_login_rate_limited_after_repeated_failures() {
    let app = spawn_app().await;
    app.signed_in("a@b.com", "password1").await;

    for _ in 0..5 {
        app.login("a@b.com", "wrong-password").await.assert_status(StatusCode::UNAUTHORIZED);
    }

    // Even the right password is refused while throttled
    let response = app.login("a@b.com", "password1").await;
    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
    let body: Value = response.json();
    assert_eq!(error_code(&body), "RATE_LIMIT");
    assert!(body["error"]["details"]["retry_after"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_login_rate_limited_per_ip() {
    let app = spawn_app().await;

    for _ in 0..10 {
        app.server
            .post("/api/login")
            .add_header(
                HeaderName::from_static("x-forwarded-for"),
                HeaderValue::from_static("198.51.100.4"),
            )
            .json(&json!({ "email": "a@b.com", "password": "" }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    app.server
        .post("/api/login")
        .add_header(
            HeaderName::from_static("x-forwarded-for"),
            HeaderValue::from_static("198.51.100.4"),
        )
        .json(&json!({ "email": "a@b.com", "password": "password1" }))
        .await
        .assert_status(StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_validate_session_via_header() {
    let app = spawn_app().await;
    let token = app.signed_in("a@b.com", "password1").await;

    let response = app
        .server
        .post("/api/validate-session")
        .add_header(session_header(), HeaderValue::from_str(&token).unwrap())
        .await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["valid"], true);
    assert_eq!(body["user"]["email"], "a@b.com");
}

#[tokio::test]
async fn test_validate_session_missing_token() {
    let app = spawn_app().await;

    app.server
        .post("/api/validate-session")
        .json(&json!({}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    app.validate("never-issued").await.assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_validate_expired_session() {
    let app = spawn_app().await;
    app.signed_in("a@b.com", "password1").await;
    let user = app.users.find_by_email("a@b.com").await.unwrap().unwrap();

    let issued = Utc::now() - Duration::days(31);
    app.sessions
        .create(&NewSession {
            user_id: user.id,
            token: "issued-31-days-ago".to_string(),
            device_info: String::new(),
            expires_at: issued + Duration::days(30),
            created_at: issued,
        })
        .await
        .unwrap();

    let response = app.validate("issued-31-days-ago").await;
    response.assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(response.json::<Value>()["error"]["message"], "Session expired");
}

#[tokio::test]
async fn test_validate_after_user_disabled() {
    let app = spawn_app().await;
    let token = app.signed_in("a@b.com", "password1").await;
    let user = app.users.find_by_email("a@b.com").await.unwrap().unwrap();

    let disable = UserUpdate {
        is_active: Some(false),
        ..Default::default()
    };
    app.users.update_fields(user.id, &disable).await.unwrap();

    let response = app.validate(&token).await;
    response.assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.json::<Value>()["error"]["message"],
        "User not found or inactive"
    );
}

#[tokio::test]
async fn test_logout_always_succeeds() {
    let app = spawn_app().await;

    for body in [json!({ "session_token": "never-issued" }), json!({})] {
        let response = app.server.post("/api/logout").json(&body).await;
        response.assert_status_ok();
        response.assert_json(&json!({ "success": true }));
    }

    let response = app.server.post("/api/logout").await;
    response.assert_status_ok();
}

#[tokio::test]
async fn test_resend_verification_does_not_enumerate() {
    let app = spawn_app().await;
    app.register("a@b.com", "password1").await;

    let known: Value = app
        .server
        .post("/api/resend-verification")
        .json(&json!({ "email": "a@b.com" }))
        .await
        .json();
    let unknown: Value = app
        .server
        .post("/api/resend-verification")
        .json(&json!({ "email": "ghost@b.com" }))
        .await
        .json();

    assert_eq!(known, unknown);
    assert_eq!(known["message"], "If the email exists, a verification link has been sent");

    app.server
        .post("/api/resend-verification")
        .json(&json!({ "email": "" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_resend_delivery_failure_keeps_generic_body() {
    let app = spawn_app_with(CapturingNotifier::failing()).await;
    app.register("a@b.com", "password1").await;

    let response = app
        .server
        .post("/api/resend-verification")
        .json(&json!({ "email": "a@b.com" }))
        .await;
    response.assert_status_ok();
    response.assert_json(&json!({
        "success": true,
        "message": "If the email exists, a verification link has been sent",
    }));
}

#[tokio::test]
async fn test_malformed_json_bodies_use_error_envelope() {
    let app = spawn_app().await;

    for path in ["/api/register", "/api/login", "/api/verify", "/api/resend-verification"] {
        let response = app
            .server
            .post(path)
            .json(&json!({ "email": null, "password": 5, "token": [] }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&response.json()), "VALIDATION_ERROR", "{}", path);

        let response = app.server.post(path).text("email=a@b.com").await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&response.json()), "VALIDATION_ERROR", "{}", path);
    }
}

#[tokio::test]
async fn test_password_reset_flow() {
    let app = spawn_app().await;
    let old_session = app.signed_in("a@b.com", "password1").await;

    let known: Value = app
        .server
        .post("/api/password-reset/request")
        .json(&json!({ "email": "a@b.com" }))
        .await
        .json();
    let unknown: Value = app
        .server
        .post("/api/password-reset/request")
        .json(&json!({ "email": "ghost@b.com" }))
        .await
        .json();
    assert_eq!(known, unknown);
    assert_eq!(known["message"], "If that email exists, a reset link has been sent");

    let token = app.notifier.reset_token();
    let response = app
        .server
        .post("/api/password-reset/confirm")
        .json(&json!({ "token": token, "new_password": "new-password" }))
        .await;
    response.assert_status_ok();
    response.assert_json(&json!({ "success": true, "message": "Password reset successfully" }));

    app.login("a@b.com", "password1").await.assert_status(StatusCode::UNAUTHORIZED);
    app.login("a@b.com", "new-password").await.assert_status_ok();
    app.validate(&old_session).await.assert_status(StatusCode::UNAUTHORIZED);

    // Spent
    let response = app
        .server
        .post("/api/password-reset/confirm")
        .json(&json!({ "token": token, "new_password": "third-password" }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(
        response.json::<Value>()["error"]["message"],
        "Invalid or expired reset token"
    );
}

#[tokio::test]
async fn test_password_reset_validation() {
    let app = spawn_app().await;

    app.server
        .post("/api/password-reset/request")
        .json(&json!({}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    for body in [
        json!({ "token": "", "new_password": "new-password" }),
        json!({ "token": "whatever", "new_password": "short" }),
        json!({ "token": "whatever" }),
    ] {
        let response = app.server.post("/api/password-reset/confirm").json(&body).await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&response.json()), "VALIDATION_ERROR");
    }
}

#[tokio::test]
async fn test_end_to_end_account_lifecycle() {
    let app = spawn_app().await;

    app.register("a@b.com", "password1").await.assert_status(StatusCode::CREATED);
    let t1 = app.notifier.token();

    app.server
        .post("/api/verify")
        .json(&json!({ "token": t1 }))
        .await
        .assert_status_ok();
    assert!(app.users.find_by_email("a@b.com").await.unwrap().unwrap().is_verified);

    let login = app.login("a@b.com", "password1").await;
    login.assert_status_ok();
    let s1 = login.json::<Value>()["session_token"].as_str().unwrap().to_string();

    let validated = app.validate(&s1).await;
    validated.assert_status_ok();
    assert_eq!(validated.json::<Value>()["user"]["email"], "a@b.com");

    app.server
        .post("/api/logout")
        .json(&json!({ "session_token": s1 }))
        .await
        .assert_json(&json!({ "success": true }));

    let after = app.validate(&s1).await;
    after.assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(after.json::<Value>()["error"]["message"], "Invalid session");
}
