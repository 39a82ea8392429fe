//! Transactional e-mail delivery
//!
//! The auth service hands verification and password reset tokens to a
//! [`Notifier`]. Concrete transports:
//! - [`SendGridNotifier`] posts to the SendGrid v3 mail API
//! - [`SmtpNotifier`] relays through an SMTP server
//! - [`DisabledNotifier`] refuses every message
//!
//! [`QueuedNotifier`] wraps a transport with a bounded queue and a background
//! worker that retries with exponential backoff, so registration never waits
//! on the mail provider.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::{NotificationConfig, NotificationProvider};

const SENDGRID_ENDPOINT: &str = "https://api.sendgrid.com/v3/mail/send";
const VERIFICATION_SUBJECT: &str = "Verify your Pure Electric account";
const PASSWORD_RESET_SUBJECT: &str = "Reset your Pure Electric password";

/// Why a message could not be handed off or delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("email delivery is not configured")]
    NotConfigured,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("provider rejected message with status {status}")]
    Rejected { status: u16 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("delivery timed out")]
    Timeout,
    #[error("delivery queue is full")]
    QueueFull,
    #[error("delivery queue is closed")]
    QueueClosed,
}

impl DeliveryError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Transport(_) | DeliveryError::Timeout => true,
            DeliveryError::Rejected { status } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Which link a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailKind {
    Verification,
    PasswordReset,
}

impl EmailKind {
    fn label(&self) -> &'static str {
        match self {
            EmailKind::Verification => "Verification",
            EmailKind::PasswordReset => "Password reset",
        }
    }
}

/// Out-of-band delivery of one-time tokens.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver (or accept for delivery) a `kind` link for `token` to `to`.
    async fn send(&self, kind: EmailKind, to: &str, token: &str) -> Result<(), DeliveryError>;
}

/// Rendered message.
#[derive(Debug, Clone)]
pub struct RenderedEmail {
    pub subject: String,
    pub link: String,
    pub text: String,
    pub html: String,
}

impl RenderedEmail {
    pub fn new(kind: EmailKind, app_url: &str, token: &str) -> Self {
        match kind {
            EmailKind::Verification => Self::verification(app_url, token),
            EmailKind::PasswordReset => Self::password_reset(app_url, token),
        }
    }

    pub fn verification(app_url: &str, token: &str) -> Self {
        let link = format!("{}/verify?token={}", app_url.trim_end_matches('/'), token);
        let text = format!(
            "Welcome to Pure Electric.\n\n\
             Please verify your email address by opening this link:\n{}\n\n\
             This link will expire in 24 hours. If you didn't create this account, please ignore this email.\n",
            link
        );
        let html = format!(
            r#"<html>
<body style="font-family: Arial, sans-serif; padding: 20px;">
  <h2>Welcome to Pure Electric</h2>
  <p>Thank you for registering! Please verify your email address by clicking the link below:</p>
  <p><a href="{link}" style="background-color: #4CAF50; color: white; padding: 12px 24px; text-decoration: none; border-radius: 4px; display: inline-block;">Verify Email Address</a></p>
  <p>Or copy and paste this link into your browser:</p>
  <p style="color: #666;">{link}</p>
  <p style="margin-top: 30px; color: #999; font-size: 12px;">This link will expire in 24 hours. If you didn't create this account, please ignore this email.</p>
</body>
</html>"#,
            link = link
        );

        Self {
            subject: VERIFICATION_SUBJECT.to_string(),
            link,
            text,
            html,
        }
    }

    pub fn password_reset(app_url: &str, token: &str) -> Self {
        let link = format!("{}/reset-password?token={}", app_url.trim_end_matches('/'), token);
        let text = format!(
            "We received a request to reset your Pure Electric password.\n\n\
             Open this link to choose a new password:\n{}\n\n\
             This link will expire in 1 hour. If you didn't request a password reset, please ignore this email.\n",
            link
        );
        let html = format!(
            r#"<html>
<body style="font-family: Arial, sans-serif; padding: 20px;">
  <h2>Password Reset Request</h2>
  <p>We received a request to reset your password. Click the link below to choose a new one:</p>
  <p><a href="{link}" style="background-color: #2196F3; color: white; padding: 12px 24px; text-decoration: none; border-radius: 4px; display: inline-block;">Reset Password</a></p>
  <p>Or copy and paste this link into your browser:</p>
  <p style="color: #666;">{link}</p>
  <p style="margin-top: 30px; color: #999; font-size: 12px;">This link will expire in 1 hour. If you didn't request a password reset, please ignore this email.</p>
</body>
</html>"#,
            link = link
        );

        Self {
            subject: PASSWORD_RESET_SUBJECT.to_string(),
            link,
            text,
            html,
        }
    }
}

// ============================================================================
// Transports
// ============================================================================

/// SendGrid HTTP API transport
pub struct SendGridNotifier {
    client: reqwest::Client,
    api_key: String,
    from_email: String,
    from_name: String,
    app_url: String,
}

impl SendGridNotifier {
    pub fn new(config: &NotificationConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .context("notification.api_key is required for the sendgrid provider")?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key,
            from_email: config.from_email.clone(),
            from_name: config.from_name.clone(),
            app_url: config.app_url.clone(),
        })
    }

    fn payload(&self, to: &str, email: &RenderedEmail) -> serde_json::Value {
        json!({
            "personalizations": [{ "to": [{ "email": to }] }],
            "from": { "email": self.from_email, "name": self.from_name },
            "subject": email.subject,
            "content": [
                { "type": "text/plain", "value": email.text },
                { "type": "text/html", "value": email.html },
            ],
        })
    }
}

#[async_trait]
impl Notifier for SendGridNotifier {
    async fn send(&self, kind: EmailKind, to: &str, token: &str) -> Result<(), DeliveryError> {
        let email = RenderedEmail::new(kind, &self.app_url, token);

        let response = self
            .client
            .post(SENDGRID_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&self.payload(to, &email))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    DeliveryError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
            });
        }

        tracing::debug!("SendGrid accepted {} email, status {}", kind.label(), status);
        Ok(())
    }
}

/// SMTP relay transport
pub struct SmtpNotifier {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    app_url: String,
}

impl SmtpNotifier {
    pub fn new(config: &NotificationConfig) -> Result<Self> {
        let host = config
            .smtp_host
            .as_deref()
            .filter(|h| !h.is_empty())
            .context("notification.smtp_host is required for the smtp provider")?;

        let from: Mailbox = format!("{} <{}>", config.from_name, config.from_email)
            .parse()
            .map_err(|e| anyhow!("Invalid from address: {}", e))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| anyhow!("Failed to create SMTP transport: {}", e))?
            .port(config.smtp_port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));

        if let (Some(username), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
            app_url: config.app_url.clone(),
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, kind: EmailKind, to: &str, token: &str) -> Result<(), DeliveryError> {
        let email = RenderedEmail::new(kind, &self.app_url, token);

        let recipient: Mailbox = to
            .parse()
            .map_err(|_| DeliveryError::InvalidAddress(to.to_string()))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(recipient)
            .subject(email.subject)
            .multipart(MultiPart::alternative_plain_html(email.text, email.html))
            .map_err(|e| DeliveryError::Transport(format!("Failed to build email: {}", e)))?;

        self.mailer
            .send(message)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        Ok(())
    }
}

/// Transport used when no provider is configured.
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn send(&self, _kind: EmailKind, _to: &str, _token: &str) -> Result<(), DeliveryError> {
        Err(DeliveryError::NotConfigured)
    }
}

// ============================================================================
// Queued delivery
// ============================================================================

struct DeliveryJob {
    kind: EmailKind,
    to: String,
    token: String,
}

/// Retry policy of the delivery worker
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (attempts are 1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Accepts messages into a bounded queue drained by a background worker.
///
/// `send` only fails when the queue is full or the worker is
/// gone; delivery failures are logged by the worker.
pub struct QueuedNotifier {
    tx: mpsc::Sender<DeliveryJob>,
}

impl QueuedNotifier {
    /// Start the worker. Must be called from within a Tokio runtime.
    pub fn spawn(inner: Arc<dyn Notifier>, capacity: usize, policy: RetryPolicy) -> Self {
        let (tx, mut rx) = mpsc::channel::<DeliveryJob>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                deliver_with_retry(inner.as_ref(), &job, policy).await;
            }
            tracing::debug!("Delivery queue closed, worker exiting");
        });

        Self { tx }
    }
}

#[async_trait]
impl Notifier for QueuedNotifier {
    async fn send(&self, kind: EmailKind, to: &str, token: &str) -> Result<(), DeliveryError> {
        self.tx
            .try_send(DeliveryJob {
                kind,
                to: to.to_string(),
                token: token.to_string(),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DeliveryError::QueueClosed,
            })
    }
}

async fn deliver_with_retry(inner: &dyn Notifier, job: &DeliveryJob, policy: RetryPolicy) {
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match inner.send(job.kind, &job.to, &job.token).await {
            Ok(()) => {
                tracing::info!("{} email delivered to {}", job.kind.label(), job.to);
                return;
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    "{} email to {} failed (attempt {}/{}): {}; retrying in {:?}",
                    job.kind.label(),
                    job.to,
                    attempt,
                    max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::warn!(
                    "{} email to {} dropped after {} attempt(s): {}",
                    job.kind.label(),
                    job.to,
                    attempt,
                    e
                );
                return;
            }
        }
    }
}

/// Build the notifier described by `config`.
///
/// Real transports are wrapped in a [`QueuedNotifier`]; the disabled provider
/// is returned bare so callers see `NotConfigured` immediately.
pub fn build_notifier(config: &NotificationConfig) -> Result<Arc<dyn Notifier>> {
    let transport: Arc<dyn Notifier> = match config.provider {
        NotificationProvider::Disabled => {
            tracing::warn!("Email delivery disabled; registrations will report a delivery warning");
            return Ok(Arc::new(DisabledNotifier));
        }
        NotificationProvider::Sendgrid => Arc::new(SendGridNotifier::new(config)?),
        NotificationProvider::Smtp => Arc::new(SmtpNotifier::new(config)?),
    };

    let policy = RetryPolicy {
        max_attempts: config.max_attempts,
        base_delay: Duration::from_secs(1),
    };
    Ok(Arc::new(QueuedNotifier::spawn(
        transport,
        config.queue_capacity,
        policy,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Fails the first `failures` calls with a retryable error, then succeeds.
    struct FlakyNotifier {
        failures: u32,
        calls: AtomicU32,
        delivered: Notify,
    }

    impl FlakyNotifier {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                delivered: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn send(&self, _kind: EmailKind, _to: &str, _token: &str) -> Result<(), DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(DeliveryError::Transport("connection reset".to_string()));
            }
            self.delivered.notify_one();
            Ok(())
        }
    }

    /// Never returns, so queued jobs pile up.
    struct StuckNotifier;

    #[async_trait]
    impl Notifier for StuckNotifier {
        async fn send(&self, _kind: EmailKind, _to: &str, _token: &str) -> Result<(), DeliveryError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_verification_email_link() {
        let email = RenderedEmail::new(EmailKind::Verification, "https://app.pureelectric.com/", "abc_123");

        assert_eq!(email.link, "https://app.pureelectric.com/verify?token=abc_123");
        assert_eq!(email.subject, "Verify your Pure Electric account");
        assert!(email.html.contains("https://app.pureelectric.com/verify?token=abc_123"));
        assert!(email.text.contains("24 hours"));
    }

    #[test]
    fn test_password_reset_email_link() {
        let email = RenderedEmail::new(EmailKind::PasswordReset, "https://app.pureelectric.com", "r_1");

        assert_eq!(email.link, "https://app.pureelectric.com/reset-password?token=r_1");
        assert_eq!(email.subject, "Reset your Pure Electric password");
        assert!(email.html.contains(&email.link));
        assert!(email.text.contains("1 hour"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DeliveryError::Timeout.is_retryable());
        assert!(DeliveryError::Transport("x".into()).is_retryable());
        assert!(DeliveryError::Rejected { status: 503 }.is_retryable());
        assert!(DeliveryError::Rejected { status: 429 }.is_retryable());
        assert!(!DeliveryError::Rejected { status: 401 }.is_retryable());
        assert!(!DeliveryError::NotConfigured.is_retryable());
        assert!(!DeliveryError::InvalidAddress("x".into()).is_retryable());
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_disabled_notifier_fails() {
        let result = DisabledNotifier.send(EmailKind::Verification, "a@b.com", "tok").await;
        assert_eq!(result, Err(DeliveryError::NotConfigured));
    }

    #[tokio::test]
    async fn test_queued_notifier_retries_until_delivered() {
        let inner = Arc::new(FlakyNotifier::new(2));
        let queued = QueuedNotifier::spawn(inner.clone(), 8, fast_policy(3));

        queued.send(EmailKind::Verification, "a@b.com", "tok").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), inner.delivered.notified())
            .await
            .expect("message should be delivered on the third attempt");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_queued_notifier_gives_up_after_max_attempts() {
        let inner = Arc::new(FlakyNotifier::new(10));
        let queued = QueuedNotifier::spawn(inner.clone(), 8, fast_policy(2));

        queued.send(EmailKind::Verification, "a@b.com", "tok").await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_queued_notifier_reports_full_queue() {
        let queued = QueuedNotifier::spawn(Arc::new(StuckNotifier), 1, fast_policy(1));

        // First job is taken by the worker, second fills the single slot
        queued.send(EmailKind::Verification, "a@b.com", "t1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queued.send(EmailKind::Verification, "a@b.com", "t2").await.unwrap();

        let result = queued.send(EmailKind::Verification, "a@b.com", "t3").await;
        assert_eq!(result, Err(DeliveryError::QueueFull));
    }

    #[tokio::test]
    async fn test_build_notifier_requires_credentials() {
        let config = NotificationConfig {
            provider: NotificationProvider::Sendgrid,
            api_key: None,
            ..Default::default()
        };
        assert!(build_notifier(&config).is_err());

        let config = NotificationConfig {
            provider: NotificationProvider::Smtp,
            smtp_host: None,
            ..Default::default()
        };
        assert!(build_notifier(&config).is_err());
    }

    #[tokio::test]
    async fn test_build_notifier_disabled() {
        let notifier = build_notifier(&NotificationConfig::default()).unwrap();
        let result = notifier.send(EmailKind::PasswordReset, "a@b.com", "tok").await;
        assert_eq!(result, Err(DeliveryError::NotConfigured));
    }
}
