//! Rate limiter for login attempts
//!
//! Provides protection against brute force attacks by:
//! - Limiting failed login attempts per e-mail (5 per 15 minutes)
//! - Limiting login requests per IP address (10 per minute)

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::RwLock;

const EMAIL_MAX_FAILURES: usize = 5;
const IP_MAX_REQUESTS: usize = 10;

/// Sliding-window login rate limiter
pub struct LoginRateLimiter {
    /// Failed login attempts by normalized e-mail
    email_failures: RwLock<HashMap<String, Vec<DateTime<Utc>>>>,
    /// Login requests by IP address
    ip_requests: RwLock<HashMap<IpAddr, Vec<DateTime<Utc>>>>,
    email_window: Duration,
    ip_window: Duration,
}

impl LoginRateLimiter {
    pub fn new() -> Self {
        Self {
            email_failures: RwLock::new(HashMap::new()),
            ip_requests: RwLock::new(HashMap::new()),
            email_window: Duration::minutes(15),
            ip_window: Duration::minutes(1),
        }
    }

    /// Seconds until `email` may try again, or `None` if it is not limited
    pub async fn email_retry_after(&self, email: &str) -> Option<i64> {
        let mut failures = self.email_failures.write().await;
        let now = Utc::now();
        let attempts = failures.entry(email.to_lowercase()).or_default();
        attempts.retain(|t| *t > now - self.email_window);

        limited_for(attempts, EMAIL_MAX_FAILURES, self.email_window, now)
    }

    /// Record a failed login attempt for `email`
    pub async fn record_failure(&self, email: &str) {
        let mut failures = self.email_failures.write().await;
        failures
            .entry(email.to_lowercase())
            .or_default()
            .push(Utc::now());
    }

    /// Clear failed attempts for `email` (on successful login)
    pub async fn clear(&self, email: &str) {
        self.email_failures.write().await.remove(&email.to_lowercase());
    }

    /// Count a request from `ip`; returns the wait in seconds when over the limit.
    ///
    /// Rejected requests are not counted.
    pub async fn check_ip(&self, ip: IpAddr) -> Option<i64> {
        let mut requests = self.ip_requests.write().await;
        let now = Utc::now();
        let recent = requests.entry(ip).or_default();
        recent.retain(|t| *t > now - self.ip_window);

        if let Some(wait) = limited_for(recent, IP_MAX_REQUESTS, self.ip_window, now) {
            return Some(wait);
        }
        recent.push(now);
        None
    }

    /// Drop entries outside their window (called periodically)
    pub async fn cleanup(&self) {
        let now = Utc::now();

        {
            let email_cutoff = now - self.email_window;
            let mut failures = self.email_failures.write().await;
            failures.retain(|_, times| {
                times.retain(|t| *t > email_cutoff);
                !times.is_empty()
            });
        }

        {
            let ip_cutoff = now - self.ip_window;
            let mut requests = self.ip_requests.write().await;
            requests.retain(|_, times| {
                times.retain(|t| *t > ip_cutoff);
                !times.is_empty()
            });
        }
    }
}

impl Default for LoginRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// If `times` holds `max` or more entries, seconds until the oldest leaves the window
fn limited_for(
    times: &[DateTime<Utc>],
    max: usize,
    window: Duration,
    now: DateTime<Utc>,
) -> Option<i64> {
    if times.len() < max {
        return None;
    }
    let oldest = times.iter().min()?;
    let wait = (*oldest + window - now).num_seconds();
    Some(wait.max(1))
}
