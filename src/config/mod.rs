//! Configuration management
//!
//! This module handles loading and parsing configuration for the fleet-auth service.
//! Configuration can be loaded from:
//! - config.yml file
//! - Environment variables (override file settings)
//!
//! Missing optional values are filled with sensible defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bounds on token lifetimes
pub const MAX_SESSION_TTL_DAYS: i64 = 3650;
pub const MAX_VERIFICATION_TTL_HOURS: i64 = 720;
pub const MAX_RESET_TTL_MINUTES: i64 = 1440;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Authentication policy
    #[serde(default)]
    pub auth: AuthConfig,
    /// Outbound e-mail configuration
    #[serde(default)]
    pub notification: NotificationConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS allowed origin, `*` allows any
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origin: default_cors_origin(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_cors_origin() -> String {
    "*".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database driver (sqlite or postgres)
    #[serde(default)]
    pub driver: DatabaseDriver,
    /// Backing-store connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Backing-store credential, used as the connection password when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_key: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: DatabaseDriver::default(),
            url: default_database_url(),
            service_key: None,
        }
    }
}

fn default_database_url() -> String {
    "data/fleet-auth.db".to_string()
}

/// Database driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    /// SQLite (default)
    #[default]
    Sqlite,
    /// PostgreSQL
    Postgres,
}

/// Authentication policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Minimum accepted password length in characters
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
    /// Lifetime of an e-mail verification token
    #[serde(default = "default_verification_ttl_hours")]
    pub verification_ttl_hours: i64,
    /// Lifetime of a session token (hard cap, never extended)
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: i64,
    /// Lifetime of a password reset token
    #[serde(default = "default_reset_ttl_minutes")]
    pub reset_ttl_minutes: i64,
    /// Upper bound on any single store call
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,
    /// Interval of the expired-session sweep, 0 disables it
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            min_password_length: default_min_password_length(),
            verification_ttl_hours: default_verification_ttl_hours(),
            session_ttl_days: default_session_ttl_days(),
            reset_ttl_minutes: default_reset_ttl_minutes(),
            store_timeout_secs: default_store_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl AuthConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

fn default_min_password_length() -> usize {
    8
}

fn default_verification_ttl_hours() -> i64 {
    24
}

fn default_session_ttl_days() -> i64 {
    30
}

fn default_reset_ttl_minutes() -> i64 {
    60
}

fn default_store_timeout_secs() -> u64 {
    15
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

/// Outbound e-mail configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Delivery provider
    #[serde(default)]
    pub provider: NotificationProvider,
    /// Provider API key (SendGrid)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Sender address
    #[serde(default = "default_from_email")]
    pub from_email: String,
    /// Sender display name
    #[serde(default = "default_from_name")]
    pub from_name: String,
    /// Base URL used to build the verification link
    #[serde(default = "default_app_url")]
    pub app_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_password: Option<String>,
    /// Per-delivery network timeout
    #[serde(default = "default_notification_timeout_secs")]
    pub timeout_secs: u64,
    /// Pending deliveries held by the background worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Attempts per message before it is dropped
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            provider: NotificationProvider::default(),
            api_key: None,
            from_email: default_from_email(),
            from_name: default_from_name(),
            app_url: default_app_url(),
            smtp_host: None,
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            timeout_secs: default_notification_timeout_secs(),
            queue_capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_from_email() -> String {
    "noreply@pureelectric.com".to_string()
}

fn default_from_name() -> String {
    "Pure Electric".to_string()
}

fn default_app_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_notification_timeout_secs() -> u64 {
    15
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_attempts() -> u32 {
    3
}

/// E-mail delivery provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationProvider {
    /// SendGrid HTTP API
    Sendgrid,
    /// Plain SMTP relay
    Smtp,
    /// No delivery; registrations report a delivery warning
    #[default]
    Disabled,
}

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {message}")]
    ParseError {
        path: String,
        message: String,
    },
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl Config {
    /// Load configuration from file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// If the file exists but is invalid YAML, returns an error with details.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            ConfigError::ParseError {
                path: path.display().to_string(),
                message: format_yaml_error(&e),
            }
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file with environment variable overrides
    ///
    /// Environment variables follow the pattern `FLEET_AUTH_<SECTION>_<KEY>`:
    /// - FLEET_AUTH_SERVER_HOST / _PORT / _CORS_ORIGIN
    /// - FLEET_AUTH_DATABASE_DRIVER / _URL / _SERVICE_KEY
    /// - FLEET_AUTH_MIN_PASSWORD_LENGTH, FLEET_AUTH_VERIFICATION_TTL_HOURS,
    ///   FLEET_AUTH_SESSION_TTL_DAYS, FLEET_AUTH_RESET_TTL_MINUTES,
    ///   FLEET_AUTH_STORE_TIMEOUT_SECS, FLEET_AUTH_SWEEP_INTERVAL_SECS
    /// - FLEET_AUTH_NOTIFICATION_PROVIDER / _API_KEY / _FROM_EMAIL / _APP_URL
    /// - FLEET_AUTH_SMTP_HOST / _PORT / _USERNAME / _PASSWORD
    pub fn load_with_env(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_range("auth.session_ttl_days", self.auth.session_ttl_days, MAX_SESSION_TTL_DAYS)?;
        check_range(
            "auth.verification_ttl_hours",
            self.auth.verification_ttl_hours,
            MAX_VERIFICATION_TTL_HOURS,
        )?;
        check_range("auth.reset_ttl_minutes", self.auth.reset_ttl_minutes, MAX_RESET_TTL_MINUTES)?;
        if self.auth.store_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "auth.store_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply environment variable overrides to the configuration
    fn apply_env_overrides(&mut self) {
        // Server configuration
        if let Ok(host) = std::env::var("FLEET_AUTH_SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse::<u16>("FLEET_AUTH_SERVER_PORT") {
            self.server.port = port;
        }
        if let Ok(cors_origin) = std::env::var("FLEET_AUTH_SERVER_CORS_ORIGIN") {
            self.server.cors_origin = cors_origin;
        }

        // Database configuration
        if let Ok(driver) = std::env::var("FLEET_AUTH_DATABASE_DRIVER") {
            match driver.to_lowercase().as_str() {
                "sqlite" => self.database.driver = DatabaseDriver::Sqlite,
                "postgres" | "postgresql" => self.database.driver = DatabaseDriver::Postgres,
                _ => {}
            }
        }
        if let Ok(url) = std::env::var("FLEET_AUTH_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(key) = std::env::var("FLEET_AUTH_DATABASE_SERVICE_KEY") {
            self.database.service_key = Some(key);
        }

        // Auth policy
        if let Some(len) = env_parse::<usize>("FLEET_AUTH_MIN_PASSWORD_LENGTH") {
            self.auth.min_password_length = len;
        }
        if let Some(hours) = env_parse::<i64>("FLEET_AUTH_VERIFICATION_TTL_HOURS") {
            self.auth.verification_ttl_hours = hours;
        }
        if let Some(days) = env_parse::<i64>("FLEET_AUTH_SESSION_TTL_DAYS") {
            self.auth.session_ttl_days = days;
        }
        if let Some(minutes) = env_parse::<i64>("FLEET_AUTH_RESET_TTL_MINUTES") {
            self.auth.reset_ttl_minutes = minutes;
        }
        if let Some(secs) = env_parse::<u64>("FLEET_AUTH_STORE_TIMEOUT_SECS") {
            self.auth.store_timeout_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("FLEET_AUTH_SWEEP_INTERVAL_SECS") {
            self.auth.sweep_interval_secs = secs;
        }

        // Notification configuration
        if let Ok(provider) = std::env::var("FLEET_AUTH_NOTIFICATION_PROVIDER") {
            match provider.to_lowercase().as_str() {
                "sendgrid" => self.notification.provider = NotificationProvider::Sendgrid,
                "smtp" => self.notification.provider = NotificationProvider::Smtp,
                "disabled" => self.notification.provider = NotificationProvider::Disabled,
                _ => {}
            }
        }
        if let Ok(key) = std::env::var("FLEET_AUTH_NOTIFICATION_API_KEY") {
            self.notification.api_key = Some(key);
        }
        if let Ok(from) = std::env::var("FLEET_AUTH_NOTIFICATION_FROM_EMAIL") {
            self.notification.from_email = from;
        }
        if let Ok(url) = std::env::var("FLEET_AUTH_NOTIFICATION_APP_URL") {
            self.notification.app_url = url;
        }
        if let Ok(host) = std::env::var("FLEET_AUTH_SMTP_HOST") {
            self.notification.smtp_host = Some(host);
        }
        if let Some(port) = env_parse::<u16>("FLEET_AUTH_SMTP_PORT") {
            self.notification.smtp_port = port;
        }
        if let Ok(username) = std::env::var("FLEET_AUTH_SMTP_USERNAME") {
            self.notification.smtp_username = Some(username);
        }
        if let Ok(password) = std::env::var("FLEET_AUTH_SMTP_PASSWORD") {
            self.notification.smtp_password = Some(password);
        }
    }
}

fn check_range(key: &str, value: i64, max: i64) -> Result<(), ConfigError> {
    if value <= 0 {
        return Err(ConfigError::ValidationError(format!("{} must be positive", key)));
    }
    if value > max {
        return Err(ConfigError::ValidationError(format!(
            "{} must not exceed {}",
            key, max
        )));
    }
    Ok(())
}

/// Read and parse an environment variable, ignoring unparsable values
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

/// Format YAML parsing error with location and context
fn format_yaml_error(e: &serde_yaml::Error) -> String {
    if let Some(location) = e.location() {
        format!(
            "at line {}, column {}: {}",
            location.line(),
            location.column(),
            e
        )
    } else {
        e.to_string()
    }
}

// Shared mutex for all config tests that modify environment variables.
#[cfg(test)]
static CONFIG_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
const ENV_KEYS: &[&str] = &[
    "FLEET_AUTH_SERVER_HOST",
    "FLEET_AUTH_SERVER_PORT",
    "FLEET_AUTH_SERVER_CORS_ORIGIN",
    "FLEET_AUTH_DATABASE_DRIVER",
    "FLEET_AUTH_DATABASE_URL",
    "FLEET_AUTH_DATABASE_SERVICE_KEY",
    "FLEET_AUTH_MIN_PASSWORD_LENGTH",
    "FLEET_AUTH_VERIFICATION_TTL_HOURS",
    "FLEET_AUTH_SESSION_TTL_DAYS",
    "FLEET_AUTH_RESET_TTL_MINUTES",
    "FLEET_AUTH_STORE_TIMEOUT_SECS",
    "FLEET_AUTH_SWEEP_INTERVAL_SECS",
    "FLEET_AUTH_NOTIFICATION_PROVIDER",
    "FLEET_AUTH_NOTIFICATION_API_KEY",
    "FLEET_AUTH_NOTIFICATION_FROM_EMAIL",
    "FLEET_AUTH_NOTIFICATION_APP_URL",
    "FLEET_AUTH_SMTP_HOST",
    "FLEET_AUTH_SMTP_PORT",
    "FLEET_AUTH_SMTP_USERNAME",
    "FLEET_AUTH_SMTP_PASSWORD",
];

#[cfg(test)]
fn clear_env() {
    for key in ENV_KEYS {
        std::env::remove_var(key);
    }
}
