//! fleet-auth - Account and session service

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleet_auth::{
    api::{self, AppState},
    config::Config,
    db::{
        self,
        repositories::{SqlxPasswordResetRepository, SqlxSessionRepository, SqlxUserRepository},
    },
    services::{build_notifier, AuthService, LoginRateLimiter},
};

/// Rate limiter cleanup period
const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_auth=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting fleet-auth {}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = std::env::var("FLEET_AUTH_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yml"));
    let config = Config::load_with_env(&config_path)?;
    tracing::info!("Configuration loaded from {}", config_path.display());

    // Initialize database
    let pool = db::create_pool(&config.database).await?;
    tracing::info!("Database connected: {:?}", config.database.driver);

    // Run migrations
    let applied = db::migrations::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed ({} applied)", applied);

    // Notification delivery
    let notifier = build_notifier(&config.notification)?;
    tracing::info!("Notification provider: {:?}", config.notification.provider);

    // Services
    let auth_service = Arc::new(AuthService::new(
        SqlxUserRepository::boxed(pool.clone()),
        SqlxSessionRepository::boxed(pool.clone()),
        SqlxPasswordResetRepository::boxed(pool.clone()),
        notifier,
        &config.auth,
    ));
    let rate_limiter = Arc::new(LoginRateLimiter::new());

    // Periodic expired-session sweep
    if config.auth.sweep_interval_secs > 0 {
        let service = auth_service.clone();
        let period = Duration::from_secs(config.auth.sweep_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = service.sweep_expired_sessions().await {
                    tracing::warn!("Session sweep failed: {}", e);
                }
            }
        });
    } else {
        tracing::info!("Session sweep disabled");
    }

    // Start rate limiter cleanup task
    {
        let limiter = rate_limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(LIMITER_CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                limiter.cleanup().await;
            }
        });
    }

    let state = AppState {
        auth_service,
        rate_limiter,
    };

    // Build router
    let app = api::build_router(state, &config.server.cors_origin)?;

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
