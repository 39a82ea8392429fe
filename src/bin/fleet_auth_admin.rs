//! fleet-auth-admin - Operator commands for the account store
//!
//! Runs against the same configuration and database as the server.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use fleet_auth::{
    config::Config,
    db::{self, repositories::{SqlxPasswordResetRepository, SqlxSessionRepository, SqlxUserRepository}},
    services::{email::DisabledNotifier, AuthService, ProvisionOutcome},
};

/// Operator tooling for fleet-auth
#[derive(Parser)]
#[command(name = "fleet-auth-admin")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, short, default_value = "config.yml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a verified admin account, or promote an existing one
    CreateAdmin {
        email: String,
        /// Ignored when the account already exists
        #[arg(long)]
        password: String,
    },

    /// Disable an account and revoke its sessions
    Deactivate {
        /// User id or e-mail
        user: String,
    },

    /// Re-enable a disabled account
    Reactivate {
        /// User id or e-mail
        user: String,
    },

    /// Show the most recent sessions of an account
    Sessions {
        /// User id or e-mail
        user: String,
    },

    /// Delete all expired sessions
    Sweep,

    /// Apply pending database migrations
    Migrate,

    /// List accounts
    #[command(alias = "ls")]
    ListUsers {
        #[arg(long, default_value = "1")]
        page: i64,
        #[arg(long, default_value = "20")]
        per_page: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_auth=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_with_env(&cli.config)?;
    let pool = db::create_pool(&config.database).await?;

    let result = run(cli.command, &config, &pool).await;
    pool.close().await;
    result
}

async fn run(command: Commands, config: &Config, pool: &db::DynDatabasePool) -> Result<()> {
    if !matches!(command, Commands::Migrate) && !db::migrations::is_up_to_date(pool).await? {
        bail!("Database has pending migrations; run `fleet-auth-admin migrate` first");
    }

    let service = AuthService::new(
        SqlxUserRepository::boxed(pool.clone()),
        SqlxSessionRepository::boxed(pool.clone()),
        SqlxPasswordResetRepository::boxed(pool.clone()),
        Arc::new(DisabledNotifier),
        &config.auth,
    );

    match command {
        Commands::CreateAdmin { email, password } => {
            match service.provision_admin(&email, &password).await? {
                ProvisionOutcome::Created(id) => println!("Created admin {} (id {})", email, id),
                ProvisionOutcome::Promoted(id) => {
                    println!("Promoted existing user {} (id {}) to admin", email, id)
                }
            }
        }
        Commands::Deactivate { user } => {
            let id = resolve_user(&service, &user).await?;
            let revoked = service.deactivate_user(id).await?;
            println!("Deactivated user {}, revoked {} session(s)", id, revoked);
        }
        Commands::Reactivate { user } => {
            let id = resolve_user(&service, &user).await?;
            service.reactivate_user(id).await?;
            println!("Reactivated user {}", id);
        }
        Commands::Sessions { user } => {
            let id = resolve_user(&service, &user).await?;
            let sessions = service.list_sessions(id).await?;
            if sessions.is_empty() {
                println!("No sessions for user {}", id);
            }
            for s in sessions {
                let state = if s.is_expired() { "expired" } else { "active" };
                println!(
                    "{}…  {:<8} created {}  expires {}  last seen {}  {}",
                    s.token_prefix(),
                    state,
                    s.created_at.format("%Y-%m-%d %H:%M"),
                    s.expires_at.format("%Y-%m-%d %H:%M"),
                    s.last_activity.format("%Y-%m-%d %H:%M"),
                    s.device_info,
                );
            }
        }
        Commands::Sweep => {
            let removed = service.sweep_expired_sessions().await?;
            println!("Removed {} expired session(s)", removed);
        }
        Commands::ListUsers { page, per_page } => {
            let (users, total) = service.list_users(page, per_page).await?;
            println!("{} user(s), page {}", total, page);
            for u in users {
                println!(
                    "{:>6}  {:<40} {:<12} {:<10} {}",
                    u.id,
                    u.email,
                    u.role.as_str(),
                    if u.is_verified { "verified" } else { "pending" },
                    if u.is_active { "active" } else { "disabled" },
                );
            }
        }
        Commands::Migrate => {
            let applied = db::migrations::run_migrations(pool).await?;
            println!("Applied {} migration(s)", applied);
        }
    }

    Ok(())
}

/// Accept a numeric id or an e-mail address
async fn resolve_user(service: &AuthService, user: &str) -> Result<i64> {
    if let Ok(id) = user.parse::<i64>() {
        return Ok(id);
    }
    let found = service
        .find_user(user)
        .await?
        .with_context(|| format!("No user with e-mail {}", user))?;
    Ok(found.id)
}
