//! User repository
//!
//! The credential store: lookups by e-mail, id and verification token,
//! inserts guarded by the unique e-mail constraint, and single-statement
//! partial updates.

use crate::config::DatabaseDriver;
use crate::db::DynDatabasePool;
use crate::models::{User, UserRole, UserUpdate};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;

/// Returned (inside `anyhow::Error`) when an insert hits the unique e-mail
/// constraint. Callers detect it with `err.is::<DuplicateEmail>()`.
#[derive(Debug, thiserror::Error)]
#[error("email already registered")]
pub struct DuplicateEmail;

/// User repository trait
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Find a user by normalized e-mail
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Get user by ID
    async fn get_by_id(&self, id: i64) -> Result<Option<User>>;

    /// Find the user holding exactly this verification token
    async fn find_by_verification_token(&self, token: &str) -> Result<Option<User>>;

    /// Insert a new user, failing with [`DuplicateEmail`] if the e-mail exists
    async fn insert(&self, user: &User) -> Result<User>;

    /// Apply a partial update in one statement. Returns false if no row matched.
    async fn update_fields(&self, id: i64, update: &UserUpdate) -> Result<bool>;

    /// List users, oldest first, with the total count
    async fn list(&self, page: i64, per_page: i64) -> Result<(Vec<User>, i64)>;
}

/// SQLx-based user repository implementation
///
/// Supports both SQLite and PostgreSQL databases.
pub struct SqlxUserRepository {
    pool: DynDatabasePool,
}

impl SqlxUserRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn UserRepository> {
        Arc::new(Self::new(pool))
    }

    fn sqlite(&self) -> Result<&SqlitePool> {
        self.pool.as_sqlite().context("SQLite pool unavailable")
    }

    fn postgres(&self) -> Result<&PgPool> {
        self.pool.as_postgres().context("PostgreSQL pool unavailable")
    }
}

#[async_trait]
impl UserRepository for SqlxUserRepository {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => find_user_by_email_sqlite(self.sqlite()?, email).await,
            DatabaseDriver::Postgres => find_user_by_email_postgres(self.postgres()?, email).await,
        }
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<User>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => get_user_by_id_sqlite(self.sqlite()?, id).await,
            DatabaseDriver::Postgres => get_user_by_id_postgres(self.postgres()?, id).await,
        }
    }

    async fn find_by_verification_token(&self, token: &str) -> Result<Option<User>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => find_user_by_token_sqlite(self.sqlite()?, token).await,
            DatabaseDriver::Postgres => find_user_by_token_postgres(self.postgres()?, token).await,
        }
    }

    async fn insert(&self, user: &User) -> Result<User> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => insert_user_sqlite(self.sqlite()?, user).await,
            DatabaseDriver::Postgres => insert_user_postgres(self.postgres()?, user).await,
        }
    }

    async fn update_fields(&self, id: i64, update: &UserUpdate) -> Result<bool> {
        if update.is_empty() {
            return Ok(self.get_by_id(id).await?.is_some());
        }
        match self.pool.driver() {
            DatabaseDriver::Sqlite => update_user_fields_sqlite(self.sqlite()?, id, update).await,
            DatabaseDriver::Postgres => {
                update_user_fields_postgres(self.postgres()?, id, update).await
            }
        }
    }

    async fn list(&self, page: i64, per_page: i64) -> Result<(Vec<User>, i64)> {
        let per_page = per_page.max(1);
        let offset = (page.max(1) - 1) * per_page;
        match self.pool.driver() {
            DatabaseDriver::Sqlite => list_users_sqlite(self.sqlite()?, per_page, offset).await,
            DatabaseDriver::Postgres => list_users_postgres(self.postgres()?, per_page, offset).await,
        }
    }
}

const USER_COLUMNS: &str = "id, email, password_hash, role, is_verified, is_active, \
     verification_token, verification_token_expires, last_login, distributor_id, \
     created_at, updated_at";

/// Map a unique-constraint failure to [`DuplicateEmail`]
fn map_insert_error(e: sqlx::Error) -> anyhow::Error {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => DuplicateEmail.into(),
        _ => anyhow::Error::new(e).context("Failed to insert user"),
    }
}

fn parse_role(role: &str) -> Result<UserRole> {
    UserRole::from_str(role).with_context(|| format!("Invalid role in database: {}", role))
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn find_user_by_email_sqlite(pool: &SqlitePool, email: &str) -> Result<Option<User>> {
    let row = sqlx::query(&format!("SELECT {} FROM users WHERE email = ?", USER_COLUMNS))
        .bind(email)
        .fetch_optional(pool)
        .await
        .context("Failed to get user by email")?;

    row.as_ref().map(row_to_user_sqlite).transpose()
}

async fn get_user_by_id_sqlite(pool: &SqlitePool, id: i64) -> Result<Option<User>> {
    let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get user by ID")?;

    row.as_ref().map(row_to_user_sqlite).transpose()
}

async fn find_user_by_token_sqlite(pool: &SqlitePool, token: &str) -> Result<Option<User>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM users WHERE verification_token = ?",
        USER_COLUMNS
    ))
    .bind(token)
    .fetch_optional(pool)
    .await
    .context("Failed to get user by verification token")?;

    row.as_ref().map(row_to_user_sqlite).transpose()
}

async fn insert_user_sqlite(pool: &SqlitePool, user: &User) -> Result<User> {
    let now = Utc::now();

    let result = sqlx::query(
        r#"
        INSERT INTO users (email, password_hash, role, is_verified, is_active,
                           verification_token, verification_token_expires, last_login,
                           distributor_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(user.role.as_str())
    .bind(user.is_verified)
    .bind(user.is_active)
    .bind(&user.verification_token)
    .bind(user.verification_token_expires)
    .bind(user.last_login)
    .bind(&user.distributor_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(map_insert_error)?;

    Ok(User {
        id: result.last_insert_rowid(),
        created_at: now,
        updated_at: now,
        ..user.clone()
    })
}

async fn update_user_fields_sqlite(pool: &SqlitePool, id: i64, update: &UserUpdate) -> Result<bool> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE users SET ");
    let mut set = qb.separated(", ");
    if let Some(hash) = &update.password_hash {
        set.push("password_hash = ").push_bind_unseparated(hash.clone());
    }
    if let Some(role) = update.role {
        set.push("role = ").push_bind_unseparated(role.as_str());
    }
    if let Some(verified) = update.is_verified {
        set.push("is_verified = ").push_bind_unseparated(verified);
    }
    if let Some(active) = update.is_active {
        set.push("is_active = ").push_bind_unseparated(active);
    }
    if let Some(token) = &update.verification_token {
        set.push("verification_token = ").push_bind_unseparated(token.clone());
    }
    if let Some(expires) = update.verification_token_expires {
        set.push("verification_token_expires = ").push_bind_unseparated(expires);
    }
    if let Some(last_login) = update.last_login {
        set.push("last_login = ").push_bind_unseparated(last_login);
    }
    set.push("updated_at = ").push_bind_unseparated(Utc::now());
    qb.push(" WHERE id = ").push_bind(id);

    let result = qb
        .build()
        .execute(pool)
        .await
        .context("Failed to update user")?;

    Ok(result.rows_affected() > 0)
}

async fn list_users_sqlite(pool: &SqlitePool, limit: i64, offset: i64) -> Result<(Vec<User>, i64)> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM users ORDER BY id LIMIT ? OFFSET ?",
        USER_COLUMNS
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("Failed to list users")?;

    let users = rows.iter().map(row_to_user_sqlite).collect::<Result<Vec<_>>>()?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await
        .context("Failed to count users")?;

    Ok((users, total))
}

fn row_to_user_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
    let role: String = row.try_get("role")?;

    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        role: parse_role(&role)?,
        is_verified: row.try_get("is_verified")?,
        is_active: row.try_get("is_active")?,
        verification_token: row.try_get("verification_token")?,
        verification_token_expires: row.try_get("verification_token_expires")?,
        last_login: row.try_get("last_login")?,
        distributor_id: row.try_get("distributor_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ============================================================================
// PostgreSQL implementations
// ============================================================================

async fn find_user_by_email_postgres(pool: &PgPool, email: &str) -> Result<Option<User>> {
    let row = sqlx::query(&format!("SELECT {} FROM users WHERE email = $1", USER_COLUMNS))
        .bind(email)
        .fetch_optional(pool)
        .await
        .context("Failed to get user by email")?;

    row.as_ref().map(row_to_user_postgres).transpose()
}

async fn get_user_by_id_postgres(pool: &PgPool, id: i64) -> Result<Option<User>> {
    let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get user by ID")?;

    row.as_ref().map(row_to_user_postgres).transpose()
}

async fn find_user_by_token_postgres(pool: &PgPool, token: &str) -> Result<Option<User>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM users WHERE verification_token = $1",
        USER_COLUMNS
    ))
    .bind(token)
    .fetch_optional(pool)
    .await
    .context("Failed to get user by verification token")?;

    row.as_ref().map(row_to_user_postgres).transpose()
}

async fn insert_user_postgres(pool: &PgPool, user: &User) -> Result<User> {
    let now = Utc::now();

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO users (email, password_hash, role, is_verified, is_active,
                           verification_token, verification_token_expires, last_login,
                           distributor_id, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING id
        "#,
    )
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(user.role.as_str())
    .bind(user.is_verified)
    .bind(user.is_active)
    .bind(&user.verification_token)
    .bind(user.verification_token_expires)
    .bind(user.last_login)
    .bind(&user.distributor_id)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .map_err(map_insert_error)?;

    Ok(User {
        id,
        created_at: now,
        updated_at: now,
        ..user.clone()
    })
}

async fn update_user_fields_postgres(pool: &PgPool, id: i64, update: &UserUpdate) -> Result<bool> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE users SET ");
    let mut set = qb.separated(", ");
    if let Some(hash) = &update.password_hash {
        set.push("password_hash = ").push_bind_unseparated(hash.clone());
    }
    if let Some(role) = update.role {
        set.push("role = ").push_bind_unseparated(role.as_str());
    }
    if let Some(verified) = update.is_verified {
        set.push("is_verified = ").push_bind_unseparated(verified);
    }
    if let Some(active) = update.is_active {
        set.push("is_active = ").push_bind_unseparated(active);
    }
    if let Some(token) = &update.verification_token {
        set.push("verification_token = ").push_bind_unseparated(token.clone());
    }
    if let Some(expires) = update.verification_token_expires {
        set.push("verification_token_expires = ").push_bind_unseparated(expires);
    }
    if let Some(last_login) = update.last_login {
        set.push("last_login = ").push_bind_unseparated(last_login);
    }
    set.push("updated_at = ").push_bind_unseparated(Utc::now());
    qb.push(" WHERE id = ").push_bind(id);

    let result = qb
        .build()
        .execute(pool)
        .await
        .context("Failed to update user")?;

    Ok(result.rows_affected() > 0)
}

async fn list_users_postgres(pool: &PgPool, limit: i64, offset: i64) -> Result<(Vec<User>, i64)> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM users ORDER BY id LIMIT $1 OFFSET $2",
        USER_COLUMNS
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("Failed to list users")?;

    let users = rows.iter().map(row_to_user_postgres).collect::<Result<Vec<_>>>()?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await
        .context("Failed to count users")?;

    Ok((users, total))
}

fn row_to_user_postgres(row: &sqlx::postgres::PgRow) -> Result<User> {
    let role: String = row.try_get("role")?;

    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        role: parse_role(&role)?,
        is_verified: row.try_get("is_verified")?,
        is_active: row.try_get("is_active")?,
        verification_token: row.try_get("verification_token")?,
        verification_token_expires: row.try_get("verification_token_expires")?,
        last_login: row.try_get("last_login")?,
        distributor_id: row.try_get("distributor_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
