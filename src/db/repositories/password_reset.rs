//! Password reset repository
//!
//! Single-use reset tokens. A token is spent by flipping `used`, which only
//! succeeds once per row.

use crate::config::DatabaseDriver;
use crate::db::DynDatabasePool;
use crate::models::{NewPasswordReset, PasswordReset};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, SqlitePool};
use std::sync::Arc;

#[async_trait]
pub trait PasswordResetRepository: Send + Sync {
    async fn create(&self, reset: &NewPasswordReset) -> Result<PasswordReset>;

    /// Find a reset token by exact match, used or not
    async fn find_by_token(&self, token: &str) -> Result<Option<PasswordReset>>;

    /// Mark a token used. Returns false if it was already spent.
    async fn mark_used(&self, id: i64) -> Result<bool>;

    /// Delete spent tokens and tokens that expired before `now`
    async fn delete_stale(&self, now: DateTime<Utc>) -> Result<u64>;
}

pub struct SqlxPasswordResetRepository {
    pool: DynDatabasePool,
}

impl SqlxPasswordResetRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn PasswordResetRepository> {
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
impl PasswordResetRepository for SqlxPasswordResetRepository {
    async fn create(&self, reset: &NewPasswordReset) -> Result<PasswordReset> {
        let id = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query(
                r#"
                INSERT INTO password_reset_tokens (user_id, token, expires_at, used, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(reset.user_id)
            .bind(&reset.token)
            .bind(reset.expires_at)
            .bind(false)
            .bind(reset.created_at)
            .execute(self.sqlite()?)
            .await
            .context("Failed to create password reset token")?
            .last_insert_rowid(),
            DatabaseDriver::Postgres => sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO password_reset_tokens (user_id, token, expires_at, used, created_at)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id
                "#,
            )
            .bind(reset.user_id)
            .bind(&reset.token)
            .bind(reset.expires_at)
            .bind(false)
            .bind(reset.created_at)
            .fetch_one(self.postgres()?)
            .await
            .context("Failed to create password reset token")?,
        };

        Ok(PasswordReset {
            id,
            user_id: reset.user_id,
            token: reset.token.clone(),
            expires_at: reset.expires_at,
            used: false,
            created_at: reset.created_at,
        })
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<PasswordReset>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let row = sqlx::query(
                    r#"
                    SELECT id, user_id, token, expires_at, used, created_at
                    FROM password_reset_tokens
                    WHERE token = ?
                    "#,
                )
                .bind(token)
                .fetch_optional(self.sqlite()?)
                .await
                .context("Failed to get password reset token")?;

                row.as_ref().map(row_to_reset_sqlite).transpose()
            }
            DatabaseDriver::Postgres => {
                let row = sqlx::query(
                    r#"
                    SELECT id, user_id, token, expires_at, used, created_at
                    FROM password_reset_tokens
                    WHERE token = $1
                    "#,
                )
                .bind(token)
                .fetch_optional(self.postgres()?)
                .await
                .context("Failed to get password reset token")?;

                row.as_ref().map(row_to_reset_postgres).transpose()
            }
        }
    }

    async fn mark_used(&self, id: i64) -> Result<bool> {
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                sqlx::query("UPDATE password_reset_tokens SET used = ? WHERE id = ? AND used = ?")
                    .bind(true)
                    .bind(id)
                    .bind(false)
                    .execute(self.sqlite()?)
                    .await
                    .context("Failed to mark password reset token used")?
                    .rows_affected()
            }
            DatabaseDriver::Postgres => {
                sqlx::query("UPDATE password_reset_tokens SET used = TRUE WHERE id = $1 AND used = FALSE")
                    .bind(id)
                    .execute(self.postgres()?)
                    .await
                    .context("Failed to mark password reset token used")?
                    .rows_affected()
            }
        };
        Ok(affected > 0)
    }

    async fn delete_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                sqlx::query("DELETE FROM password_reset_tokens WHERE used = ? OR expires_at < ?")
                    .bind(true)
                    .bind(now)
                    .execute(self.sqlite()?)
                    .await
                    .context("Failed to delete stale password reset tokens")?
                    .rows_affected()
            }
            DatabaseDriver::Postgres => {
                sqlx::query("DELETE FROM password_reset_tokens WHERE used = TRUE OR expires_at < $1")
                    .bind(now)
                    .execute(self.postgres()?)
                    .await
                    .context("Failed to delete stale password reset tokens")?
                    .rows_affected()
            }
        };
        Ok(affected)
    }
}

fn row_to_reset_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<PasswordReset> {
    Ok(PasswordReset {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        token: row.try_get("token")?,
        expires_at: row.try_get("expires_at")?,
        used: row.try_get("used")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_reset_postgres(row: &sqlx::postgres::PgRow) -> Result<PasswordReset> {
    Ok(PasswordReset {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        token: row.try_get("token")?,
        expires_at: row.try_get("expires_at")?,
        used: row.try_get("used")?,
        created_at: row.try_get("created_at")?,
    })
}
