//! Session repository
//!
//! Database operations for login sessions.
//!
//! This module provides:
//! - `SessionRepository` trait defining the interface for session data access
//! - `SqlxSessionRepository` implementing the trait for SQLite and PostgreSQL

use crate::config::DatabaseDriver;
use crate::db::DynDatabasePool;
use crate::models::{NewSession, Session};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, SqlitePool};
use std::sync::Arc;

/// Session repository trait
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert a new session
    async fn create(&self, session: &NewSession) -> Result<Session>;

    /// Find a session by exact token match
    async fn find_by_token(&self, token: &str) -> Result<Option<Session>>;

    /// Record activity on a session. Only `last_activity` changes.
    async fn touch(&self, token: &str, now: DateTime<Utc>) -> Result<()>;

    /// Delete a session; returns whether a row was removed
    async fn delete(&self, token: &str) -> Result<bool>;

    /// Delete all sessions for a user
    async fn delete_by_user(&self, user_id: i64) -> Result<u64>;

    /// Delete every session whose `expires_at` is before `now`
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Most recent sessions of a user, newest first
    async fn list_by_user(&self, user_id: i64, limit: i64) -> Result<Vec<Session>>;
}

/// SQLx-based session repository implementation
///
/// Supports both SQLite and PostgreSQL databases.
pub struct SqlxSessionRepository {
    pool: DynDatabasePool,
}

impl SqlxSessionRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn SessionRepository> {
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
impl SessionRepository for SqlxSessionRepository {
    async fn create(&self, session: &NewSession) -> Result<Session> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => create_session_sqlite(self.sqlite()?, session).await,
            DatabaseDriver::Postgres => create_session_postgres(self.postgres()?, session).await,
        }
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Session>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => find_session_sqlite(self.sqlite()?, token).await,
            DatabaseDriver::Postgres => find_session_postgres(self.postgres()?, token).await,
        }
    }

    async fn touch(&self, token: &str, now: DateTime<Utc>) -> Result<()> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                sqlx::query("UPDATE sessions SET last_activity = ? WHERE token = ?")
                    .bind(now)
                    .bind(token)
                    .execute(self.sqlite()?)
                    .await
                    .context("Failed to update session activity")?;
            }
            DatabaseDriver::Postgres => {
                sqlx::query("UPDATE sessions SET last_activity = $1 WHERE token = $2")
                    .bind(now)
                    .bind(token)
                    .execute(self.postgres()?)
                    .await
                    .context("Failed to update session activity")?;
            }
        }
        Ok(())
    }

    async fn delete(&self, token: &str) -> Result<bool> {
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query("DELETE FROM sessions WHERE token = ?")
                .bind(token)
                .execute(self.sqlite()?)
                .await
                .context("Failed to delete session")?
                .rows_affected(),
            DatabaseDriver::Postgres => sqlx::query("DELETE FROM sessions WHERE token = $1")
                .bind(token)
                .execute(self.postgres()?)
                .await
                .context("Failed to delete session")?
                .rows_affected(),
        };
        Ok(affected > 0)
    }

    async fn delete_by_user(&self, user_id: i64) -> Result<u64> {
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query("DELETE FROM sessions WHERE user_id = ?")
                .bind(user_id)
                .execute(self.sqlite()?)
                .await
                .context("Failed to delete sessions by user")?
                .rows_affected(),
            DatabaseDriver::Postgres => sqlx::query("DELETE FROM sessions WHERE user_id = $1")
                .bind(user_id)
                .execute(self.postgres()?)
                .await
                .context("Failed to delete sessions by user")?
                .rows_affected(),
        };
        Ok(affected)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query("DELETE FROM sessions WHERE expires_at < ?")
                .bind(now)
                .execute(self.sqlite()?)
                .await
                .context("Failed to delete expired sessions")?
                .rows_affected(),
            DatabaseDriver::Postgres => sqlx::query("DELETE FROM sessions WHERE expires_at < $1")
                .bind(now)
                .execute(self.postgres()?)
                .await
                .context("Failed to delete expired sessions")?
                .rows_affected(),
        };
        Ok(affected)
    }

    async fn list_by_user(&self, user_id: i64, limit: i64) -> Result<Vec<Session>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => list_sessions_sqlite(self.sqlite()?, user_id, limit).await,
            DatabaseDriver::Postgres => {
                list_sessions_postgres(self.postgres()?, user_id, limit).await
            }
        }
    }
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn create_session_sqlite(pool: &SqlitePool, session: &NewSession) -> Result<Session> {
    let result = sqlx::query(
        r#"
        INSERT INTO sessions (user_id, token, device_info, expires_at, last_activity, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(session.user_id)
    .bind(&session.token)
    .bind(&session.device_info)
    .bind(session.expires_at)
    .bind(session.created_at)
    .bind(session.created_at)
    .execute(pool)
    .await
    .context("Failed to create session")?;

    Ok(session_from_new(result.last_insert_rowid(), session))
}

async fn find_session_sqlite(pool: &SqlitePool, token: &str) -> Result<Option<Session>> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, token, device_info, expires_at, last_activity, created_at
        FROM sessions
        WHERE token = ?
        "#,
    )
    .bind(token)
    .fetch_optional(pool)
    .await
    .context("Failed to get session by token")?;

    row.as_ref().map(row_to_session_sqlite).transpose()
}

async fn list_sessions_sqlite(pool: &SqlitePool, user_id: i64, limit: i64) -> Result<Vec<Session>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, token, device_info, expires_at, last_activity, created_at
        FROM sessions
        WHERE user_id = ?
        ORDER BY created_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to list sessions")?;

    rows.iter().map(row_to_session_sqlite).collect()
}

fn row_to_session_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        token: row.try_get("token")?,
        device_info: row.try_get("device_info")?,
        expires_at: row.try_get("expires_at")?,
        last_activity: row.try_get("last_activity")?,
        created_at: row.try_get("created_at")?,
    })
}

// ============================================================================
// PostgreSQL implementations
// ============================================================================

async fn create_session_postgres(pool: &PgPool, session: &NewSession) -> Result<Session> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO sessions (user_id, token, device_info, expires_at, last_activity, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(session.user_id)
    .bind(&session.token)
    .bind(&session.device_info)
    .bind(session.expires_at)
    .bind(session.created_at)
    .bind(session.created_at)
    .fetch_one(pool)
    .await
    .context("Failed to create session")?;

    Ok(session_from_new(id, session))
}

async fn find_session_postgres(pool: &PgPool, token: &str) -> Result<Option<Session>> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, token, device_info, expires_at, last_activity, created_at
        FROM sessions
        WHERE token = $1
        "#,
    )
    .bind(token)
    .fetch_optional(pool)
    .await
    .context("Failed to get session by token")?;

    row.as_ref().map(row_to_session_postgres).transpose()
}

async fn list_sessions_postgres(pool: &PgPool, user_id: i64, limit: i64) -> Result<Vec<Session>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, token, device_info, expires_at, last_activity, created_at
        FROM sessions
        WHERE user_id = $1
        ORDER BY created_at DESC, id DESC
        LIMIT $2
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to list sessions")?;

    rows.iter().map(row_to_session_postgres).collect()
}

fn row_to_session_postgres(row: &sqlx::postgres::PgRow) -> Result<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        token: row.try_get("token")?,
        device_info: row.try_get("device_info")?,
        expires_at: row.try_get("expires_at")?,
        last_activity: row.try_get("last_activity")?,
        created_at: row.try_get("created_at")?,
    })
}

fn session_from_new(id: i64, session: &NewSession) -> Session {
    Session {
        id,
        user_id: session.user_id,
        token: session.token.clone(),
        device_info: session.device_info.clone(),
        expires_at: session.expires_at,
        last_activity: session.created_at,
        created_at: session.created_at,
    }
}
