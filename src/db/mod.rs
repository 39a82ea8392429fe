//! Database layer
//!
//! Storage for the credential store and the session table. Two drivers are
//! supported:
//! - SQLite (default, single-binary deployment and tests)
//! - PostgreSQL (the managed relational store)
//!
//! The driver is selected from configuration and hidden behind the
//! `DatabasePool` trait; repositories dispatch on `DatabasePool::driver`.
//!
//! ```ignore
//! use fleet_auth::config::DatabaseConfig;
//! use fleet_auth::db::{create_pool, migrations};
//!
//! let pool = create_pool(&DatabaseConfig::default()).await?;
//! migrations::run_migrations(&pool).await?;
//! pool.ping().await?;
//! ```

pub mod migrations;
pub mod pool;
pub mod repositories;

pub use pool::{
    create_pool, create_test_pool, DatabasePool, DynDatabasePool, PostgresDatabase, SqliteDatabase,
};
