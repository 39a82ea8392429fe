//! fleet-auth - Account and session service for the Pure Electric fleet backend
//!
//! This library provides registration, e-mail verification, login and
//! session validation on top of a SQLite or PostgreSQL credential store.

pub mod api;
pub mod config;
pub mod db;
pub mod models;
pub mod services;
