//! # Explainable Platform Common Library
//!
//! Shared code for the platform services:
//! - Error type
//! - Layered configuration (CLI/ENV → TOML → defaults)
//! - SQLite schema, initialization and migrations
//! - Timestamp helpers

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod time;

pub use error::{Error, Result};
