//! # Credential Vault Library
//!
//! Encrypted storage of per-tenant provider credentials, OAuth token refresh,
//! and the integration lifecycle, plus the operator HTTP API around them.

pub mod auth;
pub mod config;
pub mod credential_store;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod models;
pub mod provider_client;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub mod token_refresh;
pub use migration;
