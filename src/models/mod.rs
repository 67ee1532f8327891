//! # Data Models
//!
//! Entity models and credential value types used throughout the vault.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod integration;
pub mod oauth;
pub mod tenant;

pub use integration::Entity as Integration;
pub use integration::{ConnectionType, Environment, IntegrationStatus};
pub use oauth::{ExpiresAt, Expiry, OAuthData, TokenSet};
pub use tenant::Entity as Tenant;
pub use tenant::PlanTier;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "credential-vault".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
