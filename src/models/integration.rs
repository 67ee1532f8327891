//! Integration entity model
//!
//! One row per (tenant, provider) connection. Credentials live in two places:
//! the current nested `settings` bag and the legacy top-level `client_id`,
//! `client_secret` and `oauth_data` columns, which are read-only fallbacks.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use super::tenant::Entity as Tenant;

/// Integration entity representing a tenant's connection to a third-party provider
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "integrations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning tenant; every query is tenant-scoped
    pub tenant_id: Uuid,

    /// Open-ended provider identifier (e.g. `quickbooks`, `microsoft`, `hubspot`)
    pub provider_name: String,

    /// `oauth` or `api_key`
    pub connection_type: String,

    /// pending | connected | error | expired | disconnected
    pub status: String,

    /// `sandbox` or `production` where the provider distinguishes them
    pub environment: Option<String>,

    /// Current credential location (encrypted leaves)
    #[sea_orm(column_type = "JsonBinary")]
    pub settings: Option<JsonValue>,

    /// Legacy client id, possibly plaintext
    pub client_id: Option<String>,

    /// Legacy client secret, possibly plaintext
    pub client_secret: Option<String>,

    /// Legacy OAuth data, possibly plaintext
    #[sea_orm(column_type = "JsonBinary")]
    pub oauth_data: Option<JsonValue>,

    /// Holder of the refresh lease, if any
    pub refresh_lease_owner: Option<Uuid>,

    /// Lease expiry; a lease past this instant is free to take
    pub refresh_lease_until: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "Tenant",
        from = "Column::TenantId",
        to = "super::tenant::Column::Id"
    )]
    Tenant,
}

impl Related<Tenant> for Entity {
    fn to() -> RelationDef {
        Relation::Tenant.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parsed status; unknown values are treated as `error`.
    pub fn status(&self) -> IntegrationStatus {
        self.status.parse().unwrap_or(IntegrationStatus::Error)
    }

    /// Parsed connection type; unknown values are treated as OAuth.
    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type.parse().unwrap_or(ConnectionType::OAuth)
    }
}

/// Authoritative integration status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Pending,
    Connected,
    Error,
    Expired,
    Disconnected,
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationStatus::Pending => "pending",
            IntegrationStatus::Connected => "connected",
            IntegrationStatus::Error => "error",
            IntegrationStatus::Expired => "expired",
            IntegrationStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IntegrationStatus::Pending),
            "connected" => Ok(IntegrationStatus::Connected),
            "error" => Ok(IntegrationStatus::Error),
            "expired" => Ok(IntegrationStatus::Expired),
            "disconnected" => Ok(IntegrationStatus::Disconnected),
            other => Err(format!("unknown integration status '{}'", other)),
        }
    }
}

/// How the integration authenticates against the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[serde(rename = "oauth")]
    OAuth,
    ApiKey,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::OAuth => "oauth",
            ConnectionType::ApiKey => "api_key",
        }
    }
}

impl FromStr for ConnectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oauth" => Ok(ConnectionType::OAuth),
            "api_key" => Ok(ConnectionType::ApiKey),
            other => Err(format!("unknown connection type '{}'", other)),
        }
    }
}

/// Provider environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Sandbox,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Sandbox => "sandbox",
            Environment::Production => "production",
        }
    }
}
