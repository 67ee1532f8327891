//! Test utilities for database testing.
//!
//! In-memory SQLite with migrations applied, plus fixtures for tenants and
//! integration rows in either storage shape.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use credential_vault::{
    config::{AppConfig, ProviderConfig, TokenRefreshConfig},
    crypto::{Cipher, CipherConfig, CryptoKey},
    models::{PlanTier, integration},
    repositories::TenantRepository,
    server::AppState,
    token_refresh::{Clock, SystemClock},
};
use migration::{Migrator, MigratorTrait};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, EntityTrait, Set};
use serde_json::Value;
use uuid::Uuid;

pub const TEST_MASTER_KEY: [u8; 32] = [7u8; 32];
pub const TEST_PROVIDER: &str = "quickbooks";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Test profile configuration with a master key and short refresh delays.
///
/// `token_url` is registered for [`TEST_PROVIDER`].
pub fn test_config(token_url: &str) -> AppConfig {
    let mut providers = BTreeMap::new();
    providers.insert(
        TEST_PROVIDER.to_string(),
        ProviderConfig {
            token_url: token_url.to_string(),
        },
    );

    AppConfig {
        profile: "test".to_string(),
        operator_tokens: vec!["test-operator-token".to_string()],
        master_key: Some(TEST_MASTER_KEY.to_vec()),
        token_refresh: TokenRefreshConfig {
            http_timeout_ms: 2_000,
            lease_wait_ms: 20,
            lease_wait_attempts: 100,
            soft_retry_delay_ms: 20,
            jitter_factor: 0.0,
            ..Default::default()
        },
        providers,
        ..Default::default()
    }
}

pub fn test_cipher() -> Cipher {
    let key = CryptoKey::new(TEST_MASTER_KEY.to_vec()).expect("test key");
    Cipher::new(CipherConfig::with_key(key))
}

pub fn build_state(db: &DatabaseConnection, config: AppConfig) -> AppState {
    build_state_with_clock(db, config, Arc::new(SystemClock))
}

pub fn build_state_with_clock(
    db: &DatabaseConnection,
    config: AppConfig,
    clock: Arc<dyn Clock>,
) -> AppState {
    AppState::with_clock(Arc::new(config), db.clone(), clock).expect("app state")
}

/// Creates a tenant on the given plan.
pub async fn create_test_tenant(db: &DatabaseConnection, plan: PlanTier) -> Result<Uuid> {
    let tenant = TenantRepository::new(Arc::new(db.clone()))
        .create("Test Tenant", plan)
        .await?;
    Ok(tenant.id)
}

/// Raw integration row; secrets are stored exactly as given.
#[derive(Debug, Clone)]
pub struct IntegrationFixture {
    pub tenant_id: Uuid,
    pub provider_name: String,
    pub connection_type: String,
    pub status: String,
    pub settings: Option<Value>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub oauth_data: Option<Value>,
}

impl IntegrationFixture {
    pub fn connected(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            provider_name: TEST_PROVIDER.to_string(),
            connection_type: "oauth".to_string(),
            status: "connected".to_string(),
            settings: None,
            client_id: None,
            client_secret: None,
            oauth_data: None,
        }
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_legacy(mut self, client_id: &str, client_secret: &str, oauth_data: Value) -> Self {
        self.client_id = Some(client_id.to_string());
        self.client_secret = Some(client_secret.to_string());
        self.oauth_data = Some(oauth_data);
        self
    }
}

pub async fn insert_integration(
    db: &DatabaseConnection,
    fixture: IntegrationFixture,
) -> Result<integration::Model> {
    let now: DateTimeWithTimeZone = Utc::now().into();
    let model = integration::ActiveModel {
        id: Set(Uuid::new_v4()),
        tenant_id: Set(fixture.tenant_id),
        provider_name: Set(fixture.provider_name),
        connection_type: Set(fixture.connection_type),
        status: Set(fixture.status),
        environment: Set(None),
        settings: Set(fixture.settings),
        client_id: Set(fixture.client_id),
        client_secret: Set(fixture.client_secret),
        oauth_data: Set(fixture.oauth_data),
        refresh_lease_owner: Set(None),
        refresh_lease_until: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await?;
    Ok(model)
}

pub async fn reload(db: &DatabaseConnection, id: Uuid) -> Result<integration::Model> {
    integration::Entity::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| anyhow::anyhow!("integration {} not found", id))
}
