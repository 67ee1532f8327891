//! # Integration Lifecycle
//!
//! Owns the authoritative status machine for integrations and the per-plan
//! limit gate applied when a tenant starts a new connection.
//!
//! ```text
//! pending   --authorization ok-->      connected
//! pending   --authorization failed-->  error
//! connected --refresh failed-->        expired
//! connected --provider auth failure--> error
//! error | expired --reauthorized-->    connected
//! connected | error | expired --disconnect--> disconnected
//! ```
//!
//! Status writes are compare-and-set against the status the transition was
//! computed from, so a concurrent writer turns into `InvalidTransition` rather
//! than a lost update.

use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::counter;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{ConnectionTrait, DatabaseConnection, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::credential_store::{CredentialStore, NewCredentials};
use crate::error::VaultError;
use crate::models::integration;
use crate::models::{ConnectionType, Environment, IntegrationStatus, OAuthData};
use crate::repositories::{IntegrationRepository, TenantRepository};
use crate::token_refresh::{Clock, is_token_expired};

/// Events that move an integration between statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    AuthorizationSucceeded,
    AuthorizationFailed,
    RefreshFailed,
    ProviderAuthFailed,
    Reauthorized,
    Disconnected,
}

impl LifecycleEvent {
    /// Status reached when this event is legal
    pub fn target(self) -> IntegrationStatus {
        match self {
            LifecycleEvent::AuthorizationSucceeded | LifecycleEvent::Reauthorized => {
                IntegrationStatus::Connected
            }
            LifecycleEvent::AuthorizationFailed | LifecycleEvent::ProviderAuthFailed => {
                IntegrationStatus::Error
            }
            LifecycleEvent::RefreshFailed => IntegrationStatus::Expired,
            LifecycleEvent::Disconnected => IntegrationStatus::Disconnected,
        }
    }
}

/// Next status for `event` applied in `from`, or `InvalidTransition`
pub fn transition(
    from: IntegrationStatus,
    event: LifecycleEvent,
) -> Result<IntegrationStatus, VaultError> {
    use IntegrationStatus as S;
    use LifecycleEvent as E;

    let legal = matches!(
        (from, event),
        (S::Pending, E::AuthorizationSucceeded | E::AuthorizationFailed)
            | (S::Connected, E::RefreshFailed | E::ProviderAuthFailed)
            | (S::Error | S::Expired, E::Reauthorized)
            | (S::Connected | S::Error | S::Expired, E::Disconnected)
    );

    if legal {
        Ok(event.target())
    } else {
        Err(VaultError::InvalidTransition { from, event })
    }
}

/// Result of the plan limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct LimitCheck {
    pub allowed: bool,
    pub current: u64,
    pub max: u64,
}

/// Stored status plus what the token expiry suggests right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ObservedStatus {
    pub status: IntegrationStatus,
    /// Derived at read time; not authoritative
    pub token_expired: bool,
    pub needs_reconnect: bool,
}

/// Request to start a new connection
#[derive(Debug, Clone)]
pub struct NewIntegration {
    pub tenant_id: Uuid,
    pub provider_name: String,
    pub connection_type: ConnectionType,
    pub environment: Option<Environment>,
    pub credentials: NewCredentials,
}

#[derive(Debug, Clone)]
pub struct LifecycleGate {
    config: Arc<AppConfig>,
    store: CredentialStore,
    clock: Arc<dyn Clock>,
}

impl LifecycleGate {
    pub fn new(config: Arc<AppConfig>, store: CredentialStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    fn repo(&self) -> &IntegrationRepository {
        self.store.repository()
    }

    fn db(&self) -> &DatabaseConnection {
        &self.repo().db
    }

    /// Count the tenant's non-disconnected integrations against its plan limit
    pub async fn can_create_integration(&self, tenant_id: Uuid) -> Result<LimitCheck, VaultError> {
        self.limit_check_in(self.db(), tenant_id).await
    }

    async fn limit_check_in<C>(&self, conn: &C, tenant_id: Uuid) -> Result<LimitCheck, VaultError>
    where
        C: ConnectionTrait,
    {
        let tenant = TenantRepository::get_by_id_in(conn, tenant_id)
            .await?
            .ok_or(VaultError::NotFound {
                entity: "tenant",
                id: tenant_id,
            })?;
        let max = self.config.plan_limits.max_for(tenant.plan_tier());
        let current = IntegrationRepository::count_active_by_tenant(conn, tenant_id).await?;

        Ok(LimitCheck {
            allowed: current < max,
            current,
            max,
        })
    }

    /// Create a `pending` integration with sealed credentials, subject to the plan limit.
    ///
    /// The count and the insert share one transaction; a rejected request writes nothing.
    #[instrument(skip_all, fields(tenant_id = %request.tenant_id, provider_name = %request.provider_name))]
    pub async fn create_integration(
        &self,
        request: NewIntegration,
    ) -> Result<integration::Model, VaultError> {
        // Sealing first means a disabled cipher fails before any row is touched
        let settings = self.store.seal_new_credentials(&request.credentials)?;

        let txn = self.db().begin().await?;
        let check = self.limit_check_in(&txn, request.tenant_id).await?;
        if !check.allowed {
            txn.rollback().await?;
            counter!("integration_limit_rejections_total").increment(1);
            warn!(
                current = check.current,
                max = check.max,
                "Integration limit reached"
            );
            return Err(VaultError::IntegrationLimitReached {
                current: check.current,
                max: check.max,
            });
        }

        let now: DateTimeWithTimeZone = Utc::now().into();
        let model = IntegrationRepository::insert(
            &txn,
            integration::ActiveModel {
                id: Set(Uuid::new_v4()),
                tenant_id: Set(request.tenant_id),
                provider_name: Set(request.provider_name.to_lowercase()),
                connection_type: Set(request.connection_type.as_str().to_string()),
                status: Set(IntegrationStatus::Pending.as_str().to_string()),
                environment: Set(request.environment.map(|env| env.as_str().to_string())),
                settings: Set(Some(settings)),
                client_id: Set(None),
                client_secret: Set(None),
                oauth_data: Set(None),
                refresh_lease_owner: Set(None),
                refresh_lease_until: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            },
        )
        .await?;
        txn.commit().await?;

        info!(integration_id = %model.id, "Integration created");
        Ok(model)
    }

    /// Store the first token set and move `pending -> connected`
    pub async fn complete_authorization(
        &self,
        integration_id: Uuid,
        oauth_data: &OAuthData,
    ) -> Result<IntegrationStatus, VaultError> {
        self.apply(
            integration_id,
            LifecycleEvent::AuthorizationSucceeded,
            Some(oauth_data),
        )
        .await
    }

    /// `pending -> error`
    pub async fn record_authorization_failure(
        &self,
        integration_id: Uuid,
    ) -> Result<IntegrationStatus, VaultError> {
        self.apply(integration_id, LifecycleEvent::AuthorizationFailed, None)
            .await
    }

    /// `connected -> expired`
    pub async fn record_refresh_failure(
        &self,
        integration_id: Uuid,
    ) -> Result<IntegrationStatus, VaultError> {
        self.apply(integration_id, LifecycleEvent::RefreshFailed, None)
            .await
    }

    /// `connected -> error` after the provider rejected a call made with a valid-looking token
    pub async fn record_provider_auth_failure(
        &self,
        integration_id: Uuid,
    ) -> Result<IntegrationStatus, VaultError> {
        self.apply(integration_id, LifecycleEvent::ProviderAuthFailed, None)
            .await
    }

    /// Replace the token set and move `error | expired -> connected`
    pub async fn reauthorize(
        &self,
        integration_id: Uuid,
        oauth_data: &OAuthData,
    ) -> Result<IntegrationStatus, VaultError> {
        self.apply(integration_id, LifecycleEvent::Reauthorized, Some(oauth_data))
            .await
    }

    /// `connected | error | expired -> disconnected`
    pub async fn disconnect(&self, integration_id: Uuid) -> Result<IntegrationStatus, VaultError> {
        self.apply(integration_id, LifecycleEvent::Disconnected, None)
            .await
    }

    /// Stored status combined with the read-time expiry check
    pub fn observed_status(&self, model: &integration::Model) -> ObservedStatus {
        let status = model.status();
        let token_expired = status == IntegrationStatus::Connected
            && model.connection_type() == ConnectionType::OAuth
            && self.token_looks_expired(model);

        ObservedStatus {
            status,
            token_expired,
            needs_reconnect: token_expired
                || matches!(status, IntegrationStatus::Error | IntegrationStatus::Expired),
        }
    }

    fn token_looks_expired(&self, model: &integration::Model) -> bool {
        let buffer = Duration::seconds(self.config.token_refresh.expiry_buffer_seconds as i64);
        match self.store.get_decrypted_credentials(model) {
            Ok(credentials) => credentials
                .tokens()
                .is_none_or(|tokens| is_token_expired(tokens, self.clock.now(), buffer)),
            Err(_) => true,
        }
    }

    #[instrument(skip(self, oauth_data), fields(integration_id = %integration_id))]
    async fn apply(
        &self,
        integration_id: Uuid,
        event: LifecycleEvent,
        oauth_data: Option<&OAuthData>,
    ) -> Result<IntegrationStatus, VaultError> {
        let model = self
            .repo()
            .get_by_id(integration_id)
            .await?
            .ok_or_else(|| VaultError::integration_not_found(integration_id))?;
        let from = model.status();

        // Repeating a status-only event is a no-op
        if oauth_data.is_none() && from == event.target() {
            return Ok(from);
        }

        let to = transition(from, event)?;
        let written = match oauth_data {
            Some(data) => {
                let settings = self.store.settings_with_oauth_data(&model, data)?;
                self.repo()
                    .transition_with_settings(integration_id, from, to, settings)
                    .await?
            }
            None => self.repo().transition_status(integration_id, from, to).await?,
        };

        if !written {
            warn!(from = %from, event = ?event, "Integration status changed concurrently");
            return Err(VaultError::InvalidTransition { from, event });
        }

        info!(
            tenant_id = %model.tenant_id,
            provider_name = %model.provider_name,
            from = %from,
            to = %to,
            "Integration status changed"
        );
        Ok(to)
    }
}
