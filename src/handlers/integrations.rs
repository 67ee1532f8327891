//! # Integration API Handlers
//!
//! Tenant-scoped integration listing and creation, the plan limit check, the
//! access-token consumer contract and disconnect. Responses never include
//! credential material other than the access token explicitly requested.

use std::fmt;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{OperatorAuth, TenantExtension, TenantHeader};
use crate::credential_store::NewCredentials;
use crate::error::{ApiError, VaultError, validation_error};
use crate::lifecycle::{LimitCheck, NewIntegration, ObservedStatus};
use crate::models::integration;
use crate::models::{ConnectionType, Environment, IntegrationStatus};
use crate::server::AppState;

/// Integration summary for API responses
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IntegrationInfo {
    #[schema(value_type = String)]
    pub id: Uuid,
    /// Provider identifier (e.g. "quickbooks")
    pub provider_name: String,
    pub connection_type: ConnectionType,
    pub environment: Option<String>,
    /// Stored status and the read-time expiry view
    pub observed: ObservedStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IntegrationInfo {
    fn from_model(model: &integration::Model, observed: ObservedStatus) -> Self {
        Self {
            id: model.id,
            provider_name: model.provider_name.clone(),
            connection_type: model.connection_type(),
            environment: model.environment.clone(),
            observed,
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IntegrationsResponse {
    pub integrations: Vec<IntegrationInfo>,
}

/// Body for starting a new connection
#[derive(Deserialize, ToSchema)]
pub struct CreateIntegrationRequest {
    pub provider_name: String,
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub environment: Option<Environment>,
    /// OAuth client id; required for `oauth`
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Required for `api_key`
    #[serde(default)]
    pub api_key: Option<String>,
}

impl fmt::Debug for CreateIntegrationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateIntegrationRequest")
            .field("provider_name", &self.provider_name)
            .field("connection_type", &self.connection_type)
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

impl CreateIntegrationRequest {
    fn validate(&self) -> Result<(), ApiError> {
        let mut errors = serde_json::Map::new();
        if self.provider_name.trim().is_empty() {
            errors.insert("provider_name".into(), json!("Must not be empty"));
        }
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
        match self.connection_type {
            ConnectionType::OAuth if !present(&self.client_id) => {
                errors.insert("client_id".into(), json!("Required for oauth integrations"));
            }
            ConnectionType::ApiKey if !present(&self.api_key) => {
                errors.insert("api_key".into(), json!("Required for api_key integrations"));
            }
            _ => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(validation_error("Invalid integration request", errors.into()))
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct AccessTokenResponse {
    pub access_token: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DisconnectResponse {
    #[schema(value_type = String)]
    pub id: Uuid,
    pub status: IntegrationStatus,
}

/// Lists the tenant's integrations with stored and observed status
#[utoipa::path(
    get,
    path = "/integrations",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    responses(
        (status = 200, description = "Tenant integrations", body = IntegrationsResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn list_integrations(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
) -> Result<Json<IntegrationsResponse>, ApiError> {
    let models = state
        .integrations
        .list_by_tenant(tenant.0)
        .await
        .map_err(VaultError::from)?;

    let integrations = models
        .iter()
        .map(|model| IntegrationInfo::from_model(model, state.gate.observed_status(model)))
        .collect();

    Ok(Json(IntegrationsResponse { integrations }))
}

/// Reports whether the tenant may create another integration
#[utoipa::path(
    get,
    path = "/integrations/limits",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    responses(
        (status = 200, description = "Plan limit check", body = LimitCheck),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Tenant not found", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn integration_limits(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
) -> Result<Json<LimitCheck>, ApiError> {
    Ok(Json(state.gate.can_create_integration(tenant.0).await?))
}

/// Creates a pending integration with sealed credentials
#[utoipa::path(
    post,
    path = "/integrations",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    request_body = CreateIntegrationRequest,
    responses(
        (status = 201, description = "Integration created", body = IntegrationInfo),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 403, description = "Plan integration limit reached", body = ApiError, example = json!({
            "code": "INTEGRATION_LIMIT_REACHED",
            "message": "Integration limit for the current plan has been reached",
            "details": {"current": 3, "max": 3}
        })),
        (status = 503, description = "Encryption disabled", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn create_integration(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
    Json(request): Json<CreateIntegrationRequest>,
) -> Result<(StatusCode, Json<IntegrationInfo>), ApiError> {
    request.validate()?;

    let model = state
        .gate
        .create_integration(NewIntegration {
            tenant_id: tenant.0,
            provider_name: request.provider_name.trim().to_string(),
            connection_type: request.connection_type,
            environment: request.environment,
            credentials: NewCredentials {
                client_id: request.client_id,
                client_secret: request.client_secret,
                api_key: request.api_key,
            },
        })
        .await?;

    let observed = state.gate.observed_status(&model);
    Ok((
        StatusCode::CREATED,
        Json(IntegrationInfo::from_model(&model, observed)),
    ))
}

/// Returns a valid access token, refreshing it first if needed
#[utoipa::path(
    post,
    path = "/integrations/{id}/access-token",
    security(("bearer_auth" = [])),
    params(
        TenantHeader,
        ("id" = String, Path, description = "Integration id")
    ),
    responses(
        (status = 200, description = "Valid access token", body = AccessTokenResponse),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Integration not found", body = ApiError),
        (status = 409, description = "Integration needs to be reconnected", body = ApiError),
        (status = 503, description = "Refresh in progress elsewhere", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn issue_access_token(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
    Path(id): Path<Uuid>,
) -> Result<Json<AccessTokenResponse>, ApiError> {
    let access_token = state
        .tokens
        .ensure_valid_access_token_for_tenant(tenant.0, id)
        .await?;
    Ok(Json(AccessTokenResponse { access_token }))
}

/// Marks the integration as disconnected
#[utoipa::path(
    post,
    path = "/integrations/{id}/disconnect",
    security(("bearer_auth" = [])),
    params(
        TenantHeader,
        ("id" = String, Path, description = "Integration id")
    ),
    responses(
        (status = 200, description = "Integration disconnected", body = DisconnectResponse),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Integration not found", body = ApiError),
        (status = 409, description = "Not allowed from the current status", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn disconnect_integration(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
    Path(id): Path<Uuid>,
) -> Result<Json<DisconnectResponse>, ApiError> {
    state
        .integrations
        .find_by_id(tenant.0, id)
        .await
        .map_err(VaultError::from)?
        .ok_or_else(|| VaultError::integration_not_found(id))?;

    let status = state.gate.disconnect(id).await?;
    Ok(Json(DisconnectResponse { id, status }))
}
