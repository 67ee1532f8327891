//! # Error Handling
//!
//! Domain errors for the credential vault ([`VaultError`]) and the unified
//! problem+json API error ([`ApiError`]) they are rendered as. Credential and
//! refresh failures all surface to API callers as "reconnect required"; the
//! underlying provider text never leaves the process.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::crypto::CryptoError;
use crate::lifecycle::LifecycleEvent;
use crate::models::IntegrationStatus;
use crate::telemetry;

/// Maximum characters of provider response text kept for diagnostics
const SNIPPET_MAX_CHARS: usize = 200;

/// Credential vault error taxonomy
#[derive(Debug, Error)]
pub enum VaultError {
    /// Envelope malformed, tampered, or opened with the wrong key
    #[error("credential decryption failed")]
    Decryption,
    #[error("credential encryption failed")]
    Encryption,
    #[error("encryption is disabled; refusing to persist credentials")]
    EncryptionDisabled,
    /// Stored credential data does not have the expected shape
    #[error("stored credential data is malformed")]
    MalformedCredentials,
    #[error("integration has no usable token set")]
    MissingTokenSet,
    /// Provider rejected the refresh, or the call failed or timed out (`status` is `None`)
    #[error("token refresh failed (provider status {status:?})")]
    TokenRefresh {
        status: Option<u16>,
        provider_message: String,
    },
    #[error("integration limit reached ({current}/{max})")]
    IntegrationLimitReached { current: u64, max: u64 },
    #[error("integration must be reconnected")]
    ReconnectRequired,
    /// Another worker holds the refresh lease and did not finish in time
    #[error("token refresh already in progress")]
    RefreshInProgress,
    #[error("illegal status transition from {from} on {event:?}")]
    InvalidTransition {
        from: IntegrationStatus,
        event: LifecycleEvent,
    },
    #[error("no token endpoint configured for provider '{0}'")]
    ProviderNotConfigured(String),
    #[error("provider request failed (status {status:?})")]
    ProviderRequest { status: Option<u16> },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

impl VaultError {
    /// Whether callers should present this as "the integration needs to be reconnected"
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            VaultError::Decryption
                | VaultError::MalformedCredentials
                | VaultError::MissingTokenSet
                | VaultError::TokenRefresh { .. }
                | VaultError::ReconnectRequired
        )
    }

    pub(crate) fn integration_not_found(id: Uuid) -> Self {
        VaultError::NotFound {
            entity: "integration",
            id,
        }
    }
}

impl From<CryptoError> for VaultError {
    fn from(error: CryptoError) -> Self {
        match error {
            CryptoError::Decryption => VaultError::Decryption,
            CryptoError::EncryptionDisabled => VaultError::EncryptionDisabled,
            CryptoError::EncryptionFailed | CryptoError::InvalidKey(_) => VaultError::Encryption,
        }
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Extract current trace ID from the active task (falls back to generated correlation ID)
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<VaultError> for ApiError {
    fn from(error: VaultError) -> Self {
        if error.requires_reconnect() {
            tracing::warn!(error = %error, "Integration requires reconnection");
            return ApiError::new(
                StatusCode::CONFLICT,
                "RECONNECT_REQUIRED",
                "This integration needs to be reconnected",
            );
        }

        match error {
            VaultError::IntegrationLimitReached { current, max } => ApiError::new(
                StatusCode::FORBIDDEN,
                "INTEGRATION_LIMIT_REACHED",
                "Integration limit for the current plan has been reached",
            )
            .with_details(json!({ "current": current, "max": max })),
            VaultError::NotFound { entity, .. } => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND".to_string(),
                format!("{} not found", entity),
            ),
            VaultError::InvalidTransition { from, .. } => ApiError::new(
                StatusCode::CONFLICT,
                "INVALID_STATUS_TRANSITION".to_string(),
                format!("Operation not allowed while integration is {}", from),
            ),
            VaultError::ProviderNotConfigured(provider) => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "PROVIDER_NOT_CONFIGURED".to_string(),
                format!("Provider '{}' is not configured", provider),
            ),
            VaultError::ProviderRequest { status } => ApiError::new(
                StatusCode::BAD_GATEWAY,
                "PROVIDER_ERROR",
                "Provider request failed",
            )
            .with_details(json!({ "status": status })),
            VaultError::EncryptionDisabled => {
                tracing::error!("Refusing to persist credentials with encryption disabled");
                ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "ENCRYPTION_DISABLED",
                    "Credential storage is unavailable",
                )
            }
            VaultError::RefreshInProgress => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "REFRESH_IN_PROGRESS",
                "Token refresh in progress, retry shortly",
            ),
            VaultError::Database(db_error) => db_error.into(),
            other => {
                tracing::error!(error = %other, "Internal credential vault error");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred",
                )
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        match error {
            sea_orm::DbErr::RecordNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", "Record not found")
            }
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// Truncate provider response text to a bounded, UTF-8 safe snippet
pub fn body_snippet(body: &str) -> String {
    if body.chars().count() > SNIPPET_MAX_CHARS {
        let truncated: String = body.chars().take(SNIPPET_MAX_CHARS).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}
