//! # Server Configuration
//!
//! Application state wiring and the Axum router for the operator API.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::credential_store::CredentialStore;
use crate::crypto::{Cipher, CipherConfig};
use crate::handlers;
use crate::lifecycle::LifecycleGate;
use crate::provider_client::{ProviderClient, VaultTokenSource};
use crate::repositories::IntegrationRepository;
use crate::telemetry::trace_context_middleware;
use crate::token_refresh::{
    Clock, IntegrationTokenService, SystemClock, TokenRefreshEngine, TokenRefreshService,
};

/// Application state containing shared resources
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub integrations: IntegrationRepository,
    pub store: CredentialStore,
    pub gate: LifecycleGate,
    pub tokens: IntegrationTokenService,
}

impl AppState {
    /// Wire the vault services against the system clock
    pub fn new(config: Arc<AppConfig>, db: DatabaseConnection) -> anyhow::Result<Self> {
        Self::with_clock(config, db, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let cipher_config =
            CipherConfig::from_app_config(&config).context("Failed to configure cipher")?;
        if !cipher_config.is_encryption_enabled() {
            tracing::warn!(
                profile = %config.profile,
                "Master key not configured; credential encryption is in passthrough mode"
            );
        }
        let cipher = Arc::new(Cipher::new(cipher_config));

        let integrations = IntegrationRepository::new(Arc::new(db.clone()));
        let store = CredentialStore::new(cipher, integrations.clone());
        let gate = LifecycleGate::new(Arc::clone(&config), store.clone(), Arc::clone(&clock));
        let engine = TokenRefreshEngine::from_config(&config.token_refresh, clock)
            .context("Failed to build token endpoint HTTP client")?;
        let tokens =
            IntegrationTokenService::new(Arc::clone(&config), store.clone(), gate.clone(), engine);

        Ok(Self {
            config,
            db,
            integrations,
            store,
            gate,
            tokens,
        })
    }

    /// Provider API client whose bearer tokens come from this vault.
    ///
    /// A 401 from the provider moves the integration to `error`.
    pub fn provider_client(&self, http: reqwest::Client) -> ProviderClient {
        let source = VaultTokenSource::new(self.tokens.clone(), self.gate.clone());
        ProviderClient::new(http, Arc::new(source))
    }

    /// Background refresher sharing this state's services
    pub fn refresh_service(&self) -> TokenRefreshService {
        TokenRefreshService::new(
            Arc::clone(&self.config),
            self.integrations.clone(),
            self.tokens.clone(),
        )
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/integrations",
            get(handlers::integrations::list_integrations)
                .post(handlers::integrations::create_integration),
        )
        .route(
            "/integrations/limits",
            get(handlers::integrations::integration_limits),
        )
        .route(
            "/integrations/{id}/access-token",
            post(handlers::integrations::issue_access_token),
        )
        .route(
            "/integrations/{id}/disconnect",
            post(handlers::integrations::disconnect_integration),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
}

/// Starts the server and the background refresher; returns when `shutdown` fires
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let state = AppState::new(Arc::new(config), db)?;

    let refresher = state.refresh_service();
    let refresher_shutdown = shutdown.child_token();
    let refresher_handle = tokio::spawn(async move { refresher.run(refresher_shutdown).await });

    let addr = state
        .config
        .bind_addr()
        .context("Invalid server address")?;
    let profile = state.config.profile.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(%addr, %profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("HTTP server error")?;

    shutdown.cancel();
    if let Err(err) = refresher_handle.await {
        tracing::error!(error = ?err, "Token refresh task ended abnormally");
    }

    Ok(())
}

struct BearerSecurity;

impl Modify for BearerSecurity {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::integrations::list_integrations,
        crate::handlers::integrations::integration_limits,
        crate::handlers::integrations::create_integration,
        crate::handlers::integrations::issue_access_token,
        crate::handlers::integrations::disconnect_integration,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::IntegrationStatus,
            crate::models::ConnectionType,
            crate::models::Environment,
            crate::lifecycle::LimitCheck,
            crate::lifecycle::ObservedStatus,
            crate::error::ApiError,
            crate::handlers::integrations::IntegrationInfo,
            crate::handlers::integrations::IntegrationsResponse,
            crate::handlers::integrations::CreateIntegrationRequest,
            crate::handlers::integrations::AccessTokenResponse,
            crate::handlers::integrations::DisconnectResponse,
        )
    ),
    modifiers(&BearerSecurity),
    info(
        title = "Credential Vault API",
        description = "Operator API for tenant integrations, plan limits and access tokens",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
