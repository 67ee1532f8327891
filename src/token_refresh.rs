//! # Token Refresh
//!
//! Three layers, innermost first:
//!
//! * [`TokenRefreshEngine`] decides whether a token set needs refreshing, calls
//!   the provider token endpoint and merges the response. It never touches storage
//!   and never retries.
//! * [`IntegrationTokenService`] is what consumers call with an integration id. It
//!   loads and decrypts credentials, serializes refreshes per integration (in-process
//!   single flight plus a datastore lease), persists the merged token set and records
//!   the `connected -> expired` transition when a refresh fails for good.
//! * [`TokenRefreshService`] is an optional background loop that walks connected
//!   OAuth integrations and refreshes them ahead of use.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use rand::Rng;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::time::{Duration as TokioDuration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::config::{AppConfig, MAX_LEASE_TTL_SECONDS, TokenRefreshConfig};
use crate::credential_store::CredentialStore;
use crate::error::{VaultError, body_snippet};
use crate::lifecycle::LifecycleGate;
use crate::models::integration;
use crate::models::oauth::seconds_from_value;
use crate::models::{ConnectionType, ExpiresAt, Expiry, IntegrationStatus, OAuthData, TokenSet};
use crate::repositories::IntegrationRepository;

/// Lifetime assumed when the provider omits `expires_in`
pub const DEFAULT_EXPIRES_IN_SECONDS: i64 = 3600;

/// Ceiling applied to provider-supplied `expires_in` (one year)
pub const MAX_EXPIRES_IN_SECONDS: i64 = 365 * 24 * 3600;

/// Source of "now"; injected so expiry decisions are testable
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a given instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Refresh state of a single token set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    NeedsRefresh,
    Refreshing,
    Refreshed,
    RefreshFailed,
}

/// OAuth client credentials used for the Basic auth header
#[derive(Clone, Default)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl ClientCredentials {
    /// `Basic base64(client_id:client_secret)`; an empty secret is allowed
    pub fn basic_authorization(&self) -> String {
        let joined = format!("{}:{}", self.client_id, self.client_secret);
        format!("Basic {}", general_purpose::STANDARD.encode(joined))
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &"[REDACTED]")
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// Result of [`TokenRefreshEngine::ensure_valid_access_token`]
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Existing token is still valid; nothing to persist
    Unchanged { access_token: String },
    /// Provider issued a new token; `tokens` must be persisted
    Refreshed {
        access_token: String,
        tokens: TokenSet,
    },
}

impl RefreshOutcome {
    pub fn access_token(&self) -> &str {
        match self {
            RefreshOutcome::Unchanged { access_token }
            | RefreshOutcome::Refreshed { access_token, .. } => access_token,
        }
    }
}

/// Successful token endpoint response
#[derive(Deserialize)]
pub struct TokenEndpointResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<Value>,
    #[serde(default)]
    pub scope: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Merge a refresh response into the previous token set.
///
/// `access_token` is always replaced. `refresh_token` and `scope` are replaced
/// only when returned. `expires_at` is recomputed from `expires_in`, which
/// defaults to one hour and is capped at one year.
pub fn merge_token_response(
    previous: &TokenSet,
    response: TokenEndpointResponse,
    now: DateTime<Utc>,
) -> TokenSet {
    let expires_in = response
        .expires_in
        .as_ref()
        .and_then(seconds_from_value)
        .filter(|seconds| *seconds > 0)
        .map(|seconds| seconds.min(MAX_EXPIRES_IN_SECONDS))
        .unwrap_or(DEFAULT_EXPIRES_IN_SECONDS);
    let expires_at = Duration::try_seconds(expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or(now);

    let mut merged = previous.clone();
    merged.access_token = Some(response.access_token);
    if let Some(refresh_token) = response.refresh_token.filter(|t| !t.is_empty()) {
        merged.refresh_token = Some(refresh_token);
    }
    merged.expires_in = Some(expires_in);
    merged.expires_at = Some(ExpiresAt::from(expires_at));
    if let Some(scope) = response.scope.filter(|s| !s.is_null()) {
        merged.scope = Some(scope);
    }
    merged.extra.extend(response.extra);
    merged
}

/// Decides on and performs provider token refreshes
#[derive(Debug, Clone)]
pub struct TokenRefreshEngine {
    http: reqwest::Client,
    buffer: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenRefreshEngine {
    /// Engine with its own HTTP client bounded by `http_timeout_ms`
    pub fn from_config(
        config: &TokenRefreshConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.http_timeout_ms))
            .build()?;
        Ok(Self::with_client(
            http,
            Duration::seconds(config.expiry_buffer_seconds as i64),
            clock,
        ))
    }

    pub fn with_client(http: reqwest::Client, buffer: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            http,
            buffer,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn buffer(&self) -> Duration {
        self.buffer
    }

    /// `Valid` or `NeedsRefresh` for the token set at the current instant.
    ///
    /// A missing `expires_at` is treated as valid; one that cannot be parsed is not.
    pub fn assess(&self, tokens: &TokenSet) -> TokenState {
        if tokens.access_token.as_deref().is_none_or(str::is_empty) {
            return TokenState::NeedsRefresh;
        }
        if is_token_expired(tokens, self.now(), self.buffer) {
            TokenState::NeedsRefresh
        } else {
            TokenState::Valid
        }
    }

    /// Return a usable access token, refreshing against `token_endpoint` when needed.
    pub async fn ensure_valid_access_token(
        &self,
        tokens: &TokenSet,
        credentials: &ClientCredentials,
        token_endpoint: &Url,
    ) -> Result<RefreshOutcome, VaultError> {
        if self.assess(tokens) == TokenState::Valid {
            if let Some(access_token) = tokens.access_token.clone() {
                return Ok(RefreshOutcome::Unchanged { access_token });
            }
        }

        debug!(state = ?TokenState::NeedsRefresh, "Token set needs refresh");
        let Some(refresh_token) = tokens.refresh_token.as_deref().filter(|t| !t.is_empty()) else {
            warn!("Token set has no refresh token");
            return Err(VaultError::ReconnectRequired);
        };

        let merged = self
            .refresh(tokens, refresh_token, credentials, token_endpoint)
            .await?;
        let access_token = merged.access_token.clone().unwrap_or_default();
        Ok(RefreshOutcome::Refreshed {
            access_token,
            tokens: merged,
        })
    }

    async fn refresh(
        &self,
        previous: &TokenSet,
        refresh_token: &str,
        credentials: &ClientCredentials,
        token_endpoint: &Url,
    ) -> Result<TokenSet, VaultError> {
        info!(state = ?TokenState::Refreshing, endpoint_host = token_endpoint.host_str().unwrap_or_default(), "Refreshing token set");
        let started = Instant::now();

        let result = self
            .http
            .post(token_endpoint.clone())
            .header(reqwest::header::AUTHORIZATION, credentials.basic_authorization())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await;

        histogram!("token_refresh_latency_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                let provider_message = if err.is_timeout() {
                    "token endpoint timed out"
                } else {
                    "token endpoint unreachable"
                };
                warn!(state = ?TokenState::RefreshFailed, timeout = err.is_timeout(), "Token refresh request failed");
                return Err(VaultError::TokenRefresh {
                    status: None,
                    provider_message: provider_message.to_string(),
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet = body_snippet(&body);
            warn!(state = ?TokenState::RefreshFailed, status = status.as_u16(), "Provider rejected token refresh");
            debug!(status = status.as_u16(), body = %snippet, "Token refresh error body");
            return Err(VaultError::TokenRefresh {
                status: Some(status.as_u16()),
                provider_message: snippet,
            });
        }

        let parsed: TokenEndpointResponse = response.json().await.map_err(|_| {
            warn!(state = ?TokenState::RefreshFailed, status = status.as_u16(), "Token endpoint returned an unusable body");
            VaultError::TokenRefresh {
                status: Some(status.as_u16()),
                provider_message: "invalid token response".to_string(),
            }
        })?;

        let merged = merge_token_response(previous, parsed, self.now());
        info!(state = ?TokenState::Refreshed, expires_in = merged.expires_in, "Token set refreshed");
        Ok(merged)
    }
}

/// `now >= expires_at - buffer`; an absent expiry never expires, an unparseable one always has.
pub fn is_token_expired(tokens: &TokenSet, now: DateTime<Utc>, buffer: Duration) -> bool {
    match tokens.expiry() {
        Expiry::Absent => false,
        Expiry::Unparseable => true,
        Expiry::At(expires_at) => {
            now.timestamp() >= expires_at.saturating_sub(buffer.num_seconds())
        }
    }
}

type FlightMap = Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>;

/// Consumer entry point: a guaranteed-valid access token for an integration
#[derive(Debug, Clone)]
pub struct IntegrationTokenService {
    config: Arc<AppConfig>,
    store: CredentialStore,
    gate: LifecycleGate,
    engine: TokenRefreshEngine,
    /// Per-integration single flight within this process
    in_flight: FlightMap,
}

impl IntegrationTokenService {
    pub fn new(
        config: Arc<AppConfig>,
        store: CredentialStore,
        gate: LifecycleGate,
        engine: TokenRefreshEngine,
    ) -> Self {
        Self {
            config,
            store,
            gate,
            engine,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn repo(&self) -> &IntegrationRepository {
        self.store.repository()
    }

    /// Access token for the integration, refreshing and persisting if required.
    pub async fn ensure_valid_access_token(&self, integration_id: Uuid) -> Result<String, VaultError> {
        let model = self
            .repo()
            .get_by_id(integration_id)
            .await?
            .ok_or_else(|| VaultError::integration_not_found(integration_id))?;
        self.access_token_for(model).await
    }

    /// Tenant-scoped variant; another tenant's integration reads as not found.
    pub async fn ensure_valid_access_token_for_tenant(
        &self,
        tenant_id: Uuid,
        integration_id: Uuid,
    ) -> Result<String, VaultError> {
        let model = self
            .repo()
            .find_by_id(tenant_id, integration_id)
            .await?
            .ok_or_else(|| VaultError::integration_not_found(integration_id))?;
        self.access_token_for(model).await
    }

    #[instrument(
        skip_all,
        fields(integration_id = %model.id, tenant_id = %model.tenant_id, provider_name = %model.provider_name)
    )]
    async fn access_token_for(&self, model: integration::Model) -> Result<String, VaultError> {
        ensure_connected(&model)?;

        let credentials = self.store.get_decrypted_credentials(&model)?;
        if model.connection_type() == ConnectionType::ApiKey {
            return credentials.api_key.ok_or(VaultError::MissingTokenSet);
        }

        let tokens = credentials.tokens().ok_or(VaultError::MissingTokenSet)?;
        if let Some(access_token) = self.usable_token(tokens) {
            return Ok(access_token);
        }

        let flight = self.flight_for(model.id);
        let _cleanup = scopeguard::guard((), |_| self.release_flight(model.id));
        let _held = flight.lock().await;

        self.refresh_serialized(model.id).await
    }

    /// Runs with the in-process flight held: take the datastore lease, refresh, release.
    async fn refresh_serialized(&self, integration_id: Uuid) -> Result<String, VaultError> {
        let settings = &self.config.token_refresh;
        let owner = Uuid::new_v4();
        let ttl = Duration::seconds(
            settings.lease_ttl_seconds.min(MAX_LEASE_TTL_SECONDS) as i64,
        );

        let mut attempts = 0;
        loop {
            // Another caller may have finished while we waited
            let model = self.load_connected(integration_id).await?;
            if let Some(access_token) = self.current_usable_token(&model)? {
                debug!(integration_id = %integration_id, "Reusing token refreshed by another caller");
                return Ok(access_token);
            }

            if self
                .repo()
                .try_acquire_refresh_lease(integration_id, owner, ttl, self.engine.now())
                .await?
            {
                break;
            }

            attempts += 1;
            if attempts >= settings.lease_wait_attempts {
                warn!(integration_id = %integration_id, "Refresh lease still held elsewhere, giving up");
                return Err(VaultError::RefreshInProgress);
            }
            sleep(TokioDuration::from_millis(settings.lease_wait_ms)).await;
        }

        let result = self.refresh_under_lease(integration_id).await;

        if let Err(err) = self.repo().release_refresh_lease(integration_id, owner).await {
            // The lease expires on its own
            warn!(integration_id = %integration_id, error = %err, "Failed to release refresh lease");
        }

        result
    }

    async fn refresh_under_lease(&self, integration_id: Uuid) -> Result<String, VaultError> {
        let model = self.load_connected(integration_id).await?;
        let credentials = self.store.get_decrypted_credentials(&model)?;
        let oauth_data = credentials.oauth_data.clone().unwrap_or_default();
        let tokens = oauth_data.tokens.clone().ok_or(VaultError::MissingTokenSet)?;

        if let Some(access_token) = self.usable_token(&tokens) {
            return Ok(access_token);
        }

        if !tokens.has_refresh_token() {
            warn!(integration_id = %integration_id, "No refresh token available, reconnection required");
            self.mark_expired(integration_id).await;
            return Err(VaultError::ReconnectRequired);
        }

        let endpoint = self
            .config
            .token_endpoint_for(&model.provider_name)
            .ok_or_else(|| VaultError::ProviderNotConfigured(model.provider_name.clone()))?;
        let client = ClientCredentials {
            client_id: credentials.client_id.clone().ok_or(VaultError::MalformedCredentials)?,
            client_secret: credentials.client_secret.clone().unwrap_or_default(),
        };

        let labels = [("provider_name", model.provider_name.clone())];
        counter!("token_refresh_attempts_total", &labels).increment(1);

        match self
            .engine
            .ensure_valid_access_token(&tokens, &client, &endpoint)
            .await
        {
            Ok(RefreshOutcome::Refreshed {
                access_token,
                tokens: merged,
            }) => {
                let updated = OAuthData {
                    tokens: Some(merged),
                    ..oauth_data
                };
                self.store
                    .persist_refreshed_tokens(integration_id, &updated)
                    .await?;
                counter!("token_refresh_success_total", &labels).increment(1);
                Ok(access_token)
            }
            Ok(RefreshOutcome::Unchanged { access_token }) => Ok(access_token),
            Err(err @ VaultError::TokenRefresh { .. }) => {
                counter!("token_refresh_failure_total", &labels).increment(1);
                self.soft_retry(integration_id, err).await
            }
            Err(VaultError::ReconnectRequired) => {
                self.mark_expired(integration_id).await;
                Err(VaultError::ReconnectRequired)
            }
            Err(other) => Err(other),
        }
    }

    /// Re-read once after a short delay before demoting the integration to `expired`.
    async fn soft_retry(&self, integration_id: Uuid, err: VaultError) -> Result<String, VaultError> {
        sleep(TokioDuration::from_millis(
            self.config.token_refresh.soft_retry_delay_ms,
        ))
        .await;

        if let Some(model) = self.repo().get_by_id(integration_id).await? {
            if model.status() == IntegrationStatus::Connected {
                if let Some(access_token) = self.current_usable_token(&model)? {
                    info!(integration_id = %integration_id, "Recovered token persisted by a concurrent refresh");
                    return Ok(access_token);
                }
            }
        }

        error!(integration_id = %integration_id, error = %err, "Token refresh failed, marking integration expired");
        self.mark_expired(integration_id).await;
        Err(err)
    }

    /// `connected -> expired`; the refresh error is what the caller sees either way
    async fn mark_expired(&self, integration_id: Uuid) {
        if let Err(err) = self.gate.record_refresh_failure(integration_id).await {
            warn!(integration_id = %integration_id, error = %err, "Could not record refresh failure");
        }
    }

    async fn load_connected(&self, integration_id: Uuid) -> Result<integration::Model, VaultError> {
        let model = self
            .repo()
            .get_by_id(integration_id)
            .await?
            .ok_or_else(|| VaultError::integration_not_found(integration_id))?;
        ensure_connected(&model)?;
        Ok(model)
    }

    fn current_usable_token(&self, model: &integration::Model) -> Result<Option<String>, VaultError> {
        let credentials = self.store.get_decrypted_credentials(model)?;
        Ok(credentials.tokens().and_then(|tokens| self.usable_token(tokens)))
    }

    fn usable_token(&self, tokens: &TokenSet) -> Option<String> {
        match self.engine.assess(tokens) {
            TokenState::Valid => tokens.access_token.clone(),
            _ => None,
        }
    }

    fn flight_for(&self, integration_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(in_flight.entry(integration_id).or_default())
    }

    fn release_flight(&self, integration_id: Uuid) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Map entry plus the releasing caller's handle
        if in_flight
            .get(&integration_id)
            .is_some_and(|flight| Arc::strong_count(flight) <= 2)
        {
            in_flight.remove(&integration_id);
        }
    }
}

fn ensure_connected(model: &integration::Model) -> Result<(), VaultError> {
    let status = model.status();
    if status == IntegrationStatus::Connected {
        Ok(())
    } else {
        debug!(integration_id = %model.id, status = %status, "Integration is not connected");
        Err(VaultError::ReconnectRequired)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshStats {
    pub integrations_polled: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Background refresh of connected OAuth integrations
#[derive(Debug, Clone)]
pub struct TokenRefreshService {
    config: Arc<AppConfig>,
    repo: IntegrationRepository,
    tokens: IntegrationTokenService,
}

impl TokenRefreshService {
    pub fn new(
        config: Arc<AppConfig>,
        repo: IntegrationRepository,
        tokens: IntegrationTokenService,
    ) -> Self {
        Self {
            config,
            repo,
            tokens,
        }
    }

    /// Run the refresh loop until the shutdown token fires
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Starting token refresh service");
        let tick_interval = TokioDuration::from_secs(self.config.token_refresh.tick_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Token refresh service shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "Token refresh tick failed");
                    }
                    histogram!("token_refresh_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Token refresh service stopped");
    }

    /// One pass over every connected OAuth integration
    #[instrument(skip_all)]
    pub async fn tick(&self) -> Result<RefreshStats, VaultError> {
        let candidates = self.repo.list_connected_oauth().await?;
        let mut stats = RefreshStats {
            integrations_polled: candidates.len() as u64,
            ..RefreshStats::default()
        };

        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            self.config.token_refresh.concurrency as usize,
        ));
        let mut handles = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let semaphore = Arc::clone(&semaphore);
            let service = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| VaultError::RefreshInProgress)?;
                service.sleep_jitter().await;
                service.tokens.ensure_valid_access_token(candidate.id).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(_)) => stats.succeeded += 1,
                Ok(Err(err)) => {
                    stats.failed += 1;
                    warn!(error = %err, "Background token refresh failed");
                }
                Err(err) => {
                    stats.failed += 1;
                    error!(error = ?err, "Refresh task panicked or was cancelled");
                }
            }
        }

        debug!(
            integrations_polled = stats.integrations_polled,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Token refresh tick completed"
        );
        Ok(stats)
    }

    async fn sleep_jitter(&self) {
        let max_ms = (self.config.token_refresh.tick_seconds as f64
            * 1_000.0
            * self.config.token_refresh.jitter_factor) as u64;
        if max_ms == 0 {
            return;
        }
        let delay = rand::thread_rng().gen_range(0..=max_ms);
        sleep(TokioDuration::from_millis(delay)).await;
    }
}
