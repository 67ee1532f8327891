//! Provider HTTP client
//!
//! Thin authenticated client for provider APIs. It asks an [`AccessTokenSource`]
//! for a bearer token before each call and reports a 401 back so the
//! integration is demoted to `error` instead of retried with the same token.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};
use url::Url;
use uuid::Uuid;

use crate::error::VaultError;
use crate::lifecycle::LifecycleGate;
use crate::token_refresh::IntegrationTokenService;

/// Where provider calls get their bearer tokens from
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// A currently valid access token for the integration
    async fn access_token(&self, tenant_id: Uuid, integration_id: Uuid) -> Result<String, VaultError>;

    /// The provider rejected a token this source handed out
    async fn report_auth_failure(&self, integration_id: Uuid) -> Result<(), VaultError>;
}

/// [`AccessTokenSource`] backed by the vault's refresh orchestration
#[derive(Debug, Clone)]
pub struct VaultTokenSource {
    tokens: IntegrationTokenService,
    gate: LifecycleGate,
}

impl VaultTokenSource {
    pub fn new(tokens: IntegrationTokenService, gate: LifecycleGate) -> Self {
        Self { tokens, gate }
    }
}

#[async_trait]
impl AccessTokenSource for VaultTokenSource {
    async fn access_token(&self, tenant_id: Uuid, integration_id: Uuid) -> Result<String, VaultError> {
        self.tokens
            .ensure_valid_access_token_for_tenant(tenant_id, integration_id)
            .await
    }

    async fn report_auth_failure(&self, integration_id: Uuid) -> Result<(), VaultError> {
        self.gate
            .record_provider_auth_failure(integration_id)
            .await
            .map(|_| ())
    }
}

/// Authenticated JSON client for a single integration's provider API
#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    tokens: Arc<dyn AccessTokenSource>,
}

impl ProviderClient {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn AccessTokenSource>) -> Self {
        Self { http, tokens }
    }

    /// GET `url` as JSON with the integration's bearer token.
    ///
    /// A 401 marks the integration as needing reconnection and returns
    /// `ReconnectRequired`; other failures return `ProviderRequest`.
    pub async fn get_json<T>(
        &self,
        tenant_id: Uuid,
        integration_id: Uuid,
        url: Url,
    ) -> Result<T, VaultError>
    where
        T: DeserializeOwned,
    {
        let access_token = self.tokens.access_token(tenant_id, integration_id).await?;

        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| {
                warn!(integration_id = %integration_id, timeout = err.is_timeout(), "Provider request failed");
                VaultError::ProviderRequest { status: None }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            error!(integration_id = %integration_id, "Provider rejected access token");
            if let Err(err) = self.tokens.report_auth_failure(integration_id).await {
                warn!(integration_id = %integration_id, error = %err, "Could not record provider auth failure");
            }
            return Err(VaultError::ReconnectRequired);
        }

        if !status.is_success() {
            debug!(integration_id = %integration_id, status = status.as_u16(), "Provider returned an error status");
            return Err(VaultError::ProviderRequest {
                status: Some(status.as_u16()),
            });
        }

        response.json::<T>().await.map_err(|_| {
            warn!(integration_id = %integration_id, "Provider returned an unreadable body");
            VaultError::ProviderRequest {
                status: Some(status.as_u16()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct StaticTokens {
        failures: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl AccessTokenSource for StaticTokens {
        async fn access_token(&self, _tenant_id: Uuid, _integration_id: Uuid) -> Result<String, VaultError> {
            Ok("A1".to_string())
        }

        async fn report_auth_failure(&self, integration_id: Uuid) -> Result<(), VaultError> {
            self.failures.lock().unwrap().push(integration_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/company"))
            .and(header("authorization", "Bearer A1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "Acme"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = ProviderClient::new(reqwest::Client::new(), Arc::new(StaticTokens::default()));
        let url = Url::parse(&format!("{}/v1/company", server.uri())).unwrap();
        let body: Value = client
            .get_json(Uuid::new_v4(), Uuid::new_v4(), url)
            .await
            .unwrap();

        assert_eq!(body["name"], "Acme");
    }

    #[tokio::test]
    async fn unauthorized_reports_failure_and_requires_reconnect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let tokens = Arc::new(StaticTokens::default());
        let client = ProviderClient::new(reqwest::Client::new(), tokens.clone());
        let integration_id = Uuid::new_v4();
        let url = Url::parse(&format!("{}/v1/company", server.uri())).unwrap();

        let err = client
            .get_json::<Value>(Uuid::new_v4(), integration_id, url)
            .await
            .unwrap_err();

        assert!(matches!(err, VaultError::ReconnectRequired));
        assert_eq!(*tokens.failures.lock().unwrap(), vec![integration_id]);
    }

    #[tokio::test]
    async fn server_errors_are_provider_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let tokens = Arc::new(StaticTokens::default());
        let client = ProviderClient::new(reqwest::Client::new(), tokens.clone());
        let url = Url::parse(&format!("{}/v1/company", server.uri())).unwrap();

        let err = client
            .get_json::<Value>(Uuid::new_v4(), Uuid::new_v4(), url)
            .await
            .unwrap_err();

        assert!(matches!(err, VaultError::ProviderRequest { status: Some(503) }));
        assert!(tokens.failures.lock().unwrap().is_empty());
    }
}
