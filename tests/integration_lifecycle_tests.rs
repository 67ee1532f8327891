//! Plan limit gate and status transitions against SQLite.

mod test_utils;

use std::sync::Arc;

use chrono::Utc;
use credential_vault::credential_store::NewCredentials;
use credential_vault::crypto::is_encrypted;
use credential_vault::error::VaultError;
use credential_vault::lifecycle::{LifecycleEvent, NewIntegration};
use credential_vault::models::{ConnectionType, ExpiresAt, IntegrationStatus, OAuthData, PlanTier, TokenSet};
use credential_vault::repositories::IntegrationRepository;
use credential_vault::token_refresh::FixedClock;
use serde_json::json;
use test_utils::*;
use uuid::Uuid;

fn oauth_request(tenant_id: Uuid) -> NewIntegration {
    NewIntegration {
        tenant_id,
        provider_name: "QuickBooks".to_string(),
        connection_type: ConnectionType::OAuth,
        environment: None,
        credentials: NewCredentials {
            client_id: Some("client".to_string()),
            client_secret: Some("secret".to_string()),
            api_key: None,
        },
    }
}

fn token_set(expires_at: i64) -> OAuthData {
    OAuthData {
        tokens: Some(TokenSet {
            access_token: Some("A1".to_string()),
            refresh_token: Some("R1".to_string()),
            expires_at: Some(ExpiresAt::Epoch(expires_at)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn row_count(db: &sea_orm::DatabaseConnection, tenant_id: Uuid) -> u64 {
    IntegrationRepository::count_active_by_tenant(db, tenant_id)
        .await
        .unwrap()
}

#[tokio::test]
async fn tenant_at_limit_is_rejected_without_writing() {
    let db = setup_test_db().await.unwrap();
    let state = build_state(&db, test_config("http://127.0.0.1:9/token"));
    let tenant_id = create_test_tenant(&db, PlanTier::Free).await.unwrap();

    let check = state.gate.can_create_integration(tenant_id).await.unwrap();
    assert!(check.allowed);
    assert_eq!((check.current, check.max), (0, 1));

    state
        .gate
        .create_integration(oauth_request(tenant_id))
        .await
        .unwrap();

    let err = state
        .gate
        .create_integration(oauth_request(tenant_id))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VaultError::IntegrationLimitReached { current: 1, max: 1 }
    ));
    assert_eq!(row_count(&db, tenant_id).await, 1);
    assert_eq!(state.integrations.list_by_tenant(tenant_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn last_free_slot_can_be_used() {
    let db = setup_test_db().await.unwrap();
    let state = build_state(&db, test_config("http://127.0.0.1:9/token"));
    let tenant_id = create_test_tenant(&db, PlanTier::Starter).await.unwrap();

    for _ in 0..2 {
        state
            .gate
            .create_integration(oauth_request(tenant_id))
            .await
            .unwrap();
    }
    let check = state.gate.can_create_integration(tenant_id).await.unwrap();
    assert_eq!((check.allowed, check.current, check.max), (true, 2, 3));

    state
        .gate
        .create_integration(oauth_request(tenant_id))
        .await
        .unwrap();

    let check = state.gate.can_create_integration(tenant_id).await.unwrap();
    assert_eq!((check.allowed, check.current, check.max), (false, 3, 3));
}

#[tokio::test]
async fn disconnected_integrations_free_their_slot() {
    let db = setup_test_db().await.unwrap();
    let state = build_state(&db, test_config("http://127.0.0.1:9/token"));
    let tenant_id = create_test_tenant(&db, PlanTier::Free).await.unwrap();
    insert_integration(
        &db,
        IntegrationFixture::connected(tenant_id).with_status("disconnected"),
    )
    .await
    .unwrap();

    let check = state.gate.can_create_integration(tenant_id).await.unwrap();
    assert_eq!((check.allowed, check.current), (true, 0));
}

#[tokio::test]
async fn unknown_tenant_is_not_found() {
    let db = setup_test_db().await.unwrap();
    let state = build_state(&db, test_config("http://127.0.0.1:9/token"));

    let err = state
        .gate
        .can_create_integration(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::NotFound { entity: "tenant", .. }));
}

#[tokio::test]
async fn created_integration_is_pending_with_sealed_credentials() {
    let db = setup_test_db().await.unwrap();
    let state = build_state(&db, test_config("http://127.0.0.1:9/token"));
    let tenant_id = create_test_tenant(&db, PlanTier::Starter).await.unwrap();

    let model = state
        .gate
        .create_integration(oauth_request(tenant_id))
        .await
        .unwrap();

    assert_eq!(model.status(), IntegrationStatus::Pending);
    assert_eq!(model.provider_name, "quickbooks");
    assert!(model.client_id.is_none());

    let settings = model.settings.unwrap();
    let sealed_id = settings["client_id"].as_str().unwrap();
    assert!(is_encrypted(sealed_id));
    assert_eq!(test_cipher().decrypt(sealed_id).unwrap(), "client");
    assert!(is_encrypted(settings["client_secret"].as_str().unwrap()));
}

#[tokio::test]
async fn production_without_master_key_refuses_to_persist() {
    let db = setup_test_db().await.unwrap();
    let mut config = test_config("http://127.0.0.1:9/token");
    config.profile = "production".to_string();
    config.master_key = None;
    let state = build_state(&db, config);
    let tenant_id = create_test_tenant(&db, PlanTier::Starter).await.unwrap();

    let err = state
        .gate
        .create_integration(oauth_request(tenant_id))
        .await
        .unwrap_err();

    assert!(matches!(err, VaultError::EncryptionDisabled));
    assert_eq!(row_count(&db, tenant_id).await, 0);
}

#[tokio::test]
async fn authorization_then_refresh_failure_then_reauthorize() {
    let db = setup_test_db().await.unwrap();
    let state = build_state(&db, test_config("http://127.0.0.1:9/token"));
    let tenant_id = create_test_tenant(&db, PlanTier::Starter).await.unwrap();
    let model = state
        .gate
        .create_integration(oauth_request(tenant_id))
        .await
        .unwrap();
    let expires_at = Utc::now().timestamp() + 3600;

    let status = state
        .gate
        .complete_authorization(model.id, &token_set(expires_at))
        .await
        .unwrap();
    assert_eq!(status, IntegrationStatus::Connected);

    let stored = reload(&db, model.id).await.unwrap();
    let settings = stored.settings.as_ref().unwrap();
    assert!(is_encrypted(settings["client_id"].as_str().unwrap()));
    assert!(is_encrypted(
        settings["oauth_data"]["tokens"]["access_token"].as_str().unwrap()
    ));
    assert_eq!(
        state.tokens.ensure_valid_access_token(model.id).await.unwrap(),
        "A1"
    );

    assert_eq!(
        state.gate.record_refresh_failure(model.id).await.unwrap(),
        IntegrationStatus::Expired
    );
    // Recording the same failure twice is harmless
    assert_eq!(
        state.gate.record_refresh_failure(model.id).await.unwrap(),
        IntegrationStatus::Expired
    );

    let mut renewed = token_set(expires_at);
    if let Some(tokens) = renewed.tokens.as_mut() {
        tokens.access_token = Some("A5".to_string());
    }
    assert_eq!(
        state.gate.reauthorize(model.id, &renewed).await.unwrap(),
        IntegrationStatus::Connected
    );
    assert_eq!(
        state.tokens.ensure_valid_access_token(model.id).await.unwrap(),
        "A5"
    );

    assert_eq!(
        state.gate.disconnect(model.id).await.unwrap(),
        IntegrationStatus::Disconnected
    );
    assert_eq!(row_count(&db, tenant_id).await, 0);
}

#[tokio::test]
async fn illegal_transitions_write_nothing() {
    let db = setup_test_db().await.unwrap();
    let state = build_state(&db, test_config("http://127.0.0.1:9/token"));
    let tenant_id = create_test_tenant(&db, PlanTier::Starter).await.unwrap();
    let model = state
        .gate
        .create_integration(oauth_request(tenant_id))
        .await
        .unwrap();

    let err = state
        .gate
        .reauthorize(model.id, &token_set(Utc::now().timestamp() + 3600))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VaultError::InvalidTransition {
            from: IntegrationStatus::Pending,
            event: LifecycleEvent::Reauthorized,
        }
    ));

    let stored = reload(&db, model.id).await.unwrap();
    assert_eq!(stored.status(), IntegrationStatus::Pending);
    assert!(stored.settings.unwrap().get("oauth_data").is_none());

    state
        .gate
        .record_authorization_failure(model.id)
        .await
        .unwrap();
    assert!(state.gate.record_refresh_failure(model.id).await.is_err());
    assert_eq!(
        reload(&db, model.id).await.unwrap().status(),
        IntegrationStatus::Error
    );
}

#[tokio::test]
async fn provider_auth_failure_moves_connected_to_error() {
    let db = setup_test_db().await.unwrap();
    let state = build_state(&db, test_config("http://127.0.0.1:9/token"));
    let tenant_id = create_test_tenant(&db, PlanTier::Starter).await.unwrap();
    let integration = insert_integration(&db, IntegrationFixture::connected(tenant_id))
        .await
        .unwrap();

    let status = state
        .gate
        .record_provider_auth_failure(integration.id)
        .await
        .unwrap();
    assert_eq!(status, IntegrationStatus::Error);
}

#[tokio::test]
async fn observed_status_flags_expired_tokens_before_any_refresh() {
    let db = setup_test_db().await.unwrap();
    let now = Utc::now();
    let state = build_state_with_clock(
        &db,
        test_config("http://127.0.0.1:9/token"),
        Arc::new(FixedClock(now)),
    );
    let tenant_id = create_test_tenant(&db, PlanTier::Enterprise).await.unwrap();

    let fresh = insert_integration(
        &db,
        IntegrationFixture::connected(tenant_id).with_settings(json!({
            "oauth_data": { "tokens": { "access_token": "A1", "expires_at": now.timestamp() + 301 } }
        })),
    )
    .await
    .unwrap();
    let stale = insert_integration(
        &db,
        IntegrationFixture::connected(tenant_id).with_settings(json!({
            "oauth_data": { "tokens": { "access_token": "A1", "expires_at": now.timestamp() + 299 } }
        })),
    )
    .await
    .unwrap();
    let errored = insert_integration(&db, IntegrationFixture::connected(tenant_id).with_status("error"))
        .await
        .unwrap();

    let observed = state.gate.observed_status(&fresh);
    assert!(!observed.token_expired && !observed.needs_reconnect);

    let observed = state.gate.observed_status(&stale);
    assert_eq!(observed.status, IntegrationStatus::Connected);
    assert!(observed.token_expired && observed.needs_reconnect);

    let observed = state.gate.observed_status(&errored);
    assert!(!observed.token_expired && observed.needs_reconnect);

    // The stored status is untouched by the read-time check
    assert_eq!(
        reload(&db, stale.id).await.unwrap().status(),
        IntegrationStatus::Connected
    );
}
