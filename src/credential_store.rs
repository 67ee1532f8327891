//! Credential store adapter
//!
//! Produces one decrypted view of an integration's credentials regardless of
//! which storage shape the row uses. Two locations exist:
//!
//! * current: the nested `settings` bag, with each secret leaf sealed individually
//! * legacy: the top-level `client_id`, `client_secret` and `oauth_data` columns,
//!   possibly plaintext, and for `oauth_data` possibly one envelope over the whole object
//!
//! The current location always wins. Writes only ever go to the current location.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::crypto::{Cipher, is_encrypted};
use crate::error::VaultError;
use crate::models::integration;
use crate::models::oauth::SENSITIVE_TOKEN_FIELDS;
use crate::models::{OAuthData, TokenSet};
use crate::repositories::IntegrationRepository;

pub const SETTINGS_CLIENT_ID: &str = "client_id";
pub const SETTINGS_CLIENT_SECRET: &str = "client_secret";
pub const SETTINGS_API_KEY: &str = "api_key";
pub const SETTINGS_OAUTH_DATA: &str = "oauth_data";

/// Which storage shape supplied a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Current,
    Legacy,
}

/// Where each resolved credential came from; `None` means neither location had it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CredentialSources {
    pub client_id: Option<CredentialSource>,
    pub client_secret: Option<CredentialSource>,
    pub oauth_data: Option<CredentialSource>,
}

/// Fully decrypted credentials for one integration
#[derive(Clone, PartialEq)]
pub struct DecryptedCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub api_key: Option<String>,
    pub oauth_data: Option<OAuthData>,
    /// `settings` exactly as stored (still sealed), for read-modify-write
    pub raw_settings: Map<String, Value>,
    pub sources: CredentialSources,
}

impl DecryptedCredentials {
    /// Token set at `oauth_data.tokens`, if any
    pub fn tokens(&self) -> Option<&TokenSet> {
        self.oauth_data.as_ref().and_then(|data| data.tokens.as_ref())
    }
}

impl fmt::Debug for DecryptedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedCredentials")
            .field("client_id", &self.client_id.as_ref().map(|_| "[REDACTED]"))
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("oauth_data", &self.oauth_data)
            .field("sources", &self.sources)
            .finish()
    }
}

/// Plaintext credentials supplied when an integration is created
#[derive(Clone, Default)]
pub struct NewCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub api_key: Option<String>,
}

impl fmt::Debug for NewCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewCredentials")
            .field("client_id", &self.client_id.is_some())
            .field("client_secret", &self.client_secret.is_some())
            .field("api_key", &self.api_key.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    cipher: Arc<Cipher>,
    repo: IntegrationRepository,
}

impl CredentialStore {
    pub fn new(cipher: Arc<Cipher>, repo: IntegrationRepository) -> Self {
        Self { cipher, repo }
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    pub fn repository(&self) -> &IntegrationRepository {
        &self.repo
    }

    /// Decrypt and resolve credentials across both storage shapes.
    ///
    /// Any decryption failure fails the whole read; no partial view is returned.
    pub fn get_decrypted_credentials(
        &self,
        model: &integration::Model,
    ) -> Result<DecryptedCredentials, VaultError> {
        let raw_settings = settings_object(model)?;
        let mut sources = CredentialSources::default();

        let current_client_id = self.open_setting(model, &raw_settings, SETTINGS_CLIENT_ID)?;
        let current_client_secret =
            self.open_setting(model, &raw_settings, SETTINGS_CLIENT_SECRET)?;
        let api_key = self.open_setting(model, &raw_settings, SETTINGS_API_KEY)?;

        let client_id = self.resolve(
            model,
            current_client_id,
            model.client_id.as_deref(),
            &mut sources.client_id,
        )?;
        let client_secret = self.resolve(
            model,
            current_client_secret,
            model.client_secret.as_deref(),
            &mut sources.client_secret,
        )?;

        let current_oauth = raw_settings
            .get(SETTINGS_OAUTH_DATA)
            .filter(|value| !value.is_null());
        let oauth_value = match (current_oauth, model.oauth_data.as_ref().filter(|v| !v.is_null())) {
            (Some(current), _) => {
                sources.oauth_data = Some(CredentialSource::Current);
                Some(self.open_oauth_value(model, current, CredentialSource::Current)?)
            }
            (None, Some(legacy)) => {
                sources.oauth_data = Some(CredentialSource::Legacy);
                tracing::debug!(
                    integration_id = %model.id,
                    tenant_id = %model.tenant_id,
                    "Using legacy top-level oauth_data"
                );
                Some(self.open_oauth_value(model, legacy, CredentialSource::Legacy)?)
            }
            (None, None) => None,
        };

        let oauth_data = oauth_value
            .map(|value| {
                serde_json::from_value::<OAuthData>(value).map_err(|_| {
                    tracing::error!(
                        integration_id = %model.id,
                        tenant_id = %model.tenant_id,
                        "Stored oauth_data has an unexpected shape"
                    );
                    VaultError::MalformedCredentials
                })
            })
            .transpose()?;

        Ok(DecryptedCredentials {
            client_id,
            client_secret,
            api_key,
            oauth_data,
            raw_settings,
            sources,
        })
    }

    /// Seal the merged token set and write it to `settings.oauth_data` only.
    pub async fn persist_refreshed_tokens(
        &self,
        integration_id: Uuid,
        merged: &OAuthData,
    ) -> Result<(), VaultError> {
        let model = self
            .repo
            .get_by_id(integration_id)
            .await?
            .ok_or_else(|| VaultError::integration_not_found(integration_id))?;

        let settings = self.settings_with_oauth_data(&model, merged)?;
        if !self.repo.update_settings(integration_id, settings).await? {
            return Err(VaultError::integration_not_found(integration_id));
        }

        tracing::debug!(
            integration_id = %integration_id,
            tenant_id = %model.tenant_id,
            "Persisted refreshed token set"
        );
        Ok(())
    }

    /// The row's `settings` with `oauth_data` replaced by the sealed form of `data`
    pub fn settings_with_oauth_data(
        &self,
        model: &integration::Model,
        data: &OAuthData,
    ) -> Result<Value, VaultError> {
        let mut settings = settings_object(model)?;
        settings.insert(SETTINGS_OAUTH_DATA.to_string(), self.seal_oauth_data(data)?);
        Ok(Value::Object(settings))
    }

    /// Serialize `data`, sealing each sensitive token leaf. Unknown fields pass through.
    pub fn seal_oauth_data(&self, data: &OAuthData) -> Result<Value, VaultError> {
        let mut value = serde_json::to_value(data).map_err(|_| VaultError::MalformedCredentials)?;

        if let Some(tokens) = value.get_mut("tokens").and_then(Value::as_object_mut) {
            for field in SENSITIVE_TOKEN_FIELDS {
                if let Some(Value::String(plain)) = tokens.get(field) {
                    let sealed = self.cipher.seal(plain)?;
                    tokens.insert(field.to_string(), Value::String(sealed));
                }
            }
        }

        Ok(value)
    }

    /// Settings bag for a new integration with every supplied secret sealed
    pub fn seal_new_credentials(&self, credentials: &NewCredentials) -> Result<Value, VaultError> {
        let mut settings = Map::new();
        for (key, value) in [
            (SETTINGS_CLIENT_ID, credentials.client_id.as_deref()),
            (SETTINGS_CLIENT_SECRET, credentials.client_secret.as_deref()),
            (SETTINGS_API_KEY, credentials.api_key.as_deref()),
        ] {
            if let Some(plain) = value.filter(|v| !v.is_empty()) {
                settings.insert(key.to_string(), Value::String(self.cipher.seal(plain)?));
            }
        }
        Ok(Value::Object(settings))
    }

    /// Seal any plaintext secret in the current location.
    ///
    /// Returns the rewritten settings and the number of leaves that changed.
    /// A whole-object `oauth_data` envelope is opened and resealed leaf by leaf.
    pub fn reseal_settings(
        &self,
        model: &integration::Model,
    ) -> Result<(Value, usize), VaultError> {
        let mut settings = settings_object(model)?;
        let mut changed = 0;

        for key in [SETTINGS_CLIENT_ID, SETTINGS_CLIENT_SECRET, SETTINGS_API_KEY] {
            if let Some(Value::String(value)) = settings.get(key) {
                if !value.is_empty() && !is_encrypted(value) {
                    let sealed = self.cipher.seal(value)?;
                    settings.insert(key.to_string(), Value::String(sealed));
                    changed += 1;
                }
            }
        }

        if let Some(current) = settings.get(SETTINGS_OAUTH_DATA).filter(|v| !v.is_null()) {
            let before = current.clone();
            let opened = self.open_oauth_value(model, current, CredentialSource::Current)?;
            let data: OAuthData =
                serde_json::from_value(opened).map_err(|_| VaultError::MalformedCredentials)?;
            let mut resealed = self.seal_oauth_data(&data)?;
            // Keep envelopes that were already sealed byte-identical
            preserve_sealed_leaves(&before, &mut resealed);
            changed += count_changed_token_leaves(&before, &resealed);
            settings.insert(SETTINGS_OAUTH_DATA.to_string(), resealed);
        }

        Ok((Value::Object(settings), changed))
    }

    fn open_setting(
        &self,
        model: &integration::Model,
        settings: &Map<String, Value>,
        key: &str,
    ) -> Result<Option<String>, VaultError> {
        match settings.get(key) {
            Some(Value::String(value)) if !value.is_empty() => {
                self.open_string(model, value, CredentialSource::Current).map(Some)
            }
            Some(Value::Null) | None => Ok(None),
            Some(Value::String(_)) => Ok(None),
            Some(_) => Err(VaultError::MalformedCredentials),
        }
    }

    fn resolve(
        &self,
        model: &integration::Model,
        current: Option<String>,
        legacy: Option<&str>,
        source: &mut Option<CredentialSource>,
    ) -> Result<Option<String>, VaultError> {
        if current.is_some() {
            *source = Some(CredentialSource::Current);
            return Ok(current);
        }
        match legacy.filter(|value| !value.is_empty()) {
            Some(value) => {
                *source = Some(CredentialSource::Legacy);
                self.open_string(model, value, CredentialSource::Legacy)
                    .map(Some)
            }
            None => Ok(None),
        }
    }

    fn open_string(
        &self,
        model: &integration::Model,
        value: &str,
        location: CredentialSource,
    ) -> Result<String, VaultError> {
        if self.cipher.is_encryption_enabled() && !is_encrypted(value) {
            tracing::warn!(
                integration_id = %model.id,
                tenant_id = %model.tenant_id,
                location = ?location,
                "Plaintext credential detected, consider running reencrypt-plaintext-credentials"
            );
        }
        self.cipher.open(value).map_err(|_| {
            tracing::error!(
                integration_id = %model.id,
                tenant_id = %model.tenant_id,
                location = ?location,
                "Credential decryption failed"
            );
            VaultError::Decryption
        })
    }

    /// Open an `oauth_data` value: either one envelope (or plaintext JSON) string
    /// over the whole object, or an object whose string leaves may be sealed.
    fn open_oauth_value(
        &self,
        model: &integration::Model,
        value: &Value,
        location: CredentialSource,
    ) -> Result<Value, VaultError> {
        match value {
            Value::String(text) => {
                let opened = self.open_string(model, text, location)?;
                let parsed: Value =
                    serde_json::from_str(&opened).map_err(|_| VaultError::MalformedCredentials)?;
                if !parsed.is_object() {
                    return Err(VaultError::MalformedCredentials);
                }
                self.open_leaves(model, &parsed, location)
            }
            Value::Object(_) => self.open_leaves(model, value, location),
            _ => Err(VaultError::MalformedCredentials),
        }
    }

    fn open_leaves(
        &self,
        model: &integration::Model,
        value: &Value,
        location: CredentialSource,
    ) -> Result<Value, VaultError> {
        Ok(match value {
            Value::String(text) if is_encrypted(text) => {
                Value::String(self.open_string(model, text, location)?)
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.open_leaves(model, v, location)?)))
                    .collect::<Result<Map<_, _>, VaultError>>()?,
            ),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.open_leaves(model, v, location))
                    .collect::<Result<Vec<_>, VaultError>>()?,
            ),
            other => other.clone(),
        })
    }
}

fn settings_object(model: &integration::Model) -> Result<Map<String, Value>, VaultError> {
    match model.settings.as_ref() {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => {
            tracing::error!(
                integration_id = %model.id,
                tenant_id = %model.tenant_id,
                "Integration settings is not an object"
            );
            Err(VaultError::MalformedCredentials)
        }
    }
}

fn token_leaf<'a>(oauth: &'a Value, field: &str) -> Option<&'a Value> {
    oauth.get("tokens").and_then(|tokens| tokens.get(field))
}

fn preserve_sealed_leaves(before: &Value, after: &mut Value) {
    let Some(tokens) = after.get_mut("tokens").and_then(Value::as_object_mut) else {
        return;
    };
    for field in SENSITIVE_TOKEN_FIELDS {
        if let Some(Value::String(previous)) = token_leaf(before, field) {
            if is_encrypted(previous) {
                tokens.insert(field.to_string(), Value::String(previous.clone()));
            }
        }
    }
}

fn count_changed_token_leaves(before: &Value, after: &Value) -> usize {
    if before.is_string() {
        // Whole-object envelope replaced by a per-leaf object
        return 1;
    }
    SENSITIVE_TOKEN_FIELDS
        .iter()
        .filter(|field| token_leaf(before, field) != token_leaf(after, field))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherConfig, CryptoKey};
    use crate::models::ExpiresAt;
    use chrono::Utc;
    use sea_orm::DatabaseConnection;
    use sea_orm::prelude::DateTimeWithTimeZone;
    use serde_json::json;

    fn key() -> CryptoKey {
        CryptoKey::new(vec![42u8; 32]).unwrap()
    }

    fn store_with(config: CipherConfig) -> CredentialStore {
        CredentialStore::new(
            Arc::new(Cipher::new(config)),
            IntegrationRepository::new(Arc::new(DatabaseConnection::default())),
        )
    }

    fn store() -> CredentialStore {
        store_with(CipherConfig::with_key(key()))
    }

    fn model() -> integration::Model {
        let now: DateTimeWithTimeZone = Utc::now().into();
        integration::Model {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            provider_name: "quickbooks".to_string(),
            connection_type: "oauth".to_string(),
            status: "connected".to_string(),
            environment: Some("production".to_string()),
            settings: None,
            client_id: None,
            client_secret: None,
            oauth_data: None,
            refresh_lease_owner: None,
            refresh_lease_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn token_data() -> OAuthData {
        OAuthData {
            tokens: Some(TokenSet {
                access_token: Some("A1".to_string()),
                refresh_token: Some("R1".to_string()),
                expires_in: Some(3600),
                expires_at: Some(ExpiresAt::Epoch(1_700_000_000)),
                ..Default::default()
            }),
            extra: Map::from_iter([("realm_id".to_string(), json!("9130"))]),
        }
    }

    #[test]
    fn legacy_fallback_matches_migrated_view() {
        let store = store();
        let cipher = store.cipher();

        let mut legacy = model();
        legacy.client_id = Some("cid".to_string());
        legacy.client_secret = Some(cipher.encrypt("secret").unwrap());
        legacy.oauth_data = Some(Value::String(
            cipher
                .encrypt(&serde_json::to_string(&token_data()).unwrap())
                .unwrap(),
        ));

        let mut migrated = model();
        migrated.settings = Some(json!({
            "client_id": cipher.encrypt("cid").unwrap(),
            "client_secret": cipher.encrypt("secret").unwrap(),
            "oauth_data": store.seal_oauth_data(&token_data()).unwrap(),
        }));

        let from_legacy = store.get_decrypted_credentials(&legacy).unwrap();
        let from_current = store.get_decrypted_credentials(&migrated).unwrap();

        assert_eq!(from_legacy.tokens(), from_current.tokens());
        assert_eq!(from_legacy.client_id, from_current.client_id);
        assert_eq!(from_legacy.client_secret.as_deref(), Some("secret"));
        assert_eq!(from_legacy.sources.oauth_data, Some(CredentialSource::Legacy));
        assert_eq!(from_current.sources.oauth_data, Some(CredentialSource::Current));
    }

    #[test]
    fn current_location_wins_over_legacy() {
        let store = store();
        let mut row = model();
        row.client_id = Some("legacy-cid".to_string());
        row.oauth_data = Some(json!({"tokens": {"access_token": "legacy"}}));
        row.settings = Some(json!({
            "client_id": store.cipher().encrypt("current-cid").unwrap(),
            "oauth_data": {"tokens": {"access_token": store.cipher().encrypt("current").unwrap()}},
        }));

        let creds = store.get_decrypted_credentials(&row).unwrap();
        assert_eq!(creds.client_id.as_deref(), Some("current-cid"));
        assert_eq!(
            creds.tokens().unwrap().access_token.as_deref(),
            Some("current")
        );
        assert_eq!(creds.sources.client_id, Some(CredentialSource::Current));
    }

    #[test]
    fn plaintext_copied_into_settings_passes_through() {
        let store = store();
        let mut row = model();
        row.settings = Some(json!({
            "client_id": "plain-cid",
            "oauth_data": {"tokens": {"access_token": "plain", "refresh_token": "R1"}},
        }));

        let creds = store.get_decrypted_credentials(&row).unwrap();
        assert_eq!(creds.client_id.as_deref(), Some("plain-cid"));
        assert!(creds.tokens().unwrap().has_refresh_token());
    }

    #[test]
    fn individually_sealed_expiry_fields_are_opened() {
        let store = store();
        let cipher = store.cipher();
        let mut row = model();
        row.settings = Some(json!({
            "oauth_data": {"tokens": {
                "access_token": cipher.encrypt("A1").unwrap(),
                "expires_in": cipher.encrypt("3600").unwrap(),
                "expires_at": cipher.encrypt("2023-11-14T22:13:20Z").unwrap(),
            }},
        }));

        let creds = store.get_decrypted_credentials(&row).unwrap();
        let tokens = creds.tokens().unwrap();
        assert_eq!(tokens.expires_in, Some(3600));
        assert_eq!(tokens.expiry(), crate::models::Expiry::At(1_700_000_000));
    }

    #[test]
    fn one_bad_envelope_fails_the_whole_read() {
        let store = store();
        let other = Cipher::new(CipherConfig::with_key(CryptoKey::new(vec![1u8; 32]).unwrap()));
        let mut row = model();
        row.settings = Some(json!({
            "client_id": store.cipher().encrypt("cid").unwrap(),
            "client_secret": other.encrypt("secret").unwrap(),
        }));

        assert!(matches!(
            store.get_decrypted_credentials(&row),
            Err(VaultError::Decryption)
        ));
    }

    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture_logs(f: impl FnOnce()) -> String {
        let buffer = Arc::new(std::sync::Mutex::new(Vec::new()));
        let writer = Arc::clone(&buffer);
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || LogBuffer(Arc::clone(&writer)))
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buffer.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn log_location_follows_the_storage_shape() {
        let store = store();
        let other = Cipher::new(CipherConfig::with_key(CryptoKey::new(vec![1u8; 32]).unwrap()));

        let mut legacy = model();
        legacy.oauth_data = Some(json!({
            "tokens": { "access_token": other.encrypt("A1").unwrap() }
        }));
        let logs = capture_logs(|| {
            assert!(matches!(
                store.get_decrypted_credentials(&legacy),
                Err(VaultError::Decryption)
            ));
        });
        assert!(logs.contains("Credential decryption failed"));
        assert!(logs.contains("location=Legacy"));
        assert!(!logs.contains("location=Current"));

        let mut current = model();
        current.settings = Some(json!({
            "oauth_data": json!({ "tokens": { "access_token": "A1" } }).to_string()
        }));
        let logs = capture_logs(|| {
            store.get_decrypted_credentials(&current).unwrap();
        });
        assert!(logs.contains("Plaintext credential detected"));
        assert!(logs.contains("location=Current"));
        assert!(!logs.contains("location=Legacy"));
    }

    #[test]
    fn repeated_reads_are_identical() {
        let store = store();
        let mut row = model();
        row.settings = Some(json!({
            "client_id": store.cipher().encrypt("cid").unwrap(),
            "oauth_data": store.seal_oauth_data(&token_data()).unwrap(),
        }));

        let first = store.get_decrypted_credentials(&row).unwrap();
        let second = store.get_decrypted_credentials(&row).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn sealing_covers_token_leaves_and_keeps_extras() {
        let store = store();
        let sealed = store.seal_oauth_data(&token_data()).unwrap();

        let tokens = &sealed["tokens"];
        assert!(is_encrypted(tokens["access_token"].as_str().unwrap()));
        assert!(is_encrypted(tokens["refresh_token"].as_str().unwrap()));
        assert_eq!(tokens["expires_in"], json!(3600));
        assert_eq!(sealed["realm_id"], json!("9130"));
    }

    #[test]
    fn sealing_fails_closed_without_key() {
        let store = store_with(CipherConfig::disabled());
        assert!(matches!(
            store.seal_oauth_data(&token_data()),
            Err(VaultError::EncryptionDisabled)
        ));
    }

    #[test]
    fn dev_passthrough_stores_plaintext() {
        let store = store_with(CipherConfig::dev_passthrough());
        let sealed = store.seal_oauth_data(&token_data()).unwrap();
        assert_eq!(sealed["tokens"]["access_token"], json!("A1"));
    }

    #[test]
    fn reseal_only_touches_plaintext() {
        let store = store();
        let already = store.cipher().encrypt("cid").unwrap();
        let mut row = model();
        row.settings = Some(json!({
            "client_id": already,
            "client_secret": "plain-secret",
            "oauth_data": {"tokens": {"access_token": "A1", "refresh_token": store.cipher().encrypt("R1").unwrap()}},
            "webhook_url": "https://example.test/hook",
        }));

        let (resealed, changed) = store.reseal_settings(&row).unwrap();
        assert_eq!(changed, 2);
        assert_eq!(resealed["client_id"], json!(already));
        assert!(is_encrypted(resealed["client_secret"].as_str().unwrap()));
        assert_eq!(resealed["webhook_url"], json!("https://example.test/hook"));

        row.settings = Some(resealed);
        let (_, changed_again) = store.reseal_settings(&row).unwrap();
        assert_eq!(changed_again, 0);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let creds = DecryptedCredentials {
            client_id: Some("cid-visible?".to_string()),
            client_secret: Some("s3cr3t".to_string()),
            api_key: None,
            oauth_data: Some(token_data()),
            raw_settings: Map::new(),
            sources: CredentialSources::default(),
        };
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("s3cr3t"));
        assert!(!rendered.contains("cid-visible"));
        assert!(!rendered.contains("R1"));
    }
}
