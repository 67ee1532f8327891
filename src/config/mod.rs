//! Configuration loading for the credential vault.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `VAULT_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::crypto::CryptoKey;
use crate::models::PlanTier;

const ENV_PREFIX: &str = "VAULT_";
const REDACTED: &str = "[REDACTED]";

/// Upper bound for the refresh lease TTL
pub const MAX_LEASE_TTL_SECONDS: u64 = 3600;

/// Application configuration derived from `VAULT_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    /// Raw 32-byte master key; `None` disables encryption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key: Option<Vec<u8>>,
    #[serde(default)]
    pub token_refresh: TokenRefreshConfig,
    #[serde(default)]
    pub plan_limits: PlanLimitsConfig,
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// Token refresh engine and orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TokenRefreshConfig {
    /// Safety margin subtracted from `expires_at` (default: 300)
    #[serde(default = "default_token_refresh_expiry_buffer_seconds")]
    pub expiry_buffer_seconds: u64,

    /// Provider token endpoint timeout (default: 10000)
    #[serde(default = "default_token_refresh_http_timeout_ms")]
    pub http_timeout_ms: u64,

    /// Lifetime of the datastore refresh lease (default: 30)
    #[serde(default = "default_token_refresh_lease_ttl_seconds")]
    pub lease_ttl_seconds: u64,

    /// Poll interval while another worker holds the lease (default: 250)
    #[serde(default = "default_token_refresh_lease_wait_ms")]
    pub lease_wait_ms: u64,

    /// Polls before giving up on a held lease (default: 20)
    #[serde(default = "default_token_refresh_lease_wait_attempts")]
    pub lease_wait_attempts: u32,

    /// Delay before re-reading persisted tokens after a failed refresh (default: 500)
    #[serde(default = "default_token_refresh_soft_retry_delay_ms")]
    pub soft_retry_delay_ms: u64,

    /// Background refresh interval in seconds (default: 300)
    #[serde(default = "default_token_refresh_tick_seconds")]
    pub tick_seconds: u64,

    /// Maximum number of concurrent background refreshes (default: 4)
    #[serde(default = "default_token_refresh_concurrency")]
    pub concurrency: u32,

    /// Jitter factor to avoid thundering herd (default: 0.1)
    #[serde(default = "default_token_refresh_jitter_factor")]
    pub jitter_factor: f64,
}

impl TokenRefreshConfig {
    /// Validate token refresh configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expiry_buffer_seconds == 0 || self.expiry_buffer_seconds > 3600 {
            return Err(ConfigError::InvalidTokenRefreshBuffer {
                value: self.expiry_buffer_seconds,
            });
        }

        if self.http_timeout_ms < 100 || self.http_timeout_ms > 120_000 {
            return Err(ConfigError::InvalidTokenRefreshTimeout {
                value: self.http_timeout_ms,
            });
        }

        // The lease must outlive one provider call or two workers can both refresh
        if self.lease_ttl_seconds > MAX_LEASE_TTL_SECONDS
            || self.lease_ttl_seconds.saturating_mul(1000) <= self.http_timeout_ms
        {
            return Err(ConfigError::InvalidTokenRefreshLeaseTtl {
                value: self.lease_ttl_seconds,
                timeout_ms: self.http_timeout_ms,
            });
        }

        if self.tick_seconds < 30 {
            return Err(ConfigError::InvalidTokenRefreshTickInterval {
                value: self.tick_seconds,
            });
        }

        if self.concurrency == 0 || self.concurrency > 20 {
            return Err(ConfigError::InvalidTokenRefreshConcurrency {
                value: self.concurrency,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidTokenRefreshJitter {
                value: self.jitter_factor,
            });
        }

        Ok(())
    }
}

impl Default for TokenRefreshConfig {
    fn default() -> Self {
        Self {
            expiry_buffer_seconds: default_token_refresh_expiry_buffer_seconds(),
            http_timeout_ms: default_token_refresh_http_timeout_ms(),
            lease_ttl_seconds: default_token_refresh_lease_ttl_seconds(),
            lease_wait_ms: default_token_refresh_lease_wait_ms(),
            lease_wait_attempts: default_token_refresh_lease_wait_attempts(),
            soft_retry_delay_ms: default_token_refresh_soft_retry_delay_ms(),
            tick_seconds: default_token_refresh_tick_seconds(),
            concurrency: default_token_refresh_concurrency(),
            jitter_factor: default_token_refresh_jitter_factor(),
        }
    }
}

/// Maximum integrations per plan tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PlanLimitsConfig {
    #[serde(default = "default_plan_limit_free")]
    pub free: u64,
    #[serde(default = "default_plan_limit_starter")]
    pub starter: u64,
    #[serde(default = "default_plan_limit_professional")]
    pub professional: u64,
    #[serde(default = "default_plan_limit_enterprise")]
    pub enterprise: u64,
}

impl PlanLimitsConfig {
    pub fn max_for(&self, tier: PlanTier) -> u64 {
        match tier {
            PlanTier::Free => self.free,
            PlanTier::Starter => self.starter,
            PlanTier::Professional => self.professional,
            PlanTier::Enterprise => self.enterprise,
        }
    }
}

impl Default for PlanLimitsConfig {
    fn default() -> Self {
        Self {
            free: default_plan_limit_free(),
            starter: default_plan_limit_starter(),
            professional: default_plan_limit_professional(),
            enterprise: default_plan_limit_enterprise(),
        }
    }
}

/// Per-provider OAuth settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ProviderConfig {
    pub token_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            master_key: None,
            token_refresh: TokenRefreshConfig::default(),
            plan_limits: PlanLimitsConfig::default(),
            providers: default_providers(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// `local` and `test` tolerate a missing master key (passthrough mode).
    pub fn is_dev_profile(&self) -> bool {
        matches!(self.profile.as_str(), "local" | "test")
    }

    /// Token endpoint for a provider; names are matched case-insensitively.
    pub fn token_endpoint_for(&self, provider_name: &str) -> Option<Url> {
        self.providers
            .get(&provider_name.to_ascii_lowercase())
            .and_then(|provider| Url::parse(&provider.token_url).ok())
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec![REDACTED.to_string()];
        }
        if config.master_key.is_some() {
            config.master_key = Some(REDACTED.as_bytes().to_vec());
        }
        if let Some((scheme, _)) = config.database_url.split_once("://") {
            if config.database_url.contains('@') {
                config.database_url = format!("{}://{}", scheme, REDACTED);
            }
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref key) = self.master_key {
            if key.len() != 32 {
                return Err(ConfigError::InvalidMasterKeyLength { length: key.len() });
            }
        } else if !self.is_dev_profile() {
            return Err(ConfigError::MissingMasterKey {
                profile: self.profile.clone(),
            });
        }

        if !self.is_dev_profile() && self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        for (provider, settings) in &self.providers {
            if let Err(source) = Url::parse(&settings.token_url) {
                return Err(ConfigError::InvalidProviderTokenUrl {
                    provider: provider.clone(),
                    value: settings.token_url.clone(),
                    source,
                });
            }
        }

        self.token_refresh.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://credential-vault.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_token_refresh_expiry_buffer_seconds() -> u64 {
    300 // 5 minutes
}

fn default_token_refresh_http_timeout_ms() -> u64 {
    10_000
}

fn default_token_refresh_lease_ttl_seconds() -> u64 {
    30
}

fn default_token_refresh_lease_wait_ms() -> u64 {
    250
}

fn default_token_refresh_lease_wait_attempts() -> u32 {
    20
}

fn default_token_refresh_soft_retry_delay_ms() -> u64 {
    500
}

fn default_token_refresh_tick_seconds() -> u64 {
    300 // 5 minutes
}

fn default_token_refresh_concurrency() -> u32 {
    4
}

fn default_token_refresh_jitter_factor() -> f64 {
    0.1 // 10% jitter
}

fn default_plan_limit_free() -> u64 {
    1
}

fn default_plan_limit_starter() -> u64 {
    3
}

fn default_plan_limit_professional() -> u64 {
    10
}

fn default_plan_limit_enterprise() -> u64 {
    50
}

fn default_providers() -> BTreeMap<String, ProviderConfig> {
    [
        (
            "quickbooks",
            "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer",
        ),
        ("xero", "https://identity.xero.com/connect/token"),
        (
            "microsoft",
            "https://login.microsoftonline.com/common/oauth2/v2.0/token",
        ),
        ("hubspot", "https://api.hubapi.com/oauth/v1/token"),
    ]
    .into_iter()
    .map(|(name, token_url)| {
        (
            name.to_string(),
            ProviderConfig {
                token_url: token_url.to_string(),
            },
        )
    })
    .collect()
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("no operator tokens configured; set VAULT_OPERATOR_TOKEN or VAULT_OPERATOR_TOKENS")]
    MissingOperatorTokens,
    #[error("master key is missing for profile '{profile}'; set VAULT_MASTER_KEY")]
    MissingMasterKey { profile: String },
    #[error("master key is invalid: {error}")]
    InvalidMasterKey { error: String },
    #[error("master key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidMasterKeyLength { length: usize },
    #[error("token endpoint for provider {provider} is not a valid URL '{value}': {source}")]
    InvalidProviderTokenUrl {
        provider: String,
        value: String,
        source: url::ParseError,
    },
    #[error("token refresh expiry buffer must be between 1 and 3600 seconds, got {value}")]
    InvalidTokenRefreshBuffer { value: u64 },
    #[error("token refresh http timeout must be between 100 and 120000 ms, got {value}")]
    InvalidTokenRefreshTimeout { value: u64 },
    #[error(
        "token refresh lease ttl ({value}s) must exceed the http timeout ({timeout_ms}ms) and be at most 3600s"
    )]
    InvalidTokenRefreshLeaseTtl { value: u64, timeout_ms: u64 },
    #[error("token refresh tick interval must be at least 30 seconds, got {value}")]
    InvalidTokenRefreshTickInterval { value: u64 },
    #[error("token refresh concurrency must be between 1 and 20, got {value}")]
    InvalidTokenRefreshConcurrency { value: u32 },
    #[error("token refresh jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidTokenRefreshJitter { value: f64 },
}

/// Loads configuration using layered `.env` files and `VAULT_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = parse_or(&mut layered, "DB_MAX_CONNECTIONS", default_db_max_connections);
        let db_acquire_timeout_ms =
            parse_or(&mut layered, "DB_ACQUIRE_TIMEOUT_MS", default_db_acquire_timeout_ms);

        // Comma-separated list wins over the single-token form
        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            tokens
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else if let Some(token) = layered.remove("OPERATOR_TOKEN").filter(|t| !t.is_empty()) {
            vec![token]
        } else {
            Vec::new()
        };

        let master_key = match layered.remove("MASTER_KEY").filter(|v| !v.trim().is_empty()) {
            Some(encoded) => Some(
                CryptoKey::parse(&encoded)
                    .map_err(|e| ConfigError::InvalidMasterKey {
                        error: e.to_string(),
                    })?
                    .as_bytes()
                    .to_vec(),
            ),
            None => None,
        };

        let token_refresh = TokenRefreshConfig {
            expiry_buffer_seconds: parse_or(
                &mut layered,
                "TOKEN_REFRESH_EXPIRY_BUFFER_SECONDS",
                default_token_refresh_expiry_buffer_seconds,
            ),
            http_timeout_ms: parse_or(
                &mut layered,
                "TOKEN_REFRESH_HTTP_TIMEOUT_MS",
                default_token_refresh_http_timeout_ms,
            ),
            lease_ttl_seconds: parse_or(
                &mut layered,
                "TOKEN_REFRESH_LEASE_TTL_SECONDS",
                default_token_refresh_lease_ttl_seconds,
            ),
            lease_wait_ms: parse_or(
                &mut layered,
                "TOKEN_REFRESH_LEASE_WAIT_MS",
                default_token_refresh_lease_wait_ms,
            ),
            lease_wait_attempts: parse_or(
                &mut layered,
                "TOKEN_REFRESH_LEASE_WAIT_ATTEMPTS",
                default_token_refresh_lease_wait_attempts,
            ),
            soft_retry_delay_ms: parse_or(
                &mut layered,
                "TOKEN_REFRESH_SOFT_RETRY_DELAY_MS",
                default_token_refresh_soft_retry_delay_ms,
            ),
            tick_seconds: parse_or(
                &mut layered,
                "TOKEN_REFRESH_TICK_SECONDS",
                default_token_refresh_tick_seconds,
            ),
            concurrency: parse_or(
                &mut layered,
                "TOKEN_REFRESH_CONCURRENCY",
                default_token_refresh_concurrency,
            ),
            jitter_factor: parse_or(
                &mut layered,
                "TOKEN_REFRESH_JITTER_FACTOR",
                default_token_refresh_jitter_factor,
            ),
        };

        let plan_limits = PlanLimitsConfig {
            free: parse_or(&mut layered, "PLAN_LIMIT_FREE", default_plan_limit_free),
            starter: parse_or(&mut layered, "PLAN_LIMIT_STARTER", default_plan_limit_starter),
            professional: parse_or(
                &mut layered,
                "PLAN_LIMIT_PROFESSIONAL",
                default_plan_limit_professional,
            ),
            enterprise: parse_or(
                &mut layered,
                "PLAN_LIMIT_ENTERPRISE",
                default_plan_limit_enterprise,
            ),
        };

        // PROVIDER_<NAME>_TOKEN_URL overrides or extends the built-in endpoints
        let mut providers = default_providers();
        for (key, value) in &layered {
            if let Some(name) = key
                .strip_prefix("PROVIDER_")
                .and_then(|rest| rest.strip_suffix("_TOKEN_URL"))
                .filter(|name| !name.is_empty())
            {
                providers.insert(
                    name.to_ascii_lowercase(),
                    ProviderConfig {
                        token_url: value.trim().to_string(),
                    },
                );
            }
        }

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            operator_tokens,
            master_key,
            token_refresh,
            plan_limits,
            providers,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("VAULT_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_or<T: std::str::FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: fn() -> T,
) -> T {
    layered
        .remove(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(default)
}
