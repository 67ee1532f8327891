use credential_vault::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const BASE64_KEY: &str = "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=";

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("VAULT_"))
        .collect();
    for key in keys {
        unsafe {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader_for(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(dir.path().to_path_buf())
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    let cfg = loader_for(&dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert!(cfg.master_key.is_none());
    assert!(cfg.operator_tokens.is_empty());
    assert_eq!(cfg.token_refresh.expiry_buffer_seconds, 300);
    cfg.bind_addr().expect("default bind addr parses");
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    write_env_file(
        &dir,
        ".env",
        "VAULT_PROFILE=staging\nVAULT_LOG_LEVEL=info\nVAULT_API_BIND_ADDR=127.0.0.1:3000\n",
    );
    write_env_file(&dir, ".env.local", "VAULT_LOG_LEVEL=debug\n");
    write_env_file(
        &dir,
        ".env.staging",
        &format!(
            "VAULT_API_BIND_ADDR=127.0.0.1:4000\nVAULT_MASTER_KEY={}\nVAULT_OPERATOR_TOKEN=staging-op\n",
            BASE64_KEY
        ),
    );
    write_env_file(&dir, ".env.staging.local", "VAULT_LOG_LEVEL=trace\n");

    let cfg = loader_for(&dir).load().expect("layered config loads");

    assert_eq!(cfg.profile, "staging");
    assert_eq!(cfg.api_bind_addr, "127.0.0.1:4000");
    assert_eq!(cfg.log_level, "trace");
    assert_eq!(cfg.operator_tokens, vec!["staging-op".to_string()]);
    assert_eq!(cfg.master_key.as_deref(), Some(&[b'a'; 32][..]));
}

#[test]
fn os_env_overrides_files() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();
    write_env_file(&dir, ".env", "VAULT_LOG_LEVEL=info\nVAULT_PLAN_LIMIT_FREE=1\n");

    unsafe {
        env::set_var("VAULT_LOG_LEVEL", "warn");
        env::set_var("VAULT_PLAN_LIMIT_FREE", "2");
    }

    let cfg = loader_for(&dir).load().expect("config loads");
    assert_eq!(cfg.log_level, "warn");
    assert_eq!(cfg.plan_limits.free, 2);
    assert_eq!(cfg.plan_limits.starter, 3);

    clear_env();
}

#[test]
fn operator_token_list_wins_over_single_token() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("VAULT_OPERATOR_TOKEN", "single");
        env::set_var("VAULT_OPERATOR_TOKENS", "first, second,,");
    }

    let cfg = loader_for(&dir).load().expect("config loads");
    assert_eq!(
        cfg.operator_tokens,
        vec!["first".to_string(), "second".to_string()]
    );

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("VAULT_API_BIND_ADDR", "not-an-addr");
    }

    let err = loader_for(&dir).load().unwrap_err();
    assert!(err.to_string().contains("invalid api bind address"));

    clear_env();
}

#[test]
fn production_without_master_key_fails_to_load() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("VAULT_PROFILE", "production");
        env::set_var("VAULT_OPERATOR_TOKEN", "op");
    }

    let err = loader_for(&dir).load().unwrap_err();
    assert!(matches!(err, ConfigError::MissingMasterKey { ref profile } if profile == "production"));

    clear_env();
}

#[test]
fn hex_master_key_is_accepted_and_garbage_is_rejected() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("VAULT_MASTER_KEY", "07".repeat(32));
    }
    let cfg = loader_for(&dir).load().expect("hex key loads");
    assert_eq!(cfg.master_key, Some(vec![7u8; 32]));

    unsafe {
        env::set_var("VAULT_MASTER_KEY", "dG9vLXNob3J0");
    }
    let err = loader_for(&dir).load().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidMasterKey { .. }));

    clear_env();
}

#[test]
fn provider_token_urls_extend_and_override_defaults() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    unsafe {
        env::set_var(
            "VAULT_PROVIDER_ACME_CRM_TOKEN_URL",
            "https://auth.acme.example/token",
        );
        env::set_var(
            "VAULT_PROVIDER_XERO_TOKEN_URL",
            "http://127.0.0.1:9999/token",
        );
    }

    let cfg = loader_for(&dir).load().expect("config loads");
    assert_eq!(
        cfg.token_endpoint_for("Acme_CRM").unwrap().as_str(),
        "https://auth.acme.example/token"
    );
    assert_eq!(
        cfg.token_endpoint_for("xero").unwrap().port(),
        Some(9999)
    );
    assert!(cfg.token_endpoint_for("quickbooks").is_some());

    unsafe {
        env::set_var("VAULT_PROVIDER_BROKEN_TOKEN_URL", "not a url");
    }
    let err = loader_for(&dir).load().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidProviderTokenUrl { ref provider, .. } if provider == "broken"));

    clear_env();
}

#[test]
fn token_refresh_bounds_are_enforced() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("VAULT_TOKEN_REFRESH_CONCURRENCY", "0");
    }

    let err = loader_for(&dir).load().unwrap_err();
    assert!(matches!(
        err,
        ConfigError::InvalidTokenRefreshConcurrency { value: 0 }
    ));

    clear_env();
}
