//! Config loader tests over real layered `.env` files.

use std::{
    env, fs,
    sync::{Mutex, MutexGuard, OnceLock},
};

use integrations::config::{ConfigError, ConfigLoader};
use tempfile::TempDir;

// 32 zero bytes, base64-encoded.
const VALID_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

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
    unsafe {
        env::remove_var("SKILLMAP_PROFILE");
        env::remove_var("SKILLMAP_API_BIND_ADDR");
        env::remove_var("SKILLMAP_LOG_LEVEL");
        env::remove_var("SKILLMAP_ENCRYPTION_KEY");
        env::remove_var("SKILLMAP_OPERATOR_TOKEN");
        env::remove_var("SKILLMAP_OPERATOR_TOKENS");
        env::remove_var("SKILLMAP_PUBLIC_BASE_URL");
        env::remove_var("GITHUB_CLIENT_ID");
        env::remove_var("GITHUB_CLIENT_SECRET");
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

#[test]
fn loads_defaults_when_only_required_settings_present() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("SKILLMAP_ENCRYPTION_KEY", VALID_KEY);
        env::set_var("SKILLMAP_OPERATOR_TOKEN", "operator-token");
    }

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf());
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.operator_tokens, vec!["operator-token".to_string()]);
    assert_eq!(cfg.encryption_key.as_ref().map(Vec::len), Some(32));
    cfg.bind_addr().expect("default bind addr parses");

    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "SKILLMAP_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.local",
        &format!(
            "SKILLMAP_PROFILE=test\nSKILLMAP_API_BIND_ADDR=127.0.0.1:4000\nSKILLMAP_OPERATOR_TOKEN=layered-token\nSKILLMAP_ENCRYPTION_KEY={}\n",
            VALID_KEY
        ),
    );
    write_env_file(
        &temp_dir,
        ".env.test",
        "SKILLMAP_API_BIND_ADDR=127.0.0.1:5000\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "SKILLMAP_API_BIND_ADDR=127.0.0.1:6000\n",
    );

    let loader = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf());
    let cfg = loader.load().expect("layered config loads");

    // Most specific file wins.
    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "127.0.0.1:6000");

    clear_env();
}

#[test]
fn process_env_overrides_files() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &format!(
            "SKILLMAP_API_BIND_ADDR=127.0.0.1:3000\nSKILLMAP_OPERATOR_TOKEN=file-token\nSKILLMAP_ENCRYPTION_KEY={}\n",
            VALID_KEY
        ),
    );

    unsafe {
        env::set_var("SKILLMAP_API_BIND_ADDR", "127.0.0.1:7000");
    }

    let loader = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf());
    let cfg = loader.load().expect("config loads");

    assert_eq!(cfg.api_bind_addr, "127.0.0.1:7000");

    unsafe {
        env::remove_var("SKILLMAP_API_BIND_ADDR");
    }
    clear_env();
}

#[test]
fn provider_credentials_are_snapshotted_from_files_and_process_env() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &format!(
            "SKILLMAP_OPERATOR_TOKEN=token\nSKILLMAP_ENCRYPTION_KEY={}\nGITHUB_CLIENT_ID=file-client-id\n",
            VALID_KEY
        ),
    );

    unsafe {
        env::set_var("GITHUB_CLIENT_SECRET", "process-secret");
    }

    let loader = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf());
    let cfg = loader.load().expect("config loads");

    assert_eq!(cfg.provider_env.get("GITHUB_CLIENT_ID"), Some("file-client-id"));
    assert_eq!(
        cfg.provider_env.get("GITHUB_CLIENT_SECRET"),
        Some("process-secret")
    );
    // Unrelated keys are not snapshotted.
    assert_eq!(cfg.provider_env.get("PATH"), None);

    clear_env();
}

#[test]
fn comma_separated_operator_tokens_are_split() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("SKILLMAP_ENCRYPTION_KEY", VALID_KEY);
        env::set_var("SKILLMAP_OPERATOR_TOKENS", "one, two,three,");
    }

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf());
    let cfg = loader.load().expect("config loads");

    assert_eq!(cfg.operator_tokens, vec!["one", "two", "three"]);

    clear_env();
}

#[test]
fn invalid_base64_key_is_rejected() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("SKILLMAP_ENCRYPTION_KEY", "not-base64!!!");
        env::set_var("SKILLMAP_OPERATOR_TOKEN", "token");
    }

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf());
    let err = loader.load().unwrap_err();

    assert!(matches!(
        err,
        ConfigError::InvalidEncryptionKeyBase64 { .. }
    ));

    clear_env();
}

#[test]
fn missing_encryption_key_is_rejected() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("SKILLMAP_OPERATOR_TOKEN", "token");
    }

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf());
    let err = loader.load().unwrap_err();

    assert!(matches!(err, ConfigError::MissingEncryptionKey));

    clear_env();
}
