use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const APP_NAME: &str = "chainvoice";
const KEYCHAIN_SERVICE: &str = "chainvoice.credentials";

/// Keychain entry holding the operator's private encryption key (hex).
pub const SECRET_ENCRYPTION_KEY: &str = "encryption_key";
/// Keychain entry holding the write-authorization signing key (hex).
pub const SECRET_WRITE_AUTHORIZATION_KEY: &str = "write_authorization_key";

/// Opaque settings object supplied to the core by the service bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// The operator's own ledger handle.
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            operator: String::new(),
            ledger: LedgerSettings::default(),
            monitor: MonitorSettings::default(),
            cache_path: default_cache_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    pub endpoints: Vec<String>,
    /// "side_channel" | "post"
    pub storage_mode: String,
    pub app_id: String,
    pub max_payload: usize,
    pub history_scan_limit: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            storage_mode: "side_channel".to_string(),
            app_id: "chainvoice".to_string(),
            max_payload: 8192,
            history_scan_limit: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub scan_interval_secs: u64,
    pub batch_size: u64,
    pub payment_epsilon: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 10,
            batch_size: 100,
            payment_epsilon: 0.01,
        }
    }
}

fn default_cache_path() -> String {
    ".chainvoice_cache".to_string()
}

pub fn load() -> Result<Settings> {
    let cfg: Settings = confy::load(APP_NAME, None).context("Failed to load app config")?;
    Ok(cfg)
}

pub fn store(cfg: &Settings) -> Result<()> {
    confy::store(APP_NAME, None, cfg).context("Failed to store app config")?;
    Ok(())
}

/// Store a secret in the OS keychain
pub fn store_secret(key: &str, value: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    entry.set_password(value)?;
    Ok(())
}

/// Retrieve a secret from the OS keychain
pub fn get_secret(key: &str) -> Result<String> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    let password = entry.get_password()?;
    Ok(password)
}

/// Delete a secret from the OS keychain
pub fn delete_secret(key: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    entry.delete_password()?;
    Ok(())
}
