use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::duration::{deserialize_duration, serialize_duration};

const SECRET_ID_ENV: &str = "BANKSYNC_SECRET_ID";
const SECRET_KEY_ENV: &str = "BANKSYNC_SECRET_KEY";

fn default_base_url() -> String {
    "https://bankaccountdata.gocardless.com".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_token_refresh_margin() -> Duration {
    Duration::from_secs(60)
}

/// Balance types in order of preference when picking the live anchor.
/// Pending transactions are ingested like booked ones, so balances that
/// already include them come first.
fn default_balance_types() -> Vec<String> {
    ["expected", "interimAvailable", "interimBooked", "closingBooked"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_max_concurrent_accounts() -> usize {
    4
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(45)
}

/// Open-banking provider settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// API root, without the `/api/v2` suffix.
    pub base_url: String,

    /// Client-level timeout applied to every HTTP request.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub request_timeout: Duration,

    /// Refresh the access token this long before it expires.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub token_refresh_margin: Duration,

    /// Preferred `balanceType` values for the live balance snapshot.
    pub balance_types: Vec<String>,

    /// Falls back to `BANKSYNC_SECRET_ID` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_id: Option<String>,

    /// Falls back to `BANKSYNC_SECRET_KEY` when unset.
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout: default_request_timeout(),
            token_refresh_margin: default_token_refresh_margin(),
            balance_types: default_balance_types(),
            secret_id: None,
            secret_key: None,
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .field("token_refresh_margin", &self.token_refresh_margin)
            .field("balance_types", &self.balance_types)
            .field("secret_id", &self.secret_id.as_ref().map(|_| "[REDACTED]"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Provider API credentials, resolved from config or environment.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub secret_id: SecretString,
    pub secret_key: SecretString,
}

impl ProviderConfig {
    pub fn credentials(&self) -> Result<ProviderCredentials> {
        let secret_id = resolve_secret(self.secret_id.as_deref(), SECRET_ID_ENV)
            .with_context(|| format!("Missing provider secret id (set provider.secret_id or {SECRET_ID_ENV})"))?;
        let secret_key = resolve_secret(self.secret_key.as_deref(), SECRET_KEY_ENV)
            .with_context(|| format!("Missing provider secret key (set provider.secret_key or {SECRET_KEY_ENV})"))?;

        Ok(ProviderCredentials {
            secret_id: SecretString::new(secret_id.into()),
            secret_key: SecretString::new(secret_key.into()),
        })
    }
}

fn resolve_secret(configured: Option<&str>, env_key: &str) -> Option<String> {
    configured
        .map(str::to_string)
        .or_else(|| std::env::var(env_key).ok())
        .filter(|value| !value.trim().is_empty())
}

/// Reconciliation run settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on accounts processed at once, across all connections.
    pub max_concurrent_accounts: usize,

    /// Deadline for each outbound provider call made by the orchestrator.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub call_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_accounts: default_max_concurrent_accounts(),
            call_timeout: default_call_timeout(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to data directory. If relative, resolved from config file location.
    /// If not specified, defaults to the config file's directory.
    pub data_dir: Option<PathBuf>,

    pub provider: ProviderConfig,

    pub sync: SyncConfig,
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load config from a file, or return default config if file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn resolve_data_dir(&self, config_dir: &Path) -> PathBuf {
        match &self.data_dir {
            Some(data_dir) if data_dir.is_absolute() => data_dir.clone(),
            Some(data_dir) => config_dir.join(data_dir),
            None => config_dir.to_path_buf(),
        }
    }
}

/// Loaded configuration with resolved paths.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub data_dir: PathBuf,
    pub provider: ProviderConfig,
    pub sync: SyncConfig,
}

impl ResolvedConfig {
    pub fn load_or_default(config_path: &Path) -> Result<Self> {
        let config = Config::load_or_default(config_path)?;
        let config_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            data_dir: config.resolve_data_dir(&config_dir),
            provider: config.provider,
            sync: config.sync,
        })
    }
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./banksync.toml` if it exists in current directory
/// 2. `~/.local/share/banksync/banksync.toml` (XDG data directory)
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from("banksync.toml");
    if local_config.exists() {
        return local_config;
    }

    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("banksync").join("banksync.toml");
    }

    local_config
}
