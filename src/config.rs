//! Configuration management for the wallet sweeper
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    pub validation: ValidationConfig,
    pub watcher: WatcherConfig,
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub farcaster: FarcasterConfig,
    #[serde(default)]
    pub revoke: RevokeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origin; any origin when unset
    #[serde(default)]
    pub frontend_origin: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    #[default]
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_idempotency_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_in_flight_wait")]
    pub in_flight_wait_ms: u64,
    #[serde(default = "default_eviction_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            ttl_secs: default_idempotency_ttl(),
            in_flight_wait_ms: default_in_flight_wait(),
            sweep_interval_secs: default_eviction_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// Endpoint used for name resolution (mainnet)
    pub naming_rpc_url: String,
    #[serde(default = "default_name_suffixes")]
    pub name_suffixes: Vec<String>,
    /// Chains queried for address liveness
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_rpc_timeout")]
    pub timeout_ms: u64,
}

impl ValidationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_rpc_timeout")]
    pub poll_timeout_ms: u64,
    /// Endpoint serving `alchemy_getAssetTransfers`
    pub data_rpc_url: String,
    #[serde(default = "default_page_size")]
    pub max_transfers_per_poll: usize,
    #[serde(default = "default_page_size")]
    pub max_page_size: usize,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    /// Paymaster-enabled endpoint for sponsored submissions
    #[serde(default)]
    pub sponsor_rpc_url: Option<String>,
    pub contract_address: String,
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FarcasterConfig {
    #[serde(default = "default_warpcast_api")]
    pub warpcast_api_url: String,
    #[serde(default)]
    pub direct_cast_url: Option<String>,
    #[serde(default = "default_farcaster_key_env")]
    pub api_key_env: String,
}

impl Default for FarcasterConfig {
    fn default() -> Self {
        Self {
            warpcast_api_url: default_warpcast_api(),
            direct_cast_url: None,
            api_key_env: default_farcaster_key_env(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RevokeConfig {
    /// Directory for temporary export artifacts; system temp dir when unset
    #[serde(default)]
    pub export_dir: Option<PathBuf>,
}

fn default_idempotency_ttl() -> u64 {
    3600
}

fn default_in_flight_wait() -> u64 {
    5000
}

fn default_eviction_interval() -> u64 {
    60
}

fn default_name_suffixes() -> Vec<String> {
    vec![".eth".to_string()]
}

fn default_rpc_timeout() -> u64 {
    10_000
}

fn default_poll_interval() -> u64 {
    15_000
}

fn default_page_size() -> usize {
    100
}

fn default_shutdown_grace() -> u64 {
    2000
}

fn default_private_key_env() -> String {
    "SWEEPER_PRIVATE_KEY".to_string()
}

fn default_submit_timeout() -> u64 {
    30_000
}

fn default_warpcast_api() -> String {
    "https://api.warpcast.com".to_string()
}

fn default_farcaster_key_env() -> String {
    "FARCASTER_API_KEY".to_string()
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("SWEEPER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse settings from a TOML document, substituting `${VAR}` placeholders
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config_str = substitute_env_vars(raw);

        let mut settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.drop_unset_optionals();
        settings.validate()?;

        Ok(settings)
    }

    /// An optional set to an unset `${VAR}` substitutes to "" and means absent
    fn drop_unset_optionals(&mut self) {
        for field in [
            &mut self.server.frontend_origin,
            &mut self.executor.sponsor_rpc_url,
            &mut self.farcaster.direct_cast_url,
        ] {
            if field.as_deref().map_or(false, |v| v.trim().is_empty()) {
                *field = None;
            }
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.validation.rpc_urls.is_empty() {
            anyhow::bail!("At least one validation RPC endpoint must be configured");
        }
        if self.validation.naming_rpc_url.is_empty() {
            anyhow::bail!("A naming RPC endpoint must be configured");
        }
        if self.watcher.poll_interval_ms == 0 {
            anyhow::bail!("watcher.poll_interval_ms must be greater than zero");
        }
        if self.watcher.max_page_size == 0 {
            anyhow::bail!("watcher.max_page_size must be greater than zero");
        }

        let needs_db = self.storage.backend == StorageBackend::Postgres
            || self.idempotency.backend == StorageBackend::Postgres;
        if needs_db && self.database.is_none() {
            anyhow::bail!("Postgres backend selected but [database] is not configured");
        }

        if self.executor.contract_address.is_empty() {
            tracing::warn!("No sweep contract address configured - transfers will fail");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
            .expect("static pattern");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_value = env::var(&cap[1]).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const SAMPLE: &str = r#"
        [server]
        host = "127.0.0.1"
        port = 3001

        [metrics]
        enabled = false
        port = 9090

        [validation]
        naming_rpc_url = "https://mainnet.base.org"
        rpc_urls = ["https://mainnet.base.org", "https://mainnet.optimism.io"]

        [watcher]
        data_rpc_url = "https://base-mainnet.g.alchemy.com/v2/${SWEEPER_TEST_ALCHEMY_KEY}"

        [executor]
        chain_id = 8453
        rpc_url = "https://mainnet.base.org"
        contract_address = "0xD8900C1b8610A27300ED68C3A248b44616155d37"
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_defaults_applied() {
        env::set_var("SWEEPER_TEST_ALCHEMY_KEY", "abc");
        let settings = Settings::from_toml(SAMPLE).unwrap();

        assert_eq!(settings.watcher.poll_interval_ms, 15_000);
        assert_eq!(settings.watcher.max_page_size, 100);
        assert_eq!(settings.validation.timeout_ms, 10_000);
        assert_eq!(settings.validation.name_suffixes, vec![".eth".to_string()]);
        assert_eq!(settings.idempotency.ttl_secs, 3600);
        assert_eq!(settings.storage.backend, StorageBackend::Memory);
        assert!(settings.watcher.data_rpc_url.ends_with("/v2/abc"));
    }

    #[test]
    fn test_postgres_requires_database() {
        let raw = SAMPLE.replace("[metrics]", "[storage]\nbackend = \"postgres\"\n\n[metrics]");
        let err = Settings::from_toml(&raw).unwrap_err();
        assert!(err.to_string().contains("[database]"));
    }

    #[test]
    fn test_unset_optional_placeholders_are_absent() {
        let raw = SAMPLE
            .replace(
                "port = 3001",
                "port = 3001\nfrontend_origin = \"${SWEEPER_TEST_UNSET_ORIGIN}\"",
            )
            .replace(
                "chain_id = 8453",
                "chain_id = 8453\nsponsor_rpc_url = \"${SWEEPER_TEST_UNSET_SPONSOR}\"",
            );
        let settings = Settings::from_toml(&raw).unwrap();
        assert!(settings.server.frontend_origin.is_none());
        assert!(settings.executor.sponsor_rpc_url.is_none());
    }

    #[test]
    fn test_empty_validation_endpoints_rejected() {
        let raw = SAMPLE.replace(
            r#"rpc_urls = ["https://mainnet.base.org", "https://mainnet.optimism.io"]"#,
            "rpc_urls = []",
        );
        assert!(Settings::from_toml(&raw).is_err());
    }
}
