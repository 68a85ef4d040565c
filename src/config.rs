//! Configuration for the scanner.
//!
//! Loaded from a TOML file (`CONFIG_PATH` env var or `config.toml` in the
//! working directory), deserialized with serde defaults so a minimal file
//! runs, then validated.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

fn default_port() -> u16 {
    3000
}

fn default_max_request_size() -> usize {
    50 * 1024 * 1024
}

fn default_update_interval_secs() -> u64 {
    60
}

fn default_size_limit() -> u64 {
    1024 * 1024 * 1024
}

fn default_max_storage_bytes() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_internal_bucket() -> String {
    "scanner-internal-bucket".to_string()
}

fn default_detection_threshold() -> f64 {
    10.0
}

fn default_external_rpm() -> u64 {
    4
}

fn default_external_rph() -> u64 {
    20
}

fn default_wait_list() -> String {
    "scan-wait-list".to_string()
}

fn default_collect_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    /// `<alias>:<sha256-hex>` entries; empty disables authentication.
    #[serde(default)]
    pub authorization_keys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_request_size: default_max_request_size(),
            authorization_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Per-bucket scan probability; unlisted buckets always scan.
    #[serde(default)]
    pub scan_probabilities: HashMap<String, f64>,
    /// Per-bucket key-prefix allow list; matching keys are never scanned.
    #[serde(default)]
    pub allowlist: HashMap<String, Vec<String>>,
    /// Objects above this size are bypassed.
    #[serde(default = "default_size_limit")]
    pub size_limit: u64,
    /// Global byte quota shared by all live sandboxes.
    #[serde(default = "default_max_storage_bytes")]
    pub max_storage_bytes: u64,
    /// Bucket owning user-submitted artifacts.
    #[serde(default = "default_internal_bucket")]
    pub internal_bucket: String,
    /// Root passphrase unwrapping the encrypted-backup password chain.
    #[serde(default)]
    pub cipher_kek: String,
    /// Directory of YARA rule files; empty disables the rule scanner.
    #[serde(default)]
    pub yara_rules_dir: String,
    #[serde(default)]
    pub external: ExternalScannerConfig,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scan_probabilities: HashMap::new(),
            allowlist: HashMap::new(),
            size_limit: default_size_limit(),
            max_storage_bytes: default_max_storage_bytes(),
            internal_bucket: default_internal_bucket(),
            cipher_kek: String::new(),
            yara_rules_dir: String::new(),
            external: ExternalScannerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalScannerConfig {
    /// Empty key disables the external scanner entirely.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f64,
    #[serde(default = "default_external_rpm")]
    pub requests_per_minute: u64,
    #[serde(default = "default_external_rph")]
    pub requests_per_hour: u64,
    /// Cache list holding outstanding analysis handles.
    #[serde(default = "default_wait_list")]
    pub wait_list: String,
    /// Cadence of the verdict collector; also the minimum age of a handle
    /// before its first poll.
    #[serde(default = "default_collect_interval_secs")]
    pub collect_interval_secs: u64,
}

impl Default for ExternalScannerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            detection_threshold: default_detection_threshold(),
            requests_per_minute: default_external_rpm(),
            requests_per_hour: default_external_rph(),
            wait_list: default_wait_list(),
            collect_interval_secs: default_collect_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct QueueConfig {
    /// Notification queue URL, consumed by the deployment's queue adapter.
    /// The embedded wiring ignores it and polls its in-process queue.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub region: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,
    /// Slack incoming-webhook URL; empty disables the Slack viewer.
    #[serde(default)]
    pub slack_webhook: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: default_update_interval_secs(),
            slack_webhook: String::new(),
        }
    }
}

impl Config {
    /// Load from `CONFIG_PATH` or `./config.toml`; a missing file yields
    /// the defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        if !Path::new(&path).exists() {
            tracing::info!(path, "no config file found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (bucket, probability) in &self.scanner.scan_probabilities {
            if !(0.0..=1.0).contains(probability) {
                bail!("scan probability for bucket '{bucket}' must be within [0, 1]");
            }
        }

        if self.scanner.max_storage_bytes == 0 {
            bail!("scanner.max_storage_bytes cannot be zero");
        }

        for entry in &self.server.authorization_keys {
            let parts: Vec<&str> = entry.splitn(2, ':').collect();
            if parts.len() != 2 || parts[1].len() != 64 {
                bail!(
                    "authorization key entries must look like <alias>:<sha256-hex>; \
                     generate one with `openssl rand -hex 32 | sha256sum`"
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.scanner.internal_bucket, "scanner-internal-bucket");
        assert_eq!(config.scanner.external.requests_per_minute, 4);
        assert_eq!(config.scanner.external.requests_per_hour, 20);
        assert_eq!(config.notification.update_interval_secs, 60);
    }

    #[test]
    fn test_full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 8080
            authorization_keys = ["ops:0000000000000000000000000000000000000000000000000000000000000000"]

            [scanner]
            size_limit = 1048576
            internal_bucket = "my-internal"

            [scanner.scan_probabilities]
            "noisy-bucket" = 0.25

            [scanner.allowlist]
            "trusted" = ["logs/", "tmp/"]

            [scanner.external]
            api_key = "secret"
            detection_threshold = 5.0

            [queue]
            url = "https://sqs.example/queue"

            [notification]
            update_interval_secs = 30
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.scanner.scan_probabilities["noisy-bucket"], 0.25);
        assert_eq!(config.scanner.allowlist["trusted"].len(), 2);
        assert_eq!(config.scanner.external.detection_threshold, 5.0);
    }

    #[test]
    fn test_validation_rejects_bad_probability_and_keys() {
        let mut config = Config::default();
        config
            .scanner
            .scan_probabilities
            .insert("b".to_string(), 1.5);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config
            .server
            .authorization_keys
            .push("missing-separator".to_string());
        assert!(config.validate().is_err());
    }
}
