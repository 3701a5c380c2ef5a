//! Configuration types for s3stream
//!
//! Every section is defaulted so a partial TOML file (or none at all) yields
//! a usable configuration. Loading and layering is done by the binaries.

use crate::error::{Error, Result};
use crate::types::BrokerId;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for an s3stream engine
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker identity and local state
    pub broker: BrokerConfig,
    /// Write-ahead log configuration
    pub wal: WalConfig,
    /// Block cache configuration
    pub cache: CacheConfig,
    /// Background upload configuration
    pub upload: UploadConfig,
    /// Object store configuration
    pub object_store: ObjectStoreConfig,
    /// Auto balancer metrics topic and client settings (bootstrap only)
    pub auto_balancer: AutoBalancerConfig,
}

/// Upper bound of `upload.max_pending_bytes`; keeps one stream's data
/// block within the u32 length fields of an object
pub const MAX_PENDING_BYTES_LIMIT: usize = 1 << 30;

impl Config {
    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.wal.max_size == 0 {
            return Err(Error::Configuration("wal.max_size must be positive".into()));
        }
        if self.cache.capacity_bytes == 0 {
            return Err(Error::Configuration(
                "cache.capacity_bytes must be positive".into(),
            ));
        }
        if self.cache.fetch_max_attempts == 0 {
            return Err(Error::Configuration(
                "cache.fetch_max_attempts must be at least 1".into(),
            ));
        }
        if self.upload.interval_ms == 0 {
            return Err(Error::Configuration(
                "upload.interval_ms must be positive".into(),
            ));
        }
        if self.upload.max_pending_bytes == 0
            || self.upload.max_pending_bytes > MAX_PENDING_BYTES_LIMIT
        {
            return Err(Error::Configuration(format!(
                "upload.max_pending_bytes must be in 1..={MAX_PENDING_BYTES_LIMIT}"
            )));
        }
        if self.upload.max_objects_per_fetch == 0 {
            return Err(Error::Configuration(
                "upload.max_objects_per_fetch must be positive".into(),
            ));
        }
        self.auto_balancer.validate()
    }

    /// WAL file location, relative paths resolved against the data directory
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.broker.data_dir.join(&self.wal.path)
    }

    /// Metadata database location
    #[must_use]
    pub fn meta_path(&self) -> PathBuf {
        self.broker.data_dir.join("meta.redb")
    }

    /// Object store directory for the filesystem store
    #[must_use]
    pub fn object_store_path(&self) -> PathBuf {
        self.broker.data_dir.join(&self.object_store.path)
    }
}

/// Broker identity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker id owning this engine's WAL
    pub broker_id: BrokerId,
    /// Broker epoch (bumped by the cluster on every broker restart)
    pub broker_epoch: u64,
    /// Data directory for WAL, metadata and local objects
    pub data_dir: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_id: BrokerId::new(0),
            broker_epoch: 0,
            data_dir: PathBuf::from("./s3stream-data"),
        }
    }
}

/// WAL synchronization mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalSyncMode {
    /// fsync after every append (durable ack)
    #[default]
    EveryWrite,
    /// Leave syncing to the OS; synced on trim and close only
    Deferred,
}

/// Write-ahead log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// WAL file path (relative to the data directory)
    pub path: PathBuf,
    /// Size after which a fully trimmed WAL is rotated
    pub max_size: u64,
    /// Sync mode for appends
    pub sync_mode: WalSyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("wal.log"),
            max_size: 256 * 1024 * 1024, // 256 MB
            sync_mode: WalSyncMode::EveryWrite,
        }
    }
}

/// Block cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum decoded bytes held by the cache
    pub capacity_bytes: usize,
    /// Maximum number of decoded object indexes kept
    pub index_capacity: usize,
    /// Attempts per object fetch before surfacing the failure
    pub fetch_max_attempts: u32,
    /// Initial backoff between fetch attempts (doubles per attempt)
    pub fetch_backoff_ms: u64,
}

impl CacheConfig {
    #[must_use]
    pub const fn fetch_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 128 * 1024 * 1024, // 128 MB
            index_capacity: 4096,
            fetch_max_attempts: 3,
            fetch_backoff_ms: 50,
        }
    }
}

/// Background upload configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Interval between upload cycles
    pub interval_ms: u64,
    /// Pending bytes that trigger an upload before the interval elapses
    pub max_pending_bytes: usize,
    /// Maximum objects resolved per fetch
    pub max_objects_per_fetch: usize,
}

impl UploadConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            max_pending_bytes: 16 * 1024 * 1024, // 16 MB
            max_objects_per_fetch: 64,
        }
    }
}

/// Object store backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreKind {
    /// In-process store, lost on exit
    Memory,
    /// One file per object under `path`
    #[default]
    Fs,
}

/// Object store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub kind: ObjectStoreKind,
    /// Directory for the filesystem store (relative to the data directory)
    pub path: PathBuf,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            kind: ObjectStoreKind::Fs,
            path: PathBuf::from("objects"),
        }
    }
}

/// Secret value that never shows up in logs or printed configuration
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the secret value
    #[must_use]
    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[hidden]")
    }
}

impl fmt::Display for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[hidden]")
    }
}

impl Serialize for Password {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("[hidden]")
    }
}

/// Client security protocol for the metrics reporter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

/// Client authentication settings for the metrics reporter
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientAuthConfig {
    pub security_protocol: SecurityProtocol,
    pub sasl_mechanism: String,
    pub sasl_jaas_config: Option<Password>,
}

impl Default for ClientAuthConfig {
    fn default() -> Self {
        Self {
            security_protocol: SecurityProtocol::Plaintext,
            sasl_mechanism: "GSSAPI".to_string(),
            sasl_jaas_config: None,
        }
    }
}

/// Auto balancer metrics topic configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoBalancerConfig {
    /// Topic the metrics reporter sends to
    pub topic: String,
    /// Partition count of the metrics topic
    pub topic_num_partitions: u32,
    /// Retention of the metrics topic
    pub topic_retention_ms: u64,
    /// Comma separated cleanup policies (`delete`, `compact`)
    pub topic_cleanup_policy: String,
    pub client_auth: ClientAuthConfig,
}

impl AutoBalancerConfig {
    #[must_use]
    pub const fn topic_retention(&self) -> Duration {
        Duration::from_millis(self.topic_retention_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(Error::Configuration("auto_balancer.topic is empty".into()));
        }
        if self.topic_num_partitions == 0 {
            return Err(Error::Configuration(
                "auto_balancer.topic_num_partitions must be positive".into(),
            ));
        }
        for policy in self.topic_cleanup_policy.split(',').map(str::trim) {
            if policy != "delete" && policy != "compact" {
                return Err(Error::Configuration(format!(
                    "auto_balancer.topic_cleanup_policy: unknown policy '{policy}'"
                )));
            }
        }
        let needs_sasl = matches!(
            self.client_auth.security_protocol,
            SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl
        );
        if needs_sasl && self.client_auth.sasl_mechanism.is_empty() {
            return Err(Error::Configuration(
                "auto_balancer.client_auth.sasl_mechanism is required for SASL".into(),
            ));
        }
        Ok(())
    }
}

impl Default for AutoBalancerConfig {
    fn default() -> Self {
        Self {
            topic: "__auto_balancer_metrics".to_string(),
            topic_num_partitions: 1,
            topic_retention_ms: 30 * 60 * 1000, // 30 minutes
            topic_cleanup_policy: "delete".to_string(),
            client_auth: ClientAuthConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.auto_balancer.topic, "__auto_balancer_metrics");
        assert_eq!(config.auto_balancer.topic_num_partitions, 1);
        assert_eq!(
            config.auto_balancer.topic_retention(),
            Duration::from_secs(30 * 60)
        );
        assert_eq!(config.wal.sync_mode, WalSyncMode::EveryWrite);
        assert_eq!(config.wal_path(), PathBuf::from("./s3stream-data/wal.log"));
    }

    #[test]
    fn test_invalid_cleanup_policy() {
        let mut config = Config::default();
        config.auto_balancer.topic_cleanup_policy = "delete,shred".to_string();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.auto_balancer.topic_cleanup_policy = "compact, delete".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_sizes() {
        let mut config = Config::default();
        config.cache.fetch_max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.auto_balancer.topic_num_partitions = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.upload.max_pending_bytes = MAX_PENDING_BYTES_LIMIT + 1;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
        config.upload.max_pending_bytes = MAX_PENDING_BYTES_LIMIT;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_password_is_redacted() {
        let mut config = Config::default();
        config.auto_balancer.client_auth.sasl_jaas_config = Some(Password::new("secret"));

        let debug = format!("{config:?}");
        assert!(!debug.contains("secret"));

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("[hidden]"));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"broker": {"broker_id": 10}, "wal": {"sync_mode": "deferred"}}"#)
                .unwrap();
        assert_eq!(config.broker.broker_id, BrokerId::new(10));
        assert_eq!(config.wal.sync_mode, WalSyncMode::Deferred);
        assert_eq!(config.cache.fetch_max_attempts, 3);
        assert_eq!(
            config.auto_balancer.client_auth.security_protocol,
            SecurityProtocol::Plaintext
        );
    }
}
