//! Typed configuration from a TOML file, with environment overrides.
//!
//! Loads once at startup and fails fast on anything malformed. The resulting
//! value is passed by reference into the controller and every sink
//! constructor. Sensitive values are wrapped in secrecy::SecretString to
//! prevent log leaks.

pub mod secrets;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Service-account namespace file present when running inside a cluster.
pub const IN_CLUSTER_NAMESPACE_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Number of dispatch workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Default tracing filter directive when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub otel_endpoint: Option<String>,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub sinks: SinksConfig,
    #[serde(default)]
    pub leader_election: LeaderElectionConfig,
}

/// Controller tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Freshness window for the staleness filter.
    #[serde(default = "default_max_event_age_secs")]
    pub max_event_age_secs: u64,
    /// How long to wait for the change feed's initial sync.
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
    /// Buffer between the change feed and the notification handler.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_event_age_secs: default_max_event_age_secs(),
            sync_timeout_secs: default_sync_timeout_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl ControllerConfig {
    pub fn max_event_age(&self) -> Duration {
        Duration::from_secs(self.max_event_age_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

/// Which sinks to construct.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinksConfig {
    pub search_index: Option<SearchIndexConfig>,
    #[serde(default)]
    pub console: bool,
    #[serde(default)]
    pub discard: bool,
    /// Allow-lists shared by every configured sink.
    #[serde(default)]
    pub filter: FilterConfig,
}

/// Search/index store connection settings.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchIndexConfig {
    pub addresses: Vec<String>,
    pub index: String,
    pub username: Option<String>,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,
    /// Per-request budget for `send`.
    #[serde(default = "default_send_timeout_secs")]
    pub timeout_secs: u64,
}

impl SearchIndexConfig {
    pub fn new(addresses: Vec<String>, index: impl Into<String>) -> Self {
        Self {
            addresses,
            index: index.into(),
            username: None,
            password: None,
            timeout_secs: default_send_timeout_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Event allow-lists. Empty lists accept everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    /// Event types to keep, e.g. ["Warning"].
    #[serde(default)]
    pub types: Vec<String>,
    /// Involved-object namespaces to keep.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// Lease settings for multi-replica deployments.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeaderElectionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Lease namespace. Resolved via [`LeaderElectionConfig::resolve_namespace`] when unset.
    pub namespace: Option<String>,
    #[serde(default = "default_lease_name")]
    pub name: String,
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,
    #[serde(default = "default_renew_deadline_secs")]
    pub renew_deadline_secs: u64,
    #[serde(default = "default_retry_period_secs")]
    pub retry_period_secs: u64,
    /// Directory holding lease files shared by all replicas.
    #[serde(default = "default_lease_dir")]
    pub lease_dir: PathBuf,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: None,
            name: default_lease_name(),
            lease_duration_secs: default_lease_duration_secs(),
            renew_deadline_secs: default_renew_deadline_secs(),
            retry_period_secs: default_retry_period_secs(),
            lease_dir: default_lease_dir(),
        }
    }
}

impl LeaderElectionConfig {
    /// Configured namespace, else the in-cluster namespace, else "default".
    pub fn resolve_namespace(&self) -> String {
        if let Some(ns) = &self.namespace {
            return ns.clone();
        }
        match std::fs::read_to_string(IN_CLUSTER_NAMESPACE_PATH) {
            Ok(ns) if !ns.trim().is_empty() => ns.trim().to_string(),
            _ => "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the first default location
    /// that exists, then apply environment overrides and validate.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_paths()
                .into_iter()
                .find(|p| p.is_file())
                .ok_or_else(|| {
                    Error::Config(format!(
                        "no configuration file found in {}",
                        default_paths()
                            .iter()
                            .map(|p| p.display().to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ))
                })?,
        };

        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("read config file {}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse without environment overrides or validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("unmarshal config: {e}")))
    }

    /// `LOG_LEVEL` and `OTEL_ENDPOINT` take precedence over the file.
    pub fn apply_env(&mut self) {
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(endpoint) = std::env::var("OTEL_ENDPOINT") {
            self.otel_endpoint = Some(endpoint);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.controller.channel_capacity == 0 {
            return Err(Error::Config(
                "controller.channel_capacity must be at least 1".to_string(),
            ));
        }
        if let Some(es) = &self.sinks.search_index {
            if es.addresses.is_empty() {
                return Err(Error::Config(
                    "sinks.search_index.addresses must not be empty".to_string(),
                ));
            }
            if es.index.trim().is_empty() {
                return Err(Error::Config(
                    "sinks.search_index.index must not be empty".to_string(),
                ));
            }
        }
        let le = &self.leader_election;
        if le.enabled
            && !(le.retry_period_secs < le.renew_deadline_secs
                && le.renew_deadline_secs < le.lease_duration_secs)
        {
            return Err(Error::Config(format!(
                "leader_election requires retry_period ({}s) < renew_deadline ({}s) < lease_duration ({}s)",
                le.retry_period_secs, le.renew_deadline_secs, le.lease_duration_secs
            )));
        }
        Ok(())
    }
}

fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/event-dispatcher/config.toml")];
    if let Ok(home) = std::env::var("HOME") {
        paths.push(PathBuf::from(home).join(".config/event-dispatcher/config.toml"));
    }
    paths.push(PathBuf::from("config.toml"));
    paths
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

fn default_workers() -> usize {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_event_age_secs() -> u64 {
    5
}

fn default_sync_timeout_secs() -> u64 {
    60
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_send_timeout_secs() -> u64 {
    5
}

fn default_lease_name() -> String {
    "event-dispatcher".to_string()
}

fn default_lease_duration_secs() -> u64 {
    15
}

fn default_renew_deadline_secs() -> u64 {
    10
}

fn default_retry_period_secs() -> u64 {
    2
}

fn default_lease_dir() -> PathBuf {
    PathBuf::from("/var/run/event-dispatcher")
}
