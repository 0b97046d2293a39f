use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use super::{
    error::{Result, StoreError},
    retry::RetryPolicy,
};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SHARDS: u32 = 256;
pub const BUCKET_ENV: &str = "BUCKETDB_BUCKET";
pub const PORT_ENV: &str = "PORT";

fn default_bucket() -> String {
    "memory://".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_shards() -> u32 {
    DEFAULT_SHARDS
}

fn default_read_concurrency() -> usize {
    16
}

fn default_lock_ttl_secs() -> u64 {
    900
}

fn default_webhook_timeout_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `gs://bucket`, `file:///dir` or `memory://`.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub compactor: CompactorConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub gcp: GcpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            port: default_port(),
            retry: RetryPolicy::default(),
            compactor: CompactorConfig::default(),
            rules: RulesConfig::default(),
            logging: LoggingConfig::default(),
            gcp: GcpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactorConfig {
    #[serde(default = "default_shards")]
    pub shards: u32,
    #[serde(default = "default_read_concurrency")]
    pub read_concurrency: usize,
    /// Lifetime of the compaction lease; an abandoned lease can be taken over
    /// once it expires.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            read_concurrency: default_read_concurrency(),
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Derive alert ids from the triggering snapshot version so redelivered
    /// events do not raise a second alert.
    #[serde(default)]
    pub dedupe_alerts: bool,
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
    /// Local stand-ins for Secret Manager, keyed by secret name.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            dedupe_alerts: false,
            webhook_timeout_secs: default_webhook_timeout_secs(),
            secrets: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write daily-rotated log files here when set.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcpConfig {
    /// Project used to expand short `secret:<name>` references.
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub storage_endpoint: Option<String>,
    #[serde(default)]
    pub secret_manager_endpoint: Option<String>,
    #[serde(default)]
    pub metadata_endpoint: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project: None,
            storage_endpoint: None,
            secret_manager_endpoint: None,
            metadata_endpoint: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub bucket: Option<String>,
    pub port: Option<u16>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.bucket.is_none() && self.port.is_none()
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let root = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .ok_or_else(|| StoreError::Config("unable to locate a configuration directory".into()))?;
    Ok(root.join("bucketdb").join("config.toml"))
}

/// Loads the configuration file (defaults when it does not exist) and applies
/// `BUCKETDB_BUCKET` / `PORT` from the environment.
pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    let mut cfg = if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        toml::from_str::<Config>(&contents)?
    } else {
        Config::default()
    };
    cfg.apply_update(ConfigUpdate::from_lookup(|name| env::var(name).ok()));
    cfg.validate()?;
    Ok((cfg, config_path))
}

impl ConfigUpdate {
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        Self {
            bucket: non_empty(BUCKET_ENV),
            port: non_empty(PORT_ENV).and_then(|value| value.trim().parse().ok()),
        }
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(bucket) = update.bucket {
            self.bucket = bucket;
        }
        if let Some(port) = update.port {
            self.port = port;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            return Err(StoreError::Config("bucket cannot be empty".into()));
        }
        if self.compactor.shards == 0 {
            return Err(StoreError::Config(
                "compactor.shards must be at least 1".into(),
            ));
        }
        if self.compactor.read_concurrency == 0 {
            return Err(StoreError::Config(
                "compactor.read_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
