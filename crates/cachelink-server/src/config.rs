use std::net::SocketAddr;
use std::time::Duration;

use cachelink_core::{CacheSettings, CoordinatorSettings};
use cachelink_storage::{RedisOptions, Topology};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::broadcast::validate_target;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        if let Some(auth) = &self.server.basic_auth {
            if auth.user.is_empty() {
                return Err("server.basic_auth.user must not be empty".into());
            }
        }
        self.redis.validate()?;
        if self.cache.clear_batch_size == 0 {
            return Err("cache.clear_batch_size must be > 0".into());
        }
        if self.coordinator.interval_secs == 0 {
            return Err("coordinator.interval_secs must be > 0".into());
        }
        if self.coordinator.sync_key.is_empty() || self.coordinator.channel.is_empty() {
            return Err("coordinator.sync_key and coordinator.channel must not be empty".into());
        }
        if self.broadcast.timeout_secs == 0 {
            return Err("broadcast.timeout_secs must be > 0".into());
        }
        for (i, target) in self.broadcast.targets.iter().enumerate() {
            validate_target(i, target).map_err(|e| e.to_string())?;
        }
        let level = self.logging.level.to_ascii_lowercase();
        let allowed = ["trace", "debug", "info", "warn", "error", "off"];
        if !allowed.contains(&level.as_str()) {
            return Err(format!("logging.level must be one of {allowed:?}"));
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        let ip = self
            .server
            .host
            .parse()
            .unwrap_or_else(|_| std::net::IpAddr::from([0, 0, 0, 0]));
        SocketAddr::new(ip, self.server.port)
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            prefix: self.redis.prefix.clone(),
            clear_later_set: self.cache.clear_later_set.clone(),
            clear_now_set: self.cache.clear_now_set.clone(),
            clear_batch_size: self.cache.clear_batch_size,
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            interval: Duration::from_secs(self.coordinator.interval_secs),
            sync_key: self.coordinator.sync_key.clone(),
            channel: self.coordinator.channel.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted request body.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    /// When set, every route requires these credentials.
    #[serde(default)]
    pub basic_auth: Option<BasicAuthConfig>,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    3111
}
fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
            basic_auth: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuthConfig {
    pub user: String,
    #[serde(default)]
    pub pass: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedisMode {
    /// In-process store; for one instance or for tests.
    Local,
    #[default]
    Single,
    Cluster,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub mode: RedisMode,

    /// `redis://` URLs. A cluster lists its seed nodes.
    #[serde(default = "default_redis_nodes")]
    pub nodes: Vec<String>,

    /// Added to every node URL that does not carry one.
    #[serde(default)]
    pub password: Option<String>,

    /// Prepended to every key.
    #[serde(default)]
    pub prefix: String,

    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_nodes() -> Vec<String> {
    vec!["redis://127.0.0.1:6379".to_string()]
}

fn default_redis_pool_size() -> usize {
    16
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            mode: RedisMode::default(),
            nodes: default_redis_nodes(),
            password: None,
            prefix: String::new(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

impl RedisConfig {
    fn validate(&self) -> Result<(), String> {
        if self.mode == RedisMode::Local {
            return Ok(());
        }
        if self.nodes.is_empty() {
            return Err("redis.nodes must list at least one node".into());
        }
        if self.mode == RedisMode::Single && self.nodes.len() > 1 {
            return Err("redis.nodes must list exactly one node unless redis.mode is cluster".into());
        }
        if self.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        self.node_urls().map(|_| ())
    }

    /// Node URLs with the configured password applied.
    pub fn node_urls(&self) -> Result<Vec<String>, String> {
        self.nodes
            .iter()
            .map(|node| {
                let mut url =
                    Url::parse(node).map_err(|e| format!("redis.nodes: invalid URL {node}: {e}"))?;
                if !matches!(url.scheme(), "redis" | "rediss") {
                    return Err(format!("redis.nodes: {node} must use redis:// or rediss://"));
                }
                if let Some(password) = self.password.as_deref() {
                    if url.password().is_none() {
                        url.set_password(Some(password))
                            .map_err(|_| format!("redis.nodes: cannot set a password on {node}"))?;
                    }
                }
                Ok(url.to_string())
            })
            .collect()
    }

    /// Options for a networked backend. `None` in local mode.
    pub fn options(&self) -> Result<Option<RedisOptions>, String> {
        let topology = match self.mode {
            RedisMode::Local => return Ok(None),
            RedisMode::Single => Topology::Single,
            RedisMode::Cluster => Topology::Sharded,
        };
        Ok(Some(RedisOptions {
            nodes: self.node_urls()?,
            topology,
            pool_size: self.pool_size,
            timeout: Duration::from_millis(self.timeout_ms),
        }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_clear_later_set")]
    pub clear_later_set: String,
    #[serde(default = "default_clear_now_set")]
    pub clear_now_set: String,
    /// Keys popped per drain batch.
    #[serde(default = "default_clear_batch_size")]
    pub clear_batch_size: usize,
}

fn default_clear_later_set() -> String {
    CacheSettings::default().clear_later_set
}
fn default_clear_now_set() -> String {
    CacheSettings::default().clear_now_set
}
fn default_clear_batch_size() -> usize {
    CacheSettings::default().clear_batch_size
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            clear_later_set: default_clear_later_set(),
            clear_now_set: default_clear_now_set(),
            clear_batch_size: default_clear_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Seconds between drain attempts.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_sync_key")]
    pub sync_key: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Run the periodic drain on this instance.
    #[serde(default = "default_cron_enabled")]
    pub cron_enabled: bool,
}

fn default_interval_secs() -> u64 {
    60
}
fn default_sync_key() -> String {
    CoordinatorSettings::default().sync_key
}
fn default_channel() -> String {
    CoordinatorSettings::default().channel
}
fn default_cron_enabled() -> bool {
    true
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            sync_key: default_sync_key(),
            channel: default_channel(),
            cron_enabled: default_cron_enabled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Base URLs of sibling clusters, `http(s)://host[:port]`.
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default = "default_broadcast_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_broadcast_timeout_secs() -> u64 {
    5
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            timeout_secs: default_broadcast_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::Path;

    /// Loads `path` if it exists, then applies `CACHELINK__SECTION__FIELD`
    /// environment overrides. List fields take comma-separated values.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        if let Some(p) = path {
            if Path::new(p).exists() {
                builder = builder.add_source(File::with_name(p));
            }
        }
        builder = builder.add_source(
            Environment::with_prefix("CACHELINK")
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("broadcast.targets")
                .with_list_parse_key("redis.nodes"),
        );

        let cfg = builder.build().map_err(|e| e.to_string())?;
        let app: AppConfig = cfg.try_deserialize().map_err(|e| e.to_string())?;
        app.validate()?;
        Ok(app)
    }
}
