use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub messager: MessagerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Message tables declared for the binary's schema feed
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

/// Defaults applied to every message table unless its own options override them.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagerConfig {
    /// Maximum number of rows held in a manager's cache
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Maximum number of rows handed to a receiver per delivery
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Interval between storage polls in milliseconds
    #[serde(default = "default_poller_interval_ms")]
    pub poller_interval_ms: u64,
    /// How long a delivered message stays leased before redelivery
    #[serde(default = "default_ack_wait_ms")]
    pub ack_wait_ms: u64,
    /// Acked rows older than this are purged
    #[serde(default = "default_purge_after_ms")]
    pub purge_after_ms: u64,
    #[serde(default = "default_purge_interval_ms")]
    pub purge_interval_ms: u64,
    #[serde(default = "default_purge_batch_size")]
    pub purge_batch_size: usize,
    /// First backoff step; 0 means use `ack_wait_ms`
    #[serde(default)]
    pub min_backoff_ms: u64,
    /// Backoff ceiling; 0 means `backoff_cap_ms`
    #[serde(default)]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upward-only jitter as a fraction of the computed backoff
    #[serde(default)]
    pub backoff_jitter: f64,
    /// Messages reaching this epoch are expired; 0 disables the cap
    #[serde(default)]
    pub max_epoch: i64,
    /// Upper bound on a single receiver delivery
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

fn default_cache_size() -> usize {
    5000
}

fn default_batch_size() -> usize {
    1
}

fn default_poller_interval_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_ack_wait_ms() -> u64 {
    30_000
}

fn default_purge_after_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_purge_interval_ms() -> u64 {
    60_000
}

fn default_purge_batch_size() -> usize {
    500
}

fn default_backoff_cap_ms() -> u64 {
    3_600_000 // 1 hour
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_delivery_timeout_ms() -> u64 {
    30_000
}

impl MessagerConfig {
    pub fn poller_interval(&self) -> Duration {
        Duration::from_millis(self.poller_interval_ms)
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }

    pub fn purge_after(&self) -> Duration {
        Duration::from_millis(self.purge_after_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

fn default_database_url() -> String {
    "postgres://localhost:5432/messages".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    15100
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// A table declared in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub name: String,
    /// Column names in declaration order
    pub columns: Vec<String>,
    /// Table comment carrying the message options
    #[serde(default)]
    pub comment: String,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("admin.host", default_host())?
            .set_default("admin.port", default_port())?
            .set_default("database.url", default_database_url())?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.format", default_log_format())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // MESSAGER__DATABASE__URL, MESSAGER__MESSAGER__CACHE_SIZE, ...
            .add_source(
                Environment::with_prefix("MESSAGER")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn admin_addr(&self) -> String {
        format!("{}:{}", self.admin.host, self.admin.port)
    }
}

impl Default for MessagerConfig {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
            batch_size: default_batch_size(),
            poller_interval_ms: default_poller_interval_ms(),
            ack_wait_ms: default_ack_wait_ms(),
            purge_after_ms: default_purge_after_ms(),
            purge_interval_ms: default_purge_interval_ms(),
            purge_batch_size: default_purge_batch_size(),
            min_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_cap_ms: default_backoff_cap_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_jitter: 0.0,
            max_epoch: 0,
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
