//! Application configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on the number of queue workers.
pub const MAX_WORKERS: usize = 256;

/// Lower bound on the number of queue workers.
pub const MIN_WORKERS: usize = 4;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Durable storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Queue and delivery configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Notification transport configuration.
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL of this instance.
    pub url: String,
}

/// Durable storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding the per-user and shared job queues.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
        }
    }
}

/// Queue, worker and retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Number of worker tasks (0 = detect from CPU count).
    #[serde(default)]
    pub num_threads: usize,
    /// Per-request timeout for outbound HTTP.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Connect timeout for outbound HTTP.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Maximum number of scheduled retries before a job is abandoned.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_retry_delay")]
    pub initial_retry_delay_secs: u64,
    /// Upper bound on the delay between retries.
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,
    /// Multiplier for exponential backoff.
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    /// Idle sleep of the sweep loop when nothing was dispatched.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Interval between purge jobs.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_retries: default_max_retries(),
            initial_retry_delay_secs: default_initial_retry_delay(),
            max_retry_delay_secs: default_max_retry_delay(),
            retry_multiplier: default_retry_multiplier(),
            sweep_interval_secs: default_sweep_interval(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

impl QueueConfig {
    /// Resolve the worker count: `num_threads`, or the CPU count when it is 0,
    /// clamped to `[MIN_WORKERS, MAX_WORKERS]`.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        let requested = if self.num_threads == 0 {
            std::thread::available_parallelism().map_or(MIN_WORKERS, std::num::NonZeroUsize::get)
        } else {
            self.num_threads
        };
        requested.clamp(MIN_WORKERS, MAX_WORKERS)
    }

    /// Per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Idle sleep of the sweep loop.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Interval between purge jobs.
    #[must_use]
    pub const fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

/// Notification transports.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    /// SMTP relay for email notifications.
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
}

/// SMTP configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    /// SMTP host.
    pub host: String,
    /// SMTP port.
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Username.
    #[serde(default)]
    pub username: Option<String>,
    /// Password.
    #[serde(default)]
    pub password: Option<String>,
    /// From address.
    pub from: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    8001
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("./data")
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_connect_timeout() -> u64 {
    10
}

const fn default_max_retries() -> u32 {
    10
}

const fn default_initial_retry_delay() -> u64 {
    120
}

const fn default_max_retry_delay() -> u64 {
    86400
}

const fn default_retry_multiplier() -> f64 {
    2.0
}

const fn default_sweep_interval() -> u64 {
    3
}

const fn default_purge_interval() -> u64 {
    86400
}

const fn default_smtp_port() -> u16 {
    587
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `TERN_ENV`)
    /// 3. Environment variables with `TERN__` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        // A missing .env file is not an error.
        let _ = dotenvy::dotenv();

        let env = std::env::var("TERN_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("TERN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("TERN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
