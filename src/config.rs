//! Configuration management for the mCSD update client

use crate::error::{ConfigError, Result, Validate};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure for the mCSD update client.
///
/// Holds the scheduler policy, the update-client (local FHIR server)
/// connection, the directory-provider source, the metadata cache, and the
/// state database location.
///
/// # Example
///
/// ```rust,no_run
/// use mcsd_update_client::config::McsdConfig;
///
/// let config = McsdConfig::load().unwrap();
/// println!("Update client URL: {}", config.client.update_client_url);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McsdConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Scheduler timing and health policy.
///
/// All durations are in seconds. The defaults mirror a conservative
/// production deployment: hourly staleness, auto-ignore after a week of
/// silence or twenty consecutive failures, cleanup after a month.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tick period of the scheduling loop.
    #[serde(default = "default_delay_input")]
    pub delay_input: u64,
    /// A directory is reported stale when its last successful sync is older
    /// than this.
    #[serde(default = "default_stale_timeout")]
    pub directory_stale_timeout: u64,
    /// Auto-ignore a directory when its last success is older than this.
    #[serde(default = "default_ignore_after_success")]
    pub ignore_directory_after_success_timeout: u64,
    /// Auto-ignore a directory after this many failed attempts.
    #[serde(default = "default_ignore_after_failures")]
    pub ignore_directory_after_failed_attempts_threshold: u32,
    /// Schedule a directory's local data for cleanup when its last success
    /// is older than this.
    #[serde(default = "default_cleanup_after_success")]
    pub cleanup_client_directory_after_success_timeout: u64,
    /// Delay between a directory being scheduled for deletion and the purge.
    #[serde(default = "default_cleanup_delay")]
    pub cleanup_delay_after_delete: u64,
    /// Whether directories removed from their provider are purged.
    #[serde(default = "default_true")]
    pub cleanup_client_directory_after_directory_delete: bool,
    /// Whether the scheduler dispatches update passes on its own.
    #[serde(default = "default_true")]
    pub automatic_background_update: bool,
    /// Whether the scheduler dispatches cleanup jobs on its own.
    #[serde(default = "default_true")]
    pub automatic_background_cleanup: bool,
    /// Number of pass reports retained in memory.
    #[serde(default = "default_max_logs_entries")]
    pub max_logs_entries: usize,
    /// Global ceiling on simultaneously running directory passes.
    #[serde(default = "default_max_concurrent_updates")]
    pub max_concurrent_updates: usize,
    /// Optional soft deadline for a single pass, in seconds.
    #[serde(default)]
    pub pass_deadline: Option<u64>,
}

/// Connection settings shared by the directory clients and the local
/// update-client writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the local addressing FHIR server.
    #[serde(default = "default_update_client_url")]
    pub update_client_url: String,
    /// Page size requested via `_count`.
    #[serde(default = "default_request_count")]
    pub request_count: u32,
    /// Validate directory capability statements before each pass.
    #[serde(default)]
    pub strict_validation: bool,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Retry attempts for idempotent requests.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base backoff delay between retries, in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

/// Source of the known-directory set.
///
/// Exactly one of `directories_provider_url` (an HTTP endpoint returning a
/// FHIR Bundle of `Endpoint` resources) or `directory_urls_path` (a local
/// JSON file) should be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub directories_provider_url: Option<String>,
    #[serde(default)]
    pub directory_urls_path: Option<PathBuf>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Backoff between refresh retries, in seconds.
    #[serde(default = "default_provider_backoff")]
    pub backoff: u64,
}

/// Metadata cache settings.
///
/// `host`/`port`/`ssl` describe an external cache backend; when unset the
/// built-in in-memory cache is used. Only capability statements and other
/// metadata responses are cached, never history pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub ssl: bool,
    /// Entry time-to-live in seconds.
    #[serde(default = "default_object_ttl")]
    pub object_ttl: u64,
    #[serde(default = "default_cache_namespace")]
    pub default_cache_namespace: String,
}

/// Location and pool sizing of the state database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub connection_pool_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            delay_input: default_delay_input(),
            directory_stale_timeout: default_stale_timeout(),
            ignore_directory_after_success_timeout: default_ignore_after_success(),
            ignore_directory_after_failed_attempts_threshold: default_ignore_after_failures(),
            cleanup_client_directory_after_success_timeout: default_cleanup_after_success(),
            cleanup_delay_after_delete: default_cleanup_delay(),
            cleanup_client_directory_after_directory_delete: true,
            automatic_background_update: true,
            automatic_background_cleanup: true,
            max_logs_entries: default_max_logs_entries(),
            max_concurrent_updates: default_max_concurrent_updates(),
            pass_deadline: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            update_client_url: default_update_client_url(),
            request_count: default_request_count(),
            strict_validation: false,
            timeout: default_timeout(),
            retry_attempts: default_retry_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            directories_provider_url: None,
            directory_urls_path: None,
            timeout: default_timeout(),
            backoff: default_provider_backoff(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            ssl: false,
            object_ttl: default_object_ttl(),
            default_cache_namespace: default_cache_namespace(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path: home_dir.join(".mcsd").join("state.db"),
            connection_pool_size: default_pool_size(),
        }
    }
}

impl McsdConfig {
    /// Loads configuration from the default location (`mcsd.toml` in the
    /// current directory), falling back to defaults when the file does not
    /// exist. `MCSD_*` environment overrides are applied either way.
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        let mut config = if config_path.exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a specific TOML file and validates it.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::InvalidFile {
            path: path.to_path_buf(),
        })?;

        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the default configuration file path (`mcsd.toml` in the
    /// current directory).
    pub fn default_config_path() -> PathBuf {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("mcsd.toml")
    }

    /// Validates the current configuration for correctness.
    pub fn validate(&self) -> Result<()> {
        <Self as Validate>::validate(self).map_err(|e| e.into())
    }

    /// Applies environment variable overrides:
    ///
    /// - `MCSD_UPDATE_CLIENT_URL` — local FHIR server base URL
    /// - `MCSD_DB_PATH` — state database path
    /// - `MCSD_PROVIDER_URL` — directory-provider URL
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("MCSD_UPDATE_CLIENT_URL") {
            self.client.update_client_url = url;
        }

        if let Ok(db_path) = std::env::var("MCSD_DB_PATH") {
            self.storage.db_path = PathBuf::from(db_path);
        }

        if let Ok(url) = std::env::var("MCSD_PROVIDER_URL") {
            self.provider.directories_provider_url = Some(url);
        }
    }

    /// A configuration suitable for tests: scratch database under `base`,
    /// fast scheduler, tiny retry budget.
    pub fn test_config(base: &std::path::Path) -> Self {
        Self {
            scheduler: SchedulerConfig {
                delay_input: 1,
                max_concurrent_updates: 2,
                ..Default::default()
            },
            client: ClientConfig {
                update_client_url: "http://localhost:8080/fhir".to_string(),
                request_count: 50,
                strict_validation: false,
                timeout: 5,
                retry_attempts: 2,
                backoff_ms: 10,
            },
            provider: ProviderConfig::default(),
            cache: CacheConfig::default(),
            storage: StorageConfig {
                db_path: base.join("state.db"),
                connection_pool_size: 2,
            },
        }
    }
}

impl Validate for McsdConfig {
    type Error = ConfigError;

    fn validate(&self) -> std::result::Result<(), Self::Error> {
        if self.client.update_client_url.is_empty() {
            return Err(ConfigError::MissingField {
                field: "client.update_client_url".to_string(),
            });
        }

        if url::Url::parse(&self.client.update_client_url).is_err() {
            return Err(ConfigError::InvalidUrl {
                key: "client.update_client_url".to_string(),
                url: self.client.update_client_url.clone(),
            });
        }

        if let Some(url) = &self.provider.directories_provider_url {
            if url::Url::parse(url).is_err() {
                return Err(ConfigError::InvalidUrl {
                    key: "provider.directories_provider_url".to_string(),
                    url: url.clone(),
                });
            }
        }

        if self.provider.directories_provider_url.is_some()
            && self.provider.directory_urls_path.is_some()
        {
            return Err(ConfigError::ValidationFailed {
                message: "provider URL and directory file are mutually exclusive".to_string(),
            });
        }

        if self.client.request_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "client.request_count".to_string(),
                value: "0".to_string(),
            });
        }

        if self.scheduler.delay_input == 0 {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.delay_input".to_string(),
                value: "0".to_string(),
            });
        }

        if self.scheduler.max_concurrent_updates == 0 {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.max_concurrent_updates".to_string(),
                value: "0".to_string(),
            });
        }

        if self.storage.db_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingField {
                field: "storage.db_path".to_string(),
            });
        }

        Ok(())
    }
}

fn default_delay_input() -> u64 {
    30
}

fn default_stale_timeout() -> u64 {
    3_600
}

fn default_ignore_after_success() -> u64 {
    7 * 24 * 3_600
}

fn default_ignore_after_failures() -> u32 {
    20
}

fn default_cleanup_after_success() -> u64 {
    30 * 24 * 3_600
}

fn default_cleanup_delay() -> u64 {
    24 * 3_600
}

fn default_max_logs_entries() -> usize {
    500
}

fn default_max_concurrent_updates() -> usize {
    1
}

fn default_update_client_url() -> String {
    "http://localhost:8080/fhir".to_string()
}

fn default_request_count() -> u32 {
    100
}

fn default_timeout() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_provider_backoff() -> u64 {
    5
}

fn default_object_ttl() -> u64 {
    600
}

fn default_cache_namespace() -> String {
    "mcsd".to_string()
}

fn default_pool_size() -> usize {
    5
}

fn default_true() -> bool {
    true
}
