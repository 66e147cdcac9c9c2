//! Configuration management for gfscreen
//!
//! All configuration is loaded from `./config/gfscreen.toml`.
//! Every section is optional; missing sections and keys fall back to the
//! values shipped in the config template.

use serde::Deserialize;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Configuration file path relative to working directory
pub const CONFIG_PATH: &str = "./config/gfscreen.toml";

/// Default configuration file content, written by `gfscreen init`
pub const DEFAULT_CONFIG: &str = include_str!("../config/gfscreen.toml");

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] io::Error),

    #[error("Failed to parse configuration file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Configuration field '{field}' cannot be empty")]
    EmptyRequired { field: String },

    #[error("Configuration field '{field}' is out of range: {reason}")]
    OutOfRange { field: String, reason: String },

    #[error("Invalid URL template in '{field}': {template}")]
    InvalidUrlTemplate { field: String, template: String },

    #[error("Configuration file already exists at {0}")]
    AlreadyExists(PathBuf),
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub qualification: QualificationConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Work store and document storage locations
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_documents_dir")]
    pub documents_dir: PathBuf,
    /// Leases older than this are treated as abandoned by a crashed run
    #[serde(default = "default_stale_lease_timeout_secs")]
    pub stale_lease_timeout_secs: u64,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/gfscreen.db")
}

fn default_documents_dir() -> PathBuf {
    PathBuf::from("documents")
}

fn default_stale_lease_timeout_secs() -> u64 {
    7200
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            documents_dir: default_documents_dir(),
            stale_lease_timeout_secs: default_stale_lease_timeout_secs(),
        }
    }
}

impl StoreConfig {
    pub fn stale_lease_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_lease_timeout_secs)
    }
}

/// Quota for lookups against the register, shared by every run on the same store
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum grants inside any rolling window
    #[serde(default = "default_max_per_window")]
    pub max_per_window: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Minimum interval between two consecutive grants
    #[serde(default = "default_min_spacing_secs")]
    pub min_spacing_secs: u64,
    /// Upper bound of the random delay added to spacing waits (0 disables jitter)
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
    /// How long the governor stays closed after the upstream signalled throttling
    #[serde(default = "default_rate_blocked_pause_secs")]
    pub rate_blocked_pause_secs: u64,
}

fn default_max_per_window() -> u32 {
    55
}

fn default_window_secs() -> u64 {
    3600
}

fn default_min_spacing_secs() -> u64 {
    65
}

fn default_jitter_max_ms() -> u64 {
    5000
}

fn default_rate_blocked_pause_secs() -> u64 {
    3600
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: default_max_per_window(),
            window_secs: default_window_secs(),
            min_spacing_secs: default_min_spacing_secs(),
            jitter_max_ms: default_jitter_max_ms(),
            rate_blocked_pause_secs: default_rate_blocked_pause_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn min_spacing(&self) -> Duration {
        Duration::from_secs(self.min_spacing_secs)
    }

    pub fn jitter_max(&self) -> Duration {
        Duration::from_millis(self.jitter_max_ms)
    }

    pub fn rate_blocked_pause(&self) -> Duration {
        Duration::from_secs(self.rate_blocked_pause_secs)
    }

    /// Longest a single `acquire` can wait under this configuration
    pub fn longest_wait(&self) -> Duration {
        self.window()
            .max(self.min_spacing() + self.jitter_max())
            .max(self.rate_blocked_pause())
    }

    /// Whether spacing alone would allow more grants per window than the ceiling
    pub fn spacing_exceeds_ceiling(&self) -> bool {
        if self.min_spacing_secs == 0 {
            return true;
        }
        self.window_secs / self.min_spacing_secs > self.max_per_window as u64
    }
}

/// Backoff strategy between retries of a failed phase
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// base * attempt
    Linear,
    /// base * 2^(attempt - 1)
    Exponential,
}

/// Retry bounds and backoff for the fetch and parse phases
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_fetch_retries")]
    pub max_fetch_retries: u32,
    #[serde(default = "default_max_parse_retries")]
    pub max_parse_retries: u32,
    #[serde(default = "default_backoff_strategy")]
    pub backoff_strategy: BackoffStrategy,
    #[serde(default = "default_backoff_base_delay_ms")]
    pub backoff_base_delay_ms: u64,
    #[serde(default = "default_backoff_max_delay_ms")]
    pub backoff_max_delay_ms: u64,
}

fn default_max_fetch_retries() -> u32 {
    3
}

fn default_max_parse_retries() -> u32 {
    2
}

fn default_backoff_strategy() -> BackoffStrategy {
    BackoffStrategy::Exponential
}

fn default_backoff_base_delay_ms() -> u64 {
    60_000
}

fn default_backoff_max_delay_ms() -> u64 {
    1_800_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_fetch_retries: default_max_fetch_retries(),
            max_parse_retries: default_max_parse_retries(),
            backoff_strategy: default_backoff_strategy(),
            backoff_base_delay_ms: default_backoff_base_delay_ms(),
            backoff_max_delay_ms: default_backoff_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay before failed attempt number `attempt` (1-based) may be retried
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay_ms = match self.backoff_strategy {
            BackoffStrategy::Linear => self.backoff_base_delay_ms.saturating_mul(attempt as u64),
            BackoffStrategy::Exponential => {
                let factor = 2u64.checked_pow(attempt - 1).unwrap_or(u64::MAX);
                self.backoff_base_delay_ms.saturating_mul(factor)
            }
        };

        Duration::from_millis(delay_ms.min(self.backoff_max_delay_ms))
    }
}

/// Which transport retrieves documents
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FetchBackend {
    /// Document gateway reachable over HTTP
    Http,
    /// Files already downloaded into `source_dir`
    Directory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_backend")]
    pub backend: FetchBackend,
    /// Supports `{key}`, `{register}`, `{court}` and `{name}` placeholders
    #[serde(default = "default_url_template")]
    pub url_template: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
}

fn default_backend() -> FetchBackend {
    FetchBackend::Directory
}

fn default_url_template() -> String {
    "http://localhost:8080/documents?register={register}&court={court}".to_string()
}

fn default_user_agent() -> String {
    format!("gfscreen/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("incoming")
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url_template: default_url_template(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
            source_dir: default_source_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// 0 means one worker per available core
    #[serde(default)]
    pub parse_workers: usize,
    #[serde(default = "default_parse_batch_size")]
    pub parse_batch_size: usize,
}

fn default_confidence_threshold() -> f64 {
    0.5
}

fn default_parse_batch_size() -> usize {
    32
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            parse_workers: 0,
            parse_batch_size: default_parse_batch_size(),
        }
    }
}

impl ExtractionConfig {
    /// Effective size of the parse worker pool
    pub fn worker_count(&self) -> usize {
        if self.parse_workers > 0 {
            return self.parse_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QualificationConfig {
    #[serde(default = "default_max_natural_persons")]
    pub max_natural_persons: usize,
    /// Require zero legal-entity shareholders for a company to qualify
    #[serde(default)]
    pub reject_legal_entities: bool,
}

fn default_max_natural_persons() -> usize {
    2
}

impl Default for QualificationConfig {
    fn default() -> Self {
        Self {
            max_natural_persons: default_max_natural_persons(),
            reject_legal_entities: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

fn default_max_age_days() -> u32 {
    90
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.database_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyRequired {
                field: "store.database_path".to_string(),
            });
        }
        if self.store.documents_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyRequired {
                field: "store.documents_dir".to_string(),
            });
        }

        if self.rate_limit.max_per_window == 0 {
            return Err(ConfigError::OutOfRange {
                field: "rate_limit.max_per_window".to_string(),
                reason: "must allow at least one lookup per window".to_string(),
            });
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::OutOfRange {
                field: "rate_limit.window_secs".to_string(),
                reason: "window must be longer than zero seconds".to_string(),
            });
        }
        if self.rate_limit.spacing_exceeds_ceiling() {
            warn!(
                "rate_limit: a spacing of {}s allows more than {} lookups per {}s window; the ceiling will throttle",
                self.rate_limit.min_spacing_secs,
                self.rate_limit.max_per_window,
                self.rate_limit.window_secs
            );
        }

        if self.retry.backoff_max_delay_ms < self.retry.backoff_base_delay_ms {
            return Err(ConfigError::OutOfRange {
                field: "retry.backoff_max_delay_ms".to_string(),
                reason: "must not be smaller than retry.backoff_base_delay_ms".to_string(),
            });
        }

        match self.fetch.backend {
            FetchBackend::Http => {
                let template = &self.fetch.url_template;
                if template.is_empty() {
                    return Err(ConfigError::EmptyRequired {
                        field: "fetch.url_template".to_string(),
                    });
                }
                let has_scheme = template.starts_with("http://") || template.starts_with("https://");
                let has_placeholder = template.contains("{key}") || template.contains("{register}");
                if !has_scheme || !has_placeholder {
                    return Err(ConfigError::InvalidUrlTemplate {
                        field: "fetch.url_template".to_string(),
                        template: template.clone(),
                    });
                }
                if self.fetch.user_agent.is_empty() {
                    return Err(ConfigError::EmptyRequired {
                        field: "fetch.user_agent".to_string(),
                    });
                }
                if self.fetch.request_timeout_secs == 0 {
                    return Err(ConfigError::EmptyRequired {
                        field: "fetch.request_timeout_secs".to_string(),
                    });
                }
            }
            FetchBackend::Directory => {
                if self.fetch.source_dir.as_os_str().is_empty() {
                    return Err(ConfigError::EmptyRequired {
                        field: "fetch.source_dir".to_string(),
                    });
                }
            }
        }

        let threshold = self.extraction.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::OutOfRange {
                field: "extraction.confidence_threshold".to_string(),
                reason: format!("{} is not within [0, 1]", threshold),
            });
        }
        if self.extraction.parse_batch_size == 0 {
            return Err(ConfigError::OutOfRange {
                field: "extraction.parse_batch_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        // A lease must outlive the longest governor wait plus one request
        let longest_wait = self.rate_limit.longest_wait() + Duration::from_secs(self.fetch.request_timeout_secs);
        if self.store.stale_lease_timeout() <= longest_wait {
            return Err(ConfigError::OutOfRange {
                field: "store.stale_lease_timeout_secs".to_string(),
                reason: format!(
                    "{}s does not exceed the longest rate-limit wait plus request timeout ({}s)",
                    self.store.stale_lease_timeout_secs,
                    longest_wait.as_secs()
                ),
            });
        }

        if self.retention.max_age_days == 0 {
            return Err(ConfigError::OutOfRange {
                field: "retention.max_age_days".to_string(),
                reason: "must be at least one day".to_string(),
            });
        }

        Ok(())
    }

    /// Create default configuration file at `path`, refusing to overwrite
    pub fn create_default_config_at(path: &Path) -> Result<PathBuf, ConfigError> {
        if path.exists() {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(path)?;
        file.write_all(DEFAULT_CONFIG.as_bytes())?;

        Ok(path.to_path_buf())
    }

    /// Check if stdin is a TTY (interactive terminal)
    pub fn is_interactive() -> bool {
        io::stdin().is_terminal()
    }

    /// Prompt user to create default config (only in interactive mode)
    pub fn prompt_create_config(path: &Path) -> Result<Option<PathBuf>, ConfigError> {
        if !Self::is_interactive() {
            return Ok(None);
        }

        print!("Configuration file not found. Create default config? [Y/n] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim().to_lowercase();

        if input.is_empty() || input == "y" || input == "yes" {
            let path = Self::create_default_config_at(path)?;
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }
}
