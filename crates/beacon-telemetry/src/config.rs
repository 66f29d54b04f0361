//! Pipeline configuration loading and validation

use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TelemetryError};

/// Delivery pipeline configuration.
///
/// Construction-time validation is strict: required fields are never
/// silently defaulted (see [`validate`](Self::validate)). Everything else
/// ships with conservative defaults tuned for a background client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Ingestion endpoint URL. Required whenever the pipeline is enabled.
    pub endpoint: String,

    /// Project API key sent with every batch. Required whenever enabled.
    pub api_key: String,

    /// Whether events are collected and delivered (default: true).
    pub enabled: bool,

    /// Debug mode: log batches instead of sending them (default: false).
    pub debug: bool,

    /// In-memory queue capacity; overflow rejects the newest event.
    pub queue_capacity: usize,

    /// Queue size at which a flush is triggered from `track()`.
    pub auto_flush_threshold: usize,

    /// Interval between timer-driven flush cycles, in seconds.
    pub flush_interval_secs: u64,

    /// Maximum events per delivery batch.
    pub max_batch_size: usize,

    /// Retryable attempts after the first try, per batch send.
    pub max_retries: u32,

    /// First backoff delay, in milliseconds.
    pub initial_backoff_ms: u64,

    /// Backoff ceiling, in milliseconds.
    pub backoff_cap_ms: u64,

    /// Total failed attempts after which an event is given up and purged
    /// from the offline store.
    pub retry_ceiling: u32,

    /// Persist pending events for crash/offline recovery (default: true).
    /// Disabling this is an explicit choice to degrade to best-effort
    /// in-memory delivery.
    pub offline_storage: bool,

    /// Offline store directory. Defaults to `~/.beacon/telemetry/outbox`.
    pub storage_dir: Option<PathBuf>,

    /// Fixed per-request network timeout, in seconds.
    pub request_timeout_secs: u64,

    /// Default the user id to the anonymous installation id when no global
    /// user id has been set (default: true).
    pub anonymous_id: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            enabled: true,
            debug: false,
            queue_capacity: 1000,
            auto_flush_threshold: 20,
            flush_interval_secs: 30,
            max_batch_size: 50,
            max_retries: 3,
            initial_backoff_ms: 500,
            backoff_cap_ms: 30_000,
            retry_ceiling: 10,
            offline_storage: true,
            storage_dir: None,
            request_timeout_secs: 10,
            anonymous_id: true,
        }
    }
}

impl TelemetryConfig {
    /// Validate construction parameters. Fatal: a client is never built from
    /// an invalid config.
    ///
    /// Endpoint and API key are only required when the pipeline will
    /// actually send (`enabled`); a disabled client may omit them.
    pub fn validate(&self) -> Result<()> {
        if self.enabled {
            if self.endpoint.trim().is_empty() {
                return Err(TelemetryError::Config("endpoint must be set".to_string()));
            }
            if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
                return Err(TelemetryError::Config(format!(
                    "endpoint must be an http(s) URL, got '{}'",
                    self.endpoint
                )));
            }
            if self.api_key.trim().is_empty() {
                return Err(TelemetryError::Config("api_key must be set".to_string()));
            }
        }
        if self.queue_capacity == 0 {
            return Err(TelemetryError::Config(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(TelemetryError::Config(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.auto_flush_threshold == 0 {
            return Err(TelemetryError::Config(
                "auto_flush_threshold must be at least 1".to_string(),
            ));
        }
        if self.flush_interval_secs == 0 {
            return Err(TelemetryError::Config(
                "flush_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(TelemetryError::Config(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.retry_ceiling == 0 {
            return Err(TelemetryError::Config(
                "retry_ceiling must be at least 1".to_string(),
            ));
        }
        if self.initial_backoff_ms == 0 {
            return Err(TelemetryError::Config(
                "initial_backoff_ms must be at least 1".to_string(),
            ));
        }
        if self.backoff_cap_ms < self.initial_backoff_ms {
            return Err(TelemetryError::Config(
                "backoff_cap_ms must not be below initial_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Offline store directory, falling back to the per-user state dir.
    pub fn resolved_storage_dir(&self) -> AnyResult<PathBuf> {
        match &self.storage_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(get_state_dir()?.join("outbox")),
        }
    }
}

/// Partial config as it appears in a `[telemetry]` file section; only the
/// fields present in the file override the accumulated config.
#[derive(Debug, Default, Deserialize)]
struct ConfigOverlay {
    endpoint: Option<String>,
    api_key: Option<String>,
    enabled: Option<bool>,
    debug: Option<bool>,
    queue_capacity: Option<usize>,
    auto_flush_threshold: Option<usize>,
    flush_interval_secs: Option<u64>,
    max_batch_size: Option<usize>,
    max_retries: Option<u32>,
    initial_backoff_ms: Option<u64>,
    backoff_cap_ms: Option<u64>,
    retry_ceiling: Option<u32>,
    offline_storage: Option<bool>,
    storage_dir: Option<PathBuf>,
    request_timeout_secs: Option<u64>,
    anonymous_id: Option<bool>,
}

impl ConfigOverlay {
    fn apply(self, config: &mut TelemetryConfig) {
        if let Some(endpoint) = self.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(api_key) = self.api_key {
            config.api_key = api_key;
        }
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(debug) = self.debug {
            config.debug = debug;
        }
        if let Some(queue_capacity) = self.queue_capacity {
            config.queue_capacity = queue_capacity;
        }
        if let Some(auto_flush_threshold) = self.auto_flush_threshold {
            config.auto_flush_threshold = auto_flush_threshold;
        }
        if let Some(flush_interval_secs) = self.flush_interval_secs {
            config.flush_interval_secs = flush_interval_secs;
        }
        if let Some(max_batch_size) = self.max_batch_size {
            config.max_batch_size = max_batch_size;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(initial_backoff_ms) = self.initial_backoff_ms {
            config.initial_backoff_ms = initial_backoff_ms;
        }
        if let Some(backoff_cap_ms) = self.backoff_cap_ms {
            config.backoff_cap_ms = backoff_cap_ms;
        }
        if let Some(retry_ceiling) = self.retry_ceiling {
            config.retry_ceiling = retry_ceiling;
        }
        if let Some(offline_storage) = self.offline_storage {
            config.offline_storage = offline_storage;
        }
        if let Some(storage_dir) = self.storage_dir {
            config.storage_dir = Some(storage_dir);
        }
        if let Some(request_timeout_secs) = self.request_timeout_secs {
            config.request_timeout_secs = request_timeout_secs;
        }
        if let Some(anonymous_id) = self.anonymous_id {
            config.anonymous_id = anonymous_id;
        }
    }
}

/// Load configuration with precedence:
/// 1. Environment variables (highest priority)
/// 2. Project config (./.beacon/config.toml)
/// 3. User config (~/.beacon/config.toml)
/// 4. Defaults
pub fn load_telemetry_config() -> AnyResult<TelemetryConfig> {
    let mut config = TelemetryConfig::default();

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".beacon/config.toml");
        if user_config.exists() {
            if let Ok(overlay) = load_overlay_from_file(&user_config) {
                overlay.apply(&mut config);
            }
        }
    }

    let project_config = PathBuf::from(".beacon/config.toml");
    if project_config.exists() {
        if let Ok(overlay) = load_overlay_from_file(&project_config) {
            overlay.apply(&mut config);
        }
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Extract the `[telemetry]` section from a TOML config file.
fn load_overlay_from_file(path: &PathBuf) -> AnyResult<ConfigOverlay> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;

    #[derive(Deserialize)]
    struct FullConfig {
        #[serde(default)]
        telemetry: Option<ConfigOverlay>,
    }

    let full_config: FullConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config: {}", path.display()))?;

    Ok(full_config.telemetry.unwrap_or_default())
}

/// Apply environment variable overrides.
fn apply_env_overrides(config: &mut TelemetryConfig) {
    // BEACON_TELEMETRY_DISABLED=1 disables delivery
    if env::var("BEACON_TELEMETRY_DISABLED").is_ok() {
        config.enabled = false;
        return;
    }

    // DO_NOT_TRACK=1 (universal opt-out)
    if env::var("DO_NOT_TRACK").is_ok() {
        config.enabled = false;
        return;
    }

    // BEACON_TELEMETRY_DEBUG=1 enables debug mode
    if env::var("BEACON_TELEMETRY_DEBUG").is_ok() {
        config.debug = true;
    }

    // Auto-disable in CI unless explicitly enabled
    if is_ci() && env::var("BEACON_TELEMETRY_IN_CI").is_err() {
        config.enabled = false;
    }
}

/// Check if running in a CI environment.
fn is_ci() -> bool {
    env::var("CI").is_ok()
        || env::var("CONTINUOUS_INTEGRATION").is_ok()
        || env::var("GITHUB_ACTIONS").is_ok()
        || env::var("GITLAB_CI").is_ok()
        || env::var("CIRCLECI").is_ok()
        || env::var("TRAVIS").is_ok()
}

/// Per-user state directory (`~/.beacon/telemetry`), created on demand.
pub fn get_state_dir() -> AnyResult<PathBuf> {
    let home_dir = dirs::home_dir().context("Could not determine home directory")?;
    let state_dir = home_dir.join(".beacon").join("telemetry");
    fs::create_dir_all(&state_dir)?;
    Ok(state_dir)
}
