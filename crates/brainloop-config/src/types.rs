//! Configuration struct definitions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level worker configuration, loaded from `brainloop.toml` in the
/// current working directory with environment-variable fallback (see
/// [`crate::env`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory the worker is allowed to read and write under.
    pub workspace_root: PathBuf,

    /// If `true`, the worker refuses to start unless its current working
    /// directory's name appears as a substring of `workspace_root`
    /// (historical default behaviour; see the configurable-startup-check
    /// open question).
    pub require_project_name_in_cwd: bool,

    /// Directory the five SQLite databases live under, relative to
    /// `workspace_root` unless absolute.
    pub data_dir: PathBuf,

    /// Generation gateway settings.
    pub completion: CompletionConfig,

    /// Sandboxed executor settings.
    pub executor: ExecutorConfig,

    /// Rate limiter settings shared by the generation gateway.
    pub rate_limiter: RateLimiterConfig,

    /// Worker lifecycle settings (lock file, heartbeat, shutdown budget).
    pub lifecycle: LifecycleConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/workspace"),
            require_project_name_in_cwd: true,
            data_dir: PathBuf::from(".brainloop"),
            completion: CompletionConfig::default(),
            executor: ExecutorConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl Config {
    /// Resolve `data_dir` against `workspace_root` if it is relative.
    #[must_use]
    pub fn resolved_data_dir(&self) -> PathBuf {
        if self.data_dir.is_absolute() {
            self.data_dir.clone()
        } else {
            self.workspace_root.join(&self.data_dir)
        }
    }
}

/// Remote completion API settings for the generation gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Provider name (`"anthropic"`, `"cerebras"`, ...), used only for
    /// logging and the `telemetry_llm_metrics` table.
    pub provider: String,

    /// Model identifier passed to the completion API.
    pub model: String,

    /// Base URL of the completion API. `None` uses the provider's default.
    pub base_url: Option<String>,

    /// API key. Left `None` in the TOML file; resolved from the
    /// environment at load time (see [`crate::env::resolve_api_key`]).
    #[serde(skip)]
    pub api_key: Option<String>,

    /// Maximum tokens requested per completion call.
    pub max_tokens: u32,

    /// Maximum number of retries after a rate-limit or transient failure.
    pub max_retries: u32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            base_url: None,
            api_key: None,
            max_tokens: 4096,
            max_retries: 5,
        }
    }
}

/// Sandboxed command executor settings (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Hard wall-clock timeout before a spawned command is SIGKILLed.
    pub timeout_secs: u64,

    /// Maximum bytes of stdout/stderr retained per stream before
    /// truncation.
    pub max_output_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_output_bytes: 10 * 1024,
        }
    }
}

/// Token-bucket rate limiter settings (§4.11).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Maximum tokens the bucket can hold.
    pub capacity: f64,

    /// Tokens added per second.
    pub refill_per_sec: f64,

    /// Ceiling on the exponential backoff delay.
    pub max_backoff_secs: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 1.0,
            max_backoff_secs: 300,
        }
    }
}

/// Worker lifecycle settings (§4.13).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Name of the PID lock file, created under `data_dir`.
    pub lock_file_name: String,

    /// Interval between heartbeat ticks.
    pub heartbeat_interval_secs: u64,

    /// Total wall-clock budget for the three-phase graceful shutdown.
    pub shutdown_budget_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            lock_file_name: "worker.lock".to_string(),
            heartbeat_interval_secs: 15,
            shutdown_budget_secs: 60,
        }
    }
}
