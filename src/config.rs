//! Configuration for covorch.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (COVORCH_HOME, COVORCH_INVOCATION_TIMEOUT)
//! 2. Config file (.covorch/config.yaml)
//! 3. Defaults (~/.covorch)
//!
//! Config file discovery:
//! - Searches current directory and parents for .covorch/config.yaml
//! - Paths in config file are relative to the .covorch/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::backoff::{
    DelaySchedule, EventStoreRecorderBackoffStrategy, ReadyToFinaliseBackoffStrategy,
};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub invocation_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to the .covorch/ directory)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub recorder: Option<StrategyConfig>,
    #[serde(default)]
    pub ready_to_finalise: Option<StrategyConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StrategyConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub exponent: Option<u32>,
}

/// Resolved settings for one backoff strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub exponent: u32,
}

impl StrategySettings {
    fn resolve(raw: Option<&StrategyConfig>, defaults: StrategySettings) -> Self {
        let Some(raw) = raw else {
            return defaults;
        };

        Self {
            max_attempts: raw.max_attempts.unwrap_or(defaults.max_attempts),
            base_delay: raw
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            exponent: raw.exponent.unwrap_or(defaults.exponent),
        }
    }

    pub fn schedule(&self) -> DelaySchedule {
        DelaySchedule::Polynomial {
            base: self.base_delay,
            exponent: self.exponent,
        }
    }

    /// Worst-case total wait across all attempts
    pub fn max_total_delay(&self) -> Duration {
        self.schedule().total_delay(self.max_attempts)
    }
}

/// Resolved settings for both backoff strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSettings {
    pub recorder: StrategySettings,
    pub ready_to_finalise: StrategySettings,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            recorder: StrategySettings {
                max_attempts: EventStoreRecorderBackoffStrategy::DEFAULT_MAX_ATTEMPTS,
                base_delay: EventStoreRecorderBackoffStrategy::DEFAULT_BASE_DELAY,
                exponent: EventStoreRecorderBackoffStrategy::DEFAULT_EXPONENT,
            },
            ready_to_finalise: StrategySettings {
                max_attempts: ReadyToFinaliseBackoffStrategy::DEFAULT_MAX_ATTEMPTS,
                base_delay: ReadyToFinaliseBackoffStrategy::DEFAULT_BASE_DELAY,
                exponent: ReadyToFinaliseBackoffStrategy::DEFAULT_EXPONENT,
            },
        }
    }
}

impl BackoffSettings {
    fn resolve(raw: &BackoffConfig) -> Self {
        let defaults = Self::default();
        Self {
            recorder: StrategySettings::resolve(raw.recorder.as_ref(), defaults.recorder),
            ready_to_finalise: StrategySettings::resolve(
                raw.ready_to_finalise.as_ref(),
                defaults.ready_to_finalise,
            ),
        }
    }

    pub fn recorder_strategy(&self) -> EventStoreRecorderBackoffStrategy {
        EventStoreRecorderBackoffStrategy::new(self.recorder.max_attempts, self.recorder.schedule())
    }

    pub fn ready_to_finalise_strategy(&self) -> ReadyToFinaliseBackoffStrategy {
        ReadyToFinaliseBackoffStrategy::new(
            self.ready_to_finalise.max_attempts,
            self.ready_to_finalise.schedule(),
        )
    }

    /// Worst-case time one invocation can spend backing off
    pub fn max_total_delay(&self) -> Duration {
        self.recorder.max_total_delay() + self.ready_to_finalise.max_total_delay()
    }
}

/// Default platform execution limit for one invocation
pub const DEFAULT_INVOCATION_TIMEOUT_SECONDS: u64 = 30;

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to covorch home (event store state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Backoff strategy settings
    pub backoff: BackoffSettings,
    /// Execution limit of the surrounding invocation
    pub invocation_timeout: Duration,
}

impl ResolvedConfig {
    /// Directory holding the state-change logs
    pub fn events_dir(&self) -> PathBuf {
        self.home.join("events")
    }

    /// Reject backoff schedules that could outlive the invocation
    pub fn validate(&self) -> Result<()> {
        let total = self.backoff.max_total_delay();
        if total >= self.invocation_timeout {
            anyhow::bail!(
                "Backoff schedule can wait {}ms, which is not under the {}s invocation timeout",
                total.as_millis(),
                self.invocation_timeout.as_secs()
            );
        }

        if self.backoff.recorder.max_attempts == 0
            || self.backoff.ready_to_finalise.max_attempts == 0
        {
            anyhow::bail!("Backoff max_attempts must be at least 1");
        }

        Ok(())
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".covorch").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Environment variables that take precedence over the config file
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<String>,
    invocation_timeout: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var("COVORCH_HOME").ok(),
            invocation_timeout: std::env::var("COVORCH_INVOCATION_TIMEOUT").ok(),
        }
    }

    fn invocation_timeout_seconds(&self) -> Result<Option<u64>> {
        self.invocation_timeout
            .as_deref()
            .map(|value| {
                value
                    .parse()
                    .with_context(|| format!("Invalid COVORCH_INVOCATION_TIMEOUT: {}", value))
            })
            .transpose()
    }
}

/// Build the resolved configuration from an optional parsed file
fn resolve(
    config_path: Option<&Path>,
    config: Option<ConfigFile>,
    env: &EnvOverrides,
) -> Result<ResolvedConfig> {
    let home = if let Some(env_home) = &env.home {
        PathBuf::from(env_home)
    } else if let (Some(home_path), Some(config_path)) = (
        config.as_ref().and_then(|c| c.paths.home.as_deref()),
        config_path,
    ) {
        // home is relative to .covorch/ directory
        let covorch_dir = config_path.parent().unwrap_or(Path::new("."));
        resolve_path(covorch_dir, home_path)
    } else {
        dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".covorch")
    };

    let backoff = config
        .as_ref()
        .map(|c| BackoffSettings::resolve(&c.backoff))
        .unwrap_or_default();

    let timeout_seconds = env
        .invocation_timeout_seconds()?
        .or_else(|| config.as_ref().and_then(|c| c.invocation_timeout_seconds))
        .unwrap_or(DEFAULT_INVOCATION_TIMEOUT_SECONDS);

    let resolved = ResolvedConfig {
        home,
        config_file: config_path.map(Path::to_path_buf),
        backoff,
        invocation_timeout: Duration::from_secs(timeout_seconds),
    };
    resolved.validate()?;

    Ok(resolved)
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let env = EnvOverrides::from_env();

    match find_config_file() {
        Some(path) => {
            let config = load_config_file(&path)?;
            resolve(Some(&path), Some(config), &env)
        }
        None => resolve(None, None, &env),
    }
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the covorch home directory
pub fn covorch_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the event store directory ($COVORCH_HOME/events)
pub fn events_dir() -> Result<PathBuf> {
    Ok(config()?.events_dir())
}
