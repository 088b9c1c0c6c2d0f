//! Configuration loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use examflow_core::EngineConfig;

/// Content API settings.
///
/// Note: Custom Debug impl masks the token to prevent accidental exposure in logs.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            timeout_secs: default_request_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}
fn default_request_timeout() -> u64 {
    30
}

/// Engine tunables as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub pacing_ms: u64,
    pub synthetic_delay_ms: u64,
    pub buffer_threshold_ms: u64,
    pub stall_grace_secs: u64,
    pub preload_timeout_secs: u64,
    pub reading_minutes: u64,
    pub listening_nominal_minutes: u64,
    pub tick_interval_ms: u64,
    /// Unset means direction screens wait for the user.
    pub direction_auto_dismiss_secs: Option<u64>,
    pub lookahead_groups: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            pacing_ms: engine.pacing_delay.as_millis() as u64,
            synthetic_delay_ms: engine.synthetic_delay.as_millis() as u64,
            buffer_threshold_ms: engine.buffer_threshold.as_millis() as u64,
            stall_grace_secs: engine.stall_grace.as_secs(),
            preload_timeout_secs: engine.preload_timeout.as_secs(),
            reading_minutes: engine.reading_budget.as_secs() / 60,
            listening_nominal_minutes: engine.listening_nominal.as_secs() / 60,
            tick_interval_ms: engine.tick_interval.as_millis() as u64,
            direction_auto_dismiss_secs: None,
            lookahead_groups: engine.lookahead_groups,
        }
    }
}

/// Top-level examflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExamflowConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    /// Where the file-backed session store keeps its state.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("./examflow-state")
}

impl ExamflowConfig {
    pub fn engine_config(&self) -> EngineConfig {
        let e = &self.engine;
        EngineConfig {
            pacing_delay: Duration::from_millis(e.pacing_ms),
            synthetic_delay: Duration::from_millis(e.synthetic_delay_ms),
            buffer_threshold: Duration::from_millis(e.buffer_threshold_ms),
            stall_grace: Duration::from_secs(e.stall_grace_secs),
            preload_timeout: Duration::from_secs(e.preload_timeout_secs),
            reading_budget: Duration::from_secs(e.reading_minutes * 60),
            listening_nominal: Duration::from_secs(e.listening_nominal_minutes * 60),
            tick_interval: Duration::from_millis(e.tick_interval_ms.max(1)),
            direction_auto_dismiss: e.direction_auto_dismiss_secs.map(Duration::from_secs),
            lookahead_groups: e.lookahead_groups,
        }
    }
}

/// Resolve environment variable references like `${VAR_NAME}` in a string.
fn resolve_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_name = &result[start + 2..start + end];
            let value = std::env::var(var_name).unwrap_or_default();
            result = format!(
                "{}{}{}",
                &result[..start],
                value,
                &result[start + end + 1..]
            );
        } else {
            break;
        }
    }
    result
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `examflow.toml` in the current directory
/// 2. `~/.config/examflow/config.toml`
///
/// Environment variable overrides: `EXAMFLOW_API_URL`, `EXAMFLOW_API_TOKEN`.
pub fn load_config() -> Result<ExamflowConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
pub fn load_config_from(path: Option<&Path>) -> Result<ExamflowConfig> {
    let config_path = if let Some(p) = path {
        if p.exists() {
            Some(p.to_path_buf())
        } else {
            anyhow::bail!("config file not found: {}", p.display());
        }
    } else {
        let local = PathBuf::from("examflow.toml");
        if local.exists() {
            Some(local)
        } else {
            dirs_path()
                .map(|home| home.join("config.toml"))
                .filter(|global| global.exists())
        }
    };

    let mut config = match config_path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config");
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            toml::from_str::<ExamflowConfig>(&content)
                .with_context(|| format!("failed to parse config: {}", path.display()))?
        }
        None => ExamflowConfig::default(),
    };

    // Apply env var overrides
    if let Ok(url) = std::env::var("EXAMFLOW_API_URL") {
        config.api.base_url = url;
    }
    if let Ok(token) = std::env::var("EXAMFLOW_API_TOKEN") {
        config.api.token = Some(token);
    }

    config.api.base_url = resolve_env_vars(&config.api.base_url);
    config.api.token = config
        .api
        .token
        .as_deref()
        .map(resolve_env_vars)
        .filter(|t| !t.is_empty());
    if let Some(dir) = config.store_dir.to_str() {
        config.store_dir = PathBuf::from(resolve_env_vars(dir));
    }

    Ok(config)
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("examflow"))
}
