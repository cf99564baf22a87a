//! Daemon configuration
//!
//! Resolution order: built-in defaults, then `<data_dir>/config.yaml`, then environment
//! variables. The environment is passed in as a snapshot so tests never touch process state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_POLL_MS: u64 = 500;
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 90;
pub const DEFAULT_SUMMARY_URL: &str = "https://api.anthropic.com/v1/messages";
pub const DEFAULT_SUMMARY_MODEL: &str = "claude-3-5-haiku-latest";
pub const DEFAULT_SUMMARY_MAX_TOKENS: u32 = 1024;
/// Ticks between health snapshots
pub const HEALTH_EVERY_TICKS: u64 = 120;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Project directory not set (use --project or CONTEXTD_PROJECT_DIR)")]
    MissingProjectDir,

    #[error("Project directory is not a directory: {0}")]
    InvalidProjectDir(PathBuf),

    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Optional overrides read from `config.yaml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct FileConfig {
    pub project_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub event_log: Option<PathBuf>,
    pub poll_ms: Option<u64>,
    pub agent_timeout_secs: Option<u64>,
    pub model: Option<String>,
    pub summary_url: Option<String>,
    pub summary_model: Option<String>,
    pub summary_max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub project_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub event_log: PathBuf,
    pub poll_interval: Duration,
    pub agent_timeout: Duration,
    /// Model passed to the analysis CLI; `None` lets the CLI pick
    pub model: Option<String>,
    pub summary_url: String,
    pub summary_model: String,
    pub summary_max_tokens: u32,
    /// Summaries fall back to a mechanical one without a key
    pub api_key: Option<String>,
}

/// `~/.contextd`, or `./.contextd` without a home directory
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".contextd")
}

/// Data directory for an environment snapshot, before any file is read
pub fn data_dir_from(env: &HashMap<String, String>) -> PathBuf {
    env_path(env, "CONTEXTD_DATA_DIR").unwrap_or_else(default_data_dir)
}

fn env_value<'a>(env: &'a HashMap<String, String>, var: &str) -> Option<&'a str> {
    env.get(var).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn env_path(env: &HashMap<String, String>, var: &str) -> Option<PathBuf> {
    env_value(env, var).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(
    env: &HashMap<String, String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env_value(env, var) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
            var,
            value: raw.to_string(),
        }),
    }
}

/// Read `config.yaml` if present. A missing file is not an error.
pub fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FileConfig::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if content.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    let config = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "Config file loaded");
    Ok(config)
}

impl DaemonConfig {
    /// Resolve against an environment snapshot. `project_override` (the CLI flag) beats
    /// both the file and the environment.
    pub fn resolve(
        env: &HashMap<String, String>,
        project_override: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let data_dir = data_dir_from(env);
        let file = load_file_config(&data_dir.join("config.yaml"))?;

        let project_dir = project_override
            .or_else(|| env_path(env, "CONTEXTD_PROJECT_DIR"))
            .or(file.project_dir)
            .ok_or(ConfigError::MissingProjectDir)?;
        if !project_dir.is_dir() {
            return Err(ConfigError::InvalidProjectDir(project_dir));
        }

        let db_path = env_path(env, "CONTEXTD_DB_PATH")
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("contextd.db"));
        let event_log = env_path(env, "CONTEXTD_EVENT_LOG")
            .or(file.event_log)
            .unwrap_or_else(|| data_dir.join("events.jsonl"));

        let poll_ms = env_parse(env, "CONTEXTD_POLL_MS")?
            .or(file.poll_ms)
            .unwrap_or(DEFAULT_POLL_MS);
        if poll_ms == 0 {
            return Err(ConfigError::InvalidValue {
                var: "CONTEXTD_POLL_MS",
                value: "0".into(),
            });
        }
        let agent_timeout_secs = env_parse(env, "CONTEXTD_AGENT_TIMEOUT_SECS")?
            .or(file.agent_timeout_secs)
            .unwrap_or(DEFAULT_AGENT_TIMEOUT_SECS);

        Ok(Self {
            project_dir,
            db_path,
            event_log,
            poll_interval: Duration::from_millis(poll_ms),
            agent_timeout: Duration::from_secs(agent_timeout_secs),
            model: env_value(env, "CONTEXTD_MODEL").map(String::from).or(file.model),
            summary_url: env_value(env, "CONTEXTD_SUMMARY_URL")
                .map(String::from)
                .or(file.summary_url)
                .unwrap_or_else(|| DEFAULT_SUMMARY_URL.to_string()),
            summary_model: env_value(env, "CONTEXTD_SUMMARY_MODEL")
                .map(String::from)
                .or(file.summary_model)
                .unwrap_or_else(|| DEFAULT_SUMMARY_MODEL.to_string()),
            summary_max_tokens: env_parse(env, "CONTEXTD_SUMMARY_MAX_TOKENS")?
                .or(file.summary_max_tokens)
                .unwrap_or(DEFAULT_SUMMARY_MAX_TOKENS),
            api_key: env_value(env, "ANTHROPIC_API_KEY").map(String::from),
            data_dir,
        })
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}
