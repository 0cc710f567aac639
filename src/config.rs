use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domains::assistant::InputFormat;

pub const APP_DIR_NAME: &str = "claude-bridge";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub log_level: String,
    pub database: DatabaseConfig,
    pub session: SessionConfig,
    pub assistant: AssistantConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Root for cached repositories and per-session workspaces.
    pub work_dir: PathBuf,
    pub max_sessions_per_user: u32,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Channels in which sessions may never be started.
    pub reserved_channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub executable: String,
    pub args: Vec<String>,
    pub model_flag: String,
    pub resume_flag: String,
    pub models: Vec<String>,
    pub input_format: InputFormat,
    /// Line written before closing stdin on a graceful stop.
    pub exit_sentinel: Option<String>,
    pub response_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub env: Vec<(String, String)>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            database: DatabaseConfig::default(),
            session: SessionConfig::default(),
            assistant: AssistantConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./claude-bridge.db"),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./sessions"),
            max_sessions_per_user: 5,
            idle_timeout_secs: 3600,
            sweep_interval_secs: 300,
            reserved_channels: vec!["general".to_string()],
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            executable: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "--input-format".to_string(),
                "stream-json".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            model_flag: "--model".to_string(),
            resume_flag: "--resume".to_string(),
            models: vec!["sonnet".to_string(), "opus".to_string()],
            input_format: InputFormat::StreamJson,
            exit_sentinel: Some("exit".to_string()),
            response_timeout_secs: 30,
            stop_grace_secs: 5,
            shutdown_timeout_secs: 30,
            env: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.work_dir.join("repos")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.work_dir.join("worktrees")
    }
}

impl AssistantConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn allows_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join("config.toml"))
}

impl BridgeConfig {
    /// Reads `path` (or the default location when it exists), then applies
    /// process environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(explicit) => Some(explicit.to_path_buf()),
            None => default_config_path().filter(|p| p.exists()),
        };

        let mut config = match file {
            Some(file) => Self::from_file(&file)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("WORK_DIR") {
            self.session.work_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("MAX_SESSIONS_PER_USER") {
            self.session.max_sessions_per_user = raw
                .trim()
                .parse()
                .with_context(|| format!("MAX_SESSIONS_PER_USER must be a number, got '{raw}'"))?;
        }
        if let Some(raw) = lookup("SESSION_IDLE_TIMEOUT") {
            self.session.idle_timeout_secs = raw
                .trim()
                .parse()
                .with_context(|| format!("SESSION_IDLE_TIMEOUT must be seconds, got '{raw}'"))?;
        }
        if let Some(path) = lookup("CLAUDE_CODE_PATH") {
            self.assistant.executable = path;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.max_sessions_per_user == 0 {
            return Err(anyhow!("max_sessions_per_user must be positive"));
        }
        if self.session.idle_timeout_secs == 0 {
            return Err(anyhow!("idle_timeout_secs must be positive"));
        }
        if self.session.sweep_interval_secs == 0 {
            return Err(anyhow!("sweep_interval_secs must be positive"));
        }
        if self.assistant.executable.trim().is_empty() {
            return Err(anyhow!("assistant executable must not be empty"));
        }
        if self.assistant.models.is_empty() {
            return Err(anyhow!("at least one assistant model must be allowed"));
        }
        if self.assistant.response_timeout_secs == 0
            || self.assistant.stop_grace_secs == 0
            || self.assistant.shutdown_timeout_secs == 0
        {
            return Err(anyhow!("assistant timeouts must be positive"));
        }
        Ok(())
    }
}
