//! Configuration file, environment overrides, and validation.
//!
//! The on-disk [`AppConfig`] mirrors the TOML file. It is validated once at
//! startup into a [`GatewayConfig`] holding the values the request path
//! actually consumes.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::{AgentSettings, ImageStore, KILL_GRACE};
use crate::session::SessionStoreConfig;

pub const APP_NAME: &str = "agentgate";

/// Errors raised while turning [`AppConfig`] into a [`GatewayConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("environment variable {0} referenced by the config is not set")]
    EnvVarNotFound(String),

    #[error("environment variable {0} referenced by the config is empty")]
    EnvVarEmpty(String),

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("agent.binary must not be empty")]
    EmptyBinary,

    #[error("could not expand path {0}")]
    BadPath(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub sessions: SessionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token clients must present. `env:VAR` reads it from the
    /// environment. Unset disables authentication.
    pub api_key: Option<String>,
    /// CORS origins. Empty allows any origin.
    pub allowed_origins: Vec<String>,
    /// Maximum request body size in megabytes.
    pub max_body_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            api_key: None,
            allowed_origins: Vec::new(),
            max_body_mb: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub binary: String,
    pub default_model: String,
    pub permission_mode: String,
    pub max_turns: u32,
    pub timeout_secs: u64,
    pub default_cwd: String,
    /// Ask new conversations for a working directory before running.
    pub confirm_workdir: bool,
    /// Where inline images are written. Defaults to a private temp dir.
    pub image_dir: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            default_model: "sonnet".to_string(),
            permission_mode: "bypassPermissions".to_string(),
            max_turns: 25,
            timeout_secs: 600,
            default_cwd: "~".to_string(),
            confirm_workdir: true,
            image_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub ttl_secs: u64,
    /// JSON file the session map is persisted to. Unset keeps it in memory.
    pub persist_path: Option<String>,
    pub flush_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 86_400,
            persist_path: None,
            flush_interval_secs: 30,
        }
    }
}

impl AppConfig {
    /// Load `path` (if it exists) layered under `AGENTGATE__*` environment
    /// variables.
    pub fn load(path: &Path) -> Result<Self> {
        let prefix = env_prefix();
        let built = Config::builder()
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(Environment::with_prefix(prefix.as_str()).separator("__"))
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;

        let mut config: AppConfig = built
            .try_deserialize()
            .with_context(|| format!("parsing config from {}", path.display()))?;

        if let Some(ref file) = config.logging.file {
            let expanded = expand_str_path(file)?;
            config.logging.file = Some(expanded.display().to_string());
        }

        Ok(config)
    }

    /// Validate and resolve into the runtime configuration.
    pub fn validate(&self) -> Result<GatewayConfig, ConfigValidationError> {
        self.validate_with(|name| env::var(name).ok())
    }

    fn validate_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<GatewayConfig, ConfigValidationError> {
        if self.agent.binary.trim().is_empty() {
            return Err(ConfigValidationError::EmptyBinary);
        }
        if self.agent.timeout_secs == 0 {
            return Err(ConfigValidationError::NotPositive("agent.timeout_secs"));
        }
        if self.agent.max_turns == 0 {
            return Err(ConfigValidationError::NotPositive("agent.max_turns"));
        }
        if self.sessions.ttl_secs == 0 {
            return Err(ConfigValidationError::NotPositive("sessions.ttl_secs"));
        }
        if self.sessions.flush_interval_secs == 0 {
            return Err(ConfigValidationError::NotPositive(
                "sessions.flush_interval_secs",
            ));
        }

        let api_key = self
            .server
            .api_key
            .as_deref()
            .map(|value| resolve_secret(value, &lookup))
            .transpose()?;

        let expand = |text: &str| {
            expand_str_path(text).map_err(|_| ConfigValidationError::BadPath(text.to_string()))
        };

        let binary = if self.agent.binary.contains('/') || self.agent.binary.starts_with('~') {
            expand(&self.agent.binary)?
        } else {
            PathBuf::from(&self.agent.binary)
        };
        let image_dir = match &self.agent.image_dir {
            Some(dir) => expand(dir)?,
            None => ImageStore::default_dir(),
        };
        let persist_path = self
            .sessions
            .persist_path
            .as_deref()
            .map(expand)
            .transpose()?;

        Ok(GatewayConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            api_key,
            allowed_origins: self.server.allowed_origins.clone(),
            max_body_bytes: self.server.max_body_mb.max(1) * 1024 * 1024,
            agent: AgentSettings {
                binary,
                permission_mode: self.agent.permission_mode.clone(),
                max_turns: self.agent.max_turns,
                timeout: Some(Duration::from_secs(self.agent.timeout_secs)),
                kill_grace: KILL_GRACE,
            },
            default_model: self.agent.default_model.clone(),
            default_cwd: expand(&self.agent.default_cwd)?,
            confirm_workdir: self.agent.confirm_workdir,
            image_dir,
            sessions: SessionStoreConfig {
                ttl: Duration::from_secs(self.sessions.ttl_secs),
                persist_path,
                flush_interval: Duration::from_secs(self.sessions.flush_interval_secs),
            },
        })
    }
}

/// Values consumed at runtime, already validated.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub allowed_origins: Vec<String>,
    pub max_body_bytes: usize,
    pub agent: AgentSettings,
    pub default_model: String,
    pub default_cwd: PathBuf,
    pub confirm_workdir: bool,
    pub image_dir: PathBuf,
    pub sessions: SessionStoreConfig,
}

/// Resolve a secret, expanding `env:VAR_NAME` syntax.
fn resolve_secret(
    value: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigValidationError> {
    let Some(var_name) = value.strip_prefix("env:") else {
        return Ok(value.to_string());
    };
    match lookup(var_name) {
        Some(secret) if !secret.is_empty() => Ok(secret),
        Some(_) => Err(ConfigValidationError::EnvVarEmpty(var_name.to_string())),
        None => Err(ConfigValidationError::EnvVarNotFound(var_name.to_string())),
    }
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!(
        "# Configuration for {APP_NAME}\n# File: {}\n#\n# Every key can be overridden with {}__<SECTION>__<KEY> environment variables.\n\n",
        path.display(),
        env_prefix()
    )
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_config_file() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
