//! Gateway configuration loaded from `<config_dir>/cligate/config.json`.
//!
//! Every field has a default, so a missing file or a partial file is fine.
//! A few fields can be overridden from the environment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::backends::BackendKind;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Per-backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Executable name or path; defaults to the backend id.
    pub command: Option<String>,
    pub default_model: Option<String>,
    /// Grants the tool unattended local execution. Off unless set explicitly.
    pub tools_enabled: bool,
    /// Resume the tool's own conversation across turns of one session.
    pub session_continuity: bool,
    /// Retries after early, content-free failures. Defaults to 2 for claude, 1 for codex, 0 for gemini.
    pub max_retries: Option<u32>,
    pub retry_delay_ms: u64,
    /// Extra environment variables passed through to the subprocess.
    pub env_allow: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub enabled: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: None,
            default_model: None,
            tools_enabled: false,
            session_continuity: true,
            max_retries: None,
            retry_delay_ms: 1000,
            env_allow: Vec::new(),
            working_dir: None,
            enabled: true,
        }
    }
}

impl BackendConfig {
    pub fn command(&self, kind: BackendKind) -> String {
        self.command
            .clone()
            .unwrap_or_else(|| kind.as_str().to_string())
    }

    pub fn max_retries(&self, kind: BackendKind) -> u32 {
        self.max_retries.unwrap_or(match kind {
            BackendKind::Claude => 2,
            // Codex drops its transport mid-turn and sometimes gives up before any output.
            BackendKind::Codex => 1,
            BackendKind::Gemini => 0,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub session_ttl_secs: u64,
    pub prune_interval_secs: u64,
    /// Where session metadata is persisted between restarts, if anywhere.
    pub session_file: Option<PathBuf>,
    pub backends: HashMap<BackendKind, BackendConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            session_ttl_secs: 24 * 60 * 60,
            prune_interval_secs: 10 * 60,
            session_file: None,
            backends: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    pub fn backend(&self, kind: BackendKind) -> BackendConfig {
        self.backends.get(&kind).cloned().unwrap_or_default()
    }

    /// Applies `CLIGATE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("CLIGATE_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("CLIGATE_PORT") {
            self.port = port.parse().map_err(|_| ConfigError::Invalid {
                key: "CLIGATE_PORT",
                value: port,
            })?;
        }
        if let Some(ttl) = lookup("CLIGATE_SESSION_TTL_SECS") {
            self.session_ttl_secs = ttl.parse().map_err(|_| ConfigError::Invalid {
                key: "CLIGATE_SESSION_TTL_SECS",
                value: ttl,
            })?;
        }
        Ok(())
    }
}

/// Get the default config file path.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("cligate").join("config.json"))
}

/// Loads the config from `path`, or from the default location when `None`.
///
/// An explicit path must exist; a missing default file yields defaults.
pub fn load_config(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let mut config = match path {
        Some(path) => parse_file(path)?,
        None => match default_config_path() {
            Some(path) if path.exists() => parse_file(&path)?,
            _ => GatewayConfig::default(),
        },
    };
    config.apply_env_overrides()?;
    Ok(config)
}

fn parse_file(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config = serde_json::from_str(&content)?;
    log::info!("Loaded config from {}", path.display());
    Ok(config)
}

const BASE_ENV_ALLOW: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "LANG",
    "LC_ALL",
    "TERM",
    "TMPDIR",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
];

fn backend_env_allow(kind: BackendKind) -> &'static [&'static str] {
    match kind {
        BackendKind::Claude => &[
            "ANTHROPIC_API_KEY",
            "ANTHROPIC_BASE_URL",
            "ANTHROPIC_AUTH_TOKEN",
            "CLAUDE_CONFIG_DIR",
        ],
        BackendKind::Codex => &["OPENAI_API_KEY", "OPENAI_BASE_URL", "CODEX_HOME"],
        BackendKind::Gemini => &[
            "GEMINI_API_KEY",
            "GOOGLE_API_KEY",
            "GOOGLE_CLOUD_PROJECT",
            "GOOGLE_APPLICATION_CREDENTIALS",
        ],
    }
}

/// Minimal environment for one backend's subprocesses, taken from the gateway's own.
pub fn backend_env(kind: BackendKind, extra: &[String]) -> HashMap<String, String> {
    backend_env_from(kind, extra, std::env::vars())
}

fn backend_env_from(
    kind: BackendKind,
    extra: &[String],
    vars: impl IntoIterator<Item = (String, String)>,
) -> HashMap<String, String> {
    let tool_allow = backend_env_allow(kind);
    vars.into_iter()
        .filter(|(key, _)| {
            BASE_ENV_ALLOW.contains(&key.as_str())
                || tool_allow.contains(&key.as_str())
                || extra.iter().any(|allowed| allowed == key)
        })
        .collect()
}
