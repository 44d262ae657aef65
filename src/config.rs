//! Shell configuration.
//!
//! Resolution order: built-in defaults, then an optional JSON file, then
//! `ZSIM_*` environment variables.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::framing::DEFAULT_MAX_FRAME_LEN;
use crate::transport::{default_socket_path, TransportMode};

pub const ENV_DESKTOP_ENV: &str = "ZSIM_DESKTOP_ENV";
pub const ENV_DESKTOP_CONFIG: &str = "ZSIM_DESKTOP_CONFIG";
pub const ENV_PROJECT_ROOT: &str = "ZSIM_PROJECT_ROOT";
pub const ENV_RESOURCE_DIR: &str = "ZSIM_RESOURCE_DIR";
pub const ENV_READINESS: &str = "ZSIM_READINESS";
pub const ENV_STARTUP_GRACE_MS: &str = "ZSIM_STARTUP_GRACE_MS";
pub const ENV_STARTUP_TIMEOUT_MS: &str = "ZSIM_STARTUP_TIMEOUT_MS";
pub const ENV_FRAMED_SOCKET: &str = "ZSIM_FRAMED_SOCKET";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_development(self) -> bool {
        self == Environment::Development
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Environment::Development),
            "production" | "prod" => Some(Environment::Production),
            _ => None,
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Environment::Development
        } else {
            Environment::Production
        }
    }
}

/// How `start` decides that the backend is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadinessPolicy {
    /// Assume readiness once a fixed period has elapsed.
    Grace { period_ms: u64 },
    /// Poll `GET /health` with exponential backoff until it answers 2xx.
    HealthCheck {
        initial_backoff_ms: u64,
        max_backoff_ms: u64,
        timeout_ms: u64,
    },
}

impl ReadinessPolicy {
    pub fn grace(period: Duration) -> Self {
        ReadinessPolicy::Grace {
            period_ms: period.as_millis() as u64,
        }
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        ReadinessPolicy::HealthCheck {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            timeout_ms: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShellConfig {
    pub environment: Environment,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub socket_path: PathBuf,
    pub project_root: PathBuf,
    pub resource_dir: PathBuf,
    pub readiness: ReadinessPolicy,
    pub max_frame_len: usize,
    pub stop_timeout_ms: u64,
    pub transport_override: Option<TransportMode>,
    /// When set, a framed IPC gateway listens here and forwards to an
    /// HTTP-mode backend.
    pub framed_socket: Option<PathBuf>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        let resource_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            environment: Environment::default(),
            port_range_start: 8000,
            port_range_end: 8100,
            socket_path: default_socket_path(),
            project_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            resource_dir,
            readiness: ReadinessPolicy::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            stop_timeout_ms: 5_000,
            transport_override: None,
            framed_socket: None,
        }
    }
}

impl ShellConfig {
    /// Defaults, overlaid by the config file (if any) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_file_path() {
            Some(path) if path.is_file() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded shell config from {:?}", path);
        Ok(config)
    }

    /// Apply `ZSIM_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = non_empty(ENV_DESKTOP_ENV) {
            match Environment::parse(&value) {
                Some(env) => self.environment = env,
                None => warn!("Ignoring {}={}", ENV_DESKTOP_ENV, value),
            }
        }
        if let Some(value) = non_empty(crate::transport::ENV_UDS_PATH) {
            self.socket_path = PathBuf::from(value);
        }
        if let Some(value) = non_empty(ENV_PROJECT_ROOT) {
            self.project_root = PathBuf::from(value);
        }
        if let Some(value) = non_empty(ENV_RESOURCE_DIR) {
            self.resource_dir = PathBuf::from(value);
        }
        if let Some(value) = non_empty(ENV_FRAMED_SOCKET) {
            self.framed_socket = Some(PathBuf::from(value));
        }
        if let Some(value) = non_empty(crate::transport::ENV_IPC_MODE) {
            match value.parse::<TransportMode>() {
                Ok(mode) => self.transport_override = Some(mode),
                Err(e) => warn!("Ignoring {}: {}", crate::transport::ENV_IPC_MODE, e),
            }
        }

        let grace_ms = non_empty(ENV_STARTUP_GRACE_MS).and_then(|v| v.trim().parse::<u64>().ok());
        let timeout_ms =
            non_empty(ENV_STARTUP_TIMEOUT_MS).and_then(|v| v.trim().parse::<u64>().ok());
        match non_empty(ENV_READINESS).as_deref().map(str::trim) {
            Some("grace") => {
                self.readiness = ReadinessPolicy::Grace {
                    period_ms: grace_ms.unwrap_or(3_000),
                };
            }
            Some("health") => {
                self.readiness = ReadinessPolicy::default();
            }
            Some(other) => warn!("Ignoring {}={}", ENV_READINESS, other),
            None => {}
        }
        match &mut self.readiness {
            ReadinessPolicy::Grace { period_ms } => {
                if let Some(ms) = grace_ms {
                    *period_ms = ms;
                }
            }
            ReadinessPolicy::HealthCheck { timeout_ms: t, .. } => {
                if let Some(ms) = timeout_ms {
                    *t = ms;
                }
            }
        }
        debug!("Effective shell config: {:?}", self);
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(ENV_DESKTOP_CONFIG) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir().map(|dir| dir.join("zsim").join("desktop.json"))
}
