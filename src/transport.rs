//! Transport selection and the environment handed to the backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

use crate::platform::Platform;

pub const ENV_API_PORT: &str = "ZSIM_API_PORT";
pub const ENV_API_HOST: &str = "ZSIM_API_HOST";
pub const ENV_IPC_MODE: &str = "ZSIM_IPC_MODE";
pub const ENV_UDS_PATH: &str = "ZSIM_UDS_PATH";
/// Name the backend's own IPC server reads the socket path from.
pub const ENV_IPC_UDS_PATH: &str = "ZSIM_IPC_UDS_PATH";

pub const LOOPBACK_HOST: &str = "127.0.0.1";
pub const DEFAULT_SOCKET_NAME: &str = "zsim_api.sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Http,
    Uds,
}

impl TransportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportMode::Http => "http",
            TransportMode::Uds => "uds",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(TransportMode::Http),
            "uds" => Ok(TransportMode::Uds),
            other => Err(format!("unknown transport mode: {}", other)),
        }
    }
}

/// Windows has no Unix-domain sockets to rely on, so it always gets HTTP.
pub fn select_transport(platform: Platform) -> TransportMode {
    if platform.is_windows() {
        TransportMode::Http
    } else {
        TransportMode::Uds
    }
}

/// Like [`select_transport`], honouring a configured override where the
/// platform allows it.
pub fn resolve_transport(platform: Platform, requested: Option<TransportMode>) -> TransportMode {
    match requested {
        Some(TransportMode::Uds) if platform.is_windows() => {
            warn!("UDS transport requested on Windows, falling back to HTTP");
            TransportMode::Http
        }
        Some(mode) => mode,
        None => select_transport(platform),
    }
}

pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_SOCKET_NAME)
}

// ============================================================================
// Transport Config
// ============================================================================

/// The transport chosen at startup. Build through [`TransportConfig::http`] or
/// [`TransportConfig::uds`] so that exactly one endpoint is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    mode: TransportMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    http_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    socket_path: Option<PathBuf>,
}

impl TransportConfig {
    pub fn http(port: u16) -> Self {
        Self {
            mode: TransportMode::Http,
            http_port: Some(port),
            socket_path: None,
        }
    }

    pub fn uds(path: impl Into<PathBuf>) -> Self {
        Self {
            mode: TransportMode::Uds,
            http_port: None,
            socket_path: Some(path.into()),
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn http_port(&self) -> Option<u16> {
        self.http_port
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// Base URL for HTTP mode.
    pub fn base_url(&self) -> Option<String> {
        self.http_port
            .map(|port| format!("http://{}:{}", LOOPBACK_HOST, port))
    }

    /// Variables injected into the spawned backend.
    pub fn backend_env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![(ENV_IPC_MODE, self.mode.as_str().to_string())];
        match self.mode {
            TransportMode::Http => {
                if let Some(port) = self.http_port {
                    env.push((ENV_API_PORT, port.to_string()));
                }
                env.push((ENV_API_HOST, LOOPBACK_HOST.to_string()));
            }
            TransportMode::Uds => {
                if let Some(path) = &self.socket_path {
                    let path = path.to_string_lossy().to_string();
                    env.push((ENV_UDS_PATH, path.clone()));
                    env.push((ENV_IPC_UDS_PATH, path));
                }
            }
        }
        env
    }
}
