//! ZSim Desktop - Privileged Bridge
//!
//! The call surface the unprivileged UI layer may invoke. Commands arrive as
//! JSON values tagged by `command`, results leave as JSON values, and errors
//! are flattened to strings at the boundary.
//!
//! Only reads are exposed; the transport config cannot be mutated from here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info_span, Instrument};
use uuid::Uuid;

use crate::envelope::{QueryValue, RequestBody, RequestEnvelope, ResponseEnvelope};
use crate::registry::{ConfigRegistry, RegistryError};
use crate::supervisor::{BackendState, BackendStatus, BackendSupervisor};
use crate::transport::{TransportConfig, TransportMode};
use crate::uds_proxy::{send_over_uds, UdsError};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Backend is not using a Unix-domain socket")]
    NotUdsMode,

    #[error("Socket {requested} does not belong to the running backend")]
    SocketMismatch { requested: String },

    #[error(transparent)]
    Uds(#[from] UdsError),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

// ============================================================================
// Command Input/Output Types
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum BridgeCommand {
    GetApiPort,
    GetIpcConfig,
    MakeUdsRequest {
        #[serde(rename = "requestConfig")]
        request_config: UdsRequestConfig,
    },
    GetBackendStatus,
}

impl BridgeCommand {
    fn name(&self) -> &'static str {
        match self {
            BridgeCommand::GetApiPort => "get-api-port",
            BridgeCommand::GetIpcConfig => "get-ipc-config",
            BridgeCommand::MakeUdsRequest { .. } => "make-uds-request",
            BridgeCommand::GetBackendStatus => "get-backend-status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcConfig {
    pub mode: TransportMode,
    pub port: Option<u16>,
    #[serde(rename = "udsPath")]
    pub uds_path: Option<String>,
}

impl From<&TransportConfig> for IpcConfig {
    fn from(config: &TransportConfig) -> Self {
        Self {
            mode: config.mode(),
            port: config.http_port(),
            uds_path: config.socket_path().map(|p| p.display().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdsRequestConfig {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<RequestBody>,
    #[serde(default)]
    pub query: BTreeMap<String, QueryValue>,
    #[serde(rename = "udsPath", default)]
    pub uds_path: Option<String>,
}

impl UdsRequestConfig {
    pub fn from_envelope(request: &RequestEnvelope, uds_path: Option<String>) -> Self {
        let request = request.with_text_body();
        Self {
            method: request.method,
            path: request.path,
            headers: request.headers,
            body: request.body,
            query: request.query,
            uds_path,
        }
    }

    fn into_envelope(self) -> RequestEnvelope {
        let mut request = RequestEnvelope::new(self.method, self.path);
        request.headers = self.headers;
        request.query = self.query;
        request.body = self.body;
        request
    }
}

// ============================================================================
// Bridge
// ============================================================================

pub struct PrivilegedBridge {
    registry: ConfigRegistry,
    supervisor: Option<Arc<BackendSupervisor>>,
}

impl PrivilegedBridge {
    pub fn new(supervisor: Arc<BackendSupervisor>) -> Self {
        Self {
            registry: supervisor.registry(),
            supervisor: Some(supervisor),
        }
    }

    /// Bridge over a registry with no supervisor behind it (externally
    /// managed backend).
    pub fn from_registry(registry: ConfigRegistry) -> Self {
        Self {
            registry,
            supervisor: None,
        }
    }

    pub fn registry(&self) -> &ConfigRegistry {
        &self.registry
    }

    pub fn get_api_port(&self) -> Result<u16, BridgeError> {
        Ok(self.registry.get_api_port()?)
    }

    pub fn get_ipc_config(&self) -> Result<IpcConfig, BridgeError> {
        Ok(IpcConfig::from(&self.registry.get_config()?))
    }

    /// Perform one HTTP exchange over the running backend's socket.
    pub async fn make_uds_request(
        &self,
        request_config: UdsRequestConfig,
    ) -> Result<ResponseEnvelope, BridgeError> {
        let config = self.registry.get_config()?;
        let active = config.socket_path().ok_or(BridgeError::NotUdsMode)?;
        if let Some(requested) = &request_config.uds_path {
            if PathBuf::from(requested) != active {
                return Err(BridgeError::SocketMismatch {
                    requested: requested.clone(),
                });
            }
        }
        let socket = active.to_path_buf();
        let request = request_config.into_envelope();
        Ok(send_over_uds(&socket, &request).await?)
    }

    pub fn get_backend_status(&self) -> BackendStatus {
        match &self.supervisor {
            Some(supervisor) => supervisor.status(),
            None => {
                let config = self.registry.get_config().ok();
                BackendStatus {
                    state: if config.is_some() {
                        BackendState::Running
                    } else {
                        BackendState::NotStarted
                    },
                    pid: None,
                    started_at: None,
                    mode: config.as_ref().map(TransportConfig::mode),
                }
            }
        }
    }

    pub async fn dispatch(&self, command: BridgeCommand) -> Result<Value, BridgeError> {
        let value = match command {
            BridgeCommand::GetApiPort => serde_json::to_value(self.get_api_port()?),
            BridgeCommand::GetIpcConfig => serde_json::to_value(self.get_ipc_config()?),
            BridgeCommand::MakeUdsRequest { request_config } => {
                serde_json::to_value(self.make_uds_request(request_config).await?)
            }
            BridgeCommand::GetBackendStatus => serde_json::to_value(self.get_backend_status()),
        };
        value.map_err(|e| BridgeError::InvalidCommand(e.to_string()))
    }

    /// Boundary entry point: JSON in, JSON or error string out.
    pub async fn invoke(&self, payload: Value) -> Result<Value, String> {
        let command: BridgeCommand = serde_json::from_value(payload).map_err(|e| {
            error!("Rejected bridge call: {}", e);
            BridgeError::InvalidCommand(e.to_string()).to_string()
        })?;

        let request_id = Uuid::new_v4();
        let span = info_span!("bridge", %request_id, command = command.name());
        async move {
            debug!("bridge command received");
            self.dispatch(command).await.map_err(|e| {
                error!("bridge command failed: {}", e);
                e.to_string()
            })
        }
        .instrument(span)
        .await
    }
}
