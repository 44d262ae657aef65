//! IPC Config Registry
//!
//! Read-side view of the transport the supervisor chose. The supervisor holds
//! the only [`ConfigPublisher`]; everything else gets a [`ConfigRegistry`],
//! which can read the current config or wait for it once.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::transport::TransportConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Backend not running")]
    BackendNotRunning,

    #[error("Backend supervisor shut down")]
    SupervisorGone,
}

/// Creates a connected publisher/registry pair with nothing published.
pub fn config_channel() -> (ConfigPublisher, ConfigRegistry) {
    let (tx, rx) = watch::channel(None);
    (
        ConfigPublisher { tx: Arc::new(tx) },
        ConfigRegistry { rx },
    )
}

/// Write side, owned by the supervisor.
#[derive(Debug, Clone)]
pub struct ConfigPublisher {
    tx: Arc<watch::Sender<Option<TransportConfig>>>,
}

impl ConfigPublisher {
    pub(crate) fn publish(&self, config: TransportConfig) {
        self.tx.send_replace(Some(config));
    }

    pub(crate) fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn registry(&self) -> ConfigRegistry {
        ConfigRegistry {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigRegistry {
    rx: watch::Receiver<Option<TransportConfig>>,
}

impl ConfigRegistry {
    /// Registry pinned to a backend started outside this process.
    pub fn attached(config: TransportConfig) -> Self {
        let (_tx, rx) = watch::channel(Some(config));
        Self { rx }
    }

    pub fn get_config(&self) -> Result<TransportConfig, RegistryError> {
        self.rx
            .borrow()
            .clone()
            .ok_or(RegistryError::BackendNotRunning)
    }

    pub fn get_api_port(&self) -> Result<u16, RegistryError> {
        self.get_config()?
            .http_port()
            .ok_or(RegistryError::BackendNotRunning)
    }

    /// Resolves once a config has been published.
    pub async fn ready(&self) -> Result<TransportConfig, RegistryError> {
        let mut rx = self.rx.clone();
        let config = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RegistryError::SupervisorGone)?;
        config.clone().ok_or(RegistryError::BackendNotRunning)
    }
}
