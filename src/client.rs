//! Dual-transport request client.
//!
//! The surface the UI-facing layer calls. Every request asks the bridge for
//! the current transport, then goes out either as loopback HTTP or through
//! the bridge's `make-uds-request`. Both paths return the same
//! [`ResponseEnvelope`] shape. No retries.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::bridge::{IpcConfig, PrivilegedBridge, UdsRequestConfig};
use crate::envelope::{QueryValue, RequestBody, RequestEnvelope, ResponseEnvelope};
use crate::http_transport::{loopback_client, send_http, HttpTransportError};
use crate::registry::RegistryError;
use crate::transport::{TransportMode, LOOPBACK_HOST};

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("{mode} request failed: {message}")]
    Transport { mode: TransportMode, message: String },

    #[error("Bridge call failed: {0}")]
    Bridge(String),

    #[error("Malformed bridge response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    NotReady(#[from] RegistryError),
}

impl From<HttpTransportError> for RequestError {
    fn from(error: HttpTransportError) -> Self {
        RequestError::Transport {
            mode: TransportMode::Http,
            message: error.to_string(),
        }
    }
}

/// Optional parts of a request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, QueryValue>,
    pub body: Option<RequestBody>,
}

impl RequestOptions {
    pub fn query(mut self, key: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }
}

#[derive(Clone)]
pub struct ApiClient {
    bridge: Arc<PrivilegedBridge>,
    http: reqwest::Client,
    timeout: Option<Duration>,
}

impl ApiClient {
    pub fn new(bridge: Arc<PrivilegedBridge>) -> Result<Self, RequestError> {
        Ok(Self {
            bridge,
            http: loopback_client()?,
            timeout: None,
        })
    }

    /// Per-request timeout for HTTP mode. Unset means wait indefinitely.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resolves once the backend is running. Await this once instead of
    /// polling.
    pub async fn ready(&self) -> Result<IpcConfig, RequestError> {
        let config = self.bridge.registry().ready().await?;
        Ok(IpcConfig::from(&config))
    }

    pub async fn request(
        &self,
        method: &str,
        path: &str,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope, RequestError> {
        let mut request = RequestEnvelope::new(method, path);
        request.headers = options.headers;
        request.query = options.query;
        request.body = options.body;

        let config = self.ipc_config().await?;
        match config.mode {
            TransportMode::Http => self.send_via_http(&config, request).await,
            TransportMode::Uds => self.send_via_bridge(&config, &request).await,
        }
    }

    pub async fn get(
        &self,
        path: &str,
        query: BTreeMap<String, QueryValue>,
    ) -> Result<ResponseEnvelope, RequestError> {
        let options = RequestOptions {
            query,
            ..RequestOptions::default()
        };
        self.request("GET", path, options).await
    }

    /// `body`, when given, replaces any body already set on `options`.
    pub async fn post(
        &self,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope, RequestError> {
        self.request("POST", path, with_json(options, body)).await
    }

    pub async fn put(
        &self,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope, RequestError> {
        self.request("PUT", path, with_json(options, body)).await
    }

    pub async fn delete(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope, RequestError> {
        self.request("DELETE", path, options).await
    }

    // Read fresh on every call; never cached on the client.
    async fn ipc_config(&self) -> Result<IpcConfig, RequestError> {
        let value = self
            .bridge
            .invoke(json!({ "command": "get-ipc-config" }))
            .await
            .map_err(RequestError::Bridge)?;
        serde_json::from_value(value).map_err(|e| RequestError::InvalidResponse(e.to_string()))
    }

    async fn send_via_http(
        &self,
        config: &IpcConfig,
        mut request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, RequestError> {
        let port = config.port.ok_or(RegistryError::BackendNotRunning)?;
        request.ensure_content_type();
        let base = format!("http://{}:{}", LOOPBACK_HOST, port);
        Ok(send_http(&self.http, &base, &request, self.timeout).await?)
    }

    async fn send_via_bridge(
        &self,
        config: &IpcConfig,
        request: &RequestEnvelope,
    ) -> Result<ResponseEnvelope, RequestError> {
        let request_config = UdsRequestConfig::from_envelope(request, config.uds_path.clone());
        debug!("Routing {} {} through make-uds-request", request.method, request.path);
        let value = self
            .bridge
            .invoke(json!({ "command": "make-uds-request", "requestConfig": request_config }))
            .await
            .map_err(|message| RequestError::Transport {
                mode: TransportMode::Uds,
                message,
            })?;
        serde_json::from_value(value).map_err(|e| RequestError::InvalidResponse(e.to_string()))
    }
}

fn with_json(options: RequestOptions, body: Option<Value>) -> RequestOptions {
    match body {
        Some(body) => options.json(body),
        None => options,
    }
}
