//! HTTP/1.1 over a Unix-domain socket.
//!
//! Each call opens a fresh connection, performs exactly one exchange and
//! drops the connection. No pooling, no keep-alive.

use std::path::Path;
use thiserror::Error;

use crate::envelope::{RequestEnvelope, ResponseEnvelope};

#[derive(Error, Debug)]
pub enum UdsError {
    #[error("Failed to connect to {path}: {source}")]
    Connect {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("HTTP exchange failed: {0}")]
    Http(String),

    #[error("Unix-domain sockets are not supported on this platform")]
    Unsupported,
}

#[cfg(unix)]
pub async fn send_over_uds(
    socket_path: &Path,
    request: &RequestEnvelope,
) -> Result<ResponseEnvelope, UdsError> {
    unix::send(socket_path, request).await
}

#[cfg(not(unix))]
pub async fn send_over_uds(
    _socket_path: &Path,
    _request: &RequestEnvelope,
) -> Result<ResponseEnvelope, UdsError> {
    Err(UdsError::Unsupported)
}

#[cfg(unix)]
mod unix {
    use super::UdsError;
    use crate::envelope::{flatten_headers, RequestEnvelope, ResponseEnvelope};
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::header::{CONNECTION, CONTENT_LENGTH, HOST};
    use hyper::{Method, Request};
    use hyper_util::rt::TokioIo;
    use std::path::Path;
    use tokio::net::UnixStream;
    use tracing::{debug, warn};

    pub(super) async fn send(
        socket_path: &Path,
        request: &RequestEnvelope,
    ) -> Result<ResponseEnvelope, UdsError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| UdsError::InvalidRequest(format!("method {}", request.method)))?;
        let target = request
            .path_and_query()
            .map_err(|e| UdsError::InvalidRequest(e.to_string()))?;
        let body = request
            .body
            .as_ref()
            .map(|b| Bytes::from(b.to_bytes()))
            .unwrap_or_default();

        let mut builder = Request::builder()
            .method(method)
            .uri(target.as_str())
            .header(HOST, "localhost")
            .header(CONNECTION, "close");
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !body.is_empty() {
            builder = builder.header(CONTENT_LENGTH, body.len());
        }
        let http_request = builder
            .body(Full::new(body))
            .map_err(|e| UdsError::InvalidRequest(e.to_string()))?;

        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|source| UdsError::Connect {
                path: socket_path.display().to_string(),
                source,
            })?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| UdsError::Http(e.to_string()))?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("UDS connection ended with error: {}", e);
            }
        });

        debug!("UDS {} {} via {:?}", request.method, target, socket_path);
        let result = async {
            let response = sender
                .send_request(http_request)
                .await
                .map_err(|e| UdsError::Http(e.to_string()))?;
            let status = response.status().as_u16();
            let headers = flatten_headers(response.headers());
            let collected = response
                .into_body()
                .collect()
                .await
                .map_err(|e| UdsError::Http(e.to_string()))?
                .to_bytes();
            Ok::<_, UdsError>(ResponseEnvelope {
                status,
                headers,
                body: String::from_utf8_lossy(&collected).into_owned(),
            })
        }
        .await;

        drop(sender);
        driver.abort();
        result
    }
}
