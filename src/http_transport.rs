//! Loopback HTTP transport (HTTP mode and development).

use reqwest::Method;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::envelope::{flatten_headers, RequestEnvelope, ResponseEnvelope};

#[derive(Error, Debug)]
pub enum HttpTransportError {
    #[error("Invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Resolve `request.path` against `base` and append the query pairs.
/// The request always stays on `base`'s host.
pub fn build_url(base: &str, request: &RequestEnvelope) -> Result<Url, HttpTransportError> {
    Ok(request.resolve_url(&Url::parse(base)?))
}

/// Client without connection reuse; every call is one fresh exchange.
pub fn loopback_client() -> Result<reqwest::Client, HttpTransportError> {
    Ok(reqwest::Client::builder()
        .no_proxy()
        .pool_max_idle_per_host(0)
        .build()?)
}

pub async fn send_http(
    client: &reqwest::Client,
    base: &str,
    request: &RequestEnvelope,
    timeout: Option<Duration>,
) -> Result<ResponseEnvelope, HttpTransportError> {
    let url = build_url(base, request)?;
    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|_| HttpTransportError::InvalidMethod(request.method.clone()))?;

    debug!("HTTP {} {}", method, url);
    let mut builder = client.request(method, url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.to_bytes());
    }
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = flatten_headers(response.headers());
    let body = response.text().await?;

    Ok(ResponseEnvelope {
        status,
        headers,
        body,
    })
}
