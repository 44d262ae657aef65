//! In-process stand-in for the simulation backend, used by unit tests.
//!
//! Routes:
//! - `GET /health` answers `{"message":"ok"}`
//! - `* /echo...` answers with the method, request target, body and `x-trace`
//!   header it received
//! - everything else is a 404

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct MockBackend {
    pub port: Option<u16>,
    task: JoinHandle<()>,
}

impl MockBackend {
    pub async fn serve_tcp() -> Self {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .expect("bind mock backend");
        let port = listener.local_addr().expect("mock addr").port();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream));
            }
        });
        Self {
            port: Some(port),
            task,
        }
    }

    #[cfg(unix)]
    pub async fn serve_uds(path: &std::path::Path) -> Self {
        let _ = std::fs::remove_file(path);
        let listener = tokio::net::UnixListener::bind(path).expect("bind mock socket");
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream));
            }
        });
        Self { port: None, task }
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port.unwrap_or_default())
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _ = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service_fn(route))
        .await;
}

async fn route(request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let trace = header("x-trace");
    let content_type = header("content-type");
    let body = request
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    let (status, payload) = match (method.as_str(), path.as_str()) {
        ("GET", "/health") => (StatusCode::OK, json!({ "message": "ok" })),
        (_, path) if path.starts_with("/echo") => (
            StatusCode::OK,
            json!({
                "method": method,
                "target": target,
                "body": String::from_utf8_lossy(&body),
                "trace": trace,
                "contentType": content_type,
            }),
        ),
        _ => (StatusCode::NOT_FOUND, json!({ "detail": "Not Found" })),
    };

    let mut response = Response::new(Full::new(Bytes::from(payload.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}
