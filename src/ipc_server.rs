//! Framed IPC server.
//!
//! Accepts length-prefixed JSON [`RequestEnvelope`]s on a Unix socket and
//! answers each with a framed [`ResponseEnvelope`]. A connection carries any
//! number of sequential exchanges. Handler failures become `500` responses;
//! a bad frame closes the connection.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::http_transport::{loopback_client, send_http, HttpTransportError};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub trait RequestHandler: Send + Sync + 'static {
    fn handle(
        &self,
        request: RequestEnvelope,
    ) -> impl Future<Output = Result<ResponseEnvelope, HandlerError>> + Send;
}

/// Forwards framed requests to the loopback HTTP backend.
pub struct HttpForwarder {
    client: reqwest::Client,
    base_url: String,
    timeout: Option<Duration>,
}

impl HttpForwarder {
    pub fn new(base_url: impl Into<String>) -> Result<Self, HttpTransportError> {
        Ok(Self {
            client: loopback_client()?,
            base_url: base_url.into(),
            timeout: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl RequestHandler for HttpForwarder {
    async fn handle(&self, request: RequestEnvelope) -> Result<ResponseEnvelope, HandlerError> {
        Ok(send_http(&self.client, &self.base_url, &request, self.timeout).await?)
    }
}

/// Removes the socket file when dropped.
#[cfg(unix)]
struct SocketGuard(PathBuf);

#[cfg(unix)]
impl Drop for SocketGuard {
    fn drop(&mut self) {
        if self.0.exists() {
            if let Err(e) = std::fs::remove_file(&self.0) {
                warn!("Failed to remove socket {:?}: {}", self.0, e);
            }
        }
    }
}

#[cfg(unix)]
fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed stale socket {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
pub use self::unix::IpcServer;

#[cfg(unix)]
mod unix {
    use super::*;
    use crate::framing::{FrameCodec, FrameError};
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::{UnixListener, UnixStream};
    use tokio_util::codec::Framed;

    /// Pause after a failed accept so fd exhaustion does not spin the loop.
    const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

    pub struct IpcServer {
        listener: UnixListener,
        guard: SocketGuard,
        max_frame_len: usize,
    }

    impl IpcServer {
        pub fn bind(socket_path: &Path, max_frame_len: usize) -> std::io::Result<Self> {
            remove_stale_socket(socket_path)?;
            if let Some(parent) = socket_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let listener = UnixListener::bind(socket_path)?;
            info!("IPC server listening on {:?}", socket_path);
            Ok(Self {
                listener,
                guard: SocketGuard(socket_path.to_path_buf()),
                max_frame_len,
            })
        }

        pub fn socket_path(&self) -> &Path {
            &self.guard.0
        }

        /// Serve until `shutdown` resolves; the socket file is removed on return.
        pub async fn serve<H, S>(self, handler: Arc<H>, shutdown: S)
        where
            H: RequestHandler,
            S: Future<Output = ()>,
        {
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let handler = handler.clone();
                            let max_frame_len = self.max_frame_len;
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, handler, max_frame_len).await {
                                    warn!("IPC connection closed: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("IPC accept failed: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    },
                    _ = &mut shutdown => break,
                }
            }
            info!("IPC server on {:?} shutting down", self.socket_path());
        }
    }

    async fn serve_connection<H: RequestHandler>(
        stream: UnixStream,
        handler: Arc<H>,
        max_frame_len: usize,
    ) -> Result<(), FrameError> {
        let mut framed = Framed::new(stream, FrameCodec::with_max_frame_len(max_frame_len));
        while let Some(frame) = framed.next().await {
            let frame = frame?;
            let response = match serde_json::from_slice::<RequestEnvelope>(&frame) {
                Ok(request) => {
                    debug!("IPC {} {}", request.method, request.path);
                    handler
                        .handle(request)
                        .await
                        .unwrap_or_else(ResponseEnvelope::internal_error)
                }
                Err(e) => ResponseEnvelope::internal_error(format!("invalid request: {}", e)),
            };
            framed.send(Bytes::from(serde_json::to_vec(&response)?)).await?;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::framing::{encode_frame, request_framed, DEFAULT_MAX_FRAME_LEN};
    use crate::test_support::MockBackend;
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    struct Failing;

    impl RequestHandler for Failing {
        async fn handle(&self, _request: RequestEnvelope) -> Result<ResponseEnvelope, HandlerError> {
            Err("database locked".into())
        }
    }

    fn spawn_server<H: RequestHandler>(
        server: IpcServer,
        handler: H,
    ) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(server.serve(Arc::new(handler), async move {
            let _ = rx.await;
        }));
        (tx, task)
    }

    #[tokio::test]
    async fn forwards_framed_requests_to_http_backend() {
        let backend = MockBackend::serve_tcp().await;
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ipc.sock");
        let server = IpcServer::bind(&socket, DEFAULT_MAX_FRAME_LEN).unwrap();
        let (stop, task) = spawn_server(server, HttpForwarder::new(backend.base_url()).unwrap());

        let response = request_framed(&socket, &RequestEnvelope::new("GET", "/health"), DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.json::<Value>().unwrap(), json!({ "message": "ok" }));

        let request = RequestEnvelope::new("POST", "/echo").with_json(json!({ "k": [1, 2] }));
        let response = request_framed(&socket, &request, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        let echo: Value = response.json().unwrap();
        assert_eq!(echo["body"], r#"{"k":[1,2]}"#);

        stop.send(()).unwrap();
        task.await.unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn handler_error_becomes_500() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ipc.sock");
        let server = IpcServer::bind(&socket, DEFAULT_MAX_FRAME_LEN).unwrap();
        let (_stop, _task) = spawn_server(server, Failing);

        let response = request_framed(&socket, &RequestEnvelope::new("GET", "/x"), DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(
            response.json::<Value>().unwrap(),
            json!({ "error": "database locked" })
        );
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ipc.sock");
        std::fs::write(&socket, b"stale").unwrap();

        let server = IpcServer::bind(&socket, DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(server.socket_path(), socket.as_path());
    }

    #[tokio::test]
    async fn oversized_frame_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ipc.sock");
        let server = IpcServer::bind(&socket, 64).unwrap();
        let (_stop, _task) = spawn_server(server, Failing);

        let mut stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
        let frame = encode_frame(&[b'x'; 128]).unwrap();
        stream.write_all(&frame).await.unwrap();

        let mut buf = Vec::new();
        let read = stream.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn multiple_exchanges_on_one_connection() {
        use crate::framing::FrameCodec;
        use futures_util::{SinkExt, StreamExt};
        use tokio_util::codec::Framed;

        let backend = MockBackend::serve_tcp().await;
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ipc.sock");
        let server = IpcServer::bind(&socket, DEFAULT_MAX_FRAME_LEN).unwrap();
        let (_stop, _task) = spawn_server(server, HttpForwarder::new(backend.base_url()).unwrap());

        let stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::new());
        for _ in 0..3 {
            let payload = serde_json::to_vec(&RequestEnvelope::new("GET", "/health")).unwrap();
            framed.send(bytes::Bytes::from(payload)).await.unwrap();
            let frame = framed.next().await.unwrap().unwrap();
            let response: ResponseEnvelope = serde_json::from_slice(&frame).unwrap();
            assert_eq!(response.status, 200);
        }
    }
}
