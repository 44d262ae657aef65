//! ZSim Desktop - Backend Supervisor
//!
//! Owns the backend process lifecycle:
//! - spawns the resolved target with transport-specific environment
//! - forwards stdout/stderr lines to tracing
//! - waits for readiness (fixed grace period or `/health` check)
//! - detects exit and terminates the child on shutdown
//!
//! The chosen [`TransportConfig`] lives here and is published to the
//! [`ConfigRegistry`] only while the backend is `Running`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{Environment, ReadinessPolicy, ShellConfig};
use crate::envelope::RequestEnvelope;
use crate::http_transport::{loopback_client, send_http};
use crate::locator::{BackendLocator, BackendTarget, LocateError};
use crate::platform::Platform;
use crate::port::{find_available_port, PortError};
use crate::registry::{config_channel, ConfigPublisher, ConfigRegistry};
use crate::transport::{resolve_transport, TransportConfig, TransportMode};
use crate::uds_proxy::send_over_uds;

const HEALTH_PATH: &str = "/health";
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const GRACEFUL_STOP_WAIT: Duration = Duration::from_millis(1_500);

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    PortAllocationFailed(#[from] PortError),

    #[error(transparent)]
    BackendNotFound(#[from] LocateError),

    #[error("Failed to spawn backend: {0}")]
    SpawnFailed(#[source] io::Error),

    #[error("Backend already starting or running")]
    AlreadyRunning,

    #[error("Backend exited during startup (exit code {exit_code:?})")]
    ExitedDuringStartup { exit_code: Option<i32> },

    #[error("Backend was stopped during startup")]
    StoppedDuringStartup,

    #[error("Backend did not become ready within {waited_ms}ms")]
    ReadinessTimeout { waited_ms: u64 },

    #[error("Failed to build readiness client: {0}")]
    HealthClient(String),
}

// ============================================================================
// Backend State
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BackendState {
    NotStarted,
    Starting,
    Running,
    Stopped { exit_code: Option<i32> },
    Failed { error: String },
}

impl BackendState {
    pub fn is_live(&self) -> bool {
        matches!(self, BackendState::Starting | BackendState::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    #[serde(flatten)]
    pub state: BackendState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub mode: Option<TransportMode>,
}

struct LiveProcess {
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

impl LiveProcess {
    fn request_stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

struct Inner {
    state: BackendState,
    generation: u64,
    stop_requested: bool,
    live: Option<LiveProcess>,
    transport: Option<TransportConfig>,
    started_at: Option<DateTime<Utc>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Supervisor
// ============================================================================

pub struct BackendSupervisor {
    inner: Arc<Mutex<Inner>>,
    publisher: ConfigPublisher,
    environment: Environment,
    readiness: ReadinessPolicy,
    stop_timeout: Duration,
}

impl BackendSupervisor {
    pub fn new(environment: Environment, readiness: ReadinessPolicy, stop_timeout: Duration) -> Self {
        let (publisher, _registry) = config_channel();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: BackendState::NotStarted,
                generation: 0,
                stop_requested: false,
                live: None,
                transport: None,
                started_at: None,
            })),
            publisher,
            environment,
            readiness,
            stop_timeout,
        }
    }

    pub fn from_config(config: &ShellConfig) -> Self {
        Self::new(
            config.environment,
            config.readiness.clone(),
            config.stop_timeout(),
        )
    }

    /// Read-only view handed to the privileged bridge.
    pub fn registry(&self) -> ConfigRegistry {
        self.publisher.registry()
    }

    pub fn state(&self) -> BackendState {
        lock(&self.inner).state.clone()
    }

    pub fn status(&self) -> BackendStatus {
        let inner = lock(&self.inner);
        BackendStatus {
            state: inner.state.clone(),
            pid: inner.live.as_ref().and_then(|live| live.pid),
            started_at: inner.started_at,
            mode: inner.transport.as_ref().map(TransportConfig::mode),
        }
    }

    /// Locate the backend, pick and prepare a transport, then [`start`](Self::start).
    pub async fn launch(
        &self,
        config: &ShellConfig,
        platform: Platform,
    ) -> Result<TransportConfig, SupervisorError> {
        let locator = BackendLocator::new(
            config.environment,
            platform,
            &config.project_root,
            &config.resource_dir,
        );
        let target = locator.locate().map_err(|e| {
            error!("Backend lookup failed: {}", e);
            e
        })?;
        let mode = resolve_transport(platform, config.transport_override);
        let transport = prepare_transport(mode, config).await.map_err(|e| {
            error!("Transport preparation failed: {}", e);
            e
        })?;
        self.start(&target, transport.clone()).await?;
        Ok(transport)
    }

    /// Spawn the backend and wait until it is considered ready.
    pub async fn start(
        &self,
        target: &BackendTarget,
        transport: TransportConfig,
    ) -> Result<(), SupervisorError> {
        let generation = {
            let mut inner = lock(&self.inner);
            if inner.state.is_live() {
                warn!("Backend start requested while {:?}", inner.state);
                return Err(SupervisorError::AlreadyRunning);
            }
            inner.state = BackendState::Starting;
            inner.generation += 1;
            inner.stop_requested = false;
            inner.generation
        };

        if let Some(path) = transport.socket_path() {
            if path.exists() {
                debug!("Removing stale socket {:?}", path);
                let _ = std::fs::remove_file(path);
            }
        }

        info!(
            "Starting backend: {} {:?} (transport {})",
            target.command,
            target.args,
            transport.mode()
        );
        let mut command = Command::new(&target.command);
        command
            .args(&target.args)
            .current_dir(&target.working_directory)
            .envs(transport.backend_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn backend {}: {}", target.command, e);
                let mut inner = lock(&self.inner);
                if inner.generation == generation {
                    inner.state = BackendState::Failed {
                        error: e.to_string(),
                    };
                    inner.live = None;
                }
                return Err(SupervisorError::SpawnFailed(e));
            }
        };

        let pid = child.id();
        info!("Backend spawned with PID {:?}", pid);
        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout", self.environment);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr", self.environment);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        {
            let mut inner = lock(&self.inner);
            inner.live = Some(LiveProcess {
                pid,
                stop_tx: Some(stop_tx),
                exited: exited_rx.clone(),
            });
            inner.transport = Some(transport.clone());
            inner.started_at = Some(Utc::now());
        }
        tokio::spawn(watch_child(
            child,
            stop_rx,
            exited_tx,
            self.inner.clone(),
            self.publisher.clone(),
            generation,
        ));

        match self.readiness.clone() {
            ReadinessPolicy::Grace { period_ms } => {
                let mut exited = exited_rx;
                tokio::select! {
                    _ = sleep(Duration::from_millis(period_ms)) => {}
                    _ = exited.wait_for(|done| *done) => {}
                }
            }
            ReadinessPolicy::HealthCheck {
                initial_backoff_ms,
                max_backoff_ms,
                timeout_ms,
            } => {
                let checked = self
                    .wait_until_healthy(
                        generation,
                        &transport,
                        exited_rx,
                        Duration::from_millis(initial_backoff_ms.max(1)),
                        Duration::from_millis(max_backoff_ms.max(1)),
                        Duration::from_millis(timeout_ms),
                    )
                    .await;
                if let Err(e) = checked {
                    error!("Backend readiness failed: {}", e);
                    self.stop().await;
                    let mut inner = lock(&self.inner);
                    if inner.generation == generation {
                        inner.state = BackendState::Failed {
                            error: e.to_string(),
                        };
                    }
                    return Err(e);
                }
            }
        }

        self.finish_start(generation, transport)
    }

    fn finish_start(
        &self,
        generation: u64,
        transport: TransportConfig,
    ) -> Result<(), SupervisorError> {
        let mut inner = lock(&self.inner);
        if inner.generation != generation || inner.stop_requested {
            return Err(SupervisorError::StoppedDuringStartup);
        }
        match inner.state.clone() {
            BackendState::Starting => {
                inner.state = BackendState::Running;
                self.publisher.publish(transport);
                info!("Backend running");
                Ok(())
            }
            BackendState::Stopped { exit_code } => {
                Err(SupervisorError::ExitedDuringStartup { exit_code })
            }
            BackendState::Failed { .. } => Err(SupervisorError::ExitedDuringStartup { exit_code: None }),
            BackendState::Running | BackendState::NotStarted => {
                Err(SupervisorError::StoppedDuringStartup)
            }
        }
    }

    async fn wait_until_healthy(
        &self,
        generation: u64,
        transport: &TransportConfig,
        mut exited: watch::Receiver<bool>,
        initial_backoff: Duration,
        max_backoff: Duration,
        limit: Duration,
    ) -> Result<(), SupervisorError> {
        let client = loopback_client().map_err(|e| SupervisorError::HealthClient(e.to_string()))?;
        let deadline = Instant::now() + limit;
        let mut backoff = initial_backoff;

        loop {
            if *exited.borrow() || !self.is_starting(generation) {
                // finish_start reports why startup ended.
                return Ok(());
            }
            if check_health(&client, transport).await {
                debug!("Backend answered {}", HEALTH_PATH);
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SupervisorError::ReadinessTimeout {
                    waited_ms: limit.as_millis() as u64,
                });
            }
            let wait = backoff.min(deadline - now);
            tokio::select! {
                _ = sleep(wait) => {}
                _ = exited.wait_for(|done| *done) => {}
            }
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    fn is_starting(&self, generation: u64) -> bool {
        let inner = lock(&self.inner);
        inner.generation == generation && inner.state == BackendState::Starting
    }

    /// Terminate the backend and wait for the exit to be observed.
    /// No-op when nothing is running.
    pub async fn stop(&self) {
        let live = {
            let mut inner = lock(&self.inner);
            let live = inner.live.take();
            if live.is_some() {
                inner.stop_requested = true;
                inner.transport = None;
                inner.state = BackendState::Stopped { exit_code: None };
            }
            live
        };
        self.publisher.clear();

        let Some(mut live) = live else {
            debug!("Backend stop requested but nothing is running");
            return;
        };

        info!("Stopping backend (PID {:?})", live.pid);
        live.request_stop();
        let confirmed = timeout(self.stop_timeout, live.exited.wait_for(|done| *done))
            .await
            .is_ok();
        if confirmed {
            info!("Backend stopped");
        } else {
            warn!(
                "Backend did not confirm exit within {}ms",
                self.stop_timeout.as_millis()
            );
        }
    }
}

impl Drop for BackendSupervisor {
    fn drop(&mut self) {
        if let Some(mut live) = lock(&self.inner).live.take() {
            live.request_stop();
        }
    }
}

/// Allocate the endpoint for `mode`: a free loopback port or the socket path.
pub async fn prepare_transport(
    mode: TransportMode,
    config: &ShellConfig,
) -> Result<TransportConfig, PortError> {
    match mode {
        TransportMode::Http => {
            let port = find_available_port(config.port_range_start, config.port_range_end).await?;
            Ok(TransportConfig::http(port))
        }
        TransportMode::Uds => Ok(TransportConfig::uds(config.socket_path.clone())),
    }
}

async fn check_health(client: &reqwest::Client, transport: &TransportConfig) -> bool {
    let request = RequestEnvelope::new("GET", HEALTH_PATH);
    match transport.mode() {
        TransportMode::Http => {
            let Some(base) = transport.base_url() else {
                return false;
            };
            matches!(
                send_http(client, &base, &request, Some(HEALTH_REQUEST_TIMEOUT)).await,
                Ok(response) if response.is_success()
            )
        }
        TransportMode::Uds => {
            let Some(path) = transport.socket_path() else {
                return false;
            };
            matches!(
                timeout(HEALTH_REQUEST_TIMEOUT, send_over_uds(path, &request)).await,
                Ok(Ok(response)) if response.is_success()
            )
        }
    }
}

// ----------------------------------------------------------------------------
// Child watcher
// ----------------------------------------------------------------------------

enum WatchOutcome {
    Exited(io::Result<ExitStatus>),
    StopRequested,
}

async fn watch_child(
    mut child: Child,
    mut stop_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
    inner: Arc<Mutex<Inner>>,
    publisher: ConfigPublisher,
    generation: u64,
) {
    // A dropped sender counts as a stop request too.
    let outcome = tokio::select! {
        status = child.wait() => WatchOutcome::Exited(status),
        _ = &mut stop_rx => WatchOutcome::StopRequested,
    };
    let result = match outcome {
        WatchOutcome::Exited(status) => status,
        WatchOutcome::StopRequested => terminate_child(&mut child).await,
    };

    {
        let mut inner = lock(&inner);
        if inner.generation == generation {
            inner.live = None;
            inner.transport = None;
            publisher.clear();
            let next = match &result {
                Ok(status) => BackendState::Stopped {
                    exit_code: status.code(),
                },
                Err(e) => BackendState::Failed {
                    error: e.to_string(),
                },
            };
            match inner.state {
                BackendState::Starting | BackendState::Running | BackendState::Stopped { .. } => {
                    inner.state = next;
                }
                BackendState::NotStarted | BackendState::Failed { .. } => {}
            }
        }
    }

    match &result {
        Ok(status) => info!("Backend exited: {}", status),
        Err(e) => error!("Failed to reap backend: {}", e),
    }
    exited_tx.send_replace(true);
}

async fn terminate_child(child: &mut Child) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Ok(status) = timeout(GRACEFUL_STOP_WAIT, child.wait()).await {
                return status;
            }
            warn!("Backend ignored SIGTERM, killing PID {}", pid);
        }
    }
    child.kill().await?;
    child.wait().await
}

// ----------------------------------------------------------------------------
// Output forwarding
// ----------------------------------------------------------------------------

/// Outside development, uvicorn-style `INFO:` lines are dropped.
pub fn should_forward_line(line: &str, environment: Environment) -> bool {
    if line.trim().is_empty() {
        return false;
    }
    environment.is_development() || !line.contains("INFO:")
}

fn forward_output<R>(reader: R, stream: &'static str, environment: Environment)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !should_forward_line(&line, environment) {
                        continue;
                    }
                    if stream == "stderr" {
                        warn!(target: "zsim_desktop::backend", stream, "{}", line);
                    } else {
                        info!(target: "zsim_desktop::backend", stream, "{}", line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Error reading backend {}: {}", stream, e);
                    break;
                }
            }
        }
        debug!("Backend {} closed", stream);
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::MockBackend;
    use std::path::PathBuf;

    fn shell(script: &str) -> BackendTarget {
        BackendTarget {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_directory: std::env::temp_dir(),
        }
    }

    fn grace_supervisor(period_ms: u64) -> BackendSupervisor {
        BackendSupervisor::new(
            Environment::Development,
            ReadinessPolicy::Grace { period_ms },
            Duration::from_secs(5),
        )
    }

    fn health_check_supervisor(timeout_ms: u64) -> BackendSupervisor {
        BackendSupervisor::new(
            Environment::Production,
            ReadinessPolicy::HealthCheck {
                initial_backoff_ms: 20,
                max_backoff_ms: 100,
                timeout_ms,
            },
            Duration::from_secs(5),
        )
    }

    async fn wait_for_state<F>(supervisor: &BackendSupervisor, predicate: F) -> BackendState
    where
        F: Fn(&BackendState) -> bool,
    {
        for _ in 0..100 {
            let state = supervisor.state();
            if predicate(&state) {
                return state;
            }
            sleep(Duration::from_millis(20)).await;
        }
        supervisor.state()
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let supervisor = grace_supervisor(10);
        supervisor.stop().await;
        supervisor.stop().await;
        assert_eq!(supervisor.state(), BackendState::NotStarted);
    }

    #[tokio::test]
    async fn start_publishes_config_and_stop_clears_it() {
        let supervisor = grace_supervisor(100);
        let registry = supervisor.registry();
        let transport = TransportConfig::uds("/tmp/zsim-supervisor-test.sock");

        supervisor.start(&shell("exec sleep 30"), transport.clone()).await.unwrap();
        assert_eq!(supervisor.state(), BackendState::Running);
        assert_eq!(registry.get_config().unwrap(), transport);
        assert_eq!(registry.get_config().unwrap(), registry.get_config().unwrap());
        assert!(supervisor.status().pid.is_some());

        supervisor.stop().await;
        assert!(matches!(supervisor.state(), BackendState::Stopped { .. }));
        assert!(registry.get_config().is_err());
        assert!(supervisor.status().pid.is_none());

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn second_start_while_running_fails_fast() {
        let supervisor = grace_supervisor(50);
        let transport = TransportConfig::http(1);
        supervisor.start(&shell("exec sleep 30"), transport.clone()).await.unwrap();

        let err = supervisor.start(&shell("exec sleep 30"), transport).await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning));

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn spawn_failure_marks_failed() {
        let supervisor = grace_supervisor(10);
        let target = BackendTarget {
            command: "/nonexistent/zsim_api".to_string(),
            args: Vec::new(),
            working_directory: PathBuf::from("/"),
        };

        let err = supervisor.start(&target, TransportConfig::http(1)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed(_)));
        assert!(matches!(supervisor.state(), BackendState::Failed { .. }));
        assert!(supervisor.registry().get_config().is_err());
    }

    #[tokio::test]
    async fn exit_during_grace_period_is_reported() {
        let supervisor = grace_supervisor(2_000);
        let err = supervisor
            .start(&shell("exit 3"), TransportConfig::http(1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SupervisorError::ExitedDuringStartup { exit_code: Some(3) }
        ));
        assert_eq!(supervisor.state(), BackendState::Stopped { exit_code: Some(3) });
    }

    #[tokio::test]
    async fn exit_after_running_clears_handle() {
        let supervisor = grace_supervisor(50);
        let registry = supervisor.registry();
        supervisor
            .start(&shell("sleep 0.3"), TransportConfig::http(1))
            .await
            .unwrap();

        let state = wait_for_state(&supervisor, |s| !s.is_live()).await;
        assert_eq!(state, BackendState::Stopped { exit_code: Some(0) });
        assert!(registry.get_config().is_err());
        assert!(supervisor.status().pid.is_none());
    }

    #[tokio::test]
    async fn backend_receives_transport_env() {
        let supervisor = grace_supervisor(300);
        let script = r#"test "$ZSIM_IPC_MODE" = uds && test "$ZSIM_UDS_PATH" = /tmp/zsim-env.sock && exec sleep 30"#;

        supervisor
            .start(&shell(script), TransportConfig::uds("/tmp/zsim-env.sock"))
            .await
            .unwrap();
        assert_eq!(supervisor.state(), BackendState::Running);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn health_check_readiness_over_http() {
        let backend = MockBackend::serve_tcp().await;
        let supervisor = health_check_supervisor(5_000);
        let transport = TransportConfig::http(backend.port.unwrap());

        supervisor.start(&shell("exec sleep 30"), transport.clone()).await.unwrap();
        assert_eq!(supervisor.registry().get_config().unwrap(), transport);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn health_check_readiness_over_uds() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        let supervisor = health_check_supervisor(5_000);

        // The socket appears shortly after spawn, as a real backend's would.
        let target = shell("exec sleep 30");
        let start = supervisor.start(&target, TransportConfig::uds(&socket));
        let serve = async {
            sleep(Duration::from_millis(150)).await;
            MockBackend::serve_uds(&socket).await
        };
        let (started, _backend) = tokio::join!(start, serve);

        started.unwrap();
        assert_eq!(supervisor.state(), BackendState::Running);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn health_check_timeout_fails_and_terminates_child() {
        let port = find_available_port(20_000, 30_000).await.unwrap();
        let supervisor = health_check_supervisor(300);

        let err = supervisor
            .start(&shell("exec sleep 30"), TransportConfig::http(port))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ReadinessTimeout { .. }));
        assert!(matches!(supervisor.state(), BackendState::Failed { .. }));
        assert!(supervisor.status().pid.is_none());
    }

    #[test]
    fn info_lines_are_suppressed_outside_development() {
        let line = "INFO:     Uvicorn running on unix socket /tmp/zsim_api.sock";
        assert!(should_forward_line(line, Environment::Development));
        assert!(!should_forward_line(line, Environment::Production));
        assert!(should_forward_line("ERROR: boom", Environment::Production));
        assert!(!should_forward_line("   ", Environment::Development));
    }
}
