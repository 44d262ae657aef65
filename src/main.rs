//! ZSim Desktop - Main Entry Point
//!
//! Headless privileged shell that:
//! - locates and supervises the simulation backend
//! - publishes the chosen transport to the bridge
//! - runs a `/health` self-test through the request client
//! - optionally exposes a framed IPC gateway
//! - stops the backend before quitting

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use zsim_desktop::bridge::PrivilegedBridge;
use zsim_desktop::client::ApiClient;
use zsim_desktop::config::{ReadinessPolicy, ShellConfig};
use zsim_desktop::lifecycle::{AppEvent, ShellHost, ShellLifecycle};
use zsim_desktop::logging::init_logging;
use zsim_desktop::platform::Platform;
use zsim_desktop::supervisor::BackendSupervisor;
use zsim_desktop::transport::TransportConfig;

/// No window layer in the headless shell; quitting only ends the event loop.
struct HeadlessHost {
    quit_tx: watch::Sender<bool>,
}

impl ShellHost for HeadlessHost {
    fn quit(&self) {
        info!("Application quit");
        self.quit_tx.send_replace(true);
    }

    fn create_window(&self) {
        warn!("Window creation requested, but this shell is headless");
    }
}

async fn self_test(client: ApiClient, wait: Duration) {
    match tokio::time::timeout(wait, client.ready()).await {
        Ok(Ok(config)) => info!("Backend reachable over {}", config.mode),
        Ok(Err(e)) => {
            warn!("Backend never became ready: {}", e);
            return;
        }
        Err(_) => {
            warn!("Backend not ready after {}ms, skipping self-test", wait.as_millis());
            return;
        }
    }

    match client.get("/health", BTreeMap::new()).await {
        Ok(response) => {
            let message = response
                .json::<serde_json::Value>()
                .ok()
                .and_then(|body| body.get("message").and_then(|m| m.as_str()).map(str::to_string))
                .unwrap_or_else(|| format!("status {}", response.status));
            info!("Backend health: {}", message);
        }
        Err(e) => warn!("Backend health check failed: {}", e),
    }
}

#[cfg(unix)]
fn spawn_framed_gateway(
    config: &ShellConfig,
    transport: &TransportConfig,
    mut quit_rx: watch::Receiver<bool>,
) {
    use zsim_desktop::ipc_server::{HttpForwarder, IpcServer};

    let Some(socket) = config.framed_socket.clone() else {
        return;
    };
    let Some(base_url) = transport.base_url() else {
        warn!("Framed gateway needs an HTTP-mode backend, not starting it");
        return;
    };
    let forwarder = match HttpForwarder::new(base_url) {
        Ok(forwarder) => Arc::new(forwarder),
        Err(e) => {
            error!("Failed to build framed gateway client: {}", e);
            return;
        }
    };
    let server = match IpcServer::bind(&socket, config.max_frame_len) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to bind framed gateway at {:?}: {}", socket, e);
            return;
        }
    };
    tokio::spawn(server.serve(forwarder, async move {
        let _ = quit_rx.wait_for(|quit| *quit).await;
    }));
}

#[cfg(not(unix))]
fn spawn_framed_gateway(config: &ShellConfig, _: &TransportConfig, _: watch::Receiver<bool>) {
    if config.framed_socket.is_some() {
        warn!("Framed gateway requires Unix-domain sockets");
    }
}

#[tokio::main]
async fn main() {
    let _guard = init_logging();
    info!("ZSim Desktop starting...");

    let config = match ShellConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("{}; continuing with defaults", e);
            let mut config = ShellConfig::default();
            config.apply_env(|key| std::env::var(key).ok());
            config
        }
    };
    let platform = Platform::current();
    info!(
        "Platform {}, environment {:?}, readiness {:?}",
        platform, config.environment, config.readiness
    );

    let supervisor = Arc::new(BackendSupervisor::from_config(&config));
    let bridge = Arc::new(PrivilegedBridge::new(supervisor.clone()));
    let (quit_tx, mut quit_rx) = watch::channel(false);
    let lifecycle = ShellLifecycle::new(supervisor.clone(), HeadlessHost { quit_tx }, platform);

    match ApiClient::new(bridge.clone()) {
        Ok(client) => {
            let wait = match &config.readiness {
                ReadinessPolicy::Grace { period_ms } => Duration::from_millis(*period_ms),
                ReadinessPolicy::HealthCheck { timeout_ms, .. } => Duration::from_millis(*timeout_ms),
            } + Duration::from_secs(5);
            tokio::spawn(self_test(client, wait));
        }
        Err(e) => error!("Failed to build request client: {}", e),
    }

    match supervisor.launch(&config, platform).await {
        Ok(transport) => {
            info!("Backend ready ({})", transport.mode());
            spawn_framed_gateway(&config, &transport, quit_rx.clone());
        }
        // The shell keeps running; requests fail until a restart.
        Err(e) => error!("Backend failed to start: {}", e),
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
            lifecycle.handle(AppEvent::BeforeQuit).await;
            lifecycle.quit().await;
        }
        _ = quit_rx.wait_for(|quit| *quit) => {}
    }

    info!("ZSim Desktop exited");
}
