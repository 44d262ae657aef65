//! Loopback port allocation for the HTTP transport.
//!
//! Binds a throwaway listener on `127.0.0.1:<port>` and releases it straight
//! away. Another process may grab the port before the backend binds it; the
//! backend start then fails and is reported like any other spawn failure.

use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum PortError {
    #[error("No available port in range {start}..={max}")]
    PortAllocationFailed { start: u16, max: u16 },
}

/// First port in `start..=max` that can currently be bound on loopback.
pub async fn find_available_port(start: u16, max: u16) -> Result<u16, PortError> {
    if start > max {
        warn!("Empty port range {}..={}", start, max);
        return Err(PortError::PortAllocationFailed { start, max });
    }

    for port in start..=max {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                drop(listener);
                debug!("Allocated loopback port {}", port);
                return Ok(port);
            }
            Err(e) => {
                debug!("Port {} unavailable: {}", port, e);
            }
        }
    }

    Err(PortError::PortAllocationFailed { start, max })
}
