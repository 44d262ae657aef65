//! ZSim Desktop Library
//!
//! Backend supervision and the local transport bridge between the desktop
//! UI layer and the simulation API.

pub mod bridge;
pub mod client;
pub mod config;
pub mod envelope;
pub mod framing;
pub mod http_transport;
pub mod ipc_server;
pub mod lifecycle;
pub mod locator;
pub mod logging;
pub mod platform;
pub mod port;
pub mod registry;
pub mod supervisor;
pub mod transport;
pub mod uds_proxy;

#[cfg(test)]
mod test_support;
