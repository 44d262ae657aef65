//! Application exit hooks.
//!
//! Every path out of the application stops the backend before the host is
//! asked to quit, so a closing window never races ahead of process teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::platform::Platform;
use crate::supervisor::BackendSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
    /// Last window closed.
    WindowAllClosed,
    /// App re-activated (macOS dock click).
    Activate { open_windows: usize },
    BeforeQuit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Quit,
    StayResident,
    CreateWindow,
    Proceed,
}

/// The windowing side of the shell.
pub trait ShellHost: Send + Sync {
    fn quit(&self);
    fn create_window(&self);
}

pub struct ShellLifecycle<H: ShellHost> {
    supervisor: Arc<BackendSupervisor>,
    host: H,
    platform: Platform,
    quitting: AtomicBool,
}

impl<H: ShellHost> ShellLifecycle<H> {
    pub fn new(supervisor: Arc<BackendSupervisor>, host: H, platform: Platform) -> Self {
        Self {
            supervisor,
            host,
            platform,
            quitting: AtomicBool::new(false),
        }
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    pub async fn handle(&self, event: AppEvent) -> LifecycleAction {
        debug!("Lifecycle event: {:?}", event);
        match event {
            AppEvent::WindowAllClosed if self.platform.is_macos() => {
                debug!("All windows closed on macOS, staying resident");
                LifecycleAction::StayResident
            }
            AppEvent::WindowAllClosed => {
                self.quit().await;
                LifecycleAction::Quit
            }
            AppEvent::Activate { open_windows: 0 } if !self.is_quitting() => {
                self.host.create_window();
                LifecycleAction::CreateWindow
            }
            AppEvent::Activate { .. } => LifecycleAction::Proceed,
            AppEvent::BeforeQuit => {
                self.supervisor.stop().await;
                LifecycleAction::Proceed
            }
        }
    }

    /// Stop the backend, then quit the host. Safe to call repeatedly.
    pub async fn quit(&self) {
        if self.quitting.swap(true, Ordering::SeqCst) {
            debug!("Quit already in progress");
            return;
        }
        info!("Shutting down: stopping backend before quit");
        self.supervisor.stop().await;
        self.host.quit();
    }
}
