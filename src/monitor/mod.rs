//! Clipboard change monitoring
//!
//! A monitor owns one dedicated thread that receives (or detects) clipboard
//! change notifications and reports them through an injected
//! [`ChangeListener`]. It never looks at peers or sync state.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::clipboard::ClipboardBridge;
use crate::config::MonitorConfig;

pub mod polling;

#[cfg(windows)]
pub mod windows;

pub use polling::PollingMonitor;

/// Receives "the clipboard changed, go look" notifications
pub trait ChangeListener: Send + Sync {
    /// Called from the monitor thread; must not block for long
    fn on_local_change(&self);
}

impl<F> ChangeListener for F
where
    F: Fn() + Send + Sync,
{
    fn on_local_change(&self) {
        self()
    }
}

/// Listener that forwards notifications into the async runtime
#[derive(Debug, Clone)]
pub struct ChangeSignal {
    sender: mpsc::UnboundedSender<()>,
}

impl ChangeSignal {
    /// Create a signal and the receiver the sync manager drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ChangeListener for ChangeSignal {
    fn on_local_change(&self) {
        if self.sender.send(()).is_err() {
            debug!("Change signal dropped, receiver closed");
        }
    }
}

/// Monitor errors
#[derive(Debug, Error)]
pub enum MonitorError {
    /// `start` called on a running monitor
    #[error("Monitor is already running")]
    AlreadyRunning,

    /// The listener thread could not be spawned
    #[error("Failed to spawn monitor thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The platform notification hook could not be installed
    #[error("Failed to install clipboard notification hook: {0}")]
    Platform(String),
}

/// Bridges OS clipboard notifications to a [`ChangeListener`]
pub trait ChangeMonitor: Send {
    /// Spawn the listener thread; returns without waiting for notifications
    fn start(&mut self, listener: Arc<dyn ChangeListener>) -> Result<(), MonitorError>;

    /// Signal the listener thread and wait for it up to the stop timeout
    fn stop(&mut self);

    /// Whether the listener thread is running
    fn is_running(&self) -> bool;
}

/// Create the monitor matching the configured backend
pub fn create_monitor(
    bridge: Arc<dyn ClipboardBridge>,
    config: &MonitorConfig,
) -> Box<dyn ChangeMonitor> {
    #[cfg(windows)]
    if config.backend == crate::config::ClipboardBackend::Native {
        return Box::new(windows::ViewerMonitor::new(config.stop_timeout()));
    }

    Box::new(PollingMonitor::new(
        bridge,
        config.poll_interval(),
        config.stop_timeout(),
    ))
}

/// A running listener thread that reports its own exit
pub(crate) struct WorkerThread {
    handle: JoinHandle<()>,
    exited: std_mpsc::Receiver<()>,
}

impl WorkerThread {
    /// Spawn `body` on a named thread
    pub(crate) fn spawn(
        name: &str,
        body: impl FnOnce() + Send + 'static,
    ) -> Result<Self, MonitorError> {
        let (exit_tx, exited) = std_mpsc::channel();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                body();
                let _ = exit_tx.send(());
            })?;
        Ok(Self { handle, exited })
    }

    /// Wait for the thread to finish; gives up after `timeout`
    pub(crate) fn join_timeout(self, timeout: Duration) -> bool {
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    warn!("Monitor thread panicked");
                }
                true
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    "Monitor thread did not stop within {:?}, detaching",
                    timeout
                );
                false
            }
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
