//! Polling change monitor
//!
//! Used where the platform offers no change notification the bridge can hook
//! into. The dedicated thread captures on a fixed interval and signals only
//! when the content fingerprint moves.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::{ChangeListener, ChangeMonitor, MonitorError, WorkerThread};
use crate::clipboard::ClipboardBridge;
use crate::sync::fingerprint::ContentFingerprint;

/// Monitor that polls the clipboard bridge on its own thread
pub struct PollingMonitor {
    bridge: Arc<dyn ClipboardBridge>,
    interval: Duration,
    stop_timeout: Duration,
    running: Option<Running>,
}

struct Running {
    worker: WorkerThread,
    stop_tx: std_mpsc::Sender<()>,
}

impl PollingMonitor {
    /// Create a monitor polling `bridge` every `interval`
    pub fn new(bridge: Arc<dyn ClipboardBridge>, interval: Duration, stop_timeout: Duration) -> Self {
        Self {
            bridge,
            interval,
            stop_timeout,
            running: None,
        }
    }

    fn poll_loop(
        bridge: Arc<dyn ClipboardBridge>,
        listener: Arc<dyn ChangeListener>,
        interval: Duration,
        stop_rx: std_mpsc::Receiver<()>,
    ) {
        let mut last: Option<ContentFingerprint> = None;

        loop {
            match stop_rx.recv_timeout(interval) {
                Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            }

            let formats = match bridge.try_capture() {
                Ok(formats) => formats,
                Err(e) => {
                    debug!("Polling capture skipped: {}", e);
                    continue;
                }
            };

            let current = ContentFingerprint::of(&formats);
            if last.as_ref() != Some(&current) {
                debug!("Clipboard content changed ({})", current.short());
                last = Some(current);
                listener.on_local_change();
            }
        }
    }
}

impl ChangeMonitor for PollingMonitor {
    fn start(&mut self, listener: Arc<dyn ChangeListener>) -> Result<(), MonitorError> {
        if self.is_running() {
            return Err(MonitorError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = std_mpsc::channel();
        let bridge = Arc::clone(&self.bridge);
        let interval = self.interval;
        let worker = WorkerThread::spawn("clipboard-poll", move || {
            Self::poll_loop(bridge, listener, interval, stop_rx)
        })?;

        info!(
            "Polling clipboard monitor started on {} every {:?}",
            self.bridge.name(),
            self.interval
        );
        self.running = Some(Running { worker, stop_tx });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.stop_tx.send(());
            if running.worker.join_timeout(self.stop_timeout) {
                info!("Polling clipboard monitor stopped");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|running| !running.worker.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for PollingMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::memory::MemoryClipboard;
    use crate::clipboard::ClipboardFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn wait_for(count: &AtomicUsize, expected: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if count.load(Ordering::SeqCst) >= expected {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_signals_once_per_change() {
        let clipboard = Arc::new(MemoryClipboard::with_formats(vec![ClipboardFormat::text("a")]));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let mut monitor = PollingMonitor::new(
            clipboard.clone(),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        monitor
            .start(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        // Initial content counts as the first change.
        assert!(wait_for(&count, 1));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        clipboard.set_formats(vec![ClipboardFormat::text("b")]);
        assert!(wait_for(&count, 2));

        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_start_twice_fails() {
        let clipboard = Arc::new(MemoryClipboard::new());
        let mut monitor = PollingMonitor::new(
            clipboard,
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        monitor.start(Arc::new(|| {})).unwrap();

        assert!(matches!(
            monitor.start(Arc::new(|| {})),
            Err(MonitorError::AlreadyRunning)
        ));
        monitor.stop();
    }

    #[test]
    fn test_unavailable_clipboard_does_not_signal() {
        let clipboard = Arc::new(MemoryClipboard::with_formats(vec![ClipboardFormat::text("a")]));
        clipboard.set_available(false);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let mut monitor = PollingMonitor::new(
            clipboard.clone(),
            Duration::from_millis(5),
            Duration::from_secs(1),
        );
        monitor
            .start(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        monitor.stop();
    }
}
