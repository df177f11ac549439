//! In-process clipboard
//!
//! Behaves like an OS clipboard that holds a list of formats. Used for
//! headless nodes and as a stand-in for the native clipboard in tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{ClipboardBridge, ClipboardError, ClipboardFormat, RestoreReport};

/// Clipboard held in process memory
#[derive(Debug)]
pub struct MemoryClipboard {
    formats: Mutex<Vec<ClipboardFormat>>,
    available: AtomicBool,
    sequence: AtomicU64,
    restores: AtomicU64,
}

impl MemoryClipboard {
    /// Create an empty clipboard
    pub fn new() -> Self {
        Self {
            formats: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            sequence: AtomicU64::new(0),
            restores: AtomicU64::new(0),
        }
    }

    /// Create a clipboard holding `formats`
    pub fn with_formats(formats: Vec<ClipboardFormat>) -> Self {
        let clipboard = Self::new();
        clipboard.set_formats(formats);
        clipboard
    }

    /// Replace the content as a local application would, without counting a restore
    pub fn set_formats(&self, formats: Vec<ClipboardFormat>) {
        *self.formats.lock().unwrap_or_else(PoisonError::into_inner) = formats;
        self.sequence.fetch_add(1, Ordering::SeqCst);
    }

    /// Current content
    pub fn formats(&self) -> Vec<ClipboardFormat> {
        self.formats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Simulate another application holding the clipboard open
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of content changes so far
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Number of successful restore calls
    pub fn restore_count(&self) -> u64 {
        self.restores.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<(), ClipboardError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClipboardError::ClipboardUnavailable(
                "clipboard is held by another application".to_string(),
            ))
        }
    }
}

impl Default for MemoryClipboard {
    fn default() -> Self {
        Self::new()
    }
}

impl ClipboardBridge for MemoryClipboard {
    fn try_capture(&self) -> Result<Vec<ClipboardFormat>, ClipboardError> {
        self.ensure_available()?;
        Ok(self.formats())
    }

    fn restore(&self, formats: &[ClipboardFormat]) -> Result<RestoreReport, ClipboardError> {
        self.ensure_available()?;

        let mut report = RestoreReport::default();
        let mut accepted = Vec::with_capacity(formats.len());
        for format in formats {
            if format.name.is_empty() {
                report.skipped.push((
                    String::new(),
                    ClipboardError::UnsupportedFormat("empty format name".to_string()),
                ));
                continue;
            }
            report.restored.push(format.name.clone());
            accepted.push(format.clone());
        }

        self.set_formats(accepted);
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(report)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
