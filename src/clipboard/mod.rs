//! Clipboard bridge for capturing and restoring every clipboard format
//!
//! A bridge sees the OS clipboard as an ordered list of named byte payloads.
//! It knows nothing about peers or networking; the sync layer decides what to
//! do with what it captures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::config::{ClipboardBackend, MonitorConfig};

pub mod memory;

#[cfg(windows)]
pub mod windows;

#[cfg(not(windows))]
pub mod portable;

/// Maximum size of a single captured format (5MB)
pub const MAX_CLIPBOARD_SIZE: usize = 5 * 1024 * 1024;

/// Portable UTF-8 text format name
pub const TEXT_FORMAT: &str = "text/plain";

/// Portable RGBA8 image format name
pub const IMAGE_RGBA_FORMAT: &str = "image/x-rgba";

/// Windows UTF-16LE text format name
pub const CF_UNICODETEXT_NAME: &str = "CF_UNICODETEXT";

/// Windows ANSI text format name
pub const CF_TEXT_NAME: &str = "CF_TEXT";

/// Metadata key holding the numeric platform format id
pub const META_FORMAT_ID: &str = "format_id";

/// Metadata key holding the captured byte length
pub const META_ORIGINAL_SIZE: &str = "original_size";

/// One named encoding of the clipboard content
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClipboardFormat {
    /// Platform format name (e.g. `CF_UNICODETEXT`, `text/plain`)
    pub name: String,
    /// Raw payload
    #[serde(with = "crate::endpoint::protocol::base64_bytes")]
    pub data: Vec<u8>,
    /// Optional key/value metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ClipboardFormat {
    /// Create a format with no metadata beyond its original size
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(META_ORIGINAL_SIZE.to_string(), data.len().to_string());
        Self {
            name: name.into(),
            data,
            metadata,
        }
    }

    /// Create a portable UTF-8 text format
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(TEXT_FORMAT, text.into().into_bytes())
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for ClipboardFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClipboardFormat")
            .field("name", &self.name)
            .field("size", &self.data.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Outcome of a restore that got past opening the clipboard
#[derive(Debug, Default)]
pub struct RestoreReport {
    /// Names of formats placed on the clipboard
    pub restored: Vec<String>,
    /// Formats that were skipped and why
    pub skipped: Vec<(String, ClipboardError)>,
}

impl RestoreReport {
    /// True when at least one format was skipped
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// Clipboard errors
#[derive(Debug, Error)]
pub enum ClipboardError {
    /// The clipboard could not be opened (held by another application)
    #[error("Clipboard unavailable: {0}")]
    ClipboardUnavailable(String),

    /// A native buffer for one format could not be allocated
    #[error("Failed to allocate {size} bytes for format {format}")]
    FormatAllocationFailed { format: String, size: usize },

    /// A native handle for one format could not be locked
    #[error("Failed to lock clipboard handle for format {format}")]
    HandleLockFailed { format: String },

    /// The backend cannot represent this payload
    #[error("Unsupported clipboard format: {0}")]
    UnsupportedFormat(String),

    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),
}

impl ClipboardError {
    /// Whether the failure concerns a single format rather than the whole call
    pub fn is_per_format(&self) -> bool {
        matches!(
            self,
            Self::FormatAllocationFailed { .. }
                | Self::HandleLockFailed { .. }
                | Self::UnsupportedFormat(_)
        )
    }
}

/// Access to the local clipboard as a set of named payloads
///
/// Implementations perform blocking native calls; async callers should run
/// them on the blocking pool.
pub trait ClipboardBridge: Send + Sync {
    /// Capture every format currently on the clipboard
    fn try_capture(&self) -> Result<Vec<ClipboardFormat>, ClipboardError>;

    /// Replace the clipboard content with `formats`
    ///
    /// Only a failure to open the clipboard aborts the call. Per-format
    /// failures are reported in the returned [`RestoreReport`].
    fn restore(&self, formats: &[ClipboardFormat]) -> Result<RestoreReport, ClipboardError>;

    /// Backend name
    fn name(&self) -> &str;

    /// Capture every format, treating any failure as an empty clipboard
    fn capture(&self) -> Vec<ClipboardFormat> {
        match self.try_capture() {
            Ok(formats) => formats,
            Err(e) => {
                debug!("Clipboard capture failed on {}: {}", self.name(), e);
                Vec::new()
            }
        }
    }
}

/// Create the clipboard bridge selected by the monitor configuration
pub fn create_bridge(config: &MonitorConfig) -> Result<Arc<dyn ClipboardBridge>, ClipboardError> {
    match config.backend {
        ClipboardBackend::Memory => Ok(Arc::new(memory::MemoryClipboard::new())),
        ClipboardBackend::Native => native_bridge(),
    }
}

#[cfg(windows)]
fn native_bridge() -> Result<Arc<dyn ClipboardBridge>, ClipboardError> {
    Ok(Arc::new(windows::WindowsClipboard::new()))
}

#[cfg(not(windows))]
fn native_bridge() -> Result<Arc<dyn ClipboardBridge>, ClipboardError> {
    Ok(Arc::new(portable::PortableClipboard::new()))
}

/// Best-effort text extraction across platform text formats
///
/// Prefers the portable UTF-8 format, then Windows UTF-16LE, then ANSI text.
pub fn text_from_formats(formats: &[ClipboardFormat]) -> Option<String> {
    let find = |name: &str| formats.iter().find(|f| f.name == name);

    if let Some(format) = find(TEXT_FORMAT) {
        return String::from_utf8(format.data.clone()).ok();
    }
    if let Some(format) = find(CF_UNICODETEXT_NAME) {
        return utf16le_to_string(&format.data);
    }
    find(CF_TEXT_NAME).map(|format| {
        let end = format
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(format.data.len());
        String::from_utf8_lossy(&format.data[..end]).into_owned()
    })
}

/// Decode nul-terminated UTF-16LE bytes
pub fn utf16le_to_string(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16(&units).ok()
}

/// Encode text as nul-terminated UTF-16LE bytes
pub fn string_to_utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}
