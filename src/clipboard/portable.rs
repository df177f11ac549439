//! Portable clipboard backend for macOS, X11 and Wayland

use std::borrow::Cow;
use std::sync::{Mutex, PoisonError};

use arboard::{Clipboard, ImageData};
use tracing::debug;

use super::{
    text_from_formats, ClipboardBridge, ClipboardError, ClipboardFormat, RestoreReport,
    IMAGE_RGBA_FORMAT, MAX_CLIPBOARD_SIZE, TEXT_FORMAT,
};

/// Clipboard backed by `arboard`
///
/// Exposes text as `text/plain` and images as RGBA8 `image/x-rgba`. The
/// underlying handle is kept open for the life of the bridge so that content
/// written by `restore` keeps being served on X11.
pub struct PortableClipboard {
    handle: Mutex<Option<Clipboard>>,
}

impl PortableClipboard {
    /// Create a bridge; the native clipboard is opened lazily
    pub fn new() -> Self {
        Self {
            handle: Mutex::new(None),
        }
    }

    fn with_clipboard<T>(
        &self,
        f: impl FnOnce(&mut Clipboard) -> Result<T, ClipboardError>,
    ) -> Result<T, ClipboardError> {
        let mut guard = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            let clipboard = Clipboard::new()
                .map_err(|e| ClipboardError::ClipboardUnavailable(e.to_string()))?;
            *guard = Some(clipboard);
        }
        match guard.as_mut() {
            Some(clipboard) => f(clipboard),
            None => Err(ClipboardError::ClipboardUnavailable(
                "clipboard handle missing".to_string(),
            )),
        }
    }

    fn image_from_format(format: &ClipboardFormat) -> Result<ImageData<'_>, ClipboardError> {
        let dimension = |key: &str| {
            format
                .metadata
                .get(key)
                .and_then(|v| v.parse::<usize>().ok())
                .ok_or_else(|| {
                    ClipboardError::UnsupportedFormat(format!(
                        "{} without {} metadata",
                        format.name, key
                    ))
                })
        };
        let width = dimension("width")?;
        let height = dimension("height")?;
        if width.saturating_mul(height).saturating_mul(4) != format.data.len() {
            return Err(ClipboardError::UnsupportedFormat(format!(
                "{} payload does not match {}x{}",
                format.name, width, height
            )));
        }
        Ok(ImageData {
            width,
            height,
            bytes: Cow::Borrowed(&format.data),
        })
    }
}

impl Default for PortableClipboard {
    fn default() -> Self {
        Self::new()
    }
}

fn map_read_error(error: arboard::Error) -> Option<ClipboardError> {
    match error {
        arboard::Error::ContentNotAvailable => None,
        arboard::Error::ClipboardOccupied => Some(ClipboardError::ClipboardUnavailable(
            "clipboard occupied".to_string(),
        )),
        other => {
            debug!("Skipping unreadable clipboard content: {}", other);
            None
        }
    }
}

impl ClipboardBridge for PortableClipboard {
    fn try_capture(&self) -> Result<Vec<ClipboardFormat>, ClipboardError> {
        self.with_clipboard(|clipboard| {
            let mut formats = Vec::new();

            match clipboard.get_text() {
                Ok(text) => formats.push(ClipboardFormat::text(text)),
                Err(e) => {
                    if let Some(err) = map_read_error(e) {
                        return Err(err);
                    }
                }
            }

            match clipboard.get_image() {
                Ok(image) if image.bytes.len() <= MAX_CLIPBOARD_SIZE => {
                    formats.push(
                        ClipboardFormat::new(IMAGE_RGBA_FORMAT, image.bytes.into_owned())
                            .with_metadata("width", image.width)
                            .with_metadata("height", image.height),
                    );
                }
                Ok(image) => {
                    debug!("Skipping {}x{} clipboard image over size limit", image.width, image.height);
                }
                Err(e) => {
                    if let Some(err) = map_read_error(e) {
                        return Err(err);
                    }
                }
            }

            Ok(formats)
        })
    }

    fn restore(&self, formats: &[ClipboardFormat]) -> Result<RestoreReport, ClipboardError> {
        self.with_clipboard(|clipboard| {
            let mut report = RestoreReport::default();

            // arboard holds one representation at a time; text wins over images.
            if let Some(text) = text_from_formats(formats) {
                clipboard
                    .set_text(text)
                    .map_err(|e| ClipboardError::ClipboardUnavailable(e.to_string()))?;
                report.restored.push(TEXT_FORMAT.to_string());
            } else if let Some(format) = formats.iter().find(|f| f.name == IMAGE_RGBA_FORMAT) {
                match Self::image_from_format(format) {
                    Ok(image) => {
                        clipboard
                            .set_image(image)
                            .map_err(|e| ClipboardError::ClipboardUnavailable(e.to_string()))?;
                        report.restored.push(format.name.clone());
                    }
                    Err(e) => report.skipped.push((format.name.clone(), e)),
                }
            } else {
                clipboard
                    .clear()
                    .map_err(|e| ClipboardError::ClipboardUnavailable(e.to_string()))?;
            }

            for format in formats {
                if !report.restored.contains(&format.name) {
                    if report.skipped.iter().any(|(name, _)| name == &format.name) {
                        continue;
                    }
                    report.skipped.push((
                        format.name.clone(),
                        ClipboardError::UnsupportedFormat(format.name.clone()),
                    ));
                }
            }

            Ok(report)
        })
    }

    fn name(&self) -> &str {
        "portable"
    }
}
