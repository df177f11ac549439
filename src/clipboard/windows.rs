//! Windows clipboard bridge over the Win32 clipboard API
//!
//! Every native resource is held by a scope-bound guard: the clipboard itself
//! ([`OpenClipboardGuard`]), locked memory ([`GlobalLockGuard`]) and allocated
//! memory not yet owned by the system ([`OwnedGlobal`]). Early returns on the
//! per-format failure paths release them in reverse order.

use std::borrow::Cow;
use std::ffi::OsString;
use std::marker::PhantomData;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::ptr;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};
use winapi::shared::minwindef::{HGLOBAL, UINT};
use winapi::shared::ntdef::HANDLE;
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::winbase::{
    GlobalAlloc, GlobalFree, GlobalLock, GlobalSize, GlobalUnlock, GMEM_MOVEABLE,
};
use winapi::um::winuser::{
    CloseClipboard, EmptyClipboard, EnumClipboardFormats, GetClipboardData,
    GetClipboardFormatNameW, OpenClipboard, RegisterClipboardFormatW, SetClipboardData,
    CF_BITMAP, CF_DIB, CF_DIBV5, CF_DIF, CF_DSPBITMAP, CF_DSPENHMETAFILE, CF_DSPMETAFILEPICT,
    CF_DSPTEXT, CF_ENHMETAFILE, CF_GDIOBJFIRST, CF_GDIOBJLAST, CF_HDROP, CF_LOCALE,
    CF_METAFILEPICT, CF_OEMTEXT, CF_OWNERDISPLAY, CF_PALETTE, CF_PENDATA, CF_PRIVATEFIRST,
    CF_PRIVATELAST, CF_RIFF, CF_SYLK, CF_TEXT, CF_TIFF, CF_UNICODETEXT, CF_WAVE,
};

use super::{
    string_to_utf16le, text_from_formats, ClipboardBridge, ClipboardError, ClipboardFormat,
    RestoreReport, CF_UNICODETEXT_NAME, MAX_CLIPBOARD_SIZE, META_FORMAT_ID, TEXT_FORMAT,
};

const OPEN_ATTEMPTS: u32 = 5;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(10);
const FORMAT_NAME_CAPACITY: usize = 256;

/// Predefined formats with fixed identifiers
const STANDARD_FORMATS: &[(UINT, &str)] = &[
    (CF_TEXT, "CF_TEXT"),
    (CF_BITMAP, "CF_BITMAP"),
    (CF_METAFILEPICT, "CF_METAFILEPICT"),
    (CF_SYLK, "CF_SYLK"),
    (CF_DIF, "CF_DIF"),
    (CF_TIFF, "CF_TIFF"),
    (CF_OEMTEXT, "CF_OEMTEXT"),
    (CF_DIB, "CF_DIB"),
    (CF_PALETTE, "CF_PALETTE"),
    (CF_PENDATA, "CF_PENDATA"),
    (CF_RIFF, "CF_RIFF"),
    (CF_WAVE, "CF_WAVE"),
    (CF_UNICODETEXT, "CF_UNICODETEXT"),
    (CF_ENHMETAFILE, "CF_ENHMETAFILE"),
    (CF_HDROP, "CF_HDROP"),
    (CF_LOCALE, "CF_LOCALE"),
    (CF_DIBV5, "CF_DIBV5"),
];

/// Clipboard opened by the current thread; closed on drop
struct OpenClipboardGuard {
    // OpenClipboard ownership is per thread.
    _not_send: PhantomData<*const ()>,
}

impl OpenClipboardGuard {
    fn open() -> Result<Self, ClipboardError> {
        for _ in 0..OPEN_ATTEMPTS {
            if unsafe { OpenClipboard(ptr::null_mut()) } != 0 {
                return Ok(Self {
                    _not_send: PhantomData,
                });
            }
            thread::sleep(OPEN_RETRY_DELAY);
        }
        let code = unsafe { GetLastError() };
        Err(ClipboardError::ClipboardUnavailable(format!(
            "OpenClipboard failed after {} attempts (error {})",
            OPEN_ATTEMPTS, code
        )))
    }
}

impl Drop for OpenClipboardGuard {
    fn drop(&mut self) {
        unsafe {
            CloseClipboard();
        }
    }
}

/// Locked view of a movable global memory block; unlocked on drop
struct GlobalLockGuard<'a> {
    handle: HGLOBAL,
    ptr: *mut u8,
    len: usize,
    _owner: PhantomData<&'a ()>,
}

impl<'a> GlobalLockGuard<'a> {
    fn lock(handle: HGLOBAL, format: &str) -> Result<Self, ClipboardError> {
        let ptr = unsafe { GlobalLock(handle) } as *mut u8;
        if ptr.is_null() {
            return Err(ClipboardError::HandleLockFailed {
                format: format.to_string(),
            });
        }
        let len = unsafe { GlobalSize(handle) };
        Ok(Self {
            handle,
            ptr,
            len,
            _owner: PhantomData,
        })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for GlobalLockGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            GlobalUnlock(self.handle);
        }
    }
}

/// Global memory we still own; freed on drop unless handed to the clipboard
struct OwnedGlobal {
    handle: HGLOBAL,
}

impl OwnedGlobal {
    fn alloc(size: usize, format: &str) -> Result<Self, ClipboardError> {
        // Zero-sized blocks cannot be locked.
        let handle = unsafe { GlobalAlloc(GMEM_MOVEABLE, size.max(1)) };
        if handle.is_null() {
            return Err(ClipboardError::FormatAllocationFailed {
                format: format.to_string(),
                size,
            });
        }
        Ok(Self { handle })
    }

    fn lock(&self, format: &str) -> Result<GlobalLockGuard<'_>, ClipboardError> {
        GlobalLockGuard::lock(self.handle, format)
    }

    /// Give the block to the system; it must not be freed by us afterwards
    fn release(self) {
        std::mem::forget(self);
    }
}

impl Drop for OwnedGlobal {
    fn drop(&mut self) {
        unsafe {
            GlobalFree(self.handle);
        }
    }
}

fn to_wide(name: &str) -> Vec<u16> {
    std::ffi::OsStr::new(name)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

/// Formats whose data handles are GDI objects or private handles, not memory blocks
fn is_handle_format(id: UINT) -> bool {
    matches!(
        id,
        CF_BITMAP
            | CF_PALETTE
            | CF_METAFILEPICT
            | CF_ENHMETAFILE
            | CF_OWNERDISPLAY
            | CF_DSPBITMAP
            | CF_DSPMETAFILEPICT
            | CF_DSPENHMETAFILE
    ) || (CF_PRIVATEFIRST..=CF_PRIVATELAST).contains(&id)
        || (CF_GDIOBJFIRST..=CF_GDIOBJLAST).contains(&id)
}

fn format_name(id: UINT) -> String {
    if let Some((_, name)) = STANDARD_FORMATS.iter().find(|(known, _)| *known == id) {
        return (*name).to_string();
    }
    if id == CF_DSPTEXT {
        return "CF_DSPTEXT".to_string();
    }

    let mut buffer = [0u16; FORMAT_NAME_CAPACITY];
    let len = unsafe {
        GetClipboardFormatNameW(id, buffer.as_mut_ptr(), FORMAT_NAME_CAPACITY as i32)
    };
    if len > 0 {
        OsString::from_wide(&buffer[..len as usize])
            .to_string_lossy()
            .into_owned()
    } else {
        format!("#{}", id)
    }
}

fn format_id(name: &str) -> Option<UINT> {
    if let Some((id, _)) = STANDARD_FORMATS.iter().find(|(_, known)| *known == name) {
        return Some(*id);
    }
    if name == "CF_DSPTEXT" {
        return Some(CF_DSPTEXT);
    }
    if let Some(raw) = name.strip_prefix('#') {
        return raw.parse().ok();
    }
    let wide = to_wide(name);
    match unsafe { RegisterClipboardFormatW(wide.as_ptr()) } {
        0 => None,
        id => Some(id),
    }
}

/// Windows clipboard bridge
#[derive(Debug, Default)]
pub struct WindowsClipboard;

impl WindowsClipboard {
    /// Create the bridge
    pub fn new() -> Self {
        Self
    }

    fn read_format(id: UINT) -> Result<ClipboardFormat, ClipboardError> {
        let name = format_name(id);
        if is_handle_format(id) {
            return Err(ClipboardError::UnsupportedFormat(name));
        }

        let handle = unsafe { GetClipboardData(id) };
        if handle.is_null() {
            return Err(ClipboardError::HandleLockFailed { format: name });
        }

        let data = {
            let lock = GlobalLockGuard::lock(handle as HGLOBAL, &name)?;
            if lock.len > MAX_CLIPBOARD_SIZE {
                return Err(ClipboardError::UnsupportedFormat(format!(
                    "{} exceeds {} bytes",
                    name, MAX_CLIPBOARD_SIZE
                )));
            }
            lock.as_slice().to_vec()
        };

        Ok(ClipboardFormat::new(name, data).with_metadata(META_FORMAT_ID, id))
    }

    fn write_format(format: &ClipboardFormat) -> Result<(), ClipboardError> {
        let id = format_id(&format.name)
            .ok_or_else(|| ClipboardError::UnsupportedFormat(format.name.clone()))?;
        if is_handle_format(id) {
            return Err(ClipboardError::UnsupportedFormat(format.name.clone()));
        }

        let block = OwnedGlobal::alloc(format.data.len(), &format.name)?;
        {
            let mut lock = block.lock(&format.name)?;
            lock.as_mut_slice()[..format.data.len()].copy_from_slice(&format.data);
        }

        let placed = unsafe { SetClipboardData(id, block.handle as HANDLE) };
        if placed.is_null() {
            // Still ours; the drop frees it.
            return Err(ClipboardError::FormatAllocationFailed {
                format: format.name.clone(),
                size: format.data.len(),
            });
        }
        block.release();
        Ok(())
    }
}

/// Add a native `CF_UNICODETEXT` when only portable text is present
fn with_native_text(formats: &[ClipboardFormat]) -> Cow<'_, [ClipboardFormat]> {
    let has_native = formats.iter().any(|f| f.name == CF_UNICODETEXT_NAME);
    let has_portable = formats.iter().any(|f| f.name == TEXT_FORMAT);
    if has_native || !has_portable {
        return Cow::Borrowed(formats);
    }
    match text_from_formats(formats) {
        Some(text) => {
            let mut extended = formats.to_vec();
            extended.push(ClipboardFormat::new(
                CF_UNICODETEXT_NAME,
                string_to_utf16le(&text),
            ));
            Cow::Owned(extended)
        }
        None => Cow::Borrowed(formats),
    }
}

impl ClipboardBridge for WindowsClipboard {
    fn try_capture(&self) -> Result<Vec<ClipboardFormat>, ClipboardError> {
        let _clipboard = OpenClipboardGuard::open()?;

        let mut formats = Vec::new();
        let mut id = 0;
        loop {
            id = unsafe { EnumClipboardFormats(id) };
            if id == 0 {
                break;
            }
            match Self::read_format(id) {
                Ok(format) => formats.push(format),
                Err(e) => debug!("Skipping clipboard format {}: {}", id, e),
            }
        }

        Ok(formats)
    }

    fn restore(&self, formats: &[ClipboardFormat]) -> Result<RestoreReport, ClipboardError> {
        let formats = with_native_text(formats);
        let _clipboard = OpenClipboardGuard::open()?;

        if unsafe { EmptyClipboard() } == 0 {
            let code = unsafe { GetLastError() };
            return Err(ClipboardError::ClipboardUnavailable(format!(
                "EmptyClipboard failed (error {})",
                code
            )));
        }

        let mut report = RestoreReport::default();
        for format in formats.iter() {
            match Self::write_format(format) {
                Ok(()) => report.restored.push(format.name.clone()),
                Err(e) => {
                    warn!("Skipping clipboard format {} on restore: {}", format.name, e);
                    report.skipped.push((format.name.clone(), e));
                }
            }
        }

        Ok(report)
    }

    fn name(&self) -> &str {
        "windows"
    }
}
