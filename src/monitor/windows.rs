//! Clipboard viewer chain monitor for Windows
//!
//! The viewer chain delivers `WM_DRAWCLIPBOARD` to one window at a time, and
//! each viewer forwards it to the next. Our window lives on a dedicated thread
//! with its own message loop, because window messages are only delivered to
//! the thread that created the window.

use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use winapi::shared::minwindef::{LPARAM, LPVOID, LRESULT, UINT, WPARAM};
use winapi::shared::windef::HWND;
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::libloaderapi::GetModuleHandleW;
use winapi::um::winuser::{
    ChangeClipboardChain, CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW,
    GetMessageW, GetWindowLongPtrW, PostMessageW, PostQuitMessage, RegisterClassExW,
    SendMessageW, SetClipboardViewer, SetWindowLongPtrW, TranslateMessage, CREATESTRUCTW,
    GWLP_USERDATA, MSG, WM_CHANGECBCHAIN, WM_CLOSE, WM_DESTROY, WM_DRAWCLIPBOARD, WM_NCCREATE,
    WNDCLASSEXW,
};

use super::{ChangeListener, ChangeMonitor, MonitorError, WorkerThread};

const ERROR_CLASS_ALREADY_EXISTS: u32 = 1410;
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-window state, owned by the window from creation to `WM_DESTROY`
struct ViewerState {
    listener: Arc<dyn ChangeListener>,
    next_viewer: HWND,
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

unsafe extern "system" fn viewer_proc(
    hwnd: HWND,
    msg: UINT,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    if msg == WM_NCCREATE {
        let create = &*(lparam as *const CREATESTRUCTW);
        SetWindowLongPtrW(hwnd, GWLP_USERDATA, create.lpCreateParams as isize);
        return DefWindowProcW(hwnd, msg, wparam, lparam);
    }

    let state_ptr = GetWindowLongPtrW(hwnd, GWLP_USERDATA) as *mut ViewerState;
    if state_ptr.is_null() {
        return DefWindowProcW(hwnd, msg, wparam, lparam);
    }

    match msg {
        WM_DRAWCLIPBOARD => {
            let state = &*state_ptr;
            // Unwinding across the window procedure would abort the process.
            if catch_unwind(AssertUnwindSafe(|| state.listener.on_local_change())).is_err() {
                error!("Clipboard change listener panicked");
            }
            if !state.next_viewer.is_null() {
                SendMessageW(state.next_viewer, msg, wparam, lparam);
            }
            0
        }
        WM_CHANGECBCHAIN => {
            let state = &mut *state_ptr;
            let removed = wparam as HWND;
            if removed == state.next_viewer {
                state.next_viewer = lparam as HWND;
            } else if !state.next_viewer.is_null() {
                SendMessageW(state.next_viewer, msg, wparam, lparam);
            }
            0
        }
        WM_CLOSE => {
            let state = &*state_ptr;
            ChangeClipboardChain(hwnd, state.next_viewer);
            DestroyWindow(hwnd);
            0
        }
        WM_DESTROY => {
            SetWindowLongPtrW(hwnd, GWLP_USERDATA, 0);
            drop(Box::from_raw(state_ptr));
            PostQuitMessage(0);
            0
        }
        _ => DefWindowProcW(hwnd, msg, wparam, lparam),
    }
}

/// Create the hidden viewer window and link it into the chain
unsafe fn create_viewer(listener: Arc<dyn ChangeListener>) -> Result<HWND, String> {
    let class_name = wide("ClipMeshClipboardViewer");
    let instance = GetModuleHandleW(ptr::null());

    let mut class: WNDCLASSEXW = mem::zeroed();
    class.cbSize = mem::size_of::<WNDCLASSEXW>() as UINT;
    class.lpfnWndProc = Some(viewer_proc);
    class.hInstance = instance;
    class.lpszClassName = class_name.as_ptr();

    if RegisterClassExW(&class) == 0 {
        let code = GetLastError();
        if code != ERROR_CLASS_ALREADY_EXISTS {
            return Err(format!("RegisterClassExW failed (error {})", code));
        }
    }

    let state = Box::into_raw(Box::new(ViewerState {
        listener,
        next_viewer: ptr::null_mut(),
    }));

    let title = wide("ClipMesh");
    let hwnd = CreateWindowExW(
        0,
        class_name.as_ptr(),
        title.as_ptr(),
        0,
        0,
        0,
        0,
        0,
        ptr::null_mut(),
        ptr::null_mut(),
        instance,
        state as LPVOID,
    );
    if hwnd.is_null() {
        drop(Box::from_raw(state));
        return Err(format!("CreateWindowExW failed (error {})", GetLastError()));
    }

    // SetClipboardViewer sends the first WM_DRAWCLIPBOARD before returning.
    let next = SetClipboardViewer(hwnd);
    (*state).next_viewer = next;
    debug!("Joined clipboard viewer chain, next viewer {:?}", next);

    Ok(hwnd)
}

unsafe fn run_message_loop() {
    let mut msg: MSG = mem::zeroed();
    while GetMessageW(&mut msg, ptr::null_mut(), 0, 0) > 0 {
        TranslateMessage(&msg);
        DispatchMessageW(&msg);
    }
}

/// Monitor that joins the Windows clipboard viewer chain
pub struct ViewerMonitor {
    stop_timeout: Duration,
    running: Option<Running>,
}

struct Running {
    worker: WorkerThread,
    // HWND is not Send; only used to post WM_CLOSE.
    hwnd: isize,
}

impl ViewerMonitor {
    /// Create a stopped monitor
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            stop_timeout,
            running: None,
        }
    }
}

impl ChangeMonitor for ViewerMonitor {
    fn start(&mut self, listener: Arc<dyn ChangeListener>) -> Result<(), MonitorError> {
        if self.is_running() {
            return Err(MonitorError::AlreadyRunning);
        }

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<isize, String>>();
        let worker = WorkerThread::spawn("clipboard-viewer", move || unsafe {
            match create_viewer(listener) {
                Ok(hwnd) => {
                    let _ = ready_tx.send(Ok(hwnd as isize));
                    run_message_loop();
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        })?;

        match ready_rx.recv_timeout(READY_TIMEOUT) {
            Ok(Ok(hwnd)) => {
                info!("Clipboard viewer monitor started");
                self.running = Some(Running { worker, hwnd });
                Ok(())
            }
            Ok(Err(e)) => {
                worker.join_timeout(self.stop_timeout);
                Err(MonitorError::Platform(e))
            }
            Err(_) => Err(MonitorError::Platform(
                "viewer window was not created in time".to_string(),
            )),
        }
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let posted = unsafe { PostMessageW(running.hwnd as HWND, WM_CLOSE, 0, 0) };
            if posted == 0 {
                warn!("Failed to post WM_CLOSE to viewer window");
            }
            if running.worker.join_timeout(self.stop_timeout) {
                info!("Clipboard viewer monitor stopped");
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

impl Drop for ViewerMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewer_start_stop() {
        let mut monitor = ViewerMonitor::new(Duration::from_secs(2));
        monitor.start(Arc::new(|| {})).unwrap();
        assert!(monitor.is_running());

        monitor.stop();
        assert!(!monitor.is_running());
    }
}
