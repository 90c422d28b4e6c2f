use thiserror::Error;

/// What the foreground window looked like at one instant. Both fields empty
/// means nothing holds focus (desktop, lock screen, screensaver).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    pub title: String,
    pub executable_path: String,
}

impl Observation {
    pub fn new(title: impl Into<String>, executable_path: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            executable_path: executable_path.into(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.executable_path.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum InspectionError {
    #[error("foreground window has no owning process")]
    NoProcess,
    #[error("failed to open process {pid}: {message}")]
    OpenProcess { pid: u32, message: String },
    #[error("failed to resolve executable path for process {pid}: {message}")]
    ImagePath { pid: u32, message: String },
}

pub trait ForegroundInspector: Send {
    fn inspect(&self) -> Result<Observation, InspectionError>;
}

/// Inspector backed by the host windowing API.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInspector;

impl SystemInspector {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(windows)]
impl ForegroundInspector for SystemInspector {
    fn inspect(&self) -> Result<Observation, InspectionError> {
        native::inspect()
    }
}

// Foreground tracking targets the Win32 window manager only; other hosts
// always observe "nothing focused" so the agent still runs for development.
#[cfg(not(windows))]
impl ForegroundInspector for SystemInspector {
    fn inspect(&self) -> Result<Observation, InspectionError> {
        Ok(Observation::default())
    }
}

#[cfg(windows)]
mod native {
    use tracing::debug;
    use windows::Win32::Foundation::{CloseHandle, HANDLE, HMODULE, HWND, MAX_PATH};
    use windows::Win32::System::ProcessStatus::K32GetModuleFileNameExW;
    use windows::Win32::System::Threading::{
        OpenProcess, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_VM_READ,
        QueryFullProcessImageNameW,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        GetForegroundWindow, GetWindowTextLengthW, GetWindowTextW, GetWindowThreadProcessId,
    };
    use windows::core::PWSTR;

    use super::{InspectionError, Observation};

    const IMAGE_PATH_CAPACITY: usize = 1024;

    pub(super) fn inspect() -> Result<Observation, InspectionError> {
        let hwnd = unsafe { GetForegroundWindow() };
        if hwnd.0.is_null() {
            return Ok(Observation::default());
        }

        let title = window_title(hwnd);
        let pid = owning_pid(hwnd)?;
        let executable_path = with_process(pid, |handle| executable_path(pid, handle))??;

        Ok(Observation {
            title,
            executable_path,
        })
    }

    fn window_title(hwnd: HWND) -> String {
        let len = unsafe { GetWindowTextLengthW(hwnd) };
        let Ok(len) = usize::try_from(len) else {
            return String::new();
        };
        if len == 0 {
            return String::new();
        }

        let mut buf = vec![0u16; len + 1];
        let copied = unsafe { GetWindowTextW(hwnd, &mut buf) };
        match usize::try_from(copied) {
            Ok(copied) if copied > 0 => String::from_utf16_lossy(&buf[..copied.min(len)]),
            _ => String::new(),
        }
    }

    fn owning_pid(hwnd: HWND) -> Result<u32, InspectionError> {
        let mut pid = 0u32;
        unsafe { GetWindowThreadProcessId(hwnd, Some(&mut pid as *mut u32)) };
        if pid == 0 {
            return Err(InspectionError::NoProcess);
        }
        Ok(pid)
    }

    /// Opens the process, runs `use_handle`, then closes the handle before
    /// returning, whatever `use_handle` produced.
    fn with_process<T>(
        pid: u32,
        use_handle: impl FnOnce(HANDLE) -> T,
    ) -> Result<T, InspectionError> {
        let handle = open_process(pid)?;
        let result = use_handle(handle);
        if let Err(err) = unsafe { CloseHandle(handle) } {
            debug!(pid, error = %err, "failed to close process handle");
        }
        Ok(result)
    }

    fn open_process(pid: u32) -> Result<HANDLE, InspectionError> {
        // VM_READ is only needed by the module-name fallback and is refused for
        // elevated processes, so retry with the limited right alone.
        let with_vm_read = unsafe {
            OpenProcess(
                PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_VM_READ,
                false,
                pid,
            )
        };
        match with_vm_read {
            Ok(handle) => Ok(handle),
            Err(_) => unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) }
                .map_err(|err| InspectionError::OpenProcess {
                    pid,
                    message: err.to_string(),
                }),
        }
    }

    fn executable_path(pid: u32, handle: HANDLE) -> Result<String, InspectionError> {
        let mut buf = vec![0u16; IMAGE_PATH_CAPACITY];
        let mut size = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let primary = unsafe {
            QueryFullProcessImageNameW(
                handle,
                PROCESS_NAME_WIN32,
                PWSTR(buf.as_mut_ptr()),
                &mut size,
            )
        };

        match primary {
            Ok(()) => {
                let len = usize::try_from(size).unwrap_or(0).min(buf.len());
                Ok(String::from_utf16_lossy(&buf[..len]))
            }
            Err(err) => {
                debug!(
                    pid,
                    error = %err,
                    "QueryFullProcessImageNameW failed, trying module file name"
                );
                module_file_name(pid, handle)
            }
        }
    }

    fn module_file_name(pid: u32, handle: HANDLE) -> Result<String, InspectionError> {
        let mut buf = vec![0u16; usize::try_from(MAX_PATH).unwrap_or(260)];
        let copied = unsafe { K32GetModuleFileNameExW(handle, HMODULE::default(), &mut buf) };
        let len = usize::try_from(copied).unwrap_or(0).min(buf.len());
        if len == 0 {
            return Err(InspectionError::ImagePath {
                pid,
                message: windows::core::Error::from_win32().to_string(),
            });
        }
        Ok(String::from_utf16_lossy(&buf[..len]))
    }
}
