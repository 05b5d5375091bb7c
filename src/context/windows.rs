use std::process::Command;

use super::SystemProbe;

#[derive(Debug, Clone, Default)]
pub struct WindowsProbe;

impl WindowsProbe {
    pub fn new() -> Self {
        Self
    }
}

impl SystemProbe for WindowsProbe {
    fn active_app(&self) -> Option<String> {
        foreground_window_title()
    }

    fn platform_version(&self) -> Option<String> {
        let output = Command::new("cmd").args(["/C", "ver"]).output().ok()?;
        if !output.status.success() {
            return None;
        }
        version_from_ver(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(windows)]
fn foreground_window_title() -> Option<String> {
    use winapi::um::winuser::{GetForegroundWindow, GetWindowTextLengthW, GetWindowTextW};

    // SAFETY: the handle comes straight from the window manager and the
    // buffer outlives both calls that read it.
    unsafe {
        let hwnd = GetForegroundWindow();
        if hwnd.is_null() {
            return None;
        }
        let length = GetWindowTextLengthW(hwnd);
        if length <= 0 {
            return None;
        }
        let mut buffer = vec![0u16; length as usize + 1];
        let copied = GetWindowTextW(hwnd, buffer.as_mut_ptr(), buffer.len() as i32);
        if copied <= 0 {
            return None;
        }
        decode_title(&buffer[..copied as usize])
    }
}

#[cfg(not(windows))]
fn foreground_window_title() -> Option<String> {
    None
}

pub fn decode_title(wide: &[u16]) -> Option<String> {
    let title = String::from_utf16_lossy(wide);
    let title = title.trim_end_matches('\0').trim();
    Some(title.to_string()).filter(|value| !value.is_empty())
}

/// Pulls `10.0.19045.3693` out of `Microsoft Windows [Version 10.0.19045.3693]`.
pub fn version_from_ver(output: &str) -> Option<String> {
    let start = output.find("[Version ")? + "[Version ".len();
    let rest = &output[start..];
    let end = rest.find(']')?;
    Some(rest[..end].trim().to_string()).filter(|value| !value.is_empty())
}
