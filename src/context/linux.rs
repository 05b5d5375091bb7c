use std::fs;
use std::process::Command;

use super::SystemProbe;

const OS_RELEASE_PATH: &str = "/etc/os-release";

#[derive(Debug, Clone, Default)]
pub struct LinuxProbe;

impl LinuxProbe {
    pub fn new() -> Self {
        Self
    }
}

impl SystemProbe for LinuxProbe {
    fn active_app(&self) -> Option<String> {
        let output = Command::new("xdotool")
            .args(["getactivewindow", "getwindowname"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Some(name).filter(|value| !value.is_empty())
    }

    fn platform_version(&self) -> Option<String> {
        let release = fs::read_to_string(OS_RELEASE_PATH).ok()?;
        pretty_name(&release)
    }
}

pub fn pretty_name(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}
