use std::process::Command;

use super::SystemProbe;

const FRONTMOST_APP_SCRIPT: &str =
    "tell application \"System Events\" to get name of first process whose frontmost is true";

#[derive(Debug, Clone, Default)]
pub struct MacOsProbe;

impl MacOsProbe {
    pub fn new() -> Self {
        Self
    }

    fn run(program: &str, args: &[&str]) -> Option<String> {
        let output = Command::new(program).args(args).output().ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Some(text).filter(|value| !value.is_empty())
    }
}

impl SystemProbe for MacOsProbe {
    fn active_app(&self) -> Option<String> {
        Self::run("osascript", &["-e", FRONTMOST_APP_SCRIPT])
    }

    fn platform_version(&self) -> Option<String> {
        Self::run("sw_vers", &["-productVersion"])
    }
}
