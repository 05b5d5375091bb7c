//! Read-only snapshot of the environment a pipeline run happens in.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;

pub mod linux;
pub mod macos;
pub mod windows;

pub const UNKNOWN: &str = "unknown";

/// Platform hooks for the fields that need OS cooperation.
pub trait SystemProbe: Send + Sync {
    fn active_app(&self) -> Option<String>;

    fn platform_version(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct NullProbe;

impl SystemProbe for NullProbe {
    fn active_app(&self) -> Option<String> {
        None
    }
}

pub fn default_probe() -> Arc<dyn SystemProbe> {
    if cfg!(target_os = "macos") {
        Arc::new(macos::MacOsProbe::new())
    } else if cfg!(target_os = "linux") {
        Arc::new(linux::LinuxProbe::new())
    } else if cfg!(windows) {
        Arc::new(windows::WindowsProbe::new())
    } else {
        Arc::new(NullProbe)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub active_app: String,
    pub time_of_day: String,
    pub day_of_week: String,
    pub timestamp: DateTime<Utc>,
    pub platform: String,
    pub platform_version: String,
    pub app_version: String,
    pub process_id: u32,
}

impl ContextSnapshot {
    /// Snapshot with every detected field set to the sentinel.
    pub fn unknown() -> Self {
        let now = Local::now();
        Self {
            active_app: UNKNOWN.to_string(),
            time_of_day: now.format("%H:%M:%S").to_string(),
            day_of_week: now.format("%A").to_string(),
            timestamp: now.with_timezone(&Utc),
            platform: UNKNOWN.to_string(),
            platform_version: UNKNOWN.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            process_id: std::process::id(),
        }
    }

    pub fn is_known(value: &str) -> bool {
        value != UNKNOWN
    }
}

#[derive(Clone)]
pub struct ContextBuilder {
    probe: Arc<dyn SystemProbe>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new(default_probe())
    }
}

impl ContextBuilder {
    pub fn new(probe: Arc<dyn SystemProbe>) -> Self {
        Self { probe }
    }

    pub fn build(&self) -> ContextSnapshot {
        self.build_at(Local::now())
    }

    pub fn build_at(&self, now: DateTime<Local>) -> ContextSnapshot {
        ContextSnapshot {
            active_app: probe_field(|| self.probe.active_app()),
            time_of_day: now.format("%H:%M:%S").to_string(),
            day_of_week: now.format("%A").to_string(),
            timestamp: now.with_timezone(&Utc),
            platform: sentinel_if_empty(std::env::consts::OS),
            platform_version: probe_field(|| self.probe.platform_version()),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            process_id: std::process::id(),
        }
    }
}

fn probe_field(detect: impl FnOnce() -> Option<String>) -> String {
    match panic::catch_unwind(AssertUnwindSafe(detect)) {
        Ok(Some(value)) => sentinel_if_empty(value.trim()),
        Ok(None) => UNKNOWN.to_string(),
        Err(_) => {
            tracing::debug!("context probe panicked; using sentinel");
            UNKNOWN.to_string()
        }
    }
}

fn sentinel_if_empty(value: &str) -> String {
    if value.is_empty() {
        UNKNOWN.to_string()
    } else {
        value.to_string()
    }
}
