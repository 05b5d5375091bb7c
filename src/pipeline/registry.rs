use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;

use crate::plugin::{Plugin, PluginState, PriorityTier};

use super::PipelineError;

#[derive(Debug, Default)]
pub(crate) struct PluginStats {
    invocations: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    consecutive_failures: AtomicU32,
}

/// Diagnostics view of one registered plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub name: String,
    pub tier: PriorityTier,
    pub version: String,
    pub state: PluginState,
    pub enabled: bool,
    pub invocations: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub last_error: Option<String>,
}

pub(crate) struct PluginEntry {
    pub(crate) plugin: Arc<dyn Plugin>,
    pub(crate) name: String,
    pub(crate) tier: PriorityTier,
    pub(crate) version: String,
    seq: u64,
    lifecycle: Mutex<PluginState>,
    enabled: AtomicBool,
    in_flight: AtomicUsize,
    stats: PluginStats,
    last_error: Mutex<Option<String>>,
    initialized: bool,
}

/// Decrements the in-flight count when a hook call ends.
pub(crate) struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PluginEntry {
    pub(crate) fn new(
        plugin: Arc<dyn Plugin>,
        seq: u64,
        lifecycle: PluginState,
        enabled: bool,
    ) -> Self {
        let name = plugin.name().trim().to_string();
        let tier = plugin.tier();
        let version = plugin.version().to_string();
        Self {
            plugin,
            name,
            tier,
            version,
            seq,
            lifecycle: Mutex::new(lifecycle),
            enabled: AtomicBool::new(enabled),
            in_flight: AtomicUsize::new(0),
            stats: PluginStats::default(),
            last_error: Mutex::new(None),
            initialized: lifecycle == PluginState::Ready,
        }
    }

    fn lifecycle(&self) -> PluginState {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_lifecycle(&self, state: PluginState) {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub(crate) fn state(&self) -> PluginState {
        match self.lifecycle() {
            PluginState::Ready if !self.is_enabled() => PluginState::Disabled,
            PluginState::Ready if self.in_flight.load(Ordering::SeqCst) > 0 => {
                PluginState::Processing
            }
            state => state,
        }
    }

    /// `initialize` succeeded, so `shutdown` is owed.
    pub(crate) fn needs_shutdown(&self) -> bool {
        self.initialized
    }

    pub(crate) fn is_runnable(&self) -> bool {
        self.lifecycle() == PluginState::Ready && self.is_enabled()
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn begin_call(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    pub(crate) fn set_last_error(&self, reason: String) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
    }

    pub(crate) fn record_success(&self) {
        self.stats.invocations.fetch_add(1, Ordering::SeqCst);
        self.stats.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Counts a failed call. Returns true when this call used up the
    /// plugin's error budget and it was disabled.
    pub(crate) fn record_failure(&self, reason: String, budget: u32) -> bool {
        self.stats.failures.fetch_add(1, Ordering::SeqCst);
        self.count_fault(reason, budget)
    }

    pub(crate) fn record_timeout(&self, reason: String, budget: u32) -> bool {
        self.stats.timeouts.fetch_add(1, Ordering::SeqCst);
        self.count_fault(reason, budget)
    }

    fn count_fault(&self, reason: String, budget: u32) -> bool {
        self.stats.invocations.fetch_add(1, Ordering::SeqCst);
        self.set_last_error(reason);
        let consecutive = self.stats.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if budget == 0 || consecutive < budget {
            return false;
        }
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if *lifecycle != PluginState::Ready {
            return false;
        }
        *lifecycle = PluginState::Disabled;
        true
    }

    pub(crate) fn summary(&self) -> PluginSummary {
        PluginSummary {
            name: self.name.clone(),
            tier: self.tier,
            version: self.version.clone(),
            state: self.state(),
            enabled: self.is_enabled(),
            invocations: self.stats.invocations.load(Ordering::SeqCst),
            failures: self.stats.failures.load(Ordering::SeqCst),
            timeouts: self.stats.timeouts.load(Ordering::SeqCst),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

/// Registered plugins in execution order. Runs take a cheap `Arc` snapshot,
/// so registration changes never affect a run already in progress.
#[derive(Default)]
pub(crate) struct Registry {
    entries: RwLock<Arc<Vec<Arc<PluginEntry>>>>,
    next_seq: AtomicU64,
}

impl Registry {
    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<PluginEntry>>> {
        Arc::clone(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub(crate) fn find(&self, name: &str) -> Option<Arc<PluginEntry>> {
        self.snapshot()
            .iter()
            .find(|entry| entry.name == name)
            .cloned()
    }

    pub(crate) fn insert(&self, entry: Arc<PluginEntry>) -> Result<(), PipelineError> {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if guard.iter().any(|existing| existing.name == entry.name) {
            return Err(PipelineError::DuplicatePlugin(entry.name.clone()));
        }
        let mut next: Vec<Arc<PluginEntry>> = guard.as_ref().clone();
        next.push(entry);
        next.sort_by_key(|entry| (entry.tier.rank(), entry.seq));
        *guard = Arc::new(next);
        Ok(())
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<PluginEntry>> {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let index = guard.iter().position(|entry| entry.name == name)?;
        let mut next: Vec<Arc<PluginEntry>> = guard.as_ref().clone();
        let removed = next.remove(index);
        *guard = Arc::new(next);
        Some(removed)
    }

    pub(crate) fn drain(&self) -> Vec<Arc<PluginEntry>> {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let drained = guard.as_ref().clone();
        *guard = Arc::new(Vec::new());
        drained
    }
}

/// Names of plugins whose `initialize` is still running. They report
/// `Initializing` and block a second registration under the same name.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    names: Arc<Mutex<HashSet<String>>>,
}

impl Pending {
    pub(crate) fn claim(&self, name: &str) -> Option<PendingClaim> {
        let mut names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        if !names.insert(name.to_string()) {
            return None;
        }
        Some(PendingClaim {
            names: Arc::clone(&self.names),
            name: name.to_string(),
        })
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }
}

/// Releases the name when registration finishes or is abandoned.
pub(crate) struct PendingClaim {
    names: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for PendingClaim {
    fn drop(&mut self) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}
