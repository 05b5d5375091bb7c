//! Ordered, fault-isolated execution of registered plugins.
//!
//! Every entry point returns a usable value: plugin failures, timeouts and
//! contract violations are logged and recorded in the run record, never
//! propagated to the caller.

mod invoke;
mod locks;
mod merge;
mod registry;
mod run;


use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::context::ContextSnapshot;
use crate::model::Clip;
use crate::plugin::{
    HookContext, PasteDecision, PipelineConfig, PipelineSettings, Plugin, PluginError, PluginState,
};

use invoke::{call_with_budget, CallError};
use locks::ClipLocks;
use merge::{merge_clip, merge_results};
use registry::{Pending, PluginEntry, Registry};

pub use registry::PluginSummary;
pub use run::{
    Hook, PasteOutcome, PluginOutcome, ProcessOutcome, RunEntry, RunRecord, SearchOutcome,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("plugin already registered: {0}")]
    DuplicatePlugin(String),
    #[error("plugin name must not be empty")]
    InvalidPluginName,
    #[error("plugin not found: {0}")]
    PluginNotFound(String),
    #[error("pipeline has been shut down")]
    ShutDown,
}

/// A plugin-level failure as the manager sees it. These are logged and
/// recorded; none of them ever reaches a hook caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PluginFault {
    #[error("plugin {plugin} failed to initialize: {reason}")]
    Init { plugin: String, reason: String },
    #[error("plugin {plugin} timed out after {budget:?}")]
    Timeout { plugin: String, budget: Duration },
    #[error("plugin {plugin} failed: {reason}")]
    Runtime { plugin: String, reason: String },
    #[error("plugin {plugin} has invalid configuration: {reason}")]
    Config { plugin: String, reason: String },
}

#[derive(Debug, Default)]
struct Counters {
    runs: AtomicU64,
    plugin_failures: AtomicU64,
    plugin_timeouts: AtomicU64,
    vetoes: AtomicU64,
    violations: AtomicU64,
    budget_exhaustions: AtomicU64,
    passthrough_runs: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub runs: u64,
    pub plugin_failures: u64,
    pub plugin_timeouts: u64,
    pub vetoes: u64,
    pub violations: u64,
    pub budget_exhaustions: u64,
    /// Calls answered without running any plugin because the pipeline was shut down.
    pub passthrough_runs: u64,
}

enum Attempt<T> {
    Completed(T, Duration),
    Faulted,
    OutOfBudget,
}

struct RunScope {
    run_id: Uuid,
    snapshot: Arc<ContextSnapshot>,
    deadline: Instant,
    cancel: CancellationToken,
}

pub struct PipelineManager {
    config: PipelineConfig,
    registry: Registry,
    pending: Pending,
    run_permits: Arc<Semaphore>,
    clip_locks: ClipLocks,
    counters: Counters,
    closed: AtomicBool,
    shutdown_token: CancellationToken,
}

impl Default for PipelineManager {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl PipelineManager {
    pub fn new(config: PipelineConfig) -> Self {
        let permits = config.pipeline.concurrency();
        Self {
            config,
            registry: Registry::default(),
            pending: Pending::default(),
            run_permits: Arc::new(Semaphore::new(permits)),
            clip_locks: ClipLocks::default(),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn with_settings(settings: PipelineSettings) -> Self {
        Self::new(PipelineConfig {
            pipeline: settings,
            ..PipelineConfig::default()
        })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.config.pipeline
    }

    pub async fn register<P: Plugin + 'static>(&self, plugin: P) -> Result<PluginState, PipelineError> {
        self.register_boxed(Box::new(plugin)).await
    }

    /// Initializes `plugin` with its configured options and adds it to the
    /// registry. A plugin whose configuration or initialization fails is
    /// still registered, as `Disabled`, so it shows up in diagnostics.
    pub async fn register_boxed(&self, mut plugin: Box<dyn Plugin>) -> Result<PluginState, PipelineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::ShutDown);
        }
        let name = plugin.name().trim().to_string();
        if name.is_empty() {
            return Err(PipelineError::InvalidPluginName);
        }
        if self.registry.contains(&name) {
            return Err(PipelineError::DuplicatePlugin(name));
        }
        let Some(_claim) = self.pending.claim(&name) else {
            return Err(PipelineError::DuplicatePlugin(name));
        };

        let (state, enabled, fault) = match self.config.plugin_settings(&name) {
            Err(err) => (
                PluginState::Disabled,
                false,
                Some(PluginFault::Config {
                    plugin: name.clone(),
                    reason: err.to_string(),
                }),
            ),
            Ok(settings) => {
                let init = timeout(
                    self.settings().init_timeout(),
                    plugin.initialize(&settings.options),
                )
                .await;
                match init {
                    Ok(Ok(())) => (PluginState::Ready, settings.enabled, None),
                    Ok(Err(PluginError::Config(reason))) => (
                        PluginState::Disabled,
                        settings.enabled,
                        Some(PluginFault::Config {
                            plugin: name.clone(),
                            reason,
                        }),
                    ),
                    Ok(Err(err)) => (
                        PluginState::Disabled,
                        settings.enabled,
                        Some(PluginFault::Init {
                            plugin: name.clone(),
                            reason: err.to_string(),
                        }),
                    ),
                    Err(_) => (
                        PluginState::Disabled,
                        settings.enabled,
                        Some(PluginFault::Init {
                            plugin: name.clone(),
                            reason: format!(
                                "initialize did not finish within {:?}",
                                self.settings().init_timeout()
                            ),
                        }),
                    ),
                }
            }
        };

        let entry = Arc::new(PluginEntry::new(
            Arc::from(plugin),
            self.registry.next_seq(),
            state,
            enabled,
        ));
        if let Some(fault) = fault {
            error!("{fault}");
            entry.set_last_error(fault.to_string());
        }
        if let Err(err) = self.registry.insert(Arc::clone(&entry)) {
            if entry.needs_shutdown() {
                if let Err(shutdown_err) = entry.plugin.shutdown().await {
                    warn!(plugin = %name, "shutdown after rejected registration failed: {shutdown_err}");
                }
            }
            return Err(err);
        }

        info!(
            plugin = %name,
            tier = %entry.tier,
            version = %entry.version,
            state = ?entry.state(),
            "plugin registered"
        );
        Ok(entry.state())
    }

    /// Flips the user-facing toggle. A plugin disabled by a fault stays disabled.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<PluginState, PipelineError> {
        let entry = self
            .registry
            .find(name)
            .ok_or_else(|| PipelineError::PluginNotFound(name.to_string()))?;
        entry.set_enabled(enabled);
        info!(plugin = %name, enabled, "plugin toggled");
        Ok(entry.state())
    }

    pub async fn unregister(&self, name: &str) -> Result<(), PipelineError> {
        let entry = self
            .registry
            .remove(name)
            .ok_or_else(|| PipelineError::PluginNotFound(name.to_string()))?;
        self.shutdown_entry(&entry).await;
        Ok(())
    }

    /// Shuts down every plugin in execution order. Afterwards all hook entry
    /// points return their input unchanged.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.run_permits.close();
        self.shutdown_token.cancel();
        let entries = self.registry.drain();
        for entry in &entries {
            self.shutdown_entry(entry).await;
        }
        info!(plugins = entries.len(), "pipeline shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Registered plugins in execution order.
    pub fn plugins(&self) -> Vec<PluginSummary> {
        self.registry
            .snapshot()
            .iter()
            .map(|entry| entry.summary())
            .collect()
    }

    pub fn plugin_state(&self, name: &str) -> Option<PluginState> {
        match self.registry.find(name) {
            Some(entry) => Some(entry.state()),
            None if self.pending.contains(name) => Some(PluginState::Initializing),
            None => None,
        }
    }

    /// Names of the plugins a run started now would invoke, in order.
    pub fn execution_order(&self) -> Vec<String> {
        self.registry
            .snapshot()
            .iter()
            .filter(|entry| entry.is_runnable())
            .map(|entry| entry.name.clone())
            .collect()
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            runs: c.runs.load(Ordering::SeqCst),
            plugin_failures: c.plugin_failures.load(Ordering::SeqCst),
            plugin_timeouts: c.plugin_timeouts.load(Ordering::SeqCst),
            vetoes: c.vetoes.load(Ordering::SeqCst),
            violations: c.violations.load(Ordering::SeqCst),
            budget_exhaustions: c.budget_exhaustions.load(Ordering::SeqCst),
            passthrough_runs: c.passthrough_runs.load(Ordering::SeqCst),
        }
    }

    pub async fn process_clip(&self, clip: Clip, snapshot: Arc<ContextSnapshot>) -> ProcessOutcome {
        let mut record = RunRecord::new(Hook::ProcessClip);
        let Some(_permit) = self.acquire_run_slot().await else {
            return ProcessOutcome { clip, record };
        };
        let _clip_guard = self.clip_locks.acquire(clip.fingerprint()).await;
        let span = info_span!(
            "pipeline_run",
            run_id = %record.run_id,
            hook = Hook::ProcessClip.as_str(),
            fingerprint = %clip.fingerprint()
        );

        async move {
            let started = Instant::now();
            let scope = self.begin_run(record.run_id, snapshot, started);
            let plan = self.plan();
            let mut clip = clip;

            for (index, (entry, runnable)) in plan.iter().enumerate() {
                if !runnable {
                    record.push(&entry.name, entry.tier, PluginOutcome::SkippedDisabled, Duration::ZERO, Vec::new());
                    continue;
                }
                let attempt = self
                    .attempt(entry, &scope, &mut record, |plugin, ctx| {
                        let input = clip.clone();
                        async move { plugin.process_clip(input, ctx).await }
                    })
                    .await;
                match attempt {
                    Attempt::Completed(output, elapsed) => {
                        let merged = merge_clip(&clip, output, &entry.name);
                        self.note_violations(&entry.name, &merged.violations);
                        clip = merged.value;
                        record.push(&entry.name, entry.tier, PluginOutcome::Success, elapsed, merged.violations);
                    }
                    Attempt::Faulted => {}
                    Attempt::OutOfBudget => {
                        self.mark_not_reached(&mut record, &plan[index..]);
                        break;
                    }
                }
            }

            self.end_run(&scope, &mut record, started);
            ProcessOutcome { clip, record }
        }
        .instrument(span)
        .await
    }

    /// Runs `on_paste` hooks in tier order. The first veto wins and no
    /// later hook is called. Failures and timeouts never block a paste.
    pub async fn on_paste(&self, clip: Clip, snapshot: Arc<ContextSnapshot>) -> PasteOutcome {
        let mut record = RunRecord::new(Hook::OnPaste);
        let Some(_permit) = self.acquire_run_slot().await else {
            return PasteOutcome::Allowed { clip, record };
        };
        let _clip_guard = self.clip_locks.acquire(clip.fingerprint()).await;
        let span = info_span!(
            "pipeline_run",
            run_id = %record.run_id,
            hook = Hook::OnPaste.as_str(),
            fingerprint = %clip.fingerprint()
        );

        async move {
            let started = Instant::now();
            let scope = self.begin_run(record.run_id, snapshot, started);
            let plan = self.plan();
            let mut clip = clip;

            for (index, (entry, runnable)) in plan.iter().enumerate() {
                if !runnable {
                    record.push(&entry.name, entry.tier, PluginOutcome::SkippedDisabled, Duration::ZERO, Vec::new());
                    continue;
                }
                let attempt = self
                    .attempt(entry, &scope, &mut record, |plugin, ctx| {
                        let input = clip.clone();
                        async move { plugin.on_paste(input, ctx).await }
                    })
                    .await;
                match attempt {
                    Attempt::Completed(PasteDecision::Proceed(output), elapsed) => {
                        let merged = merge_clip(&clip, output, &entry.name);
                        self.note_violations(&entry.name, &merged.violations);
                        clip = merged.value;
                        record.push(&entry.name, entry.tier, PluginOutcome::Success, elapsed, merged.violations);
                    }
                    Attempt::Completed(PasteDecision::Veto { reason }, elapsed) => {
                        record.push(&entry.name, entry.tier, PluginOutcome::Success, elapsed, Vec::new());
                        self.counters.vetoes.fetch_add(1, Ordering::SeqCst);
                        warn!(plugin = %entry.name, %reason, "paste vetoed");
                        self.end_run(&scope, &mut record, started);
                        return PasteOutcome::Blocked {
                            plugin: entry.name.clone(),
                            reason,
                            record,
                        };
                    }
                    Attempt::Faulted => {}
                    Attempt::OutOfBudget => {
                        self.mark_not_reached(&mut record, &plan[index..]);
                        break;
                    }
                }
            }

            self.end_run(&scope, &mut record, started);
            PasteOutcome::Allowed { clip, record }
        }
        .instrument(span)
        .await
    }

    /// Runs `on_search` hooks in tier order. A failing stage passes its
    /// input on to the next one.
    pub async fn on_search(
        &self,
        query: &str,
        results: Vec<Clip>,
        snapshot: Arc<ContextSnapshot>,
    ) -> SearchOutcome {
        let mut record = RunRecord::new(Hook::OnSearch);
        let Some(_permit) = self.acquire_run_slot().await else {
            return SearchOutcome { results, record };
        };
        let span = info_span!(
            "pipeline_run",
            run_id = %record.run_id,
            hook = Hook::OnSearch.as_str()
        );

        async move {
            let started = Instant::now();
            let scope = self.begin_run(record.run_id, snapshot, started);
            let plan = self.plan();
            let mut results = results;

            for (index, (entry, runnable)) in plan.iter().enumerate() {
                if !runnable {
                    record.push(&entry.name, entry.tier, PluginOutcome::SkippedDisabled, Duration::ZERO, Vec::new());
                    continue;
                }
                let attempt = self
                    .attempt(entry, &scope, &mut record, |plugin, ctx| {
                        let input = results.clone();
                        let query = query.to_string();
                        async move { plugin.on_search(query, input, ctx).await }
                    })
                    .await;
                match attempt {
                    Attempt::Completed(output, elapsed) => {
                        let merged = merge_results(&results, output, &entry.name);
                        self.note_violations(&entry.name, &merged.violations);
                        results = merged.value;
                        record.push(&entry.name, entry.tier, PluginOutcome::Success, elapsed, merged.violations);
                    }
                    Attempt::Faulted => {}
                    Attempt::OutOfBudget => {
                        self.mark_not_reached(&mut record, &plan[index..]);
                        break;
                    }
                }
            }

            self.end_run(&scope, &mut record, started);
            SearchOutcome { results, record }
        }
        .instrument(span)
        .await
    }

    async fn acquire_run_slot(&self) -> Option<OwnedSemaphorePermit> {
        if self.closed.load(Ordering::SeqCst) {
            self.counters.passthrough_runs.fetch_add(1, Ordering::SeqCst);
            return None;
        }
        match Arc::clone(&self.run_permits).acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => {
                self.counters.passthrough_runs.fetch_add(1, Ordering::SeqCst);
                None
            }
        }
    }

    fn begin_run(&self, run_id: Uuid, snapshot: Arc<ContextSnapshot>, started: Instant) -> RunScope {
        self.counters.runs.fetch_add(1, Ordering::SeqCst);
        RunScope {
            run_id,
            snapshot,
            deadline: started + self.settings().run_budget(),
            cancel: self.shutdown_token.child_token(),
        }
    }

    fn end_run(&self, scope: &RunScope, record: &mut RunRecord, started: Instant) {
        record.finish(started);
        // Nothing spawned for this run may keep working once it is over.
        scope.cancel.cancel();
        debug!(
            plugins = record.entries.len(),
            invoked = record.invoked().len(),
            violations = record.violation_count(),
            budget_exhausted = record.budget_exhausted,
            elapsed_ms = record.elapsed.as_millis() as u64,
            "pipeline run finished"
        );
    }

    /// The ordered plugin list for one run, with each plugin's eligibility
    /// fixed at run start.
    fn plan(&self) -> Vec<(Arc<PluginEntry>, bool)> {
        self.registry
            .snapshot()
            .iter()
            .map(|entry| (Arc::clone(entry), entry.is_runnable()))
            .collect()
    }

    async fn attempt<T, F, Fut>(
        &self,
        entry: &PluginEntry,
        scope: &RunScope,
        record: &mut RunRecord,
        call: F,
    ) -> Attempt<T>
    where
        F: FnOnce(Arc<dyn Plugin>, HookContext) -> Fut,
        Fut: Future<Output = Result<T, PluginError>> + Send + 'static,
        T: Send + 'static,
    {
        let remaining = scope.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Attempt::OutOfBudget;
        }
        let budget = remaining.min(self.settings().plugin_timeout());
        let cancel = scope.cancel.child_token();
        let ctx = HookContext::new(scope.run_id, Arc::clone(&scope.snapshot), cancel.clone());

        let _in_flight = entry.begin_call();
        let started = Instant::now();
        let result = call_with_budget(budget, &cancel, call(Arc::clone(&entry.plugin), ctx)).await;
        let elapsed = started.elapsed();
        let error_budget = self.settings().max_consecutive_failures;

        match result {
            Ok(value) => {
                entry.record_success();
                Attempt::Completed(value, elapsed)
            }
            Err(CallError::TimedOut) => {
                let fault = PluginFault::Timeout {
                    plugin: entry.name.clone(),
                    budget,
                };
                self.counters.plugin_timeouts.fetch_add(1, Ordering::SeqCst);
                warn!("{fault}");
                if entry.record_timeout(fault.to_string(), error_budget) {
                    warn!(plugin = %entry.name, "plugin disabled after {error_budget} consecutive failures");
                }
                record.push(&entry.name, entry.tier, PluginOutcome::TimedOut, elapsed, Vec::new());
                Attempt::Faulted
            }
            Err(CallError::Failed(reason)) => {
                let fault = PluginFault::Runtime {
                    plugin: entry.name.clone(),
                    reason: reason.clone(),
                };
                self.counters.plugin_failures.fetch_add(1, Ordering::SeqCst);
                error!("{fault}");
                if entry.record_failure(fault.to_string(), error_budget) {
                    warn!(plugin = %entry.name, "plugin disabled after {error_budget} consecutive failures");
                }
                record.push(&entry.name, entry.tier, PluginOutcome::Failed(reason), elapsed, Vec::new());
                Attempt::Faulted
            }
        }
    }

    fn mark_not_reached(&self, record: &mut RunRecord, rest: &[(Arc<PluginEntry>, bool)]) {
        for (entry, runnable) in rest {
            let outcome = if *runnable {
                PluginOutcome::NotReached
            } else {
                PluginOutcome::SkippedDisabled
            };
            record.push(&entry.name, entry.tier, outcome, Duration::ZERO, Vec::new());
        }
        record.budget_exhausted = true;
        self.counters.budget_exhaustions.fetch_add(1, Ordering::SeqCst);
        warn!(skipped = rest.len(), "run budget exhausted");
    }

    fn note_violations(&self, plugin: &str, violations: &[String]) {
        if violations.is_empty() {
            return;
        }
        self.counters
            .violations
            .fetch_add(violations.len() as u64, Ordering::SeqCst);
        warn!(plugin, violations = %violations.join("; "), "reverted contribution outside plugin namespace");
    }

    async fn shutdown_entry(&self, entry: &PluginEntry) {
        entry.set_lifecycle(PluginState::ShuttingDown);
        if entry.needs_shutdown() {
            match timeout(self.settings().plugin_timeout(), entry.plugin.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(plugin = %entry.name, "shutdown failed: {err}"),
                Err(_) => warn!(plugin = %entry.name, "shutdown timed out"),
            }
        }
        entry.set_lifecycle(PluginState::Unregistered);
        info!(plugin = %entry.name, "plugin unregistered");
    }
}
