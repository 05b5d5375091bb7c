use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::model::Clip;
use crate::plugin::PriorityTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    ProcessClip,
    OnPaste,
    OnSearch,
}

impl Hook {
    pub fn as_str(self) -> &'static str {
        match self {
            Hook::ProcessClip => "process_clip",
            Hook::OnPaste => "on_paste",
            Hook::OnSearch => "on_search",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum PluginOutcome {
    Success,
    SkippedDisabled,
    Failed(String),
    TimedOut,
    /// The run budget was spent before this plugin's turn.
    NotReached,
}

impl PluginOutcome {
    /// Whether the plugin's hook was actually invoked.
    pub fn was_invoked(&self) -> bool {
        matches!(
            self,
            PluginOutcome::Success | PluginOutcome::Failed(_) | PluginOutcome::TimedOut
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunEntry {
    pub plugin: String,
    pub tier: PriorityTier,
    pub outcome: PluginOutcome,
    pub elapsed: Duration,
    /// Contract violations that were reverted after this plugin returned.
    pub violations: Vec<String>,
}

/// What happened to each plugin during one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub hook: Hook,
    pub entries: Vec<RunEntry>,
    pub elapsed: Duration,
    pub budget_exhausted: bool,
}

impl RunRecord {
    pub fn new(hook: Hook) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            hook,
            entries: Vec::new(),
            elapsed: Duration::ZERO,
            budget_exhausted: false,
        }
    }

    pub(crate) fn push(
        &mut self,
        plugin: &str,
        tier: PriorityTier,
        outcome: PluginOutcome,
        elapsed: Duration,
        violations: Vec<String>,
    ) {
        self.entries.push(RunEntry {
            plugin: plugin.to_string(),
            tier,
            outcome,
            elapsed,
            violations,
        });
    }

    pub(crate) fn finish(&mut self, started: Instant) {
        self.elapsed = started.elapsed();
    }

    pub fn outcome_of(&self, plugin: &str) -> Option<&PluginOutcome> {
        self.entries
            .iter()
            .find(|entry| entry.plugin == plugin)
            .map(|entry| &entry.outcome)
    }

    /// Plugins whose hook was invoked, in invocation order.
    pub fn invoked(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| entry.outcome.was_invoked())
            .map(|entry| entry.plugin.as_str())
            .collect()
    }

    pub fn count(&self, outcome: &PluginOutcome) -> usize {
        self.entries
            .iter()
            .filter(|entry| &entry.outcome == outcome)
            .count()
    }

    pub fn violation_count(&self) -> usize {
        self.entries.iter().map(|entry| entry.violations.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub clip: Clip,
    pub record: RunRecord,
}

#[derive(Debug, Clone)]
pub enum PasteOutcome {
    Allowed {
        clip: Clip,
        record: RunRecord,
    },
    Blocked {
        plugin: String,
        reason: String,
        record: RunRecord,
    },
}

impl PasteOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, PasteOutcome::Blocked { .. })
    }

    pub fn record(&self) -> &RunRecord {
        match self {
            PasteOutcome::Allowed { record, .. } | PasteOutcome::Blocked { record, .. } => record,
        }
    }

    pub fn into_clip(self) -> Option<Clip> {
        match self {
            PasteOutcome::Allowed { clip, .. } => Some(clip),
            PasteOutcome::Blocked { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub results: Vec<Clip>,
    pub record: RunRecord,
}
