//! The capability set every plugin exposes to the pipeline.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::ContextSnapshot;
use crate::model::Clip;

pub mod config;

pub use config::{ConfigError, PipelineConfig, PipelineSettings, PluginOptions, PluginSettings};

/// Execution tier. Lower rank runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PriorityTier {
    Critical = 1,
    High = 2,
    Medium = 3,
    Low = 4,
}

impl PriorityTier {
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PriorityTier::Critical => "critical",
            PriorityTier::High => "high",
            PriorityTier::Medium => "medium",
            PriorityTier::Low => "low",
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PluginError {
    #[error("initialization failed: {0}")]
    Init(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Runtime(String),
    #[error("cancelled")]
    Cancelled,
}

/// Lifecycle as seen from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Initializing,
    Ready,
    Processing,
    Disabled,
    ShuttingDown,
    Unregistered,
}

/// Per-call handle passed to every hook.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub run_id: Uuid,
    pub snapshot: Arc<ContextSnapshot>,
    /// Fired when the call's budget runs out. Long-running plugins should
    /// select on it and release what they hold.
    pub cancel: CancellationToken,
}

impl HookContext {
    pub fn new(run_id: Uuid, snapshot: Arc<ContextSnapshot>, cancel: CancellationToken) -> Self {
        Self {
            run_id,
            snapshot,
            cancel,
        }
    }

    pub fn detached(snapshot: ContextSnapshot) -> Self {
        Self::new(Uuid::new_v4(), Arc::new(snapshot), CancellationToken::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PasteDecision {
    Proceed(Clip),
    Veto { reason: String },
}

impl PasteDecision {
    pub fn veto(reason: impl Into<String>) -> Self {
        PasteDecision::Veto {
            reason: reason.into(),
        }
    }

    pub fn is_veto(&self) -> bool {
        matches!(self, PasteDecision::Veto { .. })
    }
}

/// A processing unit registered with the pipeline.
///
/// `name()` is the plugin's enrichment namespace: `process_clip` may write
/// `metadata.enrichments[name()]` and union into tags, security flags,
/// relationships, predictions and confidence scores. Anything else it
/// changes is reverted by the manager.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn tier(&self) -> PriorityTier;

    fn version(&self) -> &str;

    /// Called once, before any hook. An error disables the plugin for the
    /// rest of the process.
    async fn initialize(&mut self, options: &PluginOptions) -> Result<(), PluginError>;

    async fn process_clip(&self, clip: Clip, ctx: HookContext) -> Result<Clip, PluginError>;

    async fn on_paste(&self, clip: Clip, _ctx: HookContext) -> Result<PasteDecision, PluginError> {
        Ok(PasteDecision::Proceed(clip))
    }

    async fn on_search(
        &self,
        _query: String,
        results: Vec<Clip>,
        _ctx: HookContext,
    ) -> Result<Vec<Clip>, PluginError> {
        Ok(results)
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        Ok(())
    }
}
