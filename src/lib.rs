pub mod context;
pub mod db;
pub mod error;
pub mod history;
pub mod model;
pub mod pipeline;
pub mod plugin;
pub mod plugins;
mod utils;

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub use context::{ContextBuilder, ContextSnapshot, SystemProbe};
pub use error::{AppError, AppResult};
pub use history::{HistoryManager, HistoryStats, LoadReport};
pub use model::{Clip, ClipMetadata};
pub use pipeline::{PasteOutcome, PipelineError, PipelineManager, PluginOutcome, RunRecord};
pub use plugin::{HookContext, PasteDecision, PipelineConfig, Plugin, PluginError, PriorityTier};

const DB_FILE: &str = "clipstash.sqlite3";
const CONFIG_FILE: &str = "plugins.json";

/// Installs the compact `fmt` subscriber. `RUST_LOG` overrides the default
/// `info` filter. Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

/// Opens the history stored under `data_dir` with the built-in plugins
/// registered from `plugins.json` in the same directory.
pub async fn open(data_dir: &Path) -> AppResult<HistoryManager> {
    std::fs::create_dir_all(data_dir).map_err(|err| AppError::Internal(err.to_string()))?;

    let db = Arc::new(db::Database::new(&data_dir.join(DB_FILE))?);
    let config = PipelineConfig::load_or_default(&data_dir.join(CONFIG_FILE));
    let pipeline = Arc::new(PipelineManager::new(config));
    let registered = plugins::register_builtin(&pipeline).await;
    info!("registered {registered} plugins");

    let settings = db.get_settings()?;
    let _ = db.prune_excess(settings.history_limit);

    let history = HistoryManager::new(db, pipeline, ContextBuilder::default());
    let report = history.load()?;
    if !report.dropped.is_empty() {
        warn!("{} stored clips could not be read", report.dropped.len());
    }
    Ok(history)
}
