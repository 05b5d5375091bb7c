//! Clip history backed by SQLite, with every capture, paste and search
//! routed through the plugin pipeline.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::{ContextBuilder, ContextSnapshot};
use crate::db::{Database, RecordRow, Settings};
use crate::error::{AppError, AppResult};
use crate::model::{record, Clip, RecordError};
use crate::pipeline::{PasteOutcome, PipelineManager, ProcessOutcome};
use crate::plugin::PluginState;

/// A stored or imported record that could not be turned into a clip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedRecord {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub clips: Vec<Clip>,
    pub dropped: Vec<DroppedRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total: usize,
    pub pinned: usize,
    pub enriched: usize,
    pub flagged: usize,
    pub tagged: usize,
    pub plugins_active: usize,
    pub plugins_list: Vec<String>,
    pub plugins_ready: usize,
}

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct HistoryManager {
    db: Arc<Database>,
    pipeline: Arc<PipelineManager>,
    context: ContextBuilder,
    probe_timeout: Duration,
}

impl HistoryManager {
    pub fn new(db: Arc<Database>, pipeline: Arc<PipelineManager>, context: ContextBuilder) -> Self {
        Self {
            db,
            pipeline,
            context,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Bounds how long a context snapshot may wait on the system probe.
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn pipeline(&self) -> &Arc<PipelineManager> {
        &self.pipeline
    }

    pub fn settings(&self) -> AppResult<Settings> {
        Ok(self.db.get_settings()?)
    }

    pub fn update_settings(&self, settings: &Settings) -> AppResult<()> {
        self.db.update_settings(settings)?;
        self.db.prune_excess(settings.history_limit)?;
        Ok(())
    }

    /// Captures `content` as the newest clip. Returns `None` when the content
    /// is blank, too large, or tracking is paused.
    pub async fn add(&self, content: &str) -> AppResult<Option<ProcessOutcome>> {
        let settings = self.db.get_settings()?;
        if settings.tracking_paused {
            return Ok(None);
        }
        if content.trim().is_empty() {
            return Ok(None);
        }
        if content.len() as i64 > settings.max_clip_bytes {
            debug!(
                bytes = content.len(),
                limit = settings.max_clip_bytes,
                "skipping oversized clip"
            );
            return Ok(None);
        }

        let mut clip = Clip::new(content);
        if let Some(existing) = self.db.get_record(clip.fingerprint())? {
            debug!("moving duplicate clip to top: {}", clip.preview(40));
            clip.pinned = existing.pinned;
        }

        let outcome = self.pipeline.process_clip(clip, self.snapshot().await).await;
        self.db.save_clip(&outcome.clip)?;

        let pruned = self.db.prune_excess(settings.history_limit)?;
        if !pruned.is_empty() {
            debug!(
                "trimmed {} clips past history limit {}",
                pruned.len(),
                settings.history_limit
            );
        }

        Ok(Some(outcome))
    }

    /// Runs the paste hooks for a stored clip.
    pub async fn paste(&self, fingerprint: &str) -> AppResult<PasteOutcome> {
        let row = self.db.get_record(fingerprint)?.ok_or(AppError::NotFound)?;
        let clip = decode_row(&row)?;
        let outcome = self.pipeline.on_paste(clip, self.snapshot().await).await;
        if let PasteOutcome::Blocked { plugin, reason, .. } = &outcome {
            warn!(plugin = %plugin, "paste blocked: {reason}");
        }
        Ok(outcome)
    }

    /// Case-insensitive substring search, then the search hooks. An empty
    /// query returns the whole history without running hooks.
    pub async fn search(&self, query: &str) -> AppResult<Vec<Clip>> {
        if query.is_empty() {
            return self.list();
        }

        let rows = self.db.search_records(query)?;
        let matches = decode_rows(&rows).clips;
        let outcome = self
            .pipeline
            .on_search(query, matches, self.snapshot().await)
            .await;
        debug!("search returned {} results", outcome.results.len());
        Ok(outcome.results)
    }

    pub fn set_pinned(&self, fingerprint: &str, pinned: bool) -> AppResult<()> {
        if !self.db.set_pinned(fingerprint, pinned)? {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    pub fn delete(&self, fingerprint: &str) -> AppResult<()> {
        if !self.db.delete_clip(fingerprint)? {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    pub fn clear_unpinned(&self) -> AppResult<usize> {
        let deleted = self.db.delete_unpinned()?;
        info!("cleared {deleted} unpinned clips");
        Ok(deleted)
    }

    pub fn list(&self) -> AppResult<Vec<Clip>> {
        Ok(self.load()?.clips)
    }

    /// Reads every stored clip. Rows whose record cannot be decoded are
    /// reported in `dropped`; they never fail the load.
    pub fn load(&self) -> AppResult<LoadReport> {
        let rows = self.db.list_records()?;
        let report = decode_rows(&rows);
        info!(
            "loaded {} clips, dropped {}",
            report.clips.len(),
            report.dropped.len()
        );
        Ok(report)
    }

    /// Imports a JSON array of clip records, such as a `history.json` file
    /// from older versions. Records without usable content, or that fail to
    /// store, are dropped. Imported clips are re-keyed to current
    /// fingerprints and their relationships follow.
    pub fn import_legacy(&self, json: &str) -> AppResult<LoadReport> {
        let entries: Vec<Value> = serde_json::from_str(json).map_err(RecordError::from)?;
        let mut report = LoadReport::default();

        let mut loaded = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            match record::from_record(entry) {
                Ok(load) => {
                    if !load.recovered.is_empty() {
                        warn!(
                            entry = index,
                            "recovered legacy fields with defaults: {}",
                            load.recovered.join(", ")
                        );
                    }
                    loaded.push((index, load.clip));
                }
                Err(err) => {
                    warn!(entry = index, "dropping legacy record: {err}");
                    report.dropped.push(DroppedRecord {
                        source: format!("entry {index}"),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let rekeyed: Vec<(usize, String, Clip)> = loaded
            .into_iter()
            .map(|(index, clip)| {
                let legacy = clip.fingerprint().to_string();
                (index, legacy, clip.rekeyed())
            })
            .collect();
        let renamed: HashMap<String, String> = rekeyed
            .iter()
            .filter(|(_, legacy, clip)| legacy != clip.fingerprint())
            .map(|(_, legacy, clip)| (legacy.clone(), clip.fingerprint().to_string()))
            .collect();

        for (index, _, mut clip) in rekeyed {
            for target in clip.metadata.relationships.iter_mut() {
                if let Some(current) = renamed.get(target.as_str()) {
                    *target = current.clone();
                }
            }
            match self.db.save_clip(&clip) {
                Ok(()) => report.clips.push(clip),
                Err(err) => {
                    warn!(entry = index, "failed to store legacy record: {err}");
                    report.dropped.push(DroppedRecord {
                        source: format!("entry {index}"),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let settings = self.db.get_settings()?;
        self.db.prune_excess(settings.history_limit)?;
        info!(
            "imported {} legacy clips, dropped {}",
            report.clips.len(),
            report.dropped.len()
        );
        Ok(report)
    }

    pub fn stats(&self) -> AppResult<HistoryStats> {
        let clips = self.list()?;
        let plugins_used: BTreeSet<&str> = clips
            .iter()
            .flat_map(|clip| clip.metadata.enrichments.keys().map(String::as_str))
            .collect();
        let plugins_ready = self
            .pipeline
            .plugins()
            .iter()
            .filter(|plugin| matches!(plugin.state, PluginState::Ready | PluginState::Processing))
            .count();

        Ok(HistoryStats {
            total: clips.len(),
            pinned: clips.iter().filter(|clip| clip.pinned).count(),
            enriched: clips
                .iter()
                .filter(|clip| !clip.metadata.enrichments.is_empty())
                .count(),
            flagged: clips
                .iter()
                .filter(|clip| !clip.metadata.security_flags.is_empty())
                .count(),
            tagged: clips.iter().filter(|clip| !clip.metadata.tags.is_empty()).count(),
            plugins_active: plugins_used.len(),
            plugins_list: plugins_used.into_iter().map(str::to_string).collect(),
            plugins_ready,
        })
    }

    /// Probing the active app may shell out, so it runs off the async
    /// workers and gets at most `probe_timeout`.
    async fn snapshot(&self) -> Arc<ContextSnapshot> {
        let builder = self.context.clone();
        let probe = tokio::task::spawn_blocking(move || builder.build());
        match tokio::time::timeout(self.probe_timeout, probe).await {
            Ok(Ok(snapshot)) => Arc::new(snapshot),
            Ok(Err(err)) => {
                warn!("context snapshot failed: {err}");
                Arc::new(ContextSnapshot::unknown())
            }
            Err(_) => {
                warn!("context probe exceeded {:?}", self.probe_timeout);
                Arc::new(ContextSnapshot::unknown())
            }
        }
    }
}

fn decode_row(row: &RecordRow) -> Result<Clip, RecordError> {
    let load = record::from_json_str(&row.record)?;
    if !load.recovered.is_empty() {
        warn!(
            row = row.id,
            "recovered stored fields with defaults: {}",
            load.recovered.join(", ")
        );
    }
    let mut clip = load.clip;
    clip.pinned = row.pinned;
    Ok(clip)
}

fn decode_rows(rows: &[RecordRow]) -> LoadReport {
    let mut report = LoadReport::default();
    for row in rows {
        match decode_row(row) {
            Ok(clip) => report.clips.push(clip),
            Err(err) => {
                warn!(row = row.id, fingerprint = %row.fingerprint, "dropping stored record: {err}");
                report.dropped.push(DroppedRecord {
                    source: format!("row {}", row.id),
                    reason: err.to_string(),
                });
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::context::{NullProbe, SystemProbe};
    use crate::plugin::{
        HookContext, PipelineConfig, Plugin, PluginError, PluginOptions, PriorityTier,
    };
    use crate::plugins::register_builtin;
    use crate::utils::hash::fingerprint;

    /// Holds every capture until released.
    struct Holdup {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Plugin for Holdup {
        fn name(&self) -> &str {
            "Holdup"
        }

        fn tier(&self) -> PriorityTier {
            PriorityTier::Low
        }

        fn version(&self) -> &str {
            "0.1.0"
        }

        async fn initialize(&mut self, _options: &PluginOptions) -> Result<(), PluginError> {
            Ok(())
        }

        async fn process_clip(&self, clip: Clip, _ctx: HookContext) -> Result<Clip, PluginError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(clip)
        }
    }

    struct StalledProbe;

    impl SystemProbe for StalledProbe {
        fn active_app(&self) -> Option<String> {
            std::thread::sleep(Duration::from_millis(500));
            Some("Late".to_string())
        }
    }

    async fn history_with(config: PipelineConfig) -> HistoryManager {
        let db = Arc::new(Database::new_in_memory().expect("db"));
        let pipeline = Arc::new(PipelineManager::new(config));
        assert_eq!(register_builtin(&pipeline).await, 3);
        HistoryManager::new(db, pipeline, ContextBuilder::new(Arc::new(NullProbe)))
    }

    async fn history() -> HistoryManager {
        history_with(PipelineConfig::default()).await
    }

    #[tokio::test]
    async fn add_enriches_and_persists() {
        let history = history().await;
        let outcome = history
            .add("AKIA1234567890EXAMPLE")
            .await
            .expect("add")
            .expect("clip captured");
        assert_eq!(outcome.clip.metadata.security_flags.as_slice(), ["api_key"]);

        let clips = history.list().expect("list");
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0], outcome.clip);
        assert!(clips[0].metadata.enrichment("SecurityMonitor").is_some());
    }

    #[tokio::test]
    async fn skips_blank_oversized_and_paused() {
        let history = history().await;
        assert!(history.add("").await.expect("add").is_none());
        assert!(history.add("   \n\t").await.expect("add").is_none());

        history
            .update_settings(&Settings {
                max_clip_bytes: 4,
                ..Settings::default()
            })
            .expect("settings");
        assert!(history.add("too long").await.expect("add").is_none());

        history
            .update_settings(&Settings {
                tracking_paused: true,
                ..Settings::default()
            })
            .expect("settings");
        assert!(history.add("ok").await.expect("add").is_none());
        assert!(history.list().expect("list").is_empty());
    }

    #[tokio::test]
    async fn duplicate_moves_to_top_and_keeps_pin() {
        let history = history().await;
        let first = history.add("first").await.expect("add").expect("clip").clip;
        history.add("second").await.expect("add");
        history.set_pinned(first.fingerprint(), true).expect("pin");

        let again = history.add("first").await.expect("add").expect("clip").clip;
        assert!(again.pinned);
        assert!(again.timestamp() >= first.timestamp());

        let clips = history.list().expect("list");
        assert_eq!(clips.len(), 2);
        assert_eq!(clips[0].fingerprint(), first.fingerprint());
        assert!(clips[0].pinned);
    }

    #[tokio::test]
    async fn prune_keeps_pinned_clips() {
        let history = history().await;
        history
            .update_settings(&Settings {
                history_limit: 2,
                ..Settings::default()
            })
            .expect("settings");

        let keep = history.add("keep me").await.expect("add").expect("clip").clip;
        history.set_pinned(keep.fingerprint(), true).expect("pin");
        for content in ["one", "two", "three"] {
            history.add(content).await.expect("add");
        }

        let contents: Vec<String> = history
            .list()
            .expect("list")
            .iter()
            .map(|clip| clip.content().to_string())
            .collect();
        assert_eq!(contents, vec!["keep me", "three", "two"]);
    }

    #[tokio::test]
    async fn paste_runs_hooks_and_can_be_blocked() {
        let config = PipelineConfig::from_json_str(
            r#"{ "plugins": { "SecurityMonitor": { "config": { "block_sensitive": true } } } }"#,
        )
        .expect("config");
        let history = history_with(config).await;
        let secret = history
            .add("token = abcdefghijklmnopqrstuvwxyz")
            .await
            .expect("add")
            .expect("clip")
            .clip;
        let plain = history.add("lunch at noon").await.expect("add").expect("clip").clip;

        assert!(history.paste(secret.fingerprint()).await.expect("paste").is_blocked());
        let allowed = history.paste(plain.fingerprint()).await.expect("paste");
        assert_eq!(allowed.into_clip().expect("allowed").content(), "lunch at noon");

        assert!(matches!(history.paste("missing").await, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn search_matches_substring_ignoring_case() {
        let history = history().await;
        history.add("Rust ownership notes").await.expect("add");
        history.add("grocery list").await.expect("add");

        let results = history.search("RUST").await.expect("search");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content(), "Rust ownership notes");

        assert_eq!(history.search("").await.expect("search all").len(), 2);
        assert!(history.search("absent").await.expect("search").is_empty());
    }

    #[tokio::test]
    async fn load_drops_irrecoverable_rows() {
        let history = history().await;
        history.add("good clip").await.expect("add");
        history.db.insert_raw("bad-json", "x", "not json").expect("raw");
        history.db.insert_raw("no-content", "y", "{}").expect("raw");

        let report = history.load().expect("load");
        assert_eq!(report.clips.len(), 1);
        assert_eq!(report.dropped.len(), 2);
        assert!(report
            .dropped
            .iter()
            .any(|dropped| dropped.reason == RecordError::MissingContent.to_string()));
    }

    #[tokio::test]
    async fn imports_legacy_history() {
        let history = history().await;
        let legacy = json!([
            {
                "content": "old clip",
                "timestamp": "2024-05-01T10:00:00",
                "pinned": true,
                "hash": "1a2b3c4d"
            },
            { "timestamp": "2024-05-01T10:00:00" },
            {
                "content": "with metadata",
                "hash": "9f8e7d6c",
                "metadata": {
                    "tags": ["text", "text"],
                    "security_flags": "bogus",
                    "relationships": ["1a2b3c4d", "00000000"]
                }
            }
        ])
        .to_string();

        let report = history.import_legacy(&legacy).expect("import");
        assert_eq!(report.clips.len(), 2);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].source, "entry 1");

        let clips = history.list().expect("list");
        let old = clips
            .iter()
            .find(|clip| clip.content() == "old clip")
            .expect("imported");
        assert!(old.pinned);
        assert_eq!(old.fingerprint(), fingerprint("old clip"));

        let related = clips
            .iter()
            .find(|clip| clip.content() == "with metadata")
            .expect("imported");
        assert_eq!(
            related.metadata.relationships,
            vec![fingerprint("old clip"), "00000000".to_string()]
        );

        assert!(matches!(
            history.import_legacy("{\"content\": \"x\"}"),
            Err(AppError::Record(_))
        ));
    }

    #[tokio::test]
    async fn blank_legacy_entries_are_dropped_without_aborting() {
        let history = history().await;
        let legacy = json!([
            { "content": "first" },
            { "content": "" },
            { "content": "   " },
            { "content": "third" }
        ])
        .to_string();

        let report = history.import_legacy(&legacy).expect("import");
        assert_eq!(report.clips.len(), 2);
        let sources: Vec<&str> = report.dropped.iter().map(|dropped| dropped.source.as_str()).collect();
        assert_eq!(sources, vec!["entry 1", "entry 2"]);

        let mut contents: Vec<String> = history
            .list()
            .expect("list")
            .iter()
            .map(|clip| clip.content().to_string())
            .collect();
        contents.sort();
        assert_eq!(contents, vec!["first", "third"]);
    }

    #[tokio::test]
    async fn recapturing_imported_content_reuses_its_row() {
        let history = history().await;
        history
            .import_legacy(&json!([{ "content": "old clip", "hash": "1a2b3c4d", "pinned": true }]).to_string())
            .expect("import");

        let again = history.add("old clip").await.expect("add").expect("clip").clip;
        assert!(again.pinned);

        let clips = history.list().expect("list");
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].fingerprint(), again.fingerprint());
    }

    #[tokio::test]
    async fn pin_set_during_recapture_survives() {
        let history = history().await;
        let first = history.add("note").await.expect("add").expect("clip").clip;

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        history
            .pipeline()
            .register(Holdup {
                started: Arc::clone(&started),
                release: Arc::clone(&release),
            })
            .await
            .expect("register");

        let (recaptured, ()) = tokio::join!(history.add("note"), async {
            started.notified().await;
            history.set_pinned(first.fingerprint(), true).expect("pin");
            release.notify_one();
        });
        recaptured.expect("add").expect("clip");

        let clips = history.list().expect("list");
        assert_eq!(clips.len(), 1);
        assert!(clips[0].pinned);
    }

    #[tokio::test]
    async fn stalled_probe_does_not_hold_up_captures() {
        let db = Arc::new(Database::new_in_memory().expect("db"));
        let pipeline = Arc::new(PipelineManager::default());
        let history = HistoryManager::new(db, pipeline, ContextBuilder::new(Arc::new(StalledProbe)))
            .with_probe_timeout(Duration::from_millis(50));

        let added = tokio::time::timeout(Duration::from_millis(400), history.add("quick"))
            .await
            .expect("add finished before the probe")
            .expect("add");
        assert!(added.is_some());
        assert_eq!(history.list().expect("list").len(), 1);
    }

    #[tokio::test]
    async fn stats_summarize_history() {
        let history = history().await;
        let secret = history
            .add("AKIA1234567890EXAMPLE")
            .await
            .expect("add")
            .expect("clip")
            .clip;
        history.add("plain words here").await.expect("add");
        history.set_pinned(secret.fingerprint(), true).expect("pin");

        let stats = history.stats().expect("stats");
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pinned, 1);
        assert_eq!(stats.enriched, 2);
        assert_eq!(stats.flagged, 1);
        assert_eq!(stats.tagged, 2);
        assert_eq!(stats.plugins_ready, 3);
        assert_eq!(
            stats.plugins_list,
            vec!["ContentEnricher", "KnowledgeGraph", "SecurityMonitor"]
        );
        assert_eq!(stats.plugins_active, 3);
    }

    #[tokio::test]
    async fn pin_and_delete_report_missing_clips() {
        let history = history().await;
        let clip = history.add("short lived").await.expect("add").expect("clip").clip;
        history.add("pinned keeper").await.expect("add");
        let keeper = history.list().expect("list")[0].clone();
        history.set_pinned(keeper.fingerprint(), true).expect("pin");

        history.delete(clip.fingerprint()).expect("delete");
        assert!(matches!(history.delete(clip.fingerprint()), Err(AppError::NotFound)));
        assert!(matches!(history.set_pinned("missing", true), Err(AppError::NotFound)));

        assert_eq!(history.clear_unpinned().expect("clear"), 0);
        assert_eq!(history.list().expect("list").len(), 1);
    }
}
