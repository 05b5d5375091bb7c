//! Plugins shipped with the application.

pub mod content_enricher;
pub mod knowledge_graph;
pub mod security_monitor;

pub use content_enricher::ContentEnricher;
pub use knowledge_graph::KnowledgeGraph;
pub use security_monitor::SecurityMonitor;

use tracing::warn;

use crate::pipeline::PipelineManager;
use crate::plugin::Plugin;

pub fn builtin() -> Vec<Box<dyn Plugin>> {
    vec![
        Box::new(SecurityMonitor::new()),
        Box::new(ContentEnricher::new()),
        Box::new(KnowledgeGraph::new()),
    ]
}

/// Registers every built-in plugin. A plugin that cannot be registered is
/// logged and skipped; the rest still load.
pub async fn register_builtin(manager: &PipelineManager) -> usize {
    let mut registered = 0;
    for plugin in builtin() {
        let name = plugin.name().to_string();
        match manager.register_boxed(plugin).await {
            Ok(_) => registered += 1,
            Err(err) => warn!(plugin = %name, "skipping built-in plugin: {err}"),
        }
    }
    registered
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::ContextSnapshot;
    use crate::model::Clip;
    use crate::pipeline::PasteOutcome;
    use crate::plugin::{PipelineConfig, PluginState};

    async fn manager(config: PipelineConfig) -> PipelineManager {
        let manager = PipelineManager::new(config);
        assert_eq!(register_builtin(&manager).await, 3);
        manager
    }

    #[tokio::test]
    async fn aws_key_scenario() {
        let manager = manager(PipelineConfig::default()).await;
        assert_eq!(
            manager.execution_order(),
            vec!["SecurityMonitor", "ContentEnricher", "KnowledgeGraph"]
        );

        let outcome = manager
            .process_clip(
                Clip::new("AKIA1234567890EXAMPLE"),
                Arc::new(ContextSnapshot::unknown()),
            )
            .await;
        let metadata = &outcome.clip.metadata;

        assert_eq!(metadata.security_flags.as_slice(), ["api_key"]);
        assert_eq!(metadata.enrichments["SecurityMonitor"]["risk_level"], "HIGH");
        assert_eq!(metadata.enrichments["ContentEnricher"]["content_type"], "text");
        let mut tags = metadata.tags.as_slice().to_vec();
        tags.dedup();
        assert_eq!(tags.len(), metadata.tags.len());
        assert_eq!(outcome.record.violation_count(), 0);
    }

    #[tokio::test]
    async fn blocking_config_vetoes_flagged_paste() {
        let config = PipelineConfig::from_json_str(
            r#"{ "plugins": { "SecurityMonitor": { "config": { "block_sensitive": true } } } }"#,
        )
        .expect("config");
        let manager = manager(config).await;
        let snapshot = Arc::new(ContextSnapshot::unknown());

        let processed = manager
            .process_clip(Clip::new("token = abcdefghijklmnopqrstuvwxyz"), Arc::clone(&snapshot))
            .await
            .clip;
        assert!(!processed.metadata.security_flags.is_empty());

        match manager.on_paste(processed, snapshot).await {
            PasteOutcome::Blocked { plugin, record, .. } => {
                assert_eq!(plugin, "SecurityMonitor");
                assert_eq!(record.invoked(), vec!["SecurityMonitor"]);
            }
            PasteOutcome::Allowed { .. } => panic!("flagged paste should be blocked"),
        }
    }

    #[tokio::test]
    async fn disabled_builtin_is_listed_but_skipped() {
        let config = PipelineConfig::from_json_str(
            r#"{ "plugins": { "KnowledgeGraph": { "enabled": false } } }"#,
        )
        .expect("config");
        let manager = manager(config).await;
        assert_eq!(manager.plugin_state("KnowledgeGraph"), Some(PluginState::Disabled));
        assert_eq!(manager.execution_order(), vec!["SecurityMonitor", "ContentEnricher"]);
    }
}
