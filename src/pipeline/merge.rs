use std::collections::HashSet;

use tracing::debug;

use crate::model::metadata::is_valid_score;
use crate::model::{Clip, ClipMetadata, LabelSet};

/// A plugin's output after the contribution guard ran over it.
#[derive(Debug)]
pub(crate) struct Merged<T> {
    pub(crate) value: T,
    pub(crate) violations: Vec<String>,
}

/// Applies what `plugin` returned on top of `before`, keeping only the parts
/// it is allowed to change. Everything else is restored from `before` and
/// reported as a violation.
pub(crate) fn merge_clip(before: &Clip, after: Clip, plugin: &str) -> Merged<Clip> {
    let mut violations = Vec::new();
    if !before.same_capture(&after) {
        violations.push("changed content, timestamp or fingerprint".to_string());
    }
    if before.pinned != after.pinned {
        violations.push("changed pinned".to_string());
    }

    let mut merged = before.clone();
    merge_metadata(&mut merged.metadata, after.metadata, plugin, &mut violations);
    Merged {
        value: merged,
        violations,
    }
}

/// Search results may be reordered, filtered or augmented. Clips that were
/// already in the input still go through the per-clip guard.
pub(crate) fn merge_results(before: &[Clip], after: Vec<Clip>, plugin: &str) -> Merged<Vec<Clip>> {
    let mut violations = Vec::new();
    let mut kept = HashSet::new();
    let mut results = Vec::with_capacity(after.len());

    for clip in after {
        let original = before
            .iter()
            .find(|candidate| candidate.fingerprint() == clip.fingerprint());
        match original {
            Some(original) => {
                kept.insert(original.fingerprint().to_string());
                let merged = merge_clip(original, clip, plugin);
                violations.extend(merged.violations);
                results.push(merged.value);
            }
            None => results.push(clip),
        }
    }

    let removed = before
        .iter()
        .filter(|clip| !kept.contains(clip.fingerprint()))
        .count();
    if removed > 0 {
        debug!(plugin, removed, "search results filtered");
    }

    Merged {
        value: results,
        violations,
    }
}

fn merge_metadata(
    target: &mut ClipMetadata,
    produced: ClipMetadata,
    plugin: &str,
    violations: &mut Vec<String>,
) {
    let ClipMetadata {
        enrichments,
        predictions,
        security_flags,
        relationships,
        tags,
        confidence_scores,
    } = produced;

    for key in target.enrichments.keys() {
        if key != plugin && !enrichments.contains_key(key) {
            violations.push(format!("removed enrichment `{key}`"));
        }
    }
    let mut own = None;
    for (key, value) in enrichments {
        if key == plugin {
            own = Some(value);
        } else if target.enrichments.get(&key) != Some(&value) {
            violations.push(format!("wrote enrichment `{key}`"));
        }
    }
    match own {
        Some(value) => target.set_enrichment(plugin, value),
        None => {
            target.enrichments.remove(plugin);
        }
    }

    union_labels(&mut target.security_flags, security_flags, "security_flags", violations);
    union_labels(&mut target.tags, tags, "tags", violations);
    append_only(&mut target.relationships, relationships, "relationships", violations);
    append_only(&mut target.predictions, predictions, "predictions", violations);

    for (signal, score) in confidence_scores {
        if is_valid_score(score) {
            target.confidence_scores.insert(signal, score);
        } else {
            violations.push(format!("confidence score `{signal}` out of range"));
        }
    }
}

fn union_labels(target: &mut LabelSet, produced: LabelSet, field: &str, violations: &mut Vec<String>) {
    if target.iter().any(|label| !produced.contains(label)) {
        violations.push(format!("dropped {field}"));
    }
    target.extend_from(&produced);
}

fn append_only<T: PartialEq>(
    target: &mut Vec<T>,
    produced: Vec<T>,
    field: &str,
    violations: &mut Vec<String>,
) {
    let len = target.len();
    if produced.len() >= len && produced[..len] == target[..] {
        target.extend(produced.into_iter().skip(len));
        return;
    }
    violations.push(format!("rewrote {field}"));
    for item in produced {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::Prediction;

    fn enriched() -> Clip {
        let mut clip = Clip::new("some text");
        clip.metadata.set_enrichment("SecurityMonitor", json!({ "risk_score": 0.7 }));
        clip.metadata.add_security_flag("api_key");
        clip.metadata.add_tag("sensitive");
        clip.metadata.add_relationship("aaaa");
        clip.metadata.set_confidence("security.privacy", 0.7);
        clip
    }

    #[test]
    fn accepts_own_namespace_and_unions() {
        let before = enriched();
        let mut after = before.clone();
        after.metadata.set_enrichment("ContentEnricher", json!({ "content_type": "text" }));
        after.metadata.add_tag("text");
        after.metadata.add_tag("sensitive");
        after.metadata.add_relationship("bbbb");
        after.metadata.set_confidence("content.type", 0.6);

        let merged = merge_clip(&before, after, "ContentEnricher");
        assert!(merged.violations.is_empty(), "{:?}", merged.violations);
        let metadata = &merged.value.metadata;
        assert_eq!(metadata.tags.as_slice(), ["sensitive", "text"]);
        assert_eq!(metadata.relationships, vec!["aaaa", "bbbb"]);
        assert_eq!(metadata.enrichment("ContentEnricher"), Some(&json!({ "content_type": "text" })));
        assert_eq!(metadata.confidence_scores.get("content.type"), Some(&0.6));
    }

    #[test]
    fn reverts_foreign_writes_and_dropped_flags() {
        let before = enriched();
        let mut after = Clip::new("rewritten");
        after.pinned = true;
        after.metadata.set_enrichment("SecurityMonitor", json!({ "risk_score": 0.0 }));
        after.metadata.confidence_scores.insert("bogus".to_string(), 1.5);
        after.metadata.push_prediction(Prediction::new("reuse", 0.4));

        let merged = merge_clip(&before, after, "Rogue");
        let clip = &merged.value;
        assert_eq!(clip.content(), "some text");
        assert!(!clip.pinned);
        assert_eq!(clip.metadata.enrichment("SecurityMonitor"), Some(&json!({ "risk_score": 0.7 })));
        assert!(clip.metadata.security_flags.contains("api_key"));
        assert_eq!(clip.metadata.relationships, vec!["aaaa"]);
        assert_eq!(clip.metadata.predictions.len(), 1);
        assert_eq!(clip.metadata.confidence_scores.get("security.privacy"), Some(&0.7));
        assert!(!clip.metadata.confidence_scores.contains_key("bogus"));

        let violations = merged.violations.join("; ");
        for expected in [
            "changed content",
            "changed pinned",
            "wrote enrichment `SecurityMonitor`",
            "dropped security_flags",
            "dropped tags",
            "rewrote relationships",
            "`bogus` out of range",
        ] {
            assert!(violations.contains(expected), "missing {expected} in {violations}");
        }
    }

    #[test]
    fn plugin_may_clear_its_own_slot() {
        let before = enriched();
        let mut after = before.clone();
        after.metadata.enrichments.remove("SecurityMonitor");
        let merged = merge_clip(&before, after, "SecurityMonitor");
        assert!(merged.violations.is_empty());
        assert!(merged.value.metadata.enrichment("SecurityMonitor").is_none());
    }

    #[test]
    fn search_merge_keeps_reorders_and_guards_known_clips() {
        let a = Clip::new("alpha");
        let b = Clip::new("beta");
        let mut promoted = b.clone();
        promoted.metadata.add_tag("related");
        promoted.metadata.set_enrichment("Other", json!(1));
        let extra = Clip::new("gamma");

        let merged = merge_results(&[a, b], vec![promoted, extra], "KnowledgeGraph");
        let contents: Vec<&str> = merged.value.iter().map(Clip::content).collect();
        assert_eq!(contents, vec!["beta", "gamma"]);
        assert!(merged.value[0].metadata.tags.contains("related"));
        assert!(merged.value[0].metadata.enrichment("Other").is_none());
        assert_eq!(merged.violations, vec!["wrote enrichment `Other`".to_string()]);
    }
}
