use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Insertion-ordered set of short labels. Serialized as a plain list;
/// duplicates in the input collapse on load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct LabelSet(Vec<String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the label was not present yet.
    pub fn insert(&mut self, label: impl Into<String>) -> bool {
        let label = label.into();
        if label.is_empty() || self.contains(&label) {
            return false;
        }
        self.0.push(label);
        true
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.iter().any(|existing| existing == label)
    }

    pub fn extend_from(&mut self, other: &LabelSet) {
        for label in other.iter() {
            self.insert(label.as_str());
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for LabelSet {
    fn from(labels: Vec<String>) -> Self {
        let mut set = LabelSet::new();
        for label in labels {
            set.insert(label);
        }
        set
    }
}

impl From<LabelSet> for Vec<String> {
    fn from(set: LabelSet) -> Self {
        set.0
    }
}

impl<S: Into<String>> FromIterator<S> for LabelSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = LabelSet::new();
        for label in iter {
            set.insert(label);
        }
        set
    }
}

impl<'a> IntoIterator for &'a LabelSet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(rename = "type")]
    pub kind: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl Prediction {
    pub fn new(kind: impl Into<String>, confidence: f64) -> Self {
        Self {
            kind: kind.into(),
            confidence,
            timestamp: Utc::now(),
        }
    }
}

/// Everything plugins have learned about a clip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipMetadata {
    pub enrichments: BTreeMap<String, Value>,
    pub predictions: Vec<Prediction>,
    pub security_flags: LabelSet,
    pub relationships: Vec<String>,
    pub tags: LabelSet,
    pub confidence_scores: BTreeMap<String, f64>,
}

impl ClipMetadata {
    pub fn is_empty(&self) -> bool {
        self.enrichments.is_empty()
            && self.predictions.is_empty()
            && self.security_flags.is_empty()
            && self.relationships.is_empty()
            && self.tags.is_empty()
            && self.confidence_scores.is_empty()
    }

    pub fn enrichment(&self, plugin: &str) -> Option<&Value> {
        self.enrichments.get(plugin)
    }

    /// Writes the enrichment slot owned by `plugin`.
    pub fn set_enrichment(&mut self, plugin: &str, value: Value) {
        self.enrichments.insert(plugin.to_string(), value);
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) -> bool {
        self.tags.insert(tag)
    }

    pub fn add_security_flag(&mut self, flag: impl Into<String>) -> bool {
        self.security_flags.insert(flag)
    }

    pub fn add_relationship(&mut self, fingerprint: impl Into<String>) {
        let fingerprint = fingerprint.into();
        if !self.relationships.contains(&fingerprint) {
            self.relationships.push(fingerprint);
        }
    }

    pub fn push_prediction(&mut self, prediction: Prediction) {
        self.predictions.push(prediction);
    }

    pub fn set_confidence(&mut self, signal: impl Into<String>, score: f64) {
        self.confidence_scores.insert(signal.into(), score.clamp(0.0, 1.0));
    }
}

pub fn is_valid_score(score: f64) -> bool {
    score.is_finite() && (0.0..=1.0).contains(&score)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn label_set_collapses_duplicates_and_keeps_order() {
        let mut tags = LabelSet::new();
        assert!(tags.insert("code"));
        assert!(tags.insert("rust"));
        assert!(!tags.insert("code"));
        assert!(!tags.insert(""));
        assert_eq!(tags.as_slice(), ["code", "rust"]);
    }

    #[test]
    fn label_set_deserializes_with_dedup() {
        let tags: LabelSet = serde_json::from_value(json!(["a", "b", "a"])).expect("labels");
        assert_eq!(tags.as_slice(), ["a", "b"]);
        assert_eq!(serde_json::to_value(&tags).expect("serialize"), json!(["a", "b"]));
    }

    #[test]
    fn prediction_serializes_kind_as_type() {
        let prediction = Prediction::new("paste_next", 0.4);
        let value = serde_json::to_value(&prediction).expect("serialize");
        assert_eq!(value["type"], "paste_next");
    }

    #[test]
    fn confidence_is_clamped() {
        let mut metadata = ClipMetadata::default();
        metadata.set_confidence("x", 1.7);
        assert_eq!(metadata.confidence_scores["x"], 1.0);
        assert!(!is_valid_score(f64::NAN));
        assert!(is_valid_score(0.5));
    }

    #[test]
    fn relationships_skip_repeats() {
        let mut metadata = ClipMetadata::default();
        metadata.add_relationship("abc");
        metadata.add_relationship("abc");
        metadata.add_relationship("def");
        assert_eq!(metadata.relationships, vec!["abc", "def"]);
    }
}
