use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::model::metadata::ClipMetadata;
use crate::model::record;
use crate::utils::hash::fingerprint;

/// One captured clipboard entry. `content`, `timestamp` and `fingerprint`
/// are fixed at construction; plugins only ever touch `metadata`.
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    content: String,
    timestamp: DateTime<Utc>,
    fingerprint: String,
    pub pinned: bool,
    pub metadata: ClipMetadata,
}

impl Clip {
    pub fn new(content: impl Into<String>) -> Self {
        Self::captured_at(content, Utc::now())
    }

    pub fn captured_at(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let content = content.into();
        let fingerprint = fingerprint(&content);
        Self {
            content,
            timestamp,
            fingerprint,
            pinned: false,
            metadata: ClipMetadata::default(),
        }
    }

    pub(crate) fn from_parts(
        content: String,
        timestamp: DateTime<Utc>,
        pinned: bool,
        fingerprint: String,
        metadata: ClipMetadata,
    ) -> Self {
        Self {
            content,
            timestamp,
            fingerprint,
            pinned,
            metadata,
        }
    }

    /// The same clip keyed by the fingerprint its content hashes to. Records
    /// from older versions carry differently derived fingerprints.
    pub(crate) fn rekeyed(self) -> Self {
        let fingerprint = fingerprint(&self.content);
        Self { fingerprint, ..self }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// True when `other` describes the same capture, ignoring metadata and pin state.
    pub fn same_capture(&self, other: &Clip) -> bool {
        self.content == other.content
            && self.timestamp == other.timestamp
            && self.fingerprint == other.fingerprint
    }

    pub fn preview(&self, max_chars: usize) -> String {
        let flat = self.content.replace('\n', " ").replace('\r', "");
        let flat = flat.trim();
        if flat.chars().count() <= max_chars {
            return flat.to_string();
        }
        let mut preview: String = flat.chars().take(max_chars).collect();
        preview.push_str("...");
        preview
    }
}

impl Serialize for Clip {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        record::to_record(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Clip {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        record::from_record(&value)
            .map(|load| load.clip)
            .map_err(serde::de::Error::custom)
    }
}
