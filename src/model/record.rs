//! Conversion between `Clip` and the persisted record tree.
//!
//! Loading is lenient: every field except `content` has a default, and a
//! malformed sub-field is replaced by its default instead of failing the
//! whole record. Each substitution is reported in [`RecordLoad::recovered`].

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::model::clip::Clip;
use crate::model::metadata::{is_valid_score, ClipMetadata, LabelSet, Prediction};
use crate::utils::hash::fingerprint;

const LEGACY_FINGERPRINT_KEY: &str = "hash";
const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record is not an object")]
    NotAnObject,
    #[error("record has no content")]
    MissingContent,
    #[error("record content is not a string")]
    InvalidContent,
    #[error("record content is blank")]
    BlankContent,
    #[error("record json is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordLoad {
    pub clip: Clip,
    /// Paths of fields that were missing or invalid and got a default.
    pub recovered: Vec<String>,
}

pub fn to_record(clip: &Clip) -> Value {
    json!({
        "content": clip.content(),
        "timestamp": format_timestamp(clip.timestamp()),
        "pinned": clip.pinned,
        "fingerprint": clip.fingerprint(),
        "metadata": metadata_to_value(&clip.metadata),
    })
}

pub fn metadata_to_value(metadata: &ClipMetadata) -> Value {
    json!({
        "enrichments": metadata.enrichments,
        "predictions": metadata.predictions,
        "security_flags": metadata.security_flags,
        "relationships": metadata.relationships,
        "tags": metadata.tags,
        "confidence_scores": metadata.confidence_scores,
    })
}

pub fn from_json_str(text: &str) -> Result<RecordLoad, RecordError> {
    let value: Value = serde_json::from_str(text)?;
    from_record(&value)
}

pub fn from_record(value: &Value) -> Result<RecordLoad, RecordError> {
    let record = value.as_object().ok_or(RecordError::NotAnObject)?;
    let content = match record.get("content") {
        None | Some(Value::Null) => return Err(RecordError::MissingContent),
        Some(Value::String(content)) if content.trim().is_empty() => {
            return Err(RecordError::BlankContent)
        }
        Some(Value::String(content)) => content.clone(),
        Some(_) => return Err(RecordError::InvalidContent),
    };

    let mut recovered = Vec::new();

    let timestamp = match record.get("timestamp") {
        Some(Value::String(raw)) => parse_timestamp(raw),
        _ => None,
    }
    .unwrap_or_else(|| {
        recovered.push("timestamp".to_string());
        Utc::now()
    });

    let pinned = match record.get("pinned") {
        None => false,
        Some(Value::Bool(pinned)) => *pinned,
        Some(_) => {
            recovered.push("pinned".to_string());
            false
        }
    };

    let stored_fingerprint = [
        record.get("fingerprint"),
        record.get(LEGACY_FINGERPRINT_KEY),
    ]
    .into_iter()
    .flatten()
    .filter_map(Value::as_str)
    .find(|value| !value.trim().is_empty())
    .map(str::to_string);
    let clip_fingerprint = stored_fingerprint.unwrap_or_else(|| {
        recovered.push("fingerprint".to_string());
        fingerprint(&content)
    });

    let metadata = metadata_from_value(record.get("metadata"), &mut recovered);

    Ok(RecordLoad {
        clip: Clip::from_parts(content, timestamp, pinned, clip_fingerprint, metadata),
        recovered,
    })
}

pub fn metadata_from_value(value: Option<&Value>, recovered: &mut Vec<String>) -> ClipMetadata {
    let map = match value {
        None | Some(Value::Null) => return ClipMetadata::default(),
        Some(Value::Object(map)) => map,
        Some(_) => {
            recovered.push("metadata".to_string());
            return ClipMetadata::default();
        }
    };

    ClipMetadata {
        enrichments: enrichments_from(map, recovered),
        predictions: predictions_from(map, recovered),
        security_flags: labels_from(map, "security_flags", recovered),
        relationships: strings_from(map, "relationships", recovered),
        tags: labels_from(map, "tags", recovered),
        confidence_scores: scores_from(map, recovered),
    }
}

fn enrichments_from(map: &Map<String, Value>, recovered: &mut Vec<String>) -> BTreeMap<String, Value> {
    match map.get("enrichments") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(entries)) => entries
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        Some(_) => {
            recovered.push("metadata.enrichments".to_string());
            BTreeMap::new()
        }
    }
}

fn predictions_from(map: &Map<String, Value>, recovered: &mut Vec<String>) -> Vec<Prediction> {
    let items = match map.get("predictions") {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => {
            recovered.push("metadata.predictions".to_string());
            return Vec::new();
        }
    };

    let mut predictions = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match serde_json::from_value::<Prediction>(item.clone()) {
            Ok(prediction) => predictions.push(prediction),
            Err(_) => recovered.push(format!("metadata.predictions[{index}]")),
        }
    }
    predictions
}

fn labels_from(map: &Map<String, Value>, key: &str, recovered: &mut Vec<String>) -> LabelSet {
    strings_from(map, key, recovered).into()
}

fn strings_from(map: &Map<String, Value>, key: &str, recovered: &mut Vec<String>) -> Vec<String> {
    let items = match map.get(key) {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => {
            recovered.push(format!("metadata.{key}"));
            return Vec::new();
        }
    };

    let mut strings = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match item.as_str() {
            Some(value) => strings.push(value.to_string()),
            None => recovered.push(format!("metadata.{key}[{index}]")),
        }
    }
    strings
}

fn scores_from(map: &Map<String, Value>, recovered: &mut Vec<String>) -> BTreeMap<String, f64> {
    let entries = match map.get("confidence_scores") {
        None | Some(Value::Null) => return BTreeMap::new(),
        Some(Value::Object(entries)) => entries,
        Some(_) => {
            recovered.push("metadata.confidence_scores".to_string());
            return BTreeMap::new();
        }
    };

    let mut scores = BTreeMap::new();
    for (signal, raw) in entries {
        match raw.as_f64().filter(|score| is_valid_score(*score)) {
            Some(score) => {
                scores.insert(signal.clone(), score);
            }
            None => recovered.push(format!("metadata.confidence_scores.{signal}")),
        }
    }
    scores
}

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Accepts RFC 3339 and the offset-less ISO form older histories were written in.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}
