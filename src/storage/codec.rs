//! Canonical JSON encoding.
//!
//! Snapshots, the index and config files are pretty-printed with two-space
//! indentation and exactly one trailing newline. Log records are compact, one
//! per line. Object keys are sorted recursively in both forms so the output
//! does not depend on struct field order or map implementation.

use super::Result;
use serde::Serialize;
use serde_json::{Map, Value};

/// Returns `value` with every object's keys in lexicographic order.
#[must_use]
pub fn canonical_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key, canonical_value(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical_value).collect()),
        other => other,
    }
}

/// Encodes a document (snapshot, index, config) in canonical pretty form.
///
/// # Errors
/// Returns an error if `value` cannot be represented as JSON.
pub fn encode_document<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let canonical = canonical_value(serde_json::to_value(value)?);
    let mut bytes = serde_json::to_vec_pretty(&canonical)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Encodes a single log record: compact, sorted keys, no trailing newline.
///
/// # Errors
/// Returns an error if `value` cannot be represented as JSON.
pub fn encode_line<T: Serialize>(value: &T) -> Result<String> {
    let canonical = canonical_value(serde_json::to_value(value)?);
    Ok(serde_json::to_string(&canonical)?)
}
