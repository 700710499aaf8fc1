//! Canonical JSON encoding and SHA-256 helpers.
//!
//! Every hash the orchestrator publishes (plan, input, output, ledger entry)
//! is computed over the compact canonical form: object keys sorted, no
//! insignificant whitespace. Files are written in the pretty canonical form
//! (sorted keys, 2-space indent, trailing newline) so they are byte-for-byte
//! reproducible.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

/// SHA-256 of the empty input, used for subtrees that do not exist.
pub fn empty_sha256() -> String {
    sha256_hex(b"")
}

/// Convert `value` into a JSON tree whose objects are key-sorted at every depth.
pub fn to_sorted_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    let raw = serde_json::to_value(value).context("serialize canonical json")?;
    Ok(sort_value(raw))
}

fn sort_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, child) in entries {
                sorted.insert(key, sort_value(child));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

/// Compact canonical JSON (sorted keys, no whitespace).
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let sorted = to_sorted_value(value)?;
    serde_json::to_string(&sorted).context("encode canonical json")
}

/// Pretty canonical JSON (sorted keys, 2-space indent) with trailing newline.
pub fn canonical_pretty<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let sorted = to_sorted_value(value)?;
    let mut buf = serde_json::to_string_pretty(&sorted).context("encode canonical json")?;
    buf.push('\n');
    Ok(buf)
}

/// SHA-256 over the compact canonical JSON of `value`.
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(sha256_hex(canonical_json(value)?))
}

/// SHA-256 over `lines` sorted and joined by `\n`.
pub fn sorted_lines_hash(mut lines: Vec<String>) -> String {
    lines.sort();
    sha256_hex(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": true, "m": [ {"y": 1, "x": 2} ]}});
        let encoded = canonical_json(&value).expect("encode");
        assert_eq!(encoded, r#"{"a":{"m":[{"x":2,"y":1}],"z":true},"b":1}"#);
    }

    #[test]
    fn canonical_pretty_is_stable_after_reparse() {
        let value = json!({"k": "v", "list": [3, 1, 2], "nested": {"b": null, "a": 1.5}});
        let first = canonical_pretty(&value).expect("encode");
        let reparsed: Value = serde_json::from_str(&first).expect("parse");
        let second = canonical_pretty(&reparsed).expect("encode again");
        assert_eq!(first, second);
        assert!(first.ends_with("}\n"));
        assert!(first.contains("\n  \"k\": \"v\""));
    }

    #[test]
    fn empty_hash_matches_known_digest() {
        assert_eq!(
            empty_sha256(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn sorted_lines_hash_ignores_input_order() {
        let a = sorted_lines_hash(vec!["b:2".to_string(), "a:1".to_string()]);
        let b = sorted_lines_hash(vec!["a:1".to_string(), "b:2".to_string()]);
        assert_eq!(a, b);
        assert_eq!(a, sha256_hex("a:1\nb:2"));
    }
}
