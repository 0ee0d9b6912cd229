//! Persisted-key policy.
//!
//! Everything acpx writes to disk uses snake_case keys. The exemptions are
//! narrow and structural: externally-tagged variant names, the `_meta` key on
//! audit entries, map keys whose values the caller controls, and opaque
//! value subtrees that pass through from the agent verbatim. Violations fail
//! hard before any bytes are written.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("non-snake_case key {key:?} at {path}")]
pub struct KeyPolicyViolation {
    pub key: String,
    pub path: String,
}

/// Externally-tagged variant names allowed as object keys.
const VARIANT_TAGS: &[&str] = &[
    "User",
    "Agent",
    "Text",
    "Mention",
    "Image",
    "Thinking",
    "RedactedThinking",
    "ToolUse",
    "Resume",
];

/// Subtrees whose contents are opaque passthrough values. Matched as a
/// suffix of the key path (array levels appear as `[]`).
const OPAQUE_SUFFIXES: &[&[&str]] = &[
    // Record documents.
    &["agent_capabilities"],
    &["thread", "initial_project_snapshot"],
    &["thread", "model"],
    &["thread", "profile"],
    &["ToolUse", "input"],
    &["acpx", "config_options"],
    &["acpx", "audit_events", "[]", "update"],
    &["acpx", "audit_events", "[]", "_meta"],
    // Event documents: raw agent payloads under `data`.
    &["data", "update"],
    &["data", "operation"],
    &["data", "value"],
    &["data", "entries"],
    &["data", "raw_input"],
    &["data", "raw_output"],
    &["data", "acp"],
    &["data", "record"],
    &["data", "queue"],
];

fn is_snake_case(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn ends_with(path: &[String], suffix: &[&str]) -> bool {
    path.len() >= suffix.len()
        && path[path.len() - suffix.len()..]
            .iter()
            .zip(suffix)
            .all(|(seg, want)| seg == want)
}

fn is_opaque(path: &[String]) -> bool {
    // Each tool result's `output` is opaque; the map key in between is
    // arbitrary, so the suffix table cannot express it.
    if path.len() >= 3
        && path[path.len() - 3] == "tool_results"
        && path[path.len() - 1] == "output"
    {
        return true;
    }
    OPAQUE_SUFFIXES.iter().any(|suffix| ends_with(path, suffix))
}

fn key_is_exempt(parent: &[String], key: &str) -> bool {
    if VARIANT_TAGS.contains(&key) {
        return true;
    }
    // Arbitrary map keys.
    if ends_with(parent, &["thread", "request_token_usage"]) || ends_with(parent, &["tool_results"])
    {
        return true;
    }
    // The one `_meta` allowed outside opaque subtrees.
    key == "_meta" && ends_with(parent, &["acpx", "audit_events", "[]"])
}

/// Check every key of a document destined for disk.
pub fn validate_persisted_keys(doc: &Value) -> Result<(), KeyPolicyViolation> {
    let mut path = Vec::new();
    walk(doc, &mut path)
}

fn walk(value: &Value, path: &mut Vec<String>) -> Result<(), KeyPolicyViolation> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if !is_snake_case(key) && !key_is_exempt(path, key) {
                    return Err(KeyPolicyViolation {
                        key: key.clone(),
                        path: if path.is_empty() {
                            "<root>".to_string()
                        } else {
                            path.join(".")
                        },
                    });
                }
                path.push(key.clone());
                if !is_opaque(path) {
                    walk(child, path)?;
                }
                path.pop();
            }
            Ok(())
        }
        Value::Array(items) => {
            path.push("[]".to_string());
            for item in items {
                if !is_opaque(path) {
                    walk(item, path)?;
                }
            }
            path.pop();
            Ok(())
        }
        _ => Ok(()),
    }
}
