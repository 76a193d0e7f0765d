//! Structured output extraction from agent text.
//!
//! Two-step strategy: parse the last fenced ```json block and take the
//! requested keys from it; for keys the block does not cover (or when no
//! block parses), fall back to a per-key `key: value` line scan.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn json_fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```json\s*(.*?)```").expect("valid regex")
    })
}

/// Extract requested keys from agent output.
///
/// Returns `None` when `keys` is empty or nothing was found.
pub fn extract_outputs(
    output: &str,
    keys: &[String],
) -> Option<BTreeMap<String, serde_json::Value>> {
    if keys.is_empty() {
        return None;
    }

    let mut extracted = BTreeMap::new();

    if let Some(object) = last_json_block(output) {
        for key in keys {
            if let Some(value) = object.get(key) {
                extracted.insert(key.clone(), value.clone());
            }
        }
    }

    for key in keys {
        if extracted.contains_key(key) {
            continue;
        }
        if let Some(value) = line_value(output, key) {
            extracted.insert(key.clone(), serde_json::Value::String(value));
        }
    }

    if extracted.is_empty() { None } else { Some(extracted) }
}

/// The last fenced ```json block that parses to an object.
fn last_json_block(output: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    json_fence_regex()
        .captures_iter(output)
        .filter_map(|caps| {
            serde_json::from_str::<serde_json::Value>(caps[1].trim()).ok()
        })
        .filter_map(|value| match value {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        })
        .last()
}

/// Case-insensitive `key: value` line scan; first match wins.
fn line_value(output: &str, key: &str) -> Option<String> {
    let pattern = format!(r"(?mi)^{}:\s*(.+)$", regex::escape(key));
    let re = Regex::new(&pattern).ok()?;
    re.captures(output)
        .map(|caps| caps[1].trim().to_string())
}
