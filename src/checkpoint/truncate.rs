use serde_json::Value;

use crate::storage::{PhaseData, PhasePayload};

/// Keys whose string values are free text inside opaque fan-out results.
pub const FREE_TEXT_KEYS: &[&str] = &["description", "summary", "content"];

/// Keep at most `max_chars` characters, preserving the prefix.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

fn truncate_string(s: &mut String, max_chars: usize) {
    let kept = truncate_chars(s, max_chars).len();
    s.truncate(kept);
}

/// Truncate every string inside a JSON value in place. Object keys are left alone.
pub fn truncate_value(value: &mut Value, max_chars: usize) {
    match value {
        Value::String(s) => truncate_string(s, max_chars),
        Value::Array(items) => {
            for item in items {
                truncate_value(item, max_chars);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                truncate_value(item, max_chars);
            }
        }
        _ => {}
    }
}

/// Truncate only string values stored under [`FREE_TEXT_KEYS`], at any depth.
/// Ids and other strings are kept whole.
pub fn truncate_free_text(value: &mut Value, max_chars: usize) {
    match value {
        Value::Array(items) => {
            for item in items {
                truncate_free_text(item, max_chars);
            }
        }
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                match item {
                    Value::String(s) if FREE_TEXT_KEYS.contains(&key.as_str()) => {
                        truncate_string(s, max_chars)
                    }
                    _ => truncate_free_text(item, max_chars),
                }
            }
        }
        _ => {}
    }
}

/// Apply the truncation policy to the free-text fields of a phase payload
/// and to its open-ended fields. Tags, ids, verdicts and timestamps are untouched.
pub fn truncate_phase_data(mut data: PhaseData, max_chars: usize) -> PhaseData {
    match &mut data.payload {
        PhasePayload::Text { content } => truncate_string(content, max_chars),
        PhasePayload::Evidence { clusters } => {
            for cluster in clusters {
                truncate_string(&mut cluster.description, max_chars);
            }
        }
        PhasePayload::Result { result } => truncate_string(&mut result.summary, max_chars),
        PhasePayload::Generic { fields } => {
            for (_, value) in fields.iter_mut() {
                truncate_value(value, max_chars);
            }
        }
        PhasePayload::PosteriorProgress { .. } | PhasePayload::Posterior { .. } => {}
    }
    for (_, value) in data.extensions.iter_mut() {
        truncate_value(value, max_chars);
    }
    data
}
