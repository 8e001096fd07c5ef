//! Structured-data recovery from model output. Models wrap their final
//! answers in fenced code blocks, `<r>` tags, or plain prose with JSON
//! embedded somewhere in the middle — this digs the JSON out.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn result_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<r>\s*(.*?)\s*</r>").unwrap())
}

fn fenced_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\}|\[.*?\])\s*```").unwrap())
}

fn bare_res() -> &'static [Regex; 3] {
    static RES: OnceLock<[Regex; 3]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r"(?s)(\[\s*\{.*\}\s*\])").unwrap(),
            Regex::new(r"(?s)(\{.*\})").unwrap(),
            Regex::new(r"(?s)(\[.*\])").unwrap(),
        ]
    })
}

/// Find the first parseable JSON object or array embedded in `text`.
pub fn first_json(text: &str) -> Option<Value> {
    if let Some(caps) = fenced_re().captures(text) {
        if let Ok(v) = serde_json::from_str(caps[1].trim()) {
            return Some(v);
        }
    }
    if let Ok(v) = serde_json::from_str::<Value>(text.trim()) {
        if v.is_object() || v.is_array() {
            return Some(v);
        }
    }
    for re in bare_res() {
        if let Some(caps) = re.captures(text) {
            if let Ok(v) = serde_json::from_str(caps[1].trim()) {
                return Some(v);
            }
        }
    }
    None
}

/// Extract structured data from a final answer. Falls back to the raw
/// string when no JSON can be recovered.
pub fn clean_result(text: &str) -> Value {
    let text = text.trim();
    if text.is_empty() {
        return Value::Null;
    }

    // <r>...</r> tags take priority; their content may itself be JSON
    let inner;
    let text = match result_tag_re().captures(text) {
        Some(caps) => {
            inner = caps[1].trim().to_string();
            if let Ok(v) = serde_json::from_str::<Value>(&inner) {
                return v;
            }
            inner.as_str()
        }
        None => text,
    };

    match first_json(text) {
        Some(v) => v,
        None => Value::String(text.to_string()),
    }
}
