//! Structured extraction from model output.
//!
//! Generation responses carry a JSON array of moment spans somewhere in
//! a prose-laden content block, possibly wrapped in reasoning tags or a
//! markdown fence. Refinement responses carry a single span object. The
//! extractors scan for the first well-formed payload and drop invalid
//! entries rather than failing the whole parse.

use serde::Deserialize;
use serde_json::Value;

use crate::core::error::{PipelineError, PipelineResult};

/// One proposed moment from the generation model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MomentSpan {
    pub start_time: f64,
    pub end_time: f64,
    pub title: String,
}

/// Refined boundaries for one moment.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RefinedSpan {
    pub start_time: f64,
    pub end_time: f64,
}

/// Remove `<think>…</think>` reasoning blocks.
fn strip_think_tags(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(open) = rest.find("<think>") {
        out.push_str(&rest[..open]);
        match rest[open..].find("</think>") {
            Some(close) => rest = &rest[open + close + "</think>".len()..],
            None => {
                // Unterminated block: everything after the tag is
                // reasoning, not payload.
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Unwrap a ```json fenced block when the whole payload is fenced.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    match inner.rfind("```") {
        Some(end) => inner[..end].trim(),
        None => inner.trim(),
    }
}

/// Find the span of the first balanced bracket pair starting at each
/// `open` occurrence, respecting JSON string literals.
fn balanced_spans(content: &str, open: char, close: char) -> Vec<&str> {
    let bytes = content.as_bytes();
    let mut spans = Vec::new();
    let mut index = 0;
    while let Some(offset) = content[index..].find(open) {
        let start = index + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;
        for (i, &b) in bytes[start..].iter().enumerate() {
            let c = b as char;
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                c if c == open => depth += 1,
                c if c == close => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(start + i + 1);
                        break;
                    }
                }
                _ => {}
            }
        }
        match end {
            Some(end) => {
                spans.push(&content[start..end]);
                index = start + 1;
            }
            None => break,
        }
    }
    spans
}

fn valid_moment(value: &Value) -> Option<MomentSpan> {
    let span: MomentSpan = serde_json::from_value(value.clone()).ok()?;
    if span.start_time.is_finite() && span.end_time.is_finite() && span.start_time < span.end_time {
        Some(span)
    } else {
        None
    }
}

fn moments_from_array(items: &[Value]) -> Option<Vec<MomentSpan>> {
    if items.is_empty() {
        return Some(Vec::new());
    }
    // An array with no moment-shaped element at all is some other array
    // embedded in the prose; keep scanning. Moment-shaped entries that
    // fail validation (inverted times) are dropped, not fatal.
    let moment_shaped = items
        .iter()
        .filter(|v| {
            v.as_object()
                .is_some_and(|o| o.contains_key("start_time") && o.contains_key("end_time"))
        })
        .count();
    if moment_shaped == 0 {
        return None;
    }
    Some(items.iter().filter_map(valid_moment).collect())
}

/// Extract the moment list from a generation response content block.
///
/// Accepts a bare array, an object with the array under a known field,
/// or prose with an array embedded anywhere. Invalid entries (inverted
/// or non-finite times) are dropped; zero valid moments in an otherwise
/// well-formed empty array is a valid result.
pub fn parse_moments(content: &str) -> PipelineResult<Vec<MomentSpan>> {
    let stripped = strip_think_tags(content);
    let payload = strip_code_fence(&stripped);

    if let Ok(value) = serde_json::from_str::<Value>(payload) {
        match &value {
            Value::Array(items) => {
                if let Some(spans) = moments_from_array(items) {
                    return Ok(spans);
                }
            }
            Value::Object(map) => {
                for field in ["moments", "output", "final_output", "response"] {
                    if let Some(Value::Array(items)) = map.get(field) {
                        if let Some(spans) = moments_from_array(items) {
                            return Ok(spans);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    for candidate in balanced_spans(payload, '[', ']') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(candidate) {
            if let Some(spans) = moments_from_array(&items) {
                return Ok(spans);
            }
        }
    }

    Err(PipelineError::InferenceParse(format!(
        "no moment array in response ({} chars)",
        content.len()
    )))
}

/// Extract the `{start_time, end_time}` object from a refinement
/// response content block.
pub fn parse_refinement(content: &str) -> PipelineResult<RefinedSpan> {
    let stripped = strip_think_tags(content);
    let payload = strip_code_fence(&stripped);

    for candidate in balanced_spans(payload, '{', '}') {
        if let Ok(span) = serde_json::from_str::<RefinedSpan>(candidate) {
            if span.start_time.is_finite()
                && span.end_time.is_finite()
                && span.start_time < span.end_time
            {
                return Ok(span);
            }
        }
    }

    Err(PipelineError::InferenceParse(format!(
        "no refinement object in response ({} chars)",
        content.len()
    )))
}
