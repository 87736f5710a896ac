//! Tolerant decoding of capability output into stage records.
//!
//! Schema-declared calls are parsed as JSON directly; search-augmented
//! calls get the first complete JSON array scanned out of the prose.
//! A malformed payload yields an empty collection, never an error, and
//! every record receives a locally derived id regardless of what the
//! capability returned.

use crate::core::ids;
use crate::core::state::{CaptionData, GeneratedIdea, RefinementRequirement};
use serde::Deserialize;

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else {
        s.to_string()
    }
}

/// Scans `text` for the first syntactically complete JSON array,
/// honoring string literals and escapes so brackets inside strings do
/// not confuse the match.
pub fn extract_json_array(text: &str) -> Option<&str> {
    array_spans(text).into_iter().next()
}

/// Every balanced array span, in order of appearance. Search-grounded
/// prose can carry citation markers like `[1]` ahead of the record
/// array, so callers try each span until one decodes.
fn array_spans(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut from = 0;
    while let Some(rel) = text[from..].find('[') {
        let start = from + rel;
        match balanced_end(text, start) {
            Some(end) => {
                spans.push(&text[start..end]);
                from = end;
            }
            None => from = start + 1,
        }
    }
    spans
}

/// End of the balanced array starting at `start` (which must index a
/// `[`), or None when it never closes.
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'[' if !in_string => depth += 1,
            b']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Deserialize)]
struct RawIdea {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

/// Decodes one persona's ideation response. `timestamp` is the batch
/// timestamp used for every id in this call.
pub fn parse_ideas(
    raw: &str,
    persona_id: &str,
    schema_declared: bool,
    timestamp: u64,
) -> Vec<GeneratedIdea> {
    let parsed: Vec<RawIdea> = if schema_declared {
        match serde_json::from_str(&strip_code_blocks(raw)) {
            Ok(list) => list,
            Err(e) => {
                log::warn!("Discarding malformed ideas payload for {}: {}", persona_id, e);
                return Vec::new();
            }
        }
    } else {
        let decoded = array_spans(raw)
            .into_iter()
            .find_map(|span| serde_json::from_str(span).ok());
        match decoded {
            Some(list) => list,
            None => {
                log::warn!("No decodable idea array in response for {}", persona_id);
                return Vec::new();
            }
        }
    };

    parsed
        .into_iter()
        .enumerate()
        .map(|(i, idea)| GeneratedIdea {
            id: ids::idea_id(persona_id, timestamp, i),
            persona_id: persona_id.to_string(),
            title: if idea.title.trim().is_empty() {
                "Untitled idea".to_string()
            } else {
                idea.title
            },
            description: idea.description,
        })
        .collect()
}

#[derive(Deserialize)]
struct RawRequirement {
    #[serde(default)]
    question: String,
    #[serde(default)]
    suggestion: String,
}

pub fn parse_requirements(raw: &str, idea_id: &str) -> Vec<RefinementRequirement> {
    let payload = strip_code_blocks(raw);
    let parsed: Vec<RawRequirement> = match serde_json::from_str(&payload) {
        Ok(list) => list,
        Err(e) => {
            log::warn!(
                "Discarding malformed requirements payload for {}: {}",
                idea_id,
                e
            );
            return Vec::new();
        }
    };

    parsed
        .into_iter()
        .enumerate()
        .map(|(i, req)| RefinementRequirement {
            id: ids::requirement_id(idea_id, i),
            question: if req.question.trim().is_empty() {
                "Anything specific to show?".to_string()
            } else {
                req.question
            },
            suggestion: req.suggestion,
            user_response: String::new(),
            reference_image: None,
        })
        .collect()
}

#[derive(Deserialize)]
struct RawCaption {
    #[serde(default)]
    caption: String,
    #[serde(default)]
    hashtags: Vec<String>,
}

/// Falls back to the raw text as the caption when the payload is not
/// the expected object.
pub fn parse_caption(raw: &str) -> CaptionData {
    let payload = strip_code_blocks(raw);
    match serde_json::from_str::<RawCaption>(&payload) {
        Ok(parsed) => CaptionData {
            caption: parsed.caption,
            hashtags: parsed.hashtags,
        },
        Err(_) => CaptionData {
            caption: raw.trim().to_string(),
            hashtags: Vec::new(),
        },
    }
}
