//! Anti-truncation: pure helpers for the sentinel-injection scheme used to
//! detect a truncated response and splice continuation text onto it — spec
//! §4.4 "Anti-truncation continuation". The continuation call loop itself
//! lives on [`super::dispatcher::Dispatcher`], since it needs to re-issue
//! upstream calls; this module only knows about text, not transport.

use gateway_schema::gemini::Content;
use gateway_schema::{GeminiGenerateContentRequest, GeminiResponseBody};

/// Appends ` {sentinel}` to the request's system instruction (creating one
/// if absent), instructing the model to emit the sentinel once its answer
/// is actually complete.
pub fn inject_sentinel(request: &mut GeminiGenerateContentRequest, sentinel: &str) {
    let instruction = format!("When your response is fully complete, end it with the exact text {sentinel}");
    match request.system_instruction_mut() {
        Some(existing) => {
            if let Some(part) = existing.parts.first_mut() {
                let base = part.text.take().unwrap_or_default();
                part.text = Some(format!("{base}\n{instruction}"));
            } else {
                existing.parts.push(gateway_schema::gemini::Part {
                    text: Some(instruction),
                    ..Default::default()
                });
            }
        }
        slot @ None => {
            *slot = Some(Content {
                role: None,
                parts: vec![gateway_schema::gemini::Part {
                    text: Some(instruction),
                    ..Default::default()
                }],
                extra: Default::default(),
            });
        }
    }
}

/// The concatenated text of a response's last candidate, used both to
/// check for the sentinel and as the base to append continuations onto.
fn last_candidate_text(body: &GeminiResponseBody) -> Option<String> {
    let candidate = body.candidates.last()?;
    let content = candidate.content.as_ref()?;
    let text: String = content
        .parts
        .iter()
        .filter_map(|p| p.text.as_deref())
        .collect();
    Some(text)
}

/// A response is considered truncated when its last candidate exists, has
/// text, and that text does not end with the injected sentinel.
pub fn is_truncated(body: &GeminiResponseBody, sentinel: &str) -> bool {
    match last_candidate_text(body) {
        Some(text) if !text.is_empty() => !text.trim_end().ends_with(sentinel),
        _ => false,
    }
}

/// Strips a trailing sentinel occurrence from the last candidate's text,
/// called once truncation detection is done with it so the sentinel never
/// leaks to the caller.
pub fn strip_sentinel(body: &mut GeminiResponseBody, sentinel: &str) {
    if let Some(candidate) = body.candidates.last_mut() {
        if let Some(content) = candidate.content.as_mut() {
            if let Some(part) = content.parts.iter_mut().rev().find(|p| p.text.is_some()) {
                if let Some(text) = &mut part.text {
                    if let Some(idx) = text.rfind(sentinel) {
                        text.truncate(idx);
                    }
                }
            }
        }
    }
}

/// Appends `continuation` text onto the last candidate's last text part
/// (creating one if the candidate has no text part at all), concatenating
/// continuation results onto the original response per spec §4.4.
pub fn append_continuation(body: &mut GeminiResponseBody, continuation: &str) {
    let Some(candidate) = body.candidates.last_mut() else { return };
    let Some(content) = candidate.content.as_mut() else { return };

    if let Some(part) = content.parts.iter_mut().rev().find(|p| p.text.is_some()) {
        if let Some(text) = &mut part.text {
            text.push_str(continuation);
            return;
        }
    }
    content.parts.push(gateway_schema::gemini::Part {
        text: Some(continuation.to_string()),
        ..Default::default()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_schema::gemini::Part;
    use serde_json::json;

    fn body_with_text(text: &str) -> GeminiResponseBody {
        serde_json::from_value(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": text }] }
            }]
        }))
        .unwrap()
    }

    #[test]
    fn detects_missing_sentinel() {
        let body = body_with_text("hello world");
        assert!(is_truncated(&body, "[done]"));
    }

    #[test]
    fn sentinel_present_not_truncated() {
        let body = body_with_text("hello world[done]");
        assert!(!is_truncated(&body, "[done]"));
    }

    #[test]
    fn append_continuation_extends_last_text_part() {
        let mut body = body_with_text("hello ");
        append_continuation(&mut body, "world");
        let text = body.candidates[0].content.as_ref().unwrap().parts[0]
            .text
            .clone()
            .unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn strip_sentinel_removes_trailing_marker() {
        let mut body = body_with_text("hello world[done]");
        strip_sentinel(&mut body, "[done]");
        let text = body.candidates[0].content.as_ref().unwrap().parts[0]
            .text
            .clone()
            .unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn empty_candidate_not_truncated() {
        let body = GeminiResponseBody {
            candidates: vec![],
            promptFeedback: None,
            usageMetadata: None,
            modelVersion: None,
            responseId: None,
            extra: Default::default(),
        };
        assert!(!is_truncated(&body, "[done]"));
        let _ = Part::default();
    }
}
