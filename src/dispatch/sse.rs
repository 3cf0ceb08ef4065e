//! SSE pump (real upstream streams) and fake-streaming (splitting a unary
//! response into a synthetic SSE stream) — spec §4.4 "SSE pump" and
//! "Fake-streaming mode".
//!
//! The real pump is a pull-based iterator over upstream lines feeding a
//! push-based writer (spec §9): each upstream `data: ` line is decoded,
//! unwrapped from the Code Assist `{"response": {...}}` envelope, and
//! re-emitted in the same relative order it arrived in.
//!
//! Both listeners ride the same [`StreamItem`] stream: the Gemini-native
//! router forwards each body as-is, the OpenAI-compatible router re-shapes
//! it through [`gateway_schema::translate::gemini_to_openai_chunk`] first.
//! Keeping the pump's output schema-agnostic is what lets one upstream pass
//! serve both wire formats without a second reparse of the upstream bytes.

use crate::error::GeminiError;
use axum::response::sse::Event;
use eventsource_stream::Eventsource;
use futures::{Stream, TryStreamExt};
use gateway_schema::{CodeAssistResponseBody, GeminiResponseBody};
use std::collections::VecDeque;
use std::time::Duration;
use tokio_stream::StreamExt;

pub const DONE_MARKER: &str = "[DONE]";

/// One item off the schema-agnostic stream: either a decoded body or the
/// terminal marker. Keeping `Done` as a variant (rather than ending the
/// stream) lets callers emit their own `[DONE]` event in whichever wire
/// format they're speaking.
pub enum StreamItem {
    Body(GeminiResponseBody),
    Done,
}

/// Wraps an upstream Code Assist SSE response into a schema-agnostic item
/// stream, applying an idle timeout between events (a stalled upstream
/// connection must not hang the client forever).
pub fn build_typed_stream(
    upstream: reqwest::Response,
    idle_timeout: Duration,
) -> impl Stream<Item = Result<StreamItem, GeminiError>> {
    let raw = upstream.bytes_stream().eventsource();
    pump(raw).timeout(idle_timeout).map(|item| match item {
        Ok(inner) => inner,
        Err(_) => {
            tracing::warn!("upstream SSE stream idle timeout");
            Err(GeminiError::StreamProtocolError("stream idle timeout".into()))
        }
    })
}

/// Core pump: decodes each upstream `data: ` line, unwraps the Code Assist
/// envelope, and increments part-kind counters for metrics. A line that
/// fails to parse as JSON is dropped (spec testable property 6): it does
/// not count toward the downstream line total, but it also does not abort
/// the stream.
fn pump<I, E>(upstream: I) -> impl Stream<Item = Result<StreamItem, GeminiError>>
where
    I: Stream<Item = Result<eventsource_stream::Event, E>>,
    E: std::fmt::Display,
{
    upstream
        .map_err(|e| GeminiError::StreamProtocolError(e.to_string()))
        .try_filter_map(|upstream_event| async move {
            let data = upstream_event.data;
            if data.trim() == DONE_MARKER {
                return Ok(Some(StreamItem::Done));
            }
            if data.is_empty() {
                return Ok(None);
            }

            let Ok(envelope) = serde_json::from_str::<CodeAssistResponseBody>(&data) else {
                tracing::warn!(preview = %preview(&data), "skipping unparsable upstream SSE line");
                return Ok(None);
            };
            let body: GeminiResponseBody = envelope.into();
            count_parts(&body);
            Ok(Some(StreamItem::Body(body)))
        })
}

fn count_parts(body: &GeminiResponseBody) {
    for candidate in &body.candidates {
        let Some(content) = &candidate.content else { continue };
        for part in &content.parts {
            if part.function_call.is_some() {
                metrics::counter!("sse_function_call_parts_total").increment(1);
            }
            if part.inline_data.is_some() {
                metrics::counter!("sse_image_parts_total").increment(1);
            }
        }
    }
}

fn preview(s: &str) -> String {
    s.chars().take(120).collect()
}

/// Converts a unary response into a synthetic item stream: the last
/// candidate's text is split into rune-chunks of `chunk_size`, emitted one
/// item per chunk with `delay` between them, followed by any function-call
/// or inline-image parts as separate items, then `Done` — spec §4.4
/// "Fake-streaming mode".
pub fn fake_typed_stream(
    body: GeminiResponseBody,
    chunk_size: usize,
    delay: Duration,
) -> impl Stream<Item = Result<StreamItem, GeminiError>> {
    let items = build_fake_stream_items(body, chunk_size.max(1));
    futures::stream::unfold((items, true), move |(mut queue, first)| async move {
        if !first {
            tokio::time::sleep(delay).await;
        }
        let next = queue.pop_front()?;
        Some((Ok(next), (queue, false)))
    })
}

fn build_fake_stream_items(body: GeminiResponseBody, chunk_size: usize) -> VecDeque<StreamItem> {
    let mut items = VecDeque::new();
    let Some(candidate) = body.candidates.into_iter().next() else {
        items.push_back(StreamItem::Done);
        return items;
    };

    let Some(content) = candidate.content else {
        items.push_back(StreamItem::Done);
        return items;
    };

    let mut text_parts = Vec::new();
    let mut other_parts = Vec::new();
    for part in content.parts {
        if let Some(text) = &part.text {
            text_parts.push(text.clone());
        } else {
            other_parts.push(part);
        }
    }

    let full_text: String = text_parts.join("");
    let runes: Vec<char> = full_text.chars().collect();
    for chunk in runes.chunks(chunk_size) {
        let chunk_text: String = chunk.iter().collect();
        if let Some(chunk_body) = parse_chunk(single_text_chunk(chunk_text, &candidate.finish_reason)) {
            items.push_back(StreamItem::Body(chunk_body));
        }
    }

    for part in other_parts {
        if part.function_call.is_some() {
            metrics::counter!("sse_function_call_parts_total").increment(1);
        }
        if part.inline_data.is_some() {
            metrics::counter!("sse_image_parts_total").increment(1);
        }
        if let Some(chunk_body) = parse_chunk(single_part_chunk(part, &candidate.finish_reason)) {
            items.push_back(StreamItem::Body(chunk_body));
        }
    }

    items.push_back(StreamItem::Done);
    items
}

fn parse_chunk(value: serde_json::Value) -> Option<GeminiResponseBody> {
    match serde_json::from_value(value) {
        Ok(body) => Some(body),
        Err(e) => {
            tracing::warn!(error = %e, "failed to build synthetic stream chunk");
            None
        }
    }
}

fn single_text_chunk(text: String, finish_reason: &Option<String>) -> serde_json::Value {
    serde_json::json!({
        "candidates": [{
            "content": { "role": "model", "parts": [{ "text": text }] },
            "finishReason": finish_reason,
        }]
    })
}

fn single_part_chunk(part: gateway_schema::gemini::Part, finish_reason: &Option<String>) -> serde_json::Value {
    serde_json::json!({
        "candidates": [{
            "content": { "role": "model", "parts": [part] },
            "finishReason": finish_reason,
        }]
    })
}

/// Renders a [`StreamItem`] as a Gemini-native SSE event: the body is
/// forwarded verbatim as `GeminiResponseBody` JSON.
pub fn to_gemini_event(item: Result<StreamItem, GeminiError>) -> Result<Event, GeminiError> {
    match item? {
        StreamItem::Done => Ok(Event::default().data(DONE_MARKER)),
        StreamItem::Body(body) => {
            Event::default().json_data(body).map_err(|e| GeminiError::StreamProtocolError(e.to_string()))
        }
    }
}
