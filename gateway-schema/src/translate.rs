//! Bridges the OpenAI-compatible chat schema onto the Gemini native
//! `generateContent` schema, so the same upstream dispatch path can serve
//! both listeners. Translation is necessarily lossy in both directions —
//! unmapped fields are dropped rather than guessed at.

use crate::codeassist::CodeAssistResponseBody;
use crate::gemini::{Content, GeminiGenerateContentRequest, GeminiResponseBody, Part};
use crate::openai::{
    OpenaiChatChoice, OpenaiChatChoiceMessage, OpenaiChatChunk, OpenaiChatChunkChoice,
    OpenaiChatChunkDelta, OpenaiChatMessage, OpenaiChatRequest, OpenaiChatResponse, OpenaiUsage,
};
use serde_json::Value;

/// Maps an OpenAI chat role onto the Gemini `Content.role` vocabulary.
/// `system`/`developer` messages are pulled out into `systemInstruction`
/// by [`openai_to_gemini`] rather than appearing here.
fn gemini_role(openai_role: &str) -> &'static str {
    match openai_role {
        "assistant" => "model",
        _ => "user",
    }
}

fn message_text(content: &Option<Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Translates an OpenAI `chat.completions` request into a Gemini
/// `generateContent` request. System/developer messages are merged into
/// `systemInstruction`; everything else becomes a `contents` turn.
pub fn openai_to_gemini(request: &OpenaiChatRequest) -> GeminiGenerateContentRequest {
    let mut system_parts: Vec<String> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();

    for message in &request.messages {
        let text = message_text(&message.content);
        if message.role == "system" || message.role == "developer" {
            if !text.is_empty() {
                system_parts.push(text);
            }
            continue;
        }
        contents.push(Content {
            role: Some(gemini_role(&message.role).to_string()),
            parts: vec![Part {
                text: Some(text),
                ..Default::default()
            }],
            extra: Default::default(),
        });
    }

    let system_instruction = (!system_parts.is_empty()).then(|| Content {
        role: None,
        parts: vec![Part {
            text: Some(system_parts.join("\n")),
            ..Default::default()
        }],
        extra: Default::default(),
    });

    let generation_config = (request.temperature.is_some()
        || request.top_p.is_some()
        || request.max_tokens.is_some())
    .then(|| crate::gemini::GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.max_tokens,
        ..Default::default()
    });

    GeminiGenerateContentRequest {
        contents,
        system_instruction,
        generation_config,
        tools: None,
        tool_config: None,
        extra: Default::default(),
    }
}

fn candidate_text(body: &GeminiResponseBody) -> Option<String> {
    let candidate = body.candidates.first()?;
    let content = candidate.content.as_ref()?;
    let text: String = content.parts.iter().filter_map(|p| p.text.as_deref()).collect();
    (!text.is_empty()).then_some(text)
}

fn openai_finish_reason(gemini_reason: Option<&str>) -> Option<String> {
    match gemini_reason {
        Some("STOP") | None => Some("stop".to_string()),
        Some("MAX_TOKENS") => Some("length".to_string()),
        Some("SAFETY") | Some("RECITATION") | Some("BLOCKLIST") | Some("PROHIBITED_CONTENT") => {
            Some("content_filter".to_string())
        }
        Some(other) => Some(other.to_lowercase()),
    }
}

fn usage_from_metadata(metadata: &Option<Value>) -> Option<OpenaiUsage> {
    let metadata = metadata.as_ref()?;
    let prompt = metadata.get("promptTokenCount")?.as_u64().unwrap_or(0) as u32;
    let completion = metadata.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32;
    let total = metadata
        .get("totalTokenCount")
        .and_then(Value::as_u64)
        .map_or(prompt + completion, |v| v as u32);
    Some(OpenaiUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    })
}

/// Translates a unary Gemini response into an OpenAI `chat.completion` body.
pub fn gemini_to_openai_response(
    body: &GeminiResponseBody,
    model: &str,
    id: &str,
    created: i64,
) -> OpenaiChatResponse {
    let text = candidate_text(body);
    let finish_reason = openai_finish_reason(body.candidates.first().and_then(|c| c.finish_reason.as_deref()));

    OpenaiChatResponse {
        id: id.to_string(),
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        choices: vec![OpenaiChatChoice {
            index: 0,
            message: OpenaiChatChoiceMessage {
                role: "assistant".to_string(),
                content: text,
                tool_calls: None,
            },
            finish_reason,
        }],
        usage: usage_from_metadata(&body.usageMetadata),
        extra: Default::default(),
    }
}

/// Translates one Gemini streaming chunk into an OpenAI `chat.completion.chunk`.
pub fn gemini_to_openai_chunk(
    body: &GeminiResponseBody,
    model: &str,
    id: &str,
    created: i64,
) -> OpenaiChatChunk {
    let text = candidate_text(body);
    let finish_reason = body
        .candidates
        .first()
        .and_then(|c| c.finish_reason.as_deref())
        .map(|r| openai_finish_reason(Some(r)).unwrap_or_default());

    OpenaiChatChunk {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices: vec![OpenaiChatChunkChoice {
            index: 0,
            delta: OpenaiChatChunkDelta {
                role: Some("assistant".to_string()),
                content: text,
                tool_calls: None,
            },
            finish_reason,
        }],
        usage: None,
    }
}

/// Unwraps the Code Assist envelope and translates straight to an OpenAI
/// response, for callers that only hold the raw upstream envelope.
pub fn codeassist_to_openai_response(
    envelope: CodeAssistResponseBody,
    model: &str,
    id: &str,
    created: i64,
) -> OpenaiChatResponse {
    let body: GeminiResponseBody = envelope.into();
    gemini_to_openai_response(&body, model, id, created)
}

/// A minimal `OpenaiChatMessage` constructor for tests and call sites that
/// build requests programmatically rather than deserializing them.
pub fn user_message(text: impl Into<String>) -> OpenaiChatMessage {
    OpenaiChatMessage {
        role: "user".to_string(),
        content: Some(Value::String(text.into())),
        tool_calls: None,
        tool_call_id: None,
        name: None,
        extra: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_with(messages: Vec<OpenaiChatMessage>) -> OpenaiChatRequest {
        OpenaiChatRequest {
            model: "gpt-4o".to_string(),
            messages,
            stream: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            tools: None,
            tool_choice: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn system_message_becomes_instruction() {
        let request = request_with(vec![
            OpenaiChatMessage {
                role: "system".to_string(),
                content: Some(json!("be concise")),
                tool_calls: None,
                tool_call_id: None,
                name: None,
                extra: Default::default(),
            },
            user_message("hello"),
        ]);

        let gemini = openai_to_gemini(&request);
        assert_eq!(
            gemini.system_instruction.unwrap().parts[0].text.as_deref(),
            Some("be concise")
        );
        assert_eq!(gemini.contents.len(), 1);
        assert_eq!(gemini.contents[0].role.as_deref(), Some("user"));
    }

    #[test]
    fn assistant_role_maps_to_model() {
        let request = request_with(vec![OpenaiChatMessage {
            role: "assistant".to_string(),
            content: Some(json!("hi")),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            extra: Default::default(),
        }]);

        let gemini = openai_to_gemini(&request);
        assert_eq!(gemini.contents[0].role.as_deref(), Some("model"));
    }

    #[test]
    fn response_translation_extracts_text_and_usage() {
        let body: GeminiResponseBody = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hi there"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 3, "totalTokenCount": 8}
        }))
        .unwrap();

        let response = gemini_to_openai_response(&body, "gemini-2.5-flash", "chatcmpl-1", 1_700_000_000);
        assert_eq!(response.choices[0].message.content.as_deref(), Some("hi there"));
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.unwrap().total_tokens, 8);
    }

    #[test]
    fn max_tokens_finish_reason_maps_to_length() {
        let body: GeminiResponseBody = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "cut off"}]},
                "finishReason": "MAX_TOKENS"
            }]
        }))
        .unwrap();

        let response = gemini_to_openai_response(&body, "gemini-2.5-flash", "chatcmpl-2", 0);
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("length"));
    }
}
