//! Typed OpenAI Chat Completions request schema.
//!
//! Parsed into proper structs instead of passed through as raw
//! `serde_json::Value` so translation code gets compile-time field access
//! while staying forward compatible via `extra` catch-all maps.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// `POST /v1/chat/completions` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenaiChatRequest {
    pub model: String,

    pub messages: Vec<OpenaiChatMessage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,

    /// Catch-all for fields this gateway doesn't interpret directly
    /// (`frequency_penalty`, `logit_bias`, `user`, …).
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenaiChatMessage {
    pub role: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl OpenaiChatRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_request_deserializes() {
        let req: OpenaiChatRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();

        assert_eq!(req.model, "gpt-4o");
        assert_eq!(req.messages.len(), 1);
        assert!(!req.is_streaming());
    }

    #[test]
    fn unknown_fields_preserved_in_extra() {
        let req: OpenaiChatRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [],
            "frequency_penalty": 0.5,
            "user": "abc"
        }))
        .unwrap();

        assert_eq!(req.extra.get("frequency_penalty"), Some(&json!(0.5)));
        assert_eq!(req.extra.get("user"), Some(&json!("abc")));
    }

    #[test]
    fn stream_flag_roundtrips() {
        let input = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        });

        let req: OpenaiChatRequest = serde_json::from_value(input.clone()).unwrap();
        assert!(req.is_streaming());
        assert_eq!(serde_json::to_value(&req).unwrap(), input);
    }

    #[test]
    fn tool_call_message_roundtrips() {
        let input = json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{"id": "call_1", "type": "function", "function": {"name": "f", "arguments": "{}"}}]
        });

        let msg: OpenaiChatMessage = serde_json::from_value(input.clone()).unwrap();
        assert_eq!(msg.role, "assistant");
        assert!(msg.tool_calls.is_some());
        assert_eq!(serde_json::to_value(&msg).unwrap(), input);
    }
}
