//! OpenAI Chat Completions adapter.
//!
//! Builds the request with JSON-object response format and extracts
//! the assistant text from `choices[0].message.content`. JSON-mode
//! failures surface downstream as parse errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{RawReply, RequestParams, WireRequest};
use crate::error::{CallError, CallResult, ErrorKind};

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    response_format: ResponseFormat,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub fn build_request(params: &RequestParams<'_>) -> WireRequest {
    let request = ChatRequest {
        model: params.model.to_string(),
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: params.prompt.to_string(),
        }],
        response_format: ResponseFormat {
            format_type: "json_object".to_string(),
        },
        temperature: params.temperature,
        max_tokens: params.max_tokens,
    };

    WireRequest {
        url: format!("{}/v1/chat/completions", params.base_url.trim_end_matches('/')),
        headers: vec![
            (
                "authorization".to_string(),
                format!("Bearer {}", params.api_key),
            ),
            ("content-type".to_string(), "application/json".to_string()),
        ],
        body: serde_json::to_value(request).unwrap_or(Value::Null),
    }
}

pub fn extract(payload: &Value) -> CallResult<RawReply> {
    let response: ChatResponse = serde_json::from_value(payload.clone())
        .map_err(|e| CallError::new(ErrorKind::ParseError, format!("OpenAI payload: {e}")))?;

    let text = response
        .choices
        .first()
        .and_then(|c| c.message.as_ref())
        .map(|m| m.content.clone())
        .ok_or_else(|| CallError::new(ErrorKind::ParseError, "no choices in OpenAI response"))?;

    let usage = response.usage.unwrap_or(ChatUsage {
        prompt_tokens: 0,
        completion_tokens: 0,
        total_tokens: 0,
    });

    Ok(RawReply {
        text,
        model: response.model,
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        safety_block: None,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params<'a>() -> RequestParams<'a> {
        RequestParams {
            base_url: "https://api.openai.com",
            api_key: "sk-test",
            model: "gpt-4o",
            prompt: "What is 6 x 7?",
            temperature: 0.7,
            max_tokens: 4096,
        }
    }

    #[test]
    fn test_build_request_shape() {
        let req = build_request(&params());
        assert_eq!(req.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(req.body["model"], "gpt-4o");
        assert_eq!(req.body["messages"][0]["role"], "user");
        assert_eq!(req.body["messages"][0]["content"], "What is 6 x 7?");
        assert_eq!(req.body["response_format"]["type"], "json_object");
        assert_eq!(req.body["temperature"], 0.7);
        assert_eq!(req.body["max_tokens"], 4096);
    }

    #[test]
    fn test_build_request_bearer_auth() {
        let req = build_request(&params());
        let auth = req
            .headers
            .iter()
            .find(|(k, _)| k == "authorization")
            .map(|(_, v)| v.as_str());
        assert_eq!(auth, Some("Bearer sk-test"));
    }

    #[test]
    fn test_build_request_trims_trailing_slash() {
        let mut p = params();
        p.base_url = "https://api.openai.com/";
        let req = build_request(&p);
        assert_eq!(req.url, "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn test_extract_text_and_usage() {
        let payload = json!({
            "model": "gpt-4o-2024-08-06",
            "choices": [{"message": {"role": "assistant", "content": "{\"answer\":\"42\"}"}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150}
        });
        let reply = extract(&payload).unwrap();
        assert_eq!(reply.text, "{\"answer\":\"42\"}");
        assert_eq!(reply.model.as_deref(), Some("gpt-4o-2024-08-06"));
        assert_eq!(reply.input_tokens, 120);
        assert_eq!(reply.output_tokens, 30);
        assert_eq!(reply.total_tokens, 150);
        assert!(reply.safety_block.is_none());
    }

    #[test]
    fn test_extract_missing_choices() {
        let payload = json!({"model": "gpt-4o", "choices": []});
        let err = extract(&payload).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
    }

    #[test]
    fn test_extract_missing_usage_defaults_zero() {
        let payload = json!({
            "choices": [{"message": {"content": "hi"}}]
        });
        let reply = extract(&payload).unwrap();
        assert_eq!(reply.total_tokens, 0);
    }
}
