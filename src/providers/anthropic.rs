//! Anthropic Messages API adapter.
//!
//! Builds the messages request and extracts text by concatenating the
//! `content` blocks with `type = "text"`. A `stop_reason` of
//! `content_filter` or `safety` maps to a safety block.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{RawReply, RequestParams, WireRequest};
use crate::error::{CallError, CallResult, ErrorKind};

const ANTHROPIC_VERSION: &str = "2023-06-01";

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub fn build_request(params: &RequestParams<'_>) -> WireRequest {
    let request = MessagesRequest {
        model: params.model.to_string(),
        max_tokens: params.max_tokens,
        messages: vec![Message {
            role: "user".to_string(),
            content: params.prompt.to_string(),
        }],
        temperature: params.temperature,
    };

    WireRequest {
        url: format!("{}/v1/messages", params.base_url.trim_end_matches('/')),
        headers: vec![
            ("x-api-key".to_string(), params.api_key.to_string()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ],
        body: serde_json::to_value(request).unwrap_or(Value::Null),
    }
}

pub fn extract(payload: &Value) -> CallResult<RawReply> {
    let response: MessagesResponse = serde_json::from_value(payload.clone())
        .map_err(|e| CallError::new(ErrorKind::ParseError, format!("Anthropic payload: {e}")))?;

    let text = response
        .content
        .iter()
        .filter(|b| b.content_type == "text")
        .filter_map(|b| b.text.as_deref())
        .collect::<Vec<_>>()
        .join("");

    let safety_block = response
        .stop_reason
        .as_deref()
        .filter(|r| matches!(*r, "content_filter" | "safety"))
        .map(String::from);

    if text.is_empty() && safety_block.is_none() {
        return Err(CallError::new(
            ErrorKind::ParseError,
            "no text content in Anthropic response",
        ));
    }

    let usage = response.usage.unwrap_or(Usage {
        input_tokens: 0,
        output_tokens: 0,
    });

    Ok(RawReply {
        text,
        model: response.model,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: usage.input_tokens + usage.output_tokens,
        safety_block,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
