//! Google Gemini generateContent adapter.
//!
//! The credential travels as a query parameter rather than a header.
//! Text is concatenated from `candidates[0].content.parts[*].text`; a
//! `finishReason` of SAFETY, RECITATION or OTHER maps to a safety
//! block.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{RawReply, RequestParams, WireRequest};
use crate::error::{CallError, CallResult, ErrorKind};

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(rename = "modelVersion", default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: u32,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub fn build_request(params: &RequestParams<'_>) -> WireRequest {
    let request = GenerateRequest {
        contents: vec![Content {
            parts: vec![Part {
                text: params.prompt.to_string(),
            }],
        }],
        generation_config: GenerationConfig {
            temperature: params.temperature,
            max_output_tokens: params.max_tokens,
            response_mime_type: "application/json".to_string(),
        },
    };

    WireRequest {
        url: format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            params.base_url.trim_end_matches('/'),
            params.model,
            params.api_key
        ),
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: serde_json::to_value(request).unwrap_or(Value::Null),
    }
}

pub fn extract(payload: &Value) -> CallResult<RawReply> {
    let response: GenerateResponse = serde_json::from_value(payload.clone())
        .map_err(|e| CallError::new(ErrorKind::ParseError, format!("Gemini payload: {e}")))?;

    let candidate = response
        .candidates
        .first()
        .ok_or_else(|| CallError::new(ErrorKind::ParseError, "no candidates in Gemini response"))?;

    let text = candidate
        .content
        .as_ref()
        .map(|c| {
            c.parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let safety_block = candidate
        .finish_reason
        .as_deref()
        .filter(|r| matches!(*r, "SAFETY" | "RECITATION" | "OTHER"))
        .map(String::from);

    if text.is_empty() && safety_block.is_none() {
        return Err(CallError::new(
            ErrorKind::ParseError,
            "no text parts in Gemini response",
        ));
    }

    let usage = response.usage_metadata.unwrap_or(UsageMetadata {
        prompt_token_count: 0,
        candidates_token_count: 0,
        total_token_count: 0,
    });

    Ok(RawReply {
        text,
        model: response.model_version,
        input_tokens: usage.prompt_token_count,
        output_tokens: usage.candidates_token_count,
        total_tokens: usage.total_token_count,
        safety_block,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
