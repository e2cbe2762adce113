//! Provider adapters for the supported model remotes.
//!
//! Defines the wire envelope (`WireRequest`/`WireResponse`), the
//! `Transport` trait that executes it, HTTP status classification, and
//! the shared normalization path that turns a raw provider payload into
//! a `ProviderAnswer`. Per-provider request builders and payload
//! extractors live in the submodules.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{CallError, CallResult, ErrorKind};
use crate::pricing;
use crate::types::{AnswerStatus, ProviderAnswer, ProviderKind, RoundReply, Usage};

/// Default sampling temperature for round prompts.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
/// Default completion budget per call.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

// ---------------------------------------------------------------------------
// Wire envelope
// ---------------------------------------------------------------------------

/// A fully-built HTTP request for one provider call.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// The raw HTTP outcome of one provider call.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub status: u16,
    pub body: String,
}

/// Executes wire requests. Implemented over reqwest in production and
/// by scripted doubles in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &WireRequest, timeout: Duration) -> CallResult<WireResponse>;
}

/// reqwest-backed transport. Timeouts are applied per call so one
/// client can serve providers with different deadlines.
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> CallResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| CallError::new(ErrorKind::ConfigError, format!("HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &WireRequest, timeout: Duration) -> CallResult<WireResponse> {
        let mut builder = self.http.post(&request.url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.json(&request.body).send().await.map_err(|e| {
            if e.is_timeout() {
                CallError::new(ErrorKind::Timeout, format!("request timed out: {e}"))
            } else {
                CallError::new(ErrorKind::NetworkError, format!("transport failure: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                CallError::new(ErrorKind::Timeout, format!("body read timed out: {e}"))
            } else {
                CallError::new(ErrorKind::NetworkError, format!("body read failed: {e}"))
            }
        })?;

        Ok(WireResponse { status, body })
    }
}

// ---------------------------------------------------------------------------
// HTTP classification
// ---------------------------------------------------------------------------

/// Classify a non-2xx HTTP response into a structured call error.
pub fn classify_status(status: u16, body: &str) -> CallError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        429 => CallError::new(ErrorKind::RateLimit, snippet).with_status(status),
        401 => CallError::new(ErrorKind::AuthError, snippet).with_status(status),
        403 => CallError::new(ErrorKind::Forbidden, snippet).with_status(status),
        500..=599 => CallError::new(ErrorKind::ServerError, snippet).with_status(status),
        other => CallError::new(
            ErrorKind::ServerError,
            format!("unexpected HTTP status {other}: {snippet}"),
        )
        .with_status(other),
    }
}

// ---------------------------------------------------------------------------
// Request building / payload extraction dispatch
// ---------------------------------------------------------------------------

/// Parameters for building one provider request.
#[derive(Debug, Clone)]
pub struct RequestParams<'a> {
    pub base_url: &'a str,
    pub api_key: &'a str,
    pub model: &'a str,
    pub prompt: &'a str,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Build the wire request for one provider.
pub fn build_request(kind: ProviderKind, params: &RequestParams<'_>) -> WireRequest {
    match kind {
        ProviderKind::OpenAi => openai::build_request(params),
        ProviderKind::Anthropic => anthropic::build_request(params),
        ProviderKind::Gemini => gemini::build_request(params),
    }
}

/// Provider-agnostic view of a decoded 2xx payload.
#[derive(Debug, Clone, Default)]
pub struct RawReply {
    /// Concatenated assistant text.
    pub text: String,
    /// Model string echoed by the response, if any.
    pub model: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    /// Finish/stop reason indicating the content was blocked.
    pub safety_block: Option<String>,
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Convert a 2xx provider body into a `ProviderAnswer`.
///
/// Identity fields (run, round) and latency are stamped later: run and
/// round by the coordinator at persist time, latency by the client.
pub fn normalize(
    kind: ProviderKind,
    requested_model: &str,
    body: &str,
    debug_mode: bool,
) -> ProviderAnswer {
    let raw_response = debug_mode.then(|| body.to_string());

    // Envelope must be JSON at all; otherwise the whole response is a
    // parse error with no salvageable text.
    let payload: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            let mut answer = ProviderAnswer::from_error(
                Uuid::nil(),
                0,
                kind,
                requested_model,
                CallError::new(ErrorKind::ParseError, format!("response body is not JSON: {e}")),
            );
            answer.raw_response = raw_response;
            return answer;
        }
    };

    let reply = match kind {
        ProviderKind::OpenAi => openai::extract(&payload),
        ProviderKind::Anthropic => anthropic::extract(&payload),
        ProviderKind::Gemini => gemini::extract(&payload),
    };

    let reply = match reply {
        Ok(r) => r,
        Err(err) => {
            let mut answer =
                ProviderAnswer::from_error(Uuid::nil(), 0, kind, requested_model, err);
            answer.raw_response = raw_response;
            return answer;
        }
    };

    let model = reply
        .model
        .clone()
        .unwrap_or_else(|| requested_model.to_string());
    let usage = Usage {
        input_tokens: reply.input_tokens,
        output_tokens: reply.output_tokens,
        total_tokens: reply.total_tokens,
        cost_usd: pricing::cost_usd(&model, reply.input_tokens, reply.output_tokens),
    };

    if let Some(reason) = reply.safety_block {
        return ProviderAnswer {
            run_id: Uuid::nil(),
            round: 0,
            provider: kind,
            model,
            status: AnswerStatus::Error,
            answer: reply.text,
            confidence: None,
            key_claims: None,
            assumptions: None,
            citations: None,
            usage,
            latency_ms: 0,
            error: Some(CallError::new(
                ErrorKind::SafetyBlock,
                format!("content blocked: {reason}"),
            )),
            raw_response,
        };
    }

    match parse_round_reply(&reply.text) {
        Some(parsed) => ProviderAnswer {
            run_id: Uuid::nil(),
            round: 0,
            provider: kind,
            model,
            status: AnswerStatus::Ok,
            answer: parsed.answer,
            confidence: parsed.confidence.map(|c| c.clamp(0.0, 1.0)),
            key_claims: parsed.key_claims,
            assumptions: parsed.assumptions,
            citations: parsed.citations,
            usage,
            latency_ms: 0,
            error: None,
            raw_response,
        },
        None => ProviderAnswer {
            run_id: Uuid::nil(),
            round: 0,
            provider: kind,
            model,
            status: AnswerStatus::ParseError,
            // Keep the raw content: the arbiter can still read it.
            answer: reply.text,
            confidence: None,
            key_claims: None,
            assumptions: None,
            citations: None,
            usage,
            latency_ms: 0,
            error: None,
            raw_response,
        },
    }
}

// ---------------------------------------------------------------------------
// Reply text parsing with recovery heuristics
// ---------------------------------------------------------------------------

/// Parse the assistant text as a structured round reply, applying
/// recovery heuristics in order: fenced ```json block extraction,
/// trailing-comma stripping, line-comment stripping.
pub fn parse_round_reply(text: &str) -> Option<RoundReply> {
    recover_json(text).and_then(|v| serde_json::from_value(v).ok())
}

/// Best-effort JSON recovery from model output.
pub fn recover_json(text: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(text) {
        return Some(v);
    }

    let mut candidate = extract_fenced_json(text)
        .unwrap_or(text)
        .trim()
        .to_string();
    if let Ok(v) = serde_json::from_str(&candidate) {
        return Some(v);
    }

    candidate = strip_trailing_commas(&candidate);
    if let Ok(v) = serde_json::from_str(&candidate) {
        return Some(v);
    }

    candidate = strip_line_comments(&candidate);
    serde_json::from_str(&candidate).ok()
}

/// Extract the contents of the first fenced code block tagged `json`.
fn extract_fenced_json(text: &str) -> Option<&str> {
    let start_tag = text.find("```json")?;
    let after = &text[start_tag + "```json".len()..];
    let end = after.find("```")?;
    Some(after[..end].trim())
}

/// Remove commas that directly precede a closing bracket or brace,
/// outside string literals.
fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            out.push(c);
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
            '"' => {
                in_string = true;
                out.push(c);
            }
            ']' | '}' => {
                // Drop a trailing comma (and the whitespace after it).
                let trimmed_len = out.trim_end().len();
                if out[..trimmed_len].ends_with(',') {
                    out.truncate(trimmed_len - 1);
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    out
}

/// Remove `//…` comments outside string literals.
fn strip_line_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
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
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                // Skip to end of line.
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Classification ---------------------------------------------------

    #[test]
    fn test_classify_rate_limit() {
        let err = classify_status(429, "slow down");
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.http_status, Some(429));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_auth_and_forbidden_not_retryable() {
        let err = classify_status(401, "bad key");
        assert_eq!(err.kind, ErrorKind::AuthError);
        assert!(!err.is_retryable());

        let err = classify_status(403, "nope");
        assert_eq!(err.kind, ErrorKind::Forbidden);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classify_server_errors() {
        for status in [500u16, 502, 503, 504] {
            let err = classify_status(status, "oops");
            assert_eq!(err.kind, ErrorKind::ServerError);
            assert!(err.is_retryable());
        }
        // 501 is a server error but not in the retryable set
        let err = classify_status(501, "not implemented");
        assert_eq!(err.kind, ErrorKind::ServerError);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classify_truncates_body() {
        let long_body = "x".repeat(10_000);
        let err = classify_status(500, &long_body);
        assert!(err.message.len() <= 200);
    }

    // -- JSON recovery ----------------------------------------------------

    #[test]
    fn test_recover_plain_json() {
        let v = recover_json(r#"{"answer": "42", "confidence": 0.9}"#).unwrap();
        assert_eq!(v["answer"], "42");
    }

    #[test]
    fn test_recover_fenced_block() {
        let text = "Here is my answer:\n```json\n{\"answer\": \"42\"}\n```\nHope that helps.";
        let v = recover_json(text).unwrap();
        assert_eq!(v["answer"], "42");
    }

    #[test]
    fn test_recover_trailing_commas() {
        let text = r#"{"answer": "42", "key_claims": ["a", "b",],}"#;
        let v = recover_json(text).unwrap();
        assert_eq!(v["key_claims"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_recover_line_comments() {
        let text = "{\n  // the main answer\n  \"answer\": \"42\"\n}";
        let v = recover_json(text).unwrap();
        assert_eq!(v["answer"], "42");
    }

    #[test]
    fn test_recover_url_not_treated_as_comment() {
        let text = "{\n  \"answer\": \"see https://example.com/page\",\n}";
        let v = recover_json(text).unwrap();
        assert_eq!(v["answer"], "see https://example.com/page");
    }

    #[test]
    fn test_recover_fenced_with_trailing_comma() {
        let text = "```json\n{\"answer\": \"x\", \"key_claims\": [\"a\",],}\n```";
        let v = recover_json(text).unwrap();
        assert_eq!(v["answer"], "x");
    }

    #[test]
    fn test_recover_hopeless_text() {
        assert!(recover_json("I refuse to answer in JSON.").is_none());
    }

    #[test]
    fn test_parse_round_reply_clamps_nothing_here() {
        let reply = parse_round_reply(r#"{"answer": "yes", "confidence": 0.5}"#).unwrap();
        assert_eq!(reply.answer, "yes");
        assert_eq!(reply.confidence, Some(0.5));
    }

    // -- Normalization ----------------------------------------------------

    fn openai_body(content: &str) -> String {
        serde_json::json!({
            "model": "gpt-4o-2024-08-06",
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150}
        })
        .to_string()
    }

    #[test]
    fn test_normalize_ok_answer() {
        let body = openai_body(r#"{"answer": "42", "confidence": 0.85, "key_claims": ["42"]}"#);
        let answer = normalize(ProviderKind::OpenAi, "gpt-4o", &body, false);
        assert_eq!(answer.status, AnswerStatus::Ok);
        assert_eq!(answer.answer, "42");
        assert_eq!(answer.confidence, Some(0.85));
        assert_eq!(answer.key_claims.as_deref(), Some(&["42".to_string()][..]));
        assert_eq!(answer.model, "gpt-4o-2024-08-06");
        assert_eq!(answer.usage.total_tokens, 150);
        assert!(answer.usage.cost_usd.is_some());
        assert!(answer.raw_response.is_none());
    }

    #[test]
    fn test_normalize_confidence_clamped() {
        let body = openai_body(r#"{"answer": "x", "confidence": 1.7}"#);
        let answer = normalize(ProviderKind::OpenAi, "gpt-4o", &body, false);
        assert_eq!(answer.confidence, Some(1.0));
    }

    #[test]
    fn test_normalize_unstructured_text_is_parse_error() {
        let body = openai_body("The answer is simply 42.");
        let answer = normalize(ProviderKind::OpenAi, "gpt-4o", &body, false);
        assert_eq!(answer.status, AnswerStatus::ParseError);
        assert_eq!(answer.answer, "The answer is simply 42.");
        assert!(answer.status.is_usable());
    }

    #[test]
    fn test_normalize_non_json_envelope() {
        let answer = normalize(ProviderKind::OpenAi, "gpt-4o", "<html>502</html>", false);
        assert_eq!(answer.status, AnswerStatus::ParseError);
        assert!(answer.answer.is_empty());
        assert!(answer.error.is_some());
    }

    #[test]
    fn test_normalize_debug_mode_keeps_raw() {
        let body = openai_body(r#"{"answer": "42"}"#);
        let answer = normalize(ProviderKind::OpenAi, "gpt-4o", &body, true);
        assert_eq!(answer.raw_response.as_deref(), Some(body.as_str()));
    }

    #[test]
    fn test_normalize_falls_back_to_requested_model() {
        let body = serde_json::json!({
            "choices": [{"message": {"content": "{\"answer\": \"ok\"}"}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        })
        .to_string();
        let answer = normalize(ProviderKind::OpenAi, "gpt-4o", &body, false);
        assert_eq!(answer.model, "gpt-4o");
    }
}
