//! End-to-end market scenarios on a scripted transport.
//!
//! Each test wires the real coordinator, client actors, and an
//! in-memory SQLite store to a deterministic transport double that
//! replays per-provider response scripts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use quorum::client::{ProviderClient, ProviderPool, ProviderSettings};
use quorum::config::AppConfig;
use quorum::error::{CallError, CallResult, ErrorKind, MarketError};
use quorum::market::{Market, RunOptions};
use quorum::providers::{Transport, WireRequest, WireResponse};
use quorum::storage::sqlite::SqliteStore;
use quorum::storage::Store;
use quorum::types::{AnswerStatus, ArbiterSpec, ProviderKind, RunStatus};

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

/// Routes each wire request to a per-provider response queue and
/// records every request for inspection.
struct RouterTransport {
    routes: Mutex<HashMap<ProviderKind, VecDeque<CallResult<WireResponse>>>>,
    requests: Mutex<Vec<WireRequest>>,
}

impl RouterTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn script(&self, provider: ProviderKind, responses: Vec<CallResult<WireResponse>>) {
        self.routes
            .lock()
            .unwrap()
            .entry(provider)
            .or_default()
            .extend(responses);
    }

    fn requests_for(&self, provider: ProviderKind) -> Vec<WireRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| route_of(&r.url) == Some(provider))
            .cloned()
            .collect()
    }
}

fn route_of(url: &str) -> Option<ProviderKind> {
    if url.contains("/chat/completions") {
        Some(ProviderKind::OpenAi)
    } else if url.contains("/v1/messages") {
        Some(ProviderKind::Anthropic)
    } else if url.contains(":generateContent") {
        Some(ProviderKind::Gemini)
    } else {
        None
    }
}

#[async_trait]
impl Transport for RouterTransport {
    async fn execute(&self, request: &WireRequest, _timeout: Duration) -> CallResult<WireResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let provider = route_of(&request.url)
            .ok_or_else(|| CallError::new(ErrorKind::NetworkError, "unroutable URL"))?;
        self.routes
            .lock()
            .unwrap()
            .get_mut(&provider)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| {
                Err(CallError::new(
                    ErrorKind::NetworkError,
                    format!("unscripted call to {provider}"),
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn settings(kind: ProviderKind, model: &str) -> ProviderSettings {
    ProviderSettings {
        kind,
        api_key: "test-key".into(),
        base_url: match kind {
            ProviderKind::OpenAi => "https://api.openai.com".into(),
            ProviderKind::Anthropic => "https://api.anthropic.com".into(),
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com".into(),
        },
        default_model: model.into(),
        timeout: Duration::from_millis(1_000),
        rate_limit_count: 100,
        rate_limit_interval: Duration::from_millis(1_000),
        failure_threshold: 3,
        recovery_timeout: Duration::from_millis(30_000),
        max_retries: 2,
        debug_mode: false,
    }
}

fn two_provider_pool(transport: &Arc<RouterTransport>) -> Arc<ProviderPool> {
    let t: Arc<dyn Transport> = transport.clone();
    Arc::new(ProviderPool::from_clients(vec![
        Arc::new(ProviderClient::new(settings(ProviderKind::OpenAi, "gpt-4o"), t.clone())),
        Arc::new(ProviderClient::new(
            settings(ProviderKind::Anthropic, "claude-sonnet-4-20250514"),
            t.clone(),
        )),
    ]))
}

fn three_provider_pool(transport: &Arc<RouterTransport>) -> Arc<ProviderPool> {
    let t: Arc<dyn Transport> = transport.clone();
    Arc::new(ProviderPool::from_clients(vec![
        Arc::new(ProviderClient::new(settings(ProviderKind::OpenAi, "gpt-4o"), t.clone())),
        Arc::new(ProviderClient::new(
            settings(ProviderKind::Anthropic, "claude-sonnet-4-20250514"),
            t.clone(),
        )),
        Arc::new(ProviderClient::new(
            settings(ProviderKind::Gemini, "gemini-2.0-flash"),
            t.clone(),
        )),
    ]))
}

async fn make_market(pool: Arc<ProviderPool>) -> (Market, Arc<dyn Store>) {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new_in_memory().await.unwrap());
    let config = AppConfig::default();
    (Market::new(pool, store.clone(), &config), store)
}

/// A round reply as the models are asked to produce it.
fn round_json(answer: &str, confidence: f64, claims: &[&str]) -> String {
    json!({
        "answer": answer,
        "confidence": confidence,
        "key_claims": claims,
        "assumptions": [],
        "citations": []
    })
    .to_string()
}

fn arbiter_json(final_answer: &str) -> String {
    json!({
        "final_answer": final_answer,
        "agreements": ["all providers agree"],
        "conflicts": [],
        "fact_table": [{"claim": final_answer, "support": ["openai", "anthropic"], "confidence": 0.9}],
        "next_questions": [],
        "overall_confidence": 0.92,
        "dredd_failed": false
    })
    .to_string()
}

fn openai_ok(text: &str) -> CallResult<WireResponse> {
    Ok(WireResponse {
        status: 200,
        body: json!({
            "model": "gpt-4o",
            "choices": [{"message": {"role": "assistant", "content": text}}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150}
        })
        .to_string(),
    })
}

fn anthropic_ok(text: &str) -> CallResult<WireResponse> {
    Ok(WireResponse {
        status: 200,
        body: json!({
            "model": "claude-sonnet-4-20250514",
            "content": [{"type": "text", "text": text}],
            "usage": {"input_tokens": 80, "output_tokens": 40},
            "stop_reason": "end_turn"
        })
        .to_string(),
    })
}

fn gemini_ok(text: &str) -> CallResult<WireResponse> {
    Ok(WireResponse {
        status: 200,
        body: json!({
            "candidates": [{
                "content": {"parts": [{"text": text}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 60, "candidatesTokenCount": 30, "totalTokenCount": 90},
            "modelVersion": "gemini-2.0-flash"
        })
        .to_string(),
    })
}

fn http_error(status: u16) -> CallResult<WireResponse> {
    Ok(WireResponse {
        status,
        body: "upstream error".into(),
    })
}

fn timeout_error() -> CallResult<WireResponse> {
    Err(CallError::new(ErrorKind::Timeout, "request timed out"))
}

fn request_text(request: &WireRequest) -> String {
    request.body.to_string()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_single_round_convergence() {
    let transport = RouterTransport::new();
    transport.script(
        ProviderKind::OpenAi,
        vec![
            openai_ok(&round_json("42", 0.85, &["42"])),
            openai_ok(&arbiter_json("42")),
        ],
    );
    transport.script(
        ProviderKind::Anthropic,
        vec![anthropic_ok(&round_json("42", 0.85, &["42"]))],
    );

    let (market, _store) = make_market(two_provider_pool(&transport)).await;
    let record = market.run(1, "What is 6 x 7?", RunOptions::default()).await.unwrap();

    let run = &record.run;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.rounds_completed, 1);
    assert!(run.convergence_achieved);

    assert_eq!(record.answers.len(), 2);
    assert!(record.answers.iter().all(|a| a.status == AnswerStatus::Ok));

    let arbiter = record.arbiter.as_ref().unwrap();
    assert_eq!(arbiter.final_answer.as_deref(), Some("42"));
    assert!(!arbiter.arbiter_failed);
    assert_eq!(arbiter.fact_table.len(), 1);

    // Invariant: total cost is the sum of all three usage costs.
    let answer_cost: f64 = record.answers.iter().filter_map(|a| a.usage.cost_usd).sum();
    let expected = answer_cost + arbiter.cost_usd.unwrap();
    assert!((run.total_cost_usd - expected).abs() < 1e-9);
    assert!(run.total_cost_usd > 0.0);
}

#[tokio::test]
async fn test_forced_two_rounds() {
    let transport = RouterTransport::new();
    // Round 1: same claims, confidences 0.9 vs 0.5 (delta 0.4 > 0.1).
    // Round 2: both 0.8, same claims.
    transport.script(
        ProviderKind::OpenAi,
        vec![
            openai_ok(&round_json("blue", 0.9, &["the sky is blue"])),
            openai_ok(&round_json("blue", 0.8, &["the sky is blue"])),
            openai_ok(&arbiter_json("blue")),
        ],
    );
    transport.script(
        ProviderKind::Anthropic,
        vec![
            anthropic_ok(&round_json("blue-ish", 0.5, &["the sky is blue"])),
            anthropic_ok(&round_json("blue", 0.8, &["the sky is blue"])),
        ],
    );

    let (market, _store) = make_market(two_provider_pool(&transport)).await;
    let record = market
        .run(2, "What color is the sky?", RunOptions::default())
        .await
        .unwrap();

    assert_eq!(record.run.rounds_completed, 2);
    assert!(record.run.convergence_achieved);
    assert_eq!(record.answers.len(), 4);

    // The second-round prompt carried the peer's previous answer and
    // confidence.
    let openai_requests = transport.requests_for(ProviderKind::OpenAi);
    assert_eq!(openai_requests.len(), 3);
    let revision_body = request_text(&openai_requests[1]);
    assert!(revision_body.contains("YOUR PREVIOUS ANSWER"));
    assert!(revision_body.contains("ANSWER FROM ANTHROPIC"));
    assert!(revision_body.contains("0.50"));

    // Invariant: every persisted answer's round is within the run's
    // completed rounds.
    assert!(record
        .answers
        .iter()
        .all(|a| a.round >= 1 && a.round <= record.run.rounds_completed));
}

#[tokio::test(start_paused = true)]
async fn test_one_provider_always_errors() {
    let transport = RouterTransport::new();
    transport.script(
        ProviderKind::OpenAi,
        vec![
            openai_ok(&round_json("42", 0.85, &["42"])),
            openai_ok(&arbiter_json("42")),
        ],
    );
    transport.script(
        ProviderKind::Anthropic,
        vec![anthropic_ok(&round_json("42", 0.85, &["42"]))],
    );
    // Gemini fails every attempt: 3 attempts (max_retries = 2).
    transport.script(
        ProviderKind::Gemini,
        vec![http_error(500), http_error(500), http_error(500)],
    );

    let (market, _store) = make_market(three_provider_pool(&transport)).await;
    let record = market.run(3, "What is 6 x 7?", RunOptions::default()).await.unwrap();

    assert_eq!(record.run.status, RunStatus::Completed);
    assert_eq!(record.answers.len(), 3);

    let gemini = record
        .answers
        .iter()
        .find(|a| a.provider == ProviderKind::Gemini)
        .unwrap();
    assert_eq!(gemini.status, AnswerStatus::Error);
    let gemini_error = gemini.error.as_ref().unwrap();
    assert_eq!(gemini_error.kind, ErrorKind::ServerError);
    assert_eq!(gemini_error.http_status, Some(500));

    let succeeded = record
        .answers
        .iter()
        .filter(|a| a.status == AnswerStatus::Ok)
        .count();
    assert_eq!(succeeded, 2);
}

#[tokio::test(start_paused = true)]
async fn test_all_providers_fail() {
    let transport = RouterTransport::new();
    for kind in [ProviderKind::OpenAi, ProviderKind::Anthropic] {
        transport.script(kind, vec![timeout_error(), timeout_error(), timeout_error()]);
    }

    let pool = two_provider_pool(&transport);
    let (market, store) = make_market(pool).await;
    let err = market.run(4, "Anyone there?", RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, MarketError::AllProvidersFailed));
    assert!(err.user_message().contains("any provider"));

    // The run row exists, is failed, and has no arbiter output.
    let thread = store.upsert_thread(4).await.unwrap();
    let runs = store.runs_for_thread(thread.id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(store
        .arbiter_output_for_run(runs[0].id)
        .await
        .unwrap()
        .is_none());

    // Both timeout answers were still persisted for replay.
    let answers = store.answers_for_run(runs[0].id).await.unwrap();
    assert_eq!(answers.len(), 2);
    assert!(answers.iter().all(|a| a.status == AnswerStatus::Timeout));
}

#[tokio::test(start_paused = true)]
async fn test_arbiter_failure_chain() {
    let transport = RouterTransport::new();
    // Round succeeds; the primary arbiter produces malformed JSON
    // twice; the fallback (same provider by default) gets HTTP 500 on
    // all three attempts of its single chain step.
    transport.script(
        ProviderKind::OpenAi,
        vec![
            openai_ok(&round_json("42", 0.85, &["42"])),
            openai_ok("not json at all"),
            openai_ok("still not json"),
            http_error(500),
            http_error(500),
            http_error(500),
        ],
    );
    transport.script(
        ProviderKind::Anthropic,
        vec![anthropic_ok(&round_json("42", 0.9, &["42"]))],
    );

    let (market, _store) = make_market(two_provider_pool(&transport)).await;
    let record = market.run(5, "What is 6 x 7?", RunOptions::default()).await.unwrap();

    // The run still completes; synthesis failure is data.
    assert_eq!(record.run.status, RunStatus::Completed);
    let arbiter = record.arbiter.as_ref().unwrap();
    assert!(arbiter.arbiter_failed);
    assert!(arbiter.final_answer.is_none());

    // openai saw: 1 round call, 2 primary arbiter attempts, and the
    // fallback's single call retried to exhaustion (3 requests).
    assert_eq!(transport.requests_for(ProviderKind::OpenAi).len(), 6);
}

#[tokio::test]
async fn test_arbiter_override_spec() {
    let transport = RouterTransport::new();
    transport.script(
        ProviderKind::OpenAi,
        vec![openai_ok(&round_json("42", 0.85, &["42"]))],
    );
    transport.script(
        ProviderKind::Anthropic,
        vec![
            anthropic_ok(&round_json("42", 0.85, &["42"])),
            anthropic_ok(&arbiter_json("forty-two")),
        ],
    );

    let (market, _store) = make_market(two_provider_pool(&transport)).await;
    let opts = RunOptions {
        max_rounds: None,
        arbiter_spec: Some(ArbiterSpec {
            provider: ProviderKind::Anthropic,
            model: "claude-sonnet-4-20250514".into(),
        }),
    };
    let record = market.run(6, "What is 6 x 7?", opts).await.unwrap();

    let arbiter = record.arbiter.as_ref().unwrap();
    assert_eq!(arbiter.provider, ProviderKind::Anthropic);
    assert_eq!(arbiter.final_answer.as_deref(), Some("forty-two"));
    // Anthropic saw its round call plus the arbiter call.
    assert_eq!(transport.requests_for(ProviderKind::Anthropic).len(), 2);
}

#[tokio::test]
async fn test_chat_arbiter_override_from_thread() {
    let transport = RouterTransport::new();
    transport.script(
        ProviderKind::OpenAi,
        vec![openai_ok(&round_json("42", 0.85, &["42"]))],
    );
    transport.script(
        ProviderKind::Anthropic,
        vec![
            anthropic_ok(&round_json("42", 0.85, &["42"])),
            anthropic_ok(&arbiter_json("42")),
        ],
    );

    let pool = two_provider_pool(&transport);
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new_in_memory().await.unwrap());
    let config = AppConfig::default();
    let market = Market::new(pool, store.clone(), &config);

    // The chat collaborator sets the override before the run.
    store.upsert_thread(7).await.unwrap();
    store
        .set_thread_arbiter(
            7,
            Some(ArbiterSpec {
                provider: ProviderKind::Anthropic,
                model: "claude-sonnet-4-20250514".into(),
            }),
        )
        .await
        .unwrap();

    let record = market.run(7, "What is 6 x 7?", RunOptions::default()).await.unwrap();
    assert_eq!(record.arbiter.as_ref().unwrap().provider, ProviderKind::Anthropic);
}

#[tokio::test]
async fn test_parse_error_answer_still_reaches_arbiter() {
    let transport = RouterTransport::new();
    // One provider answers plain prose (parse_error), the other JSON.
    transport.script(
        ProviderKind::OpenAi,
        vec![
            openai_ok("It is 42, plainly."),
            openai_ok(&arbiter_json("42")),
        ],
    );
    transport.script(
        ProviderKind::Anthropic,
        vec![anthropic_ok(&round_json("42", 0.9, &["42"]))],
    );

    let (market, _store) = make_market(two_provider_pool(&transport)).await;
    let record = market.run(8, "What is 6 x 7?", RunOptions::default()).await.unwrap();

    assert_eq!(record.run.status, RunStatus::Completed);
    let openai = record
        .answers
        .iter()
        .find(|a| a.provider == ProviderKind::OpenAi)
        .unwrap();
    assert_eq!(openai.status, AnswerStatus::ParseError);
    assert_eq!(openai.answer, "It is 42, plainly.");

    // The raw prose was forwarded into the arbiter prompt.
    let openai_requests = transport.requests_for(ProviderKind::OpenAi);
    let arbiter_body = request_text(&openai_requests[1]);
    assert!(arbiter_body.contains("It is 42, plainly."));
}

#[tokio::test(start_paused = true)]
async fn test_failed_provider_gets_round_one_prompt_again() {
    let transport = RouterTransport::new();
    // Round 1: openai and gemini disagree on confidence (no
    // convergence) while anthropic times out. In round 2 anthropic
    // must receive the opening prompt, not a revision.
    transport.script(
        ProviderKind::OpenAi,
        vec![
            openai_ok(&round_json("blue", 0.9, &["sky blue"])),
            openai_ok(&round_json("blue", 0.8, &["sky blue"])),
            openai_ok(&arbiter_json("blue")),
        ],
    );
    transport.script(
        ProviderKind::Gemini,
        vec![
            gemini_ok(&round_json("blue", 0.5, &["sky blue"])),
            gemini_ok(&round_json("blue", 0.8, &["sky blue"])),
        ],
    );
    transport.script(
        ProviderKind::Anthropic,
        vec![
            timeout_error(),
            timeout_error(),
            timeout_error(),
            anthropic_ok(&round_json("blue", 0.8, &["sky blue"])),
        ],
    );

    let (market, _store) = make_market(three_provider_pool(&transport)).await;
    let record = market
        .run(9, "What color is the sky?", RunOptions::default())
        .await
        .unwrap();

    assert_eq!(record.run.rounds_completed, 2);

    let anthropic_requests = transport.requests_for(ProviderKind::Anthropic);
    // Requests 1-3 are the retried round-1 call; request 4 is round 2.
    assert_eq!(anthropic_requests.len(), 4);
    let round_two_body = request_text(&anthropic_requests[3]);
    assert!(!round_two_body.contains("YOUR PREVIOUS ANSWER"));
    assert!(round_two_body.contains("independent experts"));

    // Peers that did answer get revision prompts.
    let openai_requests = transport.requests_for(ProviderKind::OpenAi);
    assert!(request_text(&openai_requests[1]).contains("YOUR PREVIOUS ANSWER"));
}
