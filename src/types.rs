//! Shared types for the QUORUM consensus engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that provider, client, market,
//! and storage modules can depend on them without circular references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::CallError;

/// Round a USD amount to 6 decimal places (micro-dollar precision).
pub fn round_usd(val: f64) -> f64 {
    (val * 1_000_000.0).round() / 1_000_000.0
}

// ---------------------------------------------------------------------------
// Provider enumeration
// ---------------------------------------------------------------------------

/// The closed set of supported model providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Gemini,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "gemini" => Ok(ProviderKind::Gemini),
            other => Err(format!("Unknown provider: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Thread
// ---------------------------------------------------------------------------

/// One conversational channel tied to an external chat id.
///
/// Holds the optional chat-scoped arbiter override. Mutated only by the
/// chat collaborator; the engine reads it for arbiter selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub chat_id: i64,
    pub arbiter_override: Option<ArbiterSpec>,
    pub created_at: DateTime<Utc>,
}

/// A provider + model pair identifying an arbiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbiterSpec {
    pub provider: ProviderKind,
    pub model: String,
}

impl fmt::Display for ArbiterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Lifecycle status of a run. Transitions from `InProgress` to exactly
/// one terminal status, once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "in_progress" => Ok(RunStatus::InProgress),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("Unknown run status: {other}")),
        }
    }
}

/// One execution of the market for one question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub question: String,
    pub status: RunStatus,
    pub rounds_completed: u32,
    pub convergence_achieved: bool,
    pub total_latency_ms: u64,
    pub total_cost_usd: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Create a fresh in-progress run.
    pub fn new(thread_id: Uuid, question: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            thread_id,
            question: question.to_string(),
            status: RunStatus::InProgress,
            rounds_completed: 0,
            convergence_achieved: false,
            total_latency_ms: 0,
            total_cost_usd: 0.0,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider answers
// ---------------------------------------------------------------------------

/// Outcome classification of a single provider response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Ok,
    Error,
    Timeout,
    ParseError,
}

impl AnswerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerStatus::Ok => "ok",
            AnswerStatus::Error => "error",
            AnswerStatus::Timeout => "timeout",
            AnswerStatus::ParseError => "parse_error",
        }
    }

    /// Statuses whose answers still carry usable text for the next
    /// round and the arbiter.
    pub fn is_usable(&self) -> bool {
        matches!(self, AnswerStatus::Ok | AnswerStatus::ParseError)
    }
}

impl fmt::Display for AnswerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AnswerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(AnswerStatus::Ok),
            "error" => Ok(AnswerStatus::Error),
            "timeout" => Ok(AnswerStatus::Timeout),
            "parse_error" => Ok(AnswerStatus::ParseError),
            other => Err(format!("Unknown answer status: {other}")),
        }
    }
}

/// Token usage and cost for one call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub cost_usd: Option<f64>,
}

/// A citation attached to a provider answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// One normalized response from one provider in one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAnswer {
    pub run_id: Uuid,
    /// Round number, starting at 1.
    pub round: u32,
    pub provider: ProviderKind,
    pub model: String,
    pub status: AnswerStatus,
    pub answer: String,
    /// Self-reported confidence in [0, 1].
    pub confidence: Option<f64>,
    pub key_claims: Option<Vec<String>>,
    pub assumptions: Option<Vec<String>>,
    pub citations: Option<Vec<Citation>>,
    pub usage: Usage,
    pub latency_ms: u64,
    pub error: Option<CallError>,
    /// Full provider payload, retained only in debug mode.
    pub raw_response: Option<String>,
}

impl ProviderAnswer {
    /// Skeleton answer for a provider that never produced a payload
    /// (local rejection, transport failure, deadline kill).
    pub fn from_error(
        run_id: Uuid,
        round: u32,
        provider: ProviderKind,
        model: &str,
        error: CallError,
    ) -> Self {
        let status = error.kind.answer_status();
        Self {
            run_id,
            round,
            provider,
            model: model.to_string(),
            status,
            answer: String::new(),
            confidence: None,
            key_claims: None,
            assumptions: None,
            citations: None,
            usage: Usage::default(),
            latency_ms: error.latency_ms.unwrap_or(0),
            error: Some(error),
            raw_response: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Structured model replies (wire contracts)
// ---------------------------------------------------------------------------

/// The JSON shape every provider is asked to produce in rounds 1..n.
#[derive(Debug, Clone, Deserialize)]
pub struct RoundReply {
    pub answer: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub key_claims: Option<Vec<String>>,
    #[serde(default)]
    pub assumptions: Option<Vec<String>>,
    #[serde(default)]
    pub citations: Option<Vec<Citation>>,
}

/// The JSON shape the arbiter is asked to produce.
#[derive(Debug, Clone, Deserialize)]
pub struct ArbiterReply {
    #[serde(default)]
    pub final_answer: Option<String>,
    #[serde(default)]
    pub agreements: Vec<String>,
    #[serde(default, deserialize_with = "seq_or_items")]
    pub conflicts: Vec<Conflict>,
    #[serde(default, deserialize_with = "seq_or_items")]
    pub fact_table: Vec<FactRow>,
    #[serde(default)]
    pub next_questions: Vec<String>,
    #[serde(default)]
    pub overall_confidence: Option<f64>,
}

/// One conflict the arbiter identified between providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub topic: String,
    #[serde(default)]
    pub claims: Vec<ConflictClaim>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub status: Option<ConflictStatus>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictClaim {
    pub provider: String,
    pub claim: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    Resolved,
    Unresolved,
}

/// One row of the arbiter's cross-provider fact table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactRow {
    pub claim: String,
    #[serde(default)]
    pub support: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Accept either a bare JSON array or an `{"items": [...]}` wrapper.
/// Models produce both shapes for `conflicts` and `fact_table`.
fn seq_or_items<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SeqOrItems<T> {
        Seq(Vec<T>),
        Items { items: Vec<T> },
    }

    match SeqOrItems::deserialize(deserializer)? {
        SeqOrItems::Seq(v) => Ok(v),
        SeqOrItems::Items { items } => Ok(items),
    }
}

// ---------------------------------------------------------------------------
// Arbiter output
// ---------------------------------------------------------------------------

/// One synthesis per run, unique by run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterOutput {
    pub run_id: Uuid,
    /// The arbiter actually used (may be the fallback spec).
    pub provider: ProviderKind,
    pub model: String,
    pub final_answer: Option<String>,
    pub agreements: Vec<String>,
    pub conflicts: Vec<Conflict>,
    pub fact_table: Vec<FactRow>,
    pub next_questions: Vec<String>,
    pub overall_confidence: Option<f64>,
    pub arbiter_failed: bool,
    pub latency_ms: u64,
    pub cost_usd: Option<f64>,
}

// ---------------------------------------------------------------------------
// Run record (replay shape)
// ---------------------------------------------------------------------------

/// A run with its persisted answers and arbiter output preloaded.
/// This is the shape the caller and the replay reader receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run: Run,
    pub answers: Vec<ProviderAnswer>,
    pub arbiter: Option<ArbiterOutput>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
