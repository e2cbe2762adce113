//! Arbiter synthesis with a primary/retry/fallback chain.
//!
//! The arbiter is an ordinary provider call through the same client
//! actors; what differs is the prompt, the expected JSON shape, and the
//! failure policy: the primary spec is retried once on any failure,
//! then the fallback spec gets one attempt, and if all three fail the
//! run still completes with `arbiter_failed = true` and the
//! highest-confidence provider answer salvaged for the caller.

use tracing::{info, warn};
use uuid::Uuid;

use crate::client::{CallOptions, ProviderPool};
use crate::config::ArbiterConfig;
use crate::providers;
use crate::types::{
    round_usd, ArbiterOutput, ArbiterReply, ArbiterSpec, ProviderAnswer,
};

use super::prompts;

/// Everything the arbiter needs from the coordinator.
pub struct ArbiterRequest<'a> {
    pub run_id: Uuid,
    pub question: &'a str,
    /// Usable answers from the final round.
    pub answers: &'a [ProviderAnswer],
    pub rounds_completed: u32,
    /// Chat-scoped override, if the thread has one.
    pub override_spec: Option<&'a ArbiterSpec>,
}

/// Outcome of the synthesis stage.
pub struct Synthesis {
    pub output: ArbiterOutput,
    /// Highest-confidence provider answer, populated only when every
    /// arbiter attempt failed.
    pub best_answer: Option<ProviderAnswer>,
}

/// Selection precedence: chat override, then configured default. The
/// fallback spec is always the configured fallback.
pub(crate) fn select(
    override_spec: Option<&ArbiterSpec>,
    config: &ArbiterConfig,
) -> (ArbiterSpec, ArbiterSpec) {
    let primary = override_spec.cloned().unwrap_or_else(|| config.default.clone());
    (primary, config.fallback.clone())
}

/// Run the arbiter chain. Never fails: an exhausted chain is data.
pub async fn synthesize(
    pool: &ProviderPool,
    config: &ArbiterConfig,
    request: ArbiterRequest<'_>,
) -> Synthesis {
    let (primary, fallback) = select(request.override_spec, config);
    let prompt = prompts::arbiter(request.question, request.answers, request.rounds_completed);

    let mut total_latency_ms = 0u64;
    let mut total_cost_usd: Option<f64> = None;
    let mut last_spec = primary.clone();

    // Primary, primary again, then fallback.
    let attempts = [primary.clone(), primary, fallback];

    for (attempt, spec) in attempts.iter().enumerate() {
        last_spec = spec.clone();
        match attempt_synthesis(pool, spec, &prompt).await {
            Ok(outcome) => {
                total_latency_ms += outcome.latency_ms;
                total_cost_usd = add_cost(total_cost_usd, outcome.cost_usd);

                if let Some(final_answer) = outcome.reply.final_answer {
                    info!(
                        arbiter = %spec,
                        attempt,
                        latency_ms = total_latency_ms,
                        "Arbiter synthesis complete"
                    );
                    return Synthesis {
                        output: ArbiterOutput {
                            run_id: request.run_id,
                            provider: spec.provider,
                            model: outcome.model,
                            final_answer: Some(final_answer),
                            agreements: outcome.reply.agreements,
                            conflicts: outcome.reply.conflicts,
                            fact_table: outcome.reply.fact_table,
                            next_questions: outcome.reply.next_questions,
                            overall_confidence: outcome
                                .reply
                                .overall_confidence
                                .map(|c| c.clamp(0.0, 1.0)),
                            arbiter_failed: false,
                            latency_ms: total_latency_ms,
                            cost_usd: total_cost_usd.map(round_usd),
                        },
                        best_answer: None,
                    };
                }

                warn!(arbiter = %spec, attempt, "Arbiter reply lacks final_answer");
            }
            Err(reason) => {
                warn!(arbiter = %spec, attempt, reason = %reason.message, "Arbiter attempt failed");
                total_latency_ms += reason.latency_ms;
                total_cost_usd = add_cost(total_cost_usd, reason.cost_usd);
            }
        }
    }

    warn!(run_id = %request.run_id, "Arbiter chain exhausted, salvaging best answer");

    Synthesis {
        output: ArbiterOutput {
            run_id: request.run_id,
            provider: last_spec.provider,
            model: last_spec.model,
            final_answer: None,
            agreements: Vec::new(),
            conflicts: Vec::new(),
            fact_table: Vec::new(),
            next_questions: Vec::new(),
            overall_confidence: None,
            arbiter_failed: true,
            latency_ms: total_latency_ms,
            cost_usd: total_cost_usd.map(round_usd),
        },
        best_answer: best_answer(request.answers),
    }
}

// ---------------------------------------------------------------------------
// Single attempt
// ---------------------------------------------------------------------------

struct AttemptOutcome {
    reply: ArbiterReply,
    model: String,
    latency_ms: u64,
    cost_usd: Option<f64>,
}

struct AttemptFailure {
    message: String,
    latency_ms: u64,
    cost_usd: Option<f64>,
}

async fn attempt_synthesis(
    pool: &ProviderPool,
    spec: &ArbiterSpec,
    prompt: &str,
) -> Result<AttemptOutcome, AttemptFailure> {
    let client = pool.require(spec.provider).map_err(|e| AttemptFailure {
        message: e.to_string(),
        latency_ms: 0,
        cost_usd: None,
    })?;

    let opts = CallOptions {
        model: Some(spec.model.clone()),
        timeout: None,
    };

    let answer = client.call(prompt, &opts).await.map_err(|e| AttemptFailure {
        message: e.to_string(),
        latency_ms: e.latency_ms.unwrap_or(0),
        cost_usd: None,
    })?;

    if !answer.status.is_usable() {
        return Err(AttemptFailure {
            message: format!("arbiter answer status {}", answer.status),
            latency_ms: answer.latency_ms,
            cost_usd: answer.usage.cost_usd,
        });
    }

    // The round normalizer leaves non-round JSON as raw text with a
    // parse_error status, which is exactly what the arbiter parses.
    match parse_reply(&answer.answer) {
        Some(reply) => Ok(AttemptOutcome {
            reply,
            model: answer.model,
            latency_ms: answer.latency_ms,
            cost_usd: answer.usage.cost_usd,
        }),
        None => Err(AttemptFailure {
            message: "arbiter reply is not valid JSON".to_string(),
            latency_ms: answer.latency_ms,
            cost_usd: answer.usage.cost_usd,
        }),
    }
}

/// Parse arbiter text with the shared recovery heuristics.
fn parse_reply(text: &str) -> Option<ArbiterReply> {
    providers::recover_json(text).and_then(|v| serde_json::from_value(v).ok())
}

/// The usable answer with the highest non-null confidence. Ties keep
/// the earliest answer.
fn best_answer(answers: &[ProviderAnswer]) -> Option<ProviderAnswer> {
    answers
        .iter()
        .filter(|a| a.confidence.is_some())
        .reduce(|best, candidate| {
            if candidate.confidence > best.confidence {
                candidate
            } else {
                best
            }
        })
        .or_else(|| answers.first())
        .cloned()
}

fn add_cost(total: Option<f64>, cost: Option<f64>) -> Option<f64> {
    match (total, cost) {
        (None, None) => None,
        (t, c) => Some(t.unwrap_or(0.0) + c.unwrap_or(0.0)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
