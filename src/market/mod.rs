//! Market coordinator — the per-run round controller.
//!
//! Creates the run, fans provider calls out in parallel each round,
//! persists every answer, decides when to stop via the convergence
//! detector, invokes the arbiter chain, and finalizes the run with its
//! cost and latency totals.

pub mod arbiter;
pub mod convergence;
pub mod prompts;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::client::{CallOptions, ProviderPool};
use crate::config::{AppConfig, ArbiterConfig, MarketConfig};
use crate::error::{CallError, ErrorKind, MarketError, MarketResult};
use crate::storage::Store;
use crate::types::{
    round_usd, ArbiterSpec, ProviderAnswer, ProviderKind, Run, RunRecord, RunStatus,
};

use self::convergence::Disagreement;

/// Grace added to a provider's call timeout before its round task is
/// killed. Must keep the task deadline at or above the call timeout so
/// the client returns naturally and never leaks its actor lock.
const TASK_DEADLINE_GRACE: Duration = Duration::from_millis(5_000);

/// Per-run options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_rounds: Option<u32>,
    pub arbiter_spec: Option<ArbiterSpec>,
}

/// The consensus market engine.
pub struct Market {
    pool: Arc<ProviderPool>,
    store: Arc<dyn Store>,
    market_config: MarketConfig,
    arbiter_config: ArbiterConfig,
}

impl Market {
    pub fn new(pool: Arc<ProviderPool>, store: Arc<dyn Store>, config: &AppConfig) -> Self {
        Self {
            pool,
            store,
            market_config: config.market.clone(),
            arbiter_config: config.arbiter.clone(),
        }
    }

    /// Execute one question end to end and return the persisted run
    /// with its answers and arbiter output preloaded.
    pub async fn run(
        &self,
        chat_id: i64,
        question: &str,
        opts: RunOptions,
    ) -> MarketResult<RunRecord> {
        let thread = self.store.upsert_thread(chat_id).await?;
        let mut run = Run::new(thread.id, question);
        self.store.create_run(&run).await?;
        let started = Instant::now();

        info!(run_id = %run.id, chat_id, "Market run started");

        let providers = self.pool.enabled();
        if providers.is_empty() {
            warn!(run_id = %run.id, "No enabled providers");
            self.fail_run(&mut run, 0).await;
            return Err(MarketError::AllProvidersFailed);
        }

        let max_rounds = opts.max_rounds.unwrap_or(self.market_config.max_rounds).max(1);
        let override_spec = opts.arbiter_spec.or(thread.arbiter_override);

        // -- Round loop ----------------------------------------------------

        let mut round = 1u32;
        let mut previous: HashMap<ProviderKind, ProviderAnswer> = HashMap::new();
        let mut disagreements: Vec<Disagreement> = Vec::new();

        let (final_answers, convergence_achieved) = loop {
            let round_answers = self
                .fan_out(&providers, run.id, round, question, &previous, &disagreements)
                .await;

            for answer in &round_answers {
                if let Err(e) = self.store.insert_answer(answer).await {
                    error!(run_id = %run.id, error = %e, "Failed to persist answer");
                    self.fail_run(&mut run, round).await;
                    return Err(e.into());
                }
            }

            let successful: Vec<ProviderAnswer> = round_answers
                .into_iter()
                .filter(|a| a.status.is_usable())
                .collect();

            if successful.is_empty() {
                warn!(run_id = %run.id, round, "No usable answer in round");
                self.fail_run(&mut run, round).await;
                return Err(MarketError::AllProvidersFailed);
            }

            let report = convergence::evaluate(
                &successful,
                self.market_config.convergence_confidence_threshold,
                self.market_config.convergence_claim_overlap,
            );

            info!(
                run_id = %run.id,
                round,
                answers = successful.len(),
                confidence_delta = report.confidence_delta,
                claim_overlap = report.claim_overlap,
                converged = report.converged,
                "Round complete"
            );

            if report.converged || round >= max_rounds {
                break (successful, report.converged);
            }

            disagreements = report.disagreements;
            previous = successful.into_iter().map(|a| (a.provider, a)).collect();
            round += 1;
        };

        // -- Synthesis -----------------------------------------------------

        let synthesis = arbiter::synthesize(
            &self.pool,
            &self.arbiter_config,
            arbiter::ArbiterRequest {
                run_id: run.id,
                question,
                answers: &final_answers,
                rounds_completed: round,
                override_spec: override_spec.as_ref(),
            },
        )
        .await;

        if let Err(e) = self.store.insert_arbiter_output(&synthesis.output).await {
            error!(run_id = %run.id, error = %e, "Failed to persist arbiter output");
            self.fail_run(&mut run, round).await;
            return Err(e.into());
        }

        // -- Finalization --------------------------------------------------

        let answers = self.store.answers_for_run(run.id).await?;
        let provider_cost: f64 = answers.iter().filter_map(|a| a.usage.cost_usd).sum();
        let total_cost = round_usd(provider_cost + synthesis.output.cost_usd.unwrap_or(0.0));

        run.status = RunStatus::Completed;
        run.rounds_completed = round;
        run.convergence_achieved = convergence_achieved;
        run.total_latency_ms = started.elapsed().as_millis() as u64;
        run.total_cost_usd = total_cost;
        self.store.finalize_run(&run).await?;

        info!(
            run_id = %run.id,
            rounds = round,
            converged = convergence_achieved,
            arbiter_failed = synthesis.output.arbiter_failed,
            total_cost_usd = total_cost,
            total_latency_ms = run.total_latency_ms,
            "Market run complete"
        );

        Ok(self.store.load_run(run.id).await?)
    }

    // -- Fan-out ----------------------------------------------------------

    /// Call every provider for one round, bounded by the concurrency
    /// cap. Each task is killed at its deadline and reported as a
    /// timeout answer; every provider yields exactly one answer.
    async fn fan_out(
        &self,
        providers: &[ProviderKind],
        run_id: Uuid,
        round: u32,
        question: &str,
        previous: &HashMap<ProviderKind, ProviderAnswer>,
        disagreements: &[Disagreement],
    ) -> Vec<ProviderAnswer> {
        let semaphore = Arc::new(Semaphore::new(self.market_config.max_concurrency.max(1)));
        let mut tasks: JoinSet<(ProviderKind, String, Option<Result<ProviderAnswer, CallError>>)> =
            JoinSet::new();

        for kind in providers {
            let Some(client) = self.pool.get(*kind) else {
                continue;
            };

            // A provider that failed in the previous round restarts
            // from the opening prompt.
            let prompt = match previous.get(kind) {
                Some(own) => {
                    let peers = peer_answers(previous, *kind);
                    prompts::revision(question, own, &peers, disagreements)
                }
                None => prompts::round_one(question),
            };

            let kind = *kind;
            let model = client.default_model().to_string();
            let deadline = client.timeout() + TASK_DEADLINE_GRACE;
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                // The semaphore is never closed, so acquisition only
                // fails if the pool is torn down mid-round.
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome =
                    tokio::time::timeout(deadline, client.call(&prompt, &CallOptions::default()))
                        .await;
                (kind, model, outcome.ok())
            });
        }

        let mut answers = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_kind, _model, Some(Ok(mut answer)))) => {
                    answer.run_id = run_id;
                    answer.round = round;
                    answers.push(answer);
                }
                Ok((kind, model, Some(Err(call_error)))) => {
                    answers.push(ProviderAnswer::from_error(
                        run_id, round, kind, &model, call_error,
                    ));
                }
                Ok((kind, model, None)) => {
                    warn!(provider = %kind, round, "Round task killed at deadline");
                    answers.push(ProviderAnswer::from_error(
                        run_id,
                        round,
                        kind,
                        &model,
                        CallError::new(ErrorKind::Timeout, "round task deadline exceeded"),
                    ));
                }
                Err(join_error) => {
                    // A panicked task loses its provider identity; the
                    // round simply proceeds without that answer.
                    error!(error = %join_error, round, "Round task failed to join");
                }
            }
        }

        answers
    }

    async fn fail_run(&self, run: &mut Run, rounds_completed: u32) {
        run.status = RunStatus::Failed;
        run.rounds_completed = rounds_completed;
        if let Err(e) = self.store.finalize_run(run).await {
            error!(run_id = %run.id, error = %e, "Failed to mark run as failed");
        }
    }
}

/// Previous-round answers from every provider except `own`, in stable
/// declaration order.
fn peer_answers(
    previous: &HashMap<ProviderKind, ProviderAnswer>,
    own: ProviderKind,
) -> Vec<&ProviderAnswer> {
    ProviderKind::ALL
        .iter()
        .filter(|k| **k != own)
        .filter_map(|k| previous.get(k))
        .collect()
}
