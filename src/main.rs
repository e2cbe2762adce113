//! QUORUM — Multi-Provider LLM Consensus Engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the store, starts the provider clients, and runs a single
//! question through the market from the command line.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use quorum::client::ProviderPool;
use quorum::config::AppConfig;
use quorum::error::SYNTHESIS_FAILED_MESSAGE;
use quorum::market::{Market, RunOptions};
use quorum::providers::HttpTransport;
use quorum::storage::sqlite::SqliteStore;
use quorum::storage::Store;

/// Chat id used for command-line runs; real chat ids arrive through
/// the chat collaborator.
const CLI_CHAT_ID: i64 = 0;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = match AppConfig::load("config.toml") {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("No usable config.toml ({e:#}), using built-in defaults");
            AppConfig::default()
        }
    };

    init_logging();

    let question: String = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if question.trim().is_empty() {
        anyhow::bail!("Usage: quorum <question>");
    }

    info!(
        max_rounds = cfg.market.max_rounds,
        max_concurrency = cfg.market.max_concurrency,
        db = %cfg.database.path,
        "QUORUM starting up"
    );

    // -- Wire the engine ---------------------------------------------------

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::new(&cfg.database)
            .await
            .context("Failed to open database")?,
    );

    let transport = Arc::new(
        HttpTransport::new().map_err(|e| anyhow::anyhow!("Failed to build transport: {e}"))?,
    );
    let pool = Arc::new(ProviderPool::from_config(&cfg, transport));

    if pool.is_empty() {
        warn!("No provider has both enabled=true and a credential; the run will fail");
    }

    for probe in pool.inspect_all().await {
        info!(
            provider = %probe.provider,
            circuit = %probe.circuit_state,
            tokens = probe.available_tokens,
            "Provider started"
        );
    }

    let market = Market::new(pool, store, &cfg);

    // -- Run one question --------------------------------------------------

    let record = match market.run(CLI_CHAT_ID, &question, RunOptions::default()).await {
        Ok(record) => record,
        Err(e) => {
            eprintln!("{}", e.user_message());
            return Err(e.into());
        }
    };

    let run = &record.run;
    info!(
        run_id = %run.id,
        rounds = run.rounds_completed,
        converged = run.convergence_achieved,
        cost = format!("${:.6}", run.total_cost_usd),
        latency_ms = run.total_latency_ms,
        "Run finished"
    );

    match record.arbiter.as_ref().and_then(|a| a.final_answer.as_deref()) {
        Some(final_answer) => {
            println!("\n{final_answer}\n");
            if let Some(arbiter) = &record.arbiter {
                if let Some(confidence) = arbiter.overall_confidence {
                    println!("confidence: {confidence:.2}");
                }
                if !arbiter.agreements.is_empty() {
                    println!("agreed: {}", arbiter.agreements.join("; "));
                }
            }
        }
        None => {
            println!("\n{SYNTHESIS_FAILED_MESSAGE}\n");
            // Show the strongest raw answer instead.
            if let Some(best) = record
                .answers
                .iter()
                .filter(|a| a.status.is_usable() && a.round == run.rounds_completed)
                .max_by(|a, b| {
                    a.confidence
                        .partial_cmp(&b.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
            {
                println!("[{}] {}", best.provider, best.answer);
            }
        }
    }

    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quorum=info"));

    let json_logging = std::env::var("QUORUM_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
