//! SQLite-backed store.
//!
//! Uses sqlx with embedded migrations. UUID keys are stored as 16-byte
//! blobs; list- and object-shaped fields are serialized JSON TEXT
//! columns. Each operation is one implicit transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use super::Store;
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::types::{
    AnswerStatus, ArbiterOutput, ArbiterSpec, Citation, Conflict, FactRow, ProviderAnswer,
    ProviderKind, Run, RunRecord, RunStatus, Thread, Usage,
};
use crate::error::CallError;

/// Embedded migrations, applied at connect time.
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at the configured path
    /// and run migrations.
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        if let Some(parent) = std::path::Path::new(&config.path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {e}"),
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.path))
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database path: {e}"),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {e}"),
            })?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                StorageError::Connection {
                    message: format!("Invalid in-memory URL: {e}"),
                }
            })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to create in-memory database: {e}"),
            })?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Migration {
                message: format!("Failed to run migrations: {e}"),
            })?;
        info!("Database migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct ThreadRow {
    id: Uuid,
    chat_id: i64,
    arbiter_provider: Option<String>,
    arbiter_model: Option<String>,
    created_at: DateTime<Utc>,
}

impl ThreadRow {
    fn into_thread(self) -> StorageResult<Thread> {
        let arbiter_override = match (self.arbiter_provider, self.arbiter_model) {
            (Some(provider), Some(model)) => Some(ArbiterSpec {
                provider: parse_enum::<ProviderKind>(&provider)?,
                model,
            }),
            _ => None,
        };
        Ok(Thread {
            id: self.id,
            chat_id: self.chat_id,
            arbiter_override,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    thread_id: Uuid,
    question: String,
    status: String,
    rounds_completed: i64,
    convergence_achieved: bool,
    total_latency_ms: i64,
    total_cost_usd: f64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RunRow {
    fn into_run(self) -> StorageResult<Run> {
        Ok(Run {
            id: self.id,
            thread_id: self.thread_id,
            question: self.question,
            status: parse_enum::<RunStatus>(&self.status)?,
            rounds_completed: self.rounds_completed as u32,
            convergence_achieved: self.convergence_achieved,
            total_latency_ms: self.total_latency_ms as u64,
            total_cost_usd: self.total_cost_usd,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AnswerRow {
    run_id: Uuid,
    round: i64,
    provider: String,
    model: String,
    status: String,
    answer: String,
    confidence: Option<f64>,
    key_claims: Option<String>,
    assumptions: Option<String>,
    citations: Option<String>,
    usage: String,
    latency_ms: i64,
    error: Option<String>,
    raw_response: Option<String>,
}

impl AnswerRow {
    fn into_answer(self) -> StorageResult<ProviderAnswer> {
        Ok(ProviderAnswer {
            run_id: self.run_id,
            round: self.round as u32,
            provider: parse_enum::<ProviderKind>(&self.provider)?,
            model: self.model,
            status: parse_enum::<AnswerStatus>(&self.status)?,
            answer: self.answer,
            confidence: self.confidence,
            key_claims: decode_json_opt::<Vec<String>>(self.key_claims)?,
            assumptions: decode_json_opt::<Vec<String>>(self.assumptions)?,
            citations: decode_json_opt::<Vec<Citation>>(self.citations)?,
            usage: serde_json::from_str::<Usage>(&self.usage)?,
            latency_ms: self.latency_ms as u64,
            error: decode_json_opt::<CallError>(self.error)?,
            raw_response: self.raw_response,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ArbiterRow {
    run_id: Uuid,
    provider: String,
    model: String,
    final_answer: Option<String>,
    agreements: String,
    conflicts: String,
    fact_table: String,
    next_questions: String,
    overall_confidence: Option<f64>,
    arbiter_failed: bool,
    latency_ms: i64,
    cost_usd: Option<f64>,
}

impl ArbiterRow {
    fn into_output(self) -> StorageResult<ArbiterOutput> {
        Ok(ArbiterOutput {
            run_id: self.run_id,
            provider: parse_enum::<ProviderKind>(&self.provider)?,
            model: self.model,
            final_answer: self.final_answer,
            agreements: serde_json::from_str::<Vec<String>>(&self.agreements)?,
            conflicts: serde_json::from_str::<Vec<Conflict>>(&self.conflicts)?,
            fact_table: serde_json::from_str::<Vec<FactRow>>(&self.fact_table)?,
            next_questions: serde_json::from_str::<Vec<String>>(&self.next_questions)?,
            overall_confidence: self.overall_confidence,
            arbiter_failed: self.arbiter_failed,
            latency_ms: self.latency_ms as u64,
            cost_usd: self.cost_usd,
        })
    }
}

fn parse_enum<T: FromStr<Err = String>>(value: &str) -> StorageResult<T> {
    value.parse::<T>().map_err(|e| StorageError::Corrupt { message: e })
}

fn decode_json_opt<T: serde::de::DeserializeOwned>(
    value: Option<String>,
) -> StorageResult<Option<T>> {
    value
        .map(|v| serde_json::from_str::<T>(&v))
        .transpose()
        .map_err(StorageError::Json)
}

fn encode_json_opt<T: serde::Serialize>(value: &Option<T>) -> StorageResult<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StorageError::Json)
}

// ---------------------------------------------------------------------------
// Store implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_thread(&self, chat_id: i64) -> StorageResult<Thread> {
        sqlx::query(
            r#"
            INSERT INTO threads (id, chat_id, arbiter_provider, arbiter_model, created_at)
            VALUES (?, ?, NULL, NULL, ?)
            ON CONFLICT(chat_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(chat_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let row: ThreadRow = sqlx::query_as(
            r#"
            SELECT id, chat_id, arbiter_provider, arbiter_model, created_at
            FROM threads
            WHERE chat_id = ?
            "#,
        )
        .bind(chat_id)
        .fetch_one(&self.pool)
        .await?;

        row.into_thread()
    }

    async fn set_thread_arbiter(
        &self,
        chat_id: i64,
        spec: Option<ArbiterSpec>,
    ) -> StorageResult<()> {
        let (provider, model) = match spec {
            Some(s) => (Some(s.provider.as_str().to_string()), Some(s.model)),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE threads
            SET arbiter_provider = ?, arbiter_model = ?
            WHERE chat_id = ?
            "#,
        )
        .bind(provider)
        .bind(model)
        .bind(chat_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "thread",
                id: chat_id.to_string(),
            });
        }
        Ok(())
    }

    async fn create_run(&self, run: &Run) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (
                id, thread_id, question, status, rounds_completed,
                convergence_achieved, total_latency_ms, total_cost_usd,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.id)
        .bind(run.thread_id)
        .bind(&run.question)
        .bind(run.status.as_str())
        .bind(i64::from(run.rounds_completed))
        .bind(run.convergence_achieved)
        .bind(run.total_latency_ms as i64)
        .bind(run.total_cost_usd)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finalize_run(&self, run: &Run) -> StorageResult<()> {
        // The status guard makes the terminal transition happen at
        // most once.
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?, rounds_completed = ?, convergence_achieved = ?,
                total_latency_ms = ?, total_cost_usd = ?, updated_at = ?
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(run.status.as_str())
        .bind(i64::from(run.rounds_completed))
        .bind(run.convergence_achieved)
        .bind(run.total_latency_ms as i64)
        .bind(run.total_cost_usd)
        .bind(Utc::now())
        .bind(run.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::AlreadyFinal {
                id: run.id.to_string(),
            });
        }
        Ok(())
    }

    async fn insert_answer(&self, answer: &ProviderAnswer) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO provider_answers (
                id, run_id, round, provider, model, status, answer,
                confidence, key_claims, assumptions, citations, usage,
                latency_ms, error, raw_response
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(answer.run_id)
        .bind(i64::from(answer.round))
        .bind(answer.provider.as_str())
        .bind(&answer.model)
        .bind(answer.status.as_str())
        .bind(&answer.answer)
        .bind(answer.confidence)
        .bind(encode_json_opt(&answer.key_claims)?)
        .bind(encode_json_opt(&answer.assumptions)?)
        .bind(encode_json_opt(&answer.citations)?)
        .bind(serde_json::to_string(&answer.usage)?)
        .bind(answer.latency_ms as i64)
        .bind(encode_json_opt(&answer.error)?)
        .bind(&answer.raw_response)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_arbiter_output(&self, output: &ArbiterOutput) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dredd_outputs (
                id, run_id, provider, model, final_answer, agreements,
                conflicts, fact_table, next_questions, overall_confidence,
                arbiter_failed, latency_ms, cost_usd, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(output.run_id)
        .bind(output.provider.as_str())
        .bind(&output.model)
        .bind(&output.final_answer)
        .bind(serde_json::to_string(&output.agreements)?)
        .bind(serde_json::to_string(&output.conflicts)?)
        .bind(serde_json::to_string(&output.fact_table)?)
        .bind(serde_json::to_string(&output.next_questions)?)
        .bind(output.overall_confidence)
        .bind(output.arbiter_failed)
        .bind(output.latency_ms as i64)
        .bind(output.cost_usd)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> StorageResult<Option<Run>> {
        let row: Option<RunRow> = sqlx::query_as(
            r#"
            SELECT id, thread_id, question, status, rounds_completed,
                   convergence_achieved, total_latency_ms, total_cost_usd,
                   created_at, updated_at
            FROM runs
            WHERE id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRow::into_run).transpose()
    }

    async fn runs_for_thread(&self, thread_id: Uuid) -> StorageResult<Vec<Run>> {
        let rows: Vec<RunRow> = sqlx::query_as(
            r#"
            SELECT id, thread_id, question, status, rounds_completed,
                   convergence_achieved, total_latency_ms, total_cost_usd,
                   created_at, updated_at
            FROM runs
            WHERE thread_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunRow::into_run).collect()
    }

    async fn answers_for_run(&self, run_id: Uuid) -> StorageResult<Vec<ProviderAnswer>> {
        let rows: Vec<AnswerRow> = sqlx::query_as(
            r#"
            SELECT run_id, round, provider, model, status, answer,
                   confidence, key_claims, assumptions, citations, usage,
                   latency_ms, error, raw_response
            FROM provider_answers
            WHERE run_id = ?
            ORDER BY round ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AnswerRow::into_answer).collect()
    }

    async fn arbiter_output_for_run(&self, run_id: Uuid) -> StorageResult<Option<ArbiterOutput>> {
        let row: Option<ArbiterRow> = sqlx::query_as(
            r#"
            SELECT run_id, provider, model, final_answer, agreements,
                   conflicts, fact_table, next_questions, overall_confidence,
                   arbiter_failed, latency_ms, cost_usd
            FROM dredd_outputs
            WHERE run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ArbiterRow::into_output).transpose()
    }

    async fn load_run(&self, run_id: Uuid) -> StorageResult<RunRecord> {
        let run = self
            .get_run(run_id)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "run",
                id: run_id.to_string(),
            })?;
        let answers = self.answers_for_run(run_id).await?;
        let arbiter = self.arbiter_output_for_run(run_id).await?;

        Ok(RunRecord {
            run,
            answers,
            arbiter,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
