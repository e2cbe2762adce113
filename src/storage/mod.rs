//! Persistence layer.
//!
//! Defines the `Store` trait the coordinator writes through and the
//! replay endpoint reads from. The schema (threads, runs,
//! provider_answers, dredd_outputs) is part of the public contract:
//! replay reads these tables directly.

pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StorageResult;
use crate::types::{ArbiterOutput, ArbiterSpec, ProviderAnswer, Run, RunRecord, Thread};

/// Thread/run/answer/arbiter records the coordinator persists.
///
/// Every method is one independent transaction; a failure of any call
/// is fatal to the run in progress.
#[async_trait]
pub trait Store: Send + Sync {
    /// Find or create the thread for a chat id.
    async fn upsert_thread(&self, chat_id: i64) -> StorageResult<Thread>;

    /// Set or clear the chat-scoped arbiter override.
    async fn set_thread_arbiter(
        &self,
        chat_id: i64,
        spec: Option<ArbiterSpec>,
    ) -> StorageResult<()>;

    /// Insert a freshly-created (in-progress) run.
    async fn create_run(&self, run: &Run) -> StorageResult<()>;

    /// Write a run's terminal state. Fails with `AlreadyFinal` if the
    /// run is not in progress: a run reaches a terminal status exactly
    /// once.
    async fn finalize_run(&self, run: &Run) -> StorageResult<()>;

    /// Persist one provider answer (success or failure) for a round.
    async fn insert_answer(&self, answer: &ProviderAnswer) -> StorageResult<()>;

    /// Persist the arbiter output. At most one per run.
    async fn insert_arbiter_output(&self, output: &ArbiterOutput) -> StorageResult<()>;

    async fn get_run(&self, run_id: Uuid) -> StorageResult<Option<Run>>;

    /// All runs of one thread, newest first.
    async fn runs_for_thread(&self, thread_id: Uuid) -> StorageResult<Vec<Run>>;

    async fn answers_for_run(&self, run_id: Uuid) -> StorageResult<Vec<ProviderAnswer>>;

    async fn arbiter_output_for_run(&self, run_id: Uuid) -> StorageResult<Option<ArbiterOutput>>;

    /// A run with answers and arbiter output preloaded (the replay
    /// read path).
    async fn load_run(&self, run_id: Uuid) -> StorageResult<RunRecord>;
}
