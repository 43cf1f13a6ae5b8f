//! Durable job state and row outcomes.
//!
//! Every guarded write is atomic with respect to other writers on the same job:
//! the state compare-and-set, the set-once `row_count`, and the insert-if-absent
//! of a row outcome. Aggregates are always recomputed from stored outcomes.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::models::{ErroneousRow, ImportJob, JobState, RowOutcome, Tally};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("import job {0} not found")]
    NotFound(Uuid),
    #[error("row count of job {id} is already {existing}, refusing {attempted}")]
    RowCountConflict {
        id: Uuid,
        existing: u64,
        attempted: u64,
    },
    #[error("store backend failed: {0}")]
    Backend(String),
    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
    #[error("codec failed: {0}")]
    Codec(#[from] serde_json::Error),
}

#[async_trait]
pub trait ImportStore: Send + Sync {
    async fn create_job(&self, job: &ImportJob) -> Result<(), StoreError>;

    async fn job(&self, id: Uuid) -> Result<Option<ImportJob>, StoreError>;

    /// Sets `row_count` once. Repeating the same value is accepted.
    async fn set_row_count(&self, id: Uuid, row_count: u64) -> Result<(), StoreError>;

    /// Moves the job from `expected` to `next`; returns false if the job was not
    /// in `expected`. A failure reason is only written when none is stored yet.
    async fn compare_and_set_state(
        &self,
        id: Uuid,
        expected: JobState,
        next: JobState,
        failure_reason: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn has_outcome(&self, id: Uuid, row_index: u64) -> Result<bool, StoreError>;

    /// Stores the outcome unless the row already has one; returns whether it was stored.
    async fn record_outcome(
        &self,
        id: Uuid,
        row_index: u64,
        outcome: &RowOutcome,
    ) -> Result<bool, StoreError>;

    async fn tally(&self, id: Uuid) -> Result<Tally, StoreError>;

    /// Erroneous rows ordered by row index.
    async fn erroneous_rows(&self, id: Uuid) -> Result<Vec<ErroneousRow>, StoreError>;

    /// Removes the job together with all of its row outcomes.
    async fn delete_job(&self, id: Uuid) -> Result<bool, StoreError>;
}
