use super::{ImportStore, StoreError};
use crate::models::{ErroneousRow, ImportJob, JobState, RowOutcome, Tally};
use async_trait::async_trait;
use chrono::Utc;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::Mutex;
use uuid::Uuid;

struct JobEntry {
    job: ImportJob,
    outcomes: BTreeMap<u64, RowOutcome>,
}

/// Single-process store; one lock serializes every guarded write.
#[derive(Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImportStore for MemoryStore {
    async fn create_job(&self, job: &ImportJob) -> Result<(), StoreError> {
        let mut guard = self.jobs.lock().await;
        guard.insert(
            job.id,
            JobEntry {
                job: job.clone(),
                outcomes: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn job(&self, id: Uuid) -> Result<Option<ImportJob>, StoreError> {
        let guard = self.jobs.lock().await;
        Ok(guard.get(&id).map(|entry| entry.job.clone()))
    }

    async fn set_row_count(&self, id: Uuid, row_count: u64) -> Result<(), StoreError> {
        let mut guard = self.jobs.lock().await;
        let entry = guard.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        match entry.job.row_count {
            Some(existing) if existing == row_count => Ok(()),
            Some(existing) => Err(StoreError::RowCountConflict {
                id,
                existing,
                attempted: row_count,
            }),
            None => {
                entry.job.row_count = Some(row_count);
                entry.job.updated_at = Utc::now();
                Ok(())
            }
        }
    }

    async fn compare_and_set_state(
        &self,
        id: Uuid,
        expected: JobState,
        next: JobState,
        failure_reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut guard = self.jobs.lock().await;
        let entry = guard.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if entry.job.state != expected {
            return Ok(false);
        }
        entry.job.state = next;
        entry.job.updated_at = Utc::now();
        if let Some(reason) = failure_reason
            && entry.job.failure_reason.is_none()
        {
            entry.job.failure_reason = Some(reason.to_string());
        }
        Ok(true)
    }

    async fn has_outcome(&self, id: Uuid, row_index: u64) -> Result<bool, StoreError> {
        let guard = self.jobs.lock().await;
        let entry = guard.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(entry.outcomes.contains_key(&row_index))
    }

    async fn record_outcome(
        &self,
        id: Uuid,
        row_index: u64,
        outcome: &RowOutcome,
    ) -> Result<bool, StoreError> {
        let mut guard = self.jobs.lock().await;
        let entry = guard.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if entry.outcomes.contains_key(&row_index) {
            return Ok(false);
        }
        entry.outcomes.insert(row_index, outcome.clone());
        Ok(true)
    }

    async fn tally(&self, id: Uuid) -> Result<Tally, StoreError> {
        let guard = self.jobs.lock().await;
        let entry = guard.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(Tally::from_outcomes(entry.outcomes.values()))
    }

    async fn erroneous_rows(&self, id: Uuid) -> Result<Vec<ErroneousRow>, StoreError> {
        let guard = self.jobs.lock().await;
        let entry = guard.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(entry
            .outcomes
            .values()
            .filter_map(|outcome| match outcome {
                RowOutcome::Failed(row) => Some(row.clone()),
                _ => None,
            })
            .collect())
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut guard = self.jobs.lock().await;
        Ok(guard.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::FileRef;
    use crate::models::{Action, ListingRecord};

    fn job() -> ImportJob {
        ImportJob::new("seller-1", FileRef::new("f1"), "listings.csv")
    }

    fn published(job_id: Uuid, action: Action) -> RowOutcome {
        RowOutcome::Published(ListingRecord {
            listing_id: Uuid::new_v4().to_string(),
            external_id: None,
            action,
            fee_cents: 0,
            import_job_id: job_id,
        })
    }

    #[tokio::test]
    async fn row_count_is_set_once() {
        let store = MemoryStore::new();
        let job = job();
        store.create_job(&job).await.unwrap();
        store.set_row_count(job.id, 120).await.unwrap();
        store.set_row_count(job.id, 120).await.unwrap();
        let err = store.set_row_count(job.id, 121).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::RowCountConflict {
                existing: 120,
                attempted: 121,
                ..
            }
        ));
        assert_eq!(store.job(job.id).await.unwrap().unwrap().row_count, Some(120));
    }

    #[tokio::test]
    async fn compare_and_set_keeps_first_failure_reason() {
        let store = MemoryStore::new();
        let job = job();
        store.create_job(&job).await.unwrap();

        assert!(!store
            .compare_and_set_state(job.id, JobState::Processing, JobState::Failed, Some("x"))
            .await
            .unwrap());
        assert!(store
            .compare_and_set_state(job.id, JobState::Pending, JobState::Processing, None)
            .await
            .unwrap());
        assert!(store
            .compare_and_set_state(job.id, JobState::Processing, JobState::Failed, Some("first"))
            .await
            .unwrap());
        assert!(store
            .compare_and_set_state(job.id, JobState::Failed, JobState::Failed, Some("second"))
            .await
            .unwrap());

        let stored = store.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn outcomes_are_insert_if_absent_and_tallied() {
        let store = MemoryStore::new();
        let job = job();
        store.create_job(&job).await.unwrap();

        assert!(store.record_outcome(job.id, 1, &published(job.id, Action::Create)).await.unwrap());
        assert!(!store.record_outcome(job.id, 1, &published(job.id, Action::Update)).await.unwrap());
        assert!(store.record_outcome(job.id, 2, &published(job.id, Action::Update)).await.unwrap());
        let failed = RowOutcome::Failed(ErroneousRow {
            import_job_id: job.id,
            row_index: 3,
            validation_errors: vec!["Title can't be blank".into()],
            row_csv: ";".into(),
        });
        assert!(store.record_outcome(job.id, 3, &failed).await.unwrap());
        let skipped = RowOutcome::Skipped {
            external_id: Some("a".into()),
            action: Action::Delete,
        };
        assert!(store.record_outcome(job.id, 4, &skipped).await.unwrap());

        let tally = store.tally(job.id).await.unwrap();
        assert_eq!(tally.published, 2);
        assert_eq!(tally.erroneous, 1);
        assert_eq!(tally.skipped, 1);
        assert_eq!(tally.actions.created, 1);
        assert_eq!(tally.actions.updated, 1);
        assert!(store.has_outcome(job.id, 4).await.unwrap());
        assert!(!store.has_outcome(job.id, 5).await.unwrap());

        let rows = store.erroneous_rows(job.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_index, 3);
    }

    #[tokio::test]
    async fn delete_cascades_to_outcomes() {
        let store = MemoryStore::new();
        let job = job();
        store.create_job(&job).await.unwrap();
        store
            .record_outcome(job.id, 1, &published(job.id, Action::Create))
            .await
            .unwrap();

        assert!(store.delete_job(job.id).await.unwrap());
        assert!(!store.delete_job(job.id).await.unwrap());
        assert!(store.job(job.id).await.unwrap().is_none());
        assert!(matches!(
            store.tally(job.id).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
