//! Applies one batch of rows to the listing catalog.

use crate::domain::{CategoryResolver, ListingBuilder};
use crate::i18n::{self, FailureReason, Locale};
use crate::lifecycle::Lifecycle;
use crate::metrics;
use crate::models::{Action, ErroneousRow, ImportJob, JobState, RowOutcome};
use crate::pipeline::log_exception;
use crate::schema::{RawRow, SanitizedRow};
use crate::splitter::Batch;
use crate::store::{ImportStore, StoreError};
use std::{sync::Arc, time::Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchStatus {
    #[default]
    Completed,
    /// This batch brought the job to `finished`.
    Finished,
    /// The job was not processing; nothing was touched.
    Ignored,
    /// The batch itself was unusable and the job was failed.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub published: u64,
    pub erroneous: u64,
    pub skipped: u64,
    /// Rows that already had an outcome from an earlier delivery.
    pub duplicates: u64,
    pub status: BatchStatus,
}

impl BatchReport {
    fn with_status(status: BatchStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    fn count(&mut self, outcome: &RowOutcome) {
        match outcome {
            RowOutcome::Published(_) => self.published += 1,
            RowOutcome::Failed(_) => self.erroneous += 1,
            RowOutcome::Skipped { .. } => self.skipped += 1,
        }
    }

    pub fn rows(&self) -> u64 {
        self.published + self.erroneous + self.skipped + self.duplicates
    }
}

#[derive(Clone)]
pub struct BatchProcessor {
    store: Arc<dyn ImportStore>,
    builder: Arc<dyn ListingBuilder>,
    categories: Arc<dyn CategoryResolver>,
    lifecycle: Lifecycle,
    locale: Locale,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn ImportStore>,
        builder: Arc<dyn ListingBuilder>,
        categories: Arc<dyn CategoryResolver>,
        lifecycle: Lifecycle,
        locale: Locale,
    ) -> Self {
        Self {
            store,
            builder,
            categories,
            lifecycle,
            locale,
        }
    }

    /// Processes every row of the batch, then attempts to finish the job.
    ///
    /// Row faults become erroneous rows. An unreadable payload or a store
    /// failure fails the whole job instead. Only errors from failing the job
    /// itself are returned.
    pub async fn process(&self, job_id: Uuid, payload: &str) -> Result<BatchReport, StoreError> {
        let Some(job) = self.store.job(job_id).await? else {
            warn!(target = "hermes.batch", job_id = %job_id, "batch for unknown job dropped");
            return Ok(BatchReport::with_status(BatchStatus::Ignored));
        };
        if job.state != JobState::Processing {
            debug!(
                target = "hermes.batch",
                job_id = %job_id,
                state = job.state.as_str(),
                "job not processing, batch ignored"
            );
            return Ok(BatchReport::with_status(BatchStatus::Ignored));
        }

        let batch = match Batch::from_payload(payload) {
            Ok(batch) => batch,
            Err(err) => return self.fail(job_id, "batch payload", &err).await,
        };

        let started = Instant::now();
        let mut report = BatchReport::default();
        for (index, raw) in &batch.rows {
            match self.process_row(&job, *index, raw).await {
                Ok(Some(outcome)) => report.count(&outcome),
                Ok(None) => report.duplicates += 1,
                Err(err) => {
                    let mut failed = self.fail(job_id, "batch row store", &err).await?;
                    failed.published = report.published;
                    failed.erroneous = report.erroneous;
                    failed.skipped = report.skipped;
                    failed.duplicates = report.duplicates;
                    return Ok(failed);
                }
            }
        }
        metrics::batch_processed(batch.len(), started.elapsed().as_millis());

        if self.lifecycle.finish(job_id).await? {
            report.status = BatchStatus::Finished;
        }
        info!(
            target = "hermes.batch",
            job_id = %job_id,
            published = report.published,
            erroneous = report.erroneous,
            skipped = report.skipped,
            duplicates = report.duplicates,
            "batch processed"
        );
        Ok(report)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        context: &str,
        err: &(dyn std::error::Error + Send + Sync + 'static),
    ) -> Result<BatchReport, StoreError> {
        log_exception(context, job_id, err);
        self.lifecycle.error(job_id, FailureReason::UnknownError).await?;
        Ok(BatchReport::with_status(BatchStatus::Failed))
    }

    /// `None` when the row already had an outcome.
    async fn process_row(
        &self,
        job: &ImportJob,
        index: u64,
        raw: &RawRow,
    ) -> Result<Option<RowOutcome>, StoreError> {
        if self.store.has_outcome(job.id, index).await? {
            return Ok(None);
        }
        let outcome = self.evaluate_isolated(job, index, raw).await;
        if !self.store.record_outcome(job.id, index, &outcome).await? {
            return Ok(None);
        }
        metrics::row_outcome(outcome.kind());
        Ok(Some(outcome))
    }

    /// Runs [`Self::evaluate`] on its own task so a panicking collaborator only
    /// costs this row.
    async fn evaluate_isolated(&self, job: &ImportJob, index: u64, raw: &RawRow) -> RowOutcome {
        let processor = self.clone();
        let task_job = job.clone();
        let task_raw = raw.clone();
        let evaluated =
            tokio::spawn(async move { processor.evaluate(&task_job, index, &task_raw).await })
                .await;
        match evaluated {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    target = "hermes.batch",
                    job_id = %job.id,
                    row_index = index,
                    error = %err,
                    "row evaluation panicked"
                );
                self.erroneous(job, index, raw, Vec::new())
            }
        }
    }

    async fn evaluate(&self, job: &ImportJob, index: u64, raw: &RawRow) -> RowOutcome {
        let mut row = SanitizedRow::from_raw(raw);
        let action = match Action::parse(row.value("action")) {
            Ok(action) => action,
            Err(message) => return self.erroneous(job, index, raw, vec![message]),
        };
        let external_id = row
            .value("id")
            .or_else(|| row.value("custom_seller_identifier"))
            .map(str::to_string);

        let categories = self.categories.resolve(row.value("categories")).await;
        row.take("categories");
        let row = self.builder.enrich(row);

        let mut draft = match self
            .builder
            .resolve_or_create(row, action, &job.user_id)
            .await
        {
            Ok(Some(draft)) => draft,
            Ok(None) => {
                debug!(
                    target = "hermes.batch",
                    job_id = %job.id,
                    row_index = index,
                    action = action.as_str(),
                    "row target not resolvable, skipped"
                );
                return RowOutcome::Skipped {
                    external_id,
                    action,
                };
            }
            Err(err) => return self.erroneous(job, index, raw, err.messages()),
        };

        if self.builder.is_invalid_due_to_prior_state(&draft) {
            let messages = std::mem::take(&mut draft.errors);
            return self.erroneous(job, index, raw, messages);
        }

        draft.prices.normalize();
        if let Some(categories) = categories {
            draft.categories = categories;
        }
        match self.builder.apply_fees_and_publish(draft, job.id).await {
            Ok(record) => RowOutcome::Published(record),
            Err(err) => {
                warn!(
                    target = "hermes.batch",
                    job_id = %job.id,
                    row_index = index,
                    error = %err,
                    "row rejected"
                );
                self.erroneous(job, index, raw, err.messages())
            }
        }
    }

    fn erroneous(
        &self,
        job: &ImportJob,
        index: u64,
        raw: &RawRow,
        mut messages: Vec<String>,
    ) -> RowOutcome {
        if messages.is_empty() {
            messages.push(i18n::missing_messages_label(self.locale).to_string());
        }
        RowOutcome::Failed(ErroneousRow::new(job.id, index, raw, messages))
    }
}
