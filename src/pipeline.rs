use crate::attachments::{self, AttachmentStore};
use crate::config::ImportConfig;
use crate::domain::{CategoryResolver, ListingBuilder};
use crate::i18n::FailureReason;
use crate::lifecycle::Lifecycle;
use crate::metrics;
use crate::models::{ErroneousRow, ImportJob, JobStatusView};
use crate::notify::Notifier;
use crate::processor::{BatchProcessor, BatchReport};
use crate::queue::{WorkHandler, WorkQueue, WorkUnit};
use crate::schema;
use crate::splitter::{Batch, IngestError, SplitSummary, Splitter};
use crate::store::ImportStore;
use async_trait::async_trait;
use chrono::Utc;
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything the pipeline talks to.
pub struct Collaborators {
    pub store: Arc<dyn ImportStore>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub builder: Arc<dyn ListingBuilder>,
    pub categories: Arc<dyn CategoryResolver>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Clone)]
pub struct ImportPipeline {
    store: Arc<dyn ImportStore>,
    attachments: Arc<dyn AttachmentStore>,
    queue: Arc<dyn WorkQueue>,
    lifecycle: Lifecycle,
    processor: BatchProcessor,
    splitter: Splitter,
    max_upload_bytes: usize,
}

impl ImportPipeline {
    pub fn new(config: &ImportConfig, parts: Collaborators) -> Self {
        let lifecycle = Lifecycle::new(parts.store.clone(), parts.notifier, config.locale);
        let processor = BatchProcessor::new(
            parts.store.clone(),
            parts.builder,
            parts.categories,
            lifecycle.clone(),
            config.locale,
        );
        Self {
            store: parts.store,
            attachments: parts.attachments,
            queue: parts.queue,
            lifecycle,
            processor,
            splitter: Splitter::new(config.batch_size),
            max_upload_bytes: config.max_upload_bytes,
        }
    }

    /// Stores the upload, creates a pending job and schedules its ingestion.
    pub async fn submit(
        &self,
        user_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<ImportJob, PipelineError> {
        attachments::validate_upload(filename, bytes, self.max_upload_bytes)
            .map_err(|err| PipelineError::invalid_input("upload", err.to_string()))?;
        let file = self
            .attachments
            .put(filename, bytes)
            .map_err(|err| PipelineError::internal("upload", err.to_string()))?;

        let job = ImportJob::new(user_id, file, filename);
        self.store
            .create_job(&job)
            .await
            .map_err(|err| PipelineError::internal("store", err.to_string()))?;
        self.queue
            .enqueue(WorkUnit::StartIngestion { job_id: job.id })
            .await
            .map_err(|err| PipelineError::internal("enqueue", err.to_string()))?;

        info!(
            target = "hermes.import",
            job_id = %job.id,
            user_id = %user_id,
            filename = %filename,
            bytes = bytes.len(),
            "import submitted"
        );
        Ok(job)
    }

    /// Moves a pending job to processing and splits its file into batches.
    ///
    /// A job that is not pending was already picked up by an earlier delivery
    /// and is left alone.
    pub async fn ingest(&self, job_id: Uuid) -> Result<(), PipelineError> {
        let Some(job) = self
            .store
            .job(job_id)
            .await
            .map_err(|err| PipelineError::internal("ingest", err.to_string()))?
        else {
            warn!(target = "hermes.ingest", job_id = %job_id, "ingestion for unknown job dropped");
            return Ok(());
        };
        let started = self
            .lifecycle
            .start(job_id)
            .await
            .map_err(|err| PipelineError::internal("ingest", err.to_string()))?;
        if !started {
            debug!(
                target = "hermes.ingest",
                job_id = %job_id,
                state = job.state.as_str(),
                "job already started, ingestion skipped"
            );
            return Ok(());
        }

        let clock = Instant::now();
        let result = match self.split_and_enqueue(&job).await {
            Ok(summary) => self
                .store
                .set_row_count(job_id, summary.rows)
                .await
                .map(|()| summary)
                .map_err(|err| IngestError::Aborted(err.to_string())),
            Err(err) => Err(err),
        };

        match result {
            Ok(summary) => {
                metrics::ingest_elapsed(summary.rows, summary.batches, clock.elapsed().as_millis());
                info!(
                    target = "hermes.ingest",
                    job_id = %job_id,
                    rows = summary.rows,
                    batches = summary.batches,
                    batch_size = self.splitter.batch_size(),
                    "file split into batches"
                );
                self.lifecycle
                    .finish(job_id)
                    .await
                    .map_err(|err| PipelineError::internal("ingest", err.to_string()))?;
            }
            Err(err) => {
                log_exception("ingestion", job_id, &err);
                self.lifecycle
                    .error(job_id, err.failure_reason())
                    .await
                    .map_err(|err| PipelineError::internal("ingest", err.to_string()))?;
            }
        }
        Ok(())
    }

    async fn split_and_enqueue(&self, job: &ImportJob) -> Result<SplitSummary, IngestError> {
        let attachments = self.attachments.clone();
        let splitter = self.splitter;
        let file = job.file.clone();
        let (tx, mut rx) = mpsc::channel::<Batch>(1);

        let split = tokio::task::spawn_blocking(move || -> Result<SplitSummary, IngestError> {
            let preflight = splitter.preflight(attachments.as_ref(), &file)?;
            debug!(
                target = "hermes.ingest",
                encoding = preflight.encoding.name(),
                rows = preflight.rows,
                "preflight passed"
            );
            let source = attachments.open(&file)?;
            splitter.split(source, preflight.encoding, |batch| {
                tx.blocking_send(batch).map_err(|_| IngestError::Closed)
            })
        });

        let mut failure = None;
        while let Some(batch) = rx.recv().await {
            let payload = match batch.to_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    failure = Some(IngestError::Payload(err));
                    break;
                }
            };
            let unit = WorkUnit::ProcessBatch {
                job_id: job.id,
                payload,
            };
            if self.queue.enqueue(unit).await.is_err() {
                failure = Some(IngestError::Closed);
                break;
            }
        }
        drop(rx);

        let outcome = split
            .await
            .map_err(|err| IngestError::Aborted(err.to_string()))
            .and_then(|result| result);
        match failure {
            Some(err) => Err(err),
            None => outcome,
        }
    }

    pub async fn process_batch(
        &self,
        job_id: Uuid,
        payload: &str,
    ) -> Result<BatchReport, PipelineError> {
        self.processor
            .process(job_id, payload)
            .await
            .map_err(|err| PipelineError::internal("batch", err.to_string()))
    }

    async fn owned_job(&self, user_id: &str, job_id: Uuid) -> Result<ImportJob, PipelineError> {
        let job = self
            .store
            .job(job_id)
            .await
            .map_err(|err| PipelineError::internal("store", err.to_string()))?;
        match job {
            Some(job) if job.user_id == user_id => Ok(job),
            _ => Err(PipelineError::not_found("imports", "import job not found")),
        }
    }

    pub async fn status(&self, user_id: &str, job_id: Uuid) -> Result<JobStatusView, PipelineError> {
        let job = self.owned_job(user_id, job_id).await?;
        let tally = self
            .store
            .tally(job_id)
            .await
            .map_err(|err| PipelineError::internal("store", err.to_string()))?;
        Ok(JobStatusView::new(&job, &tally))
    }

    pub async fn erroneous_rows(
        &self,
        user_id: &str,
        job_id: Uuid,
    ) -> Result<Vec<ErroneousRow>, PipelineError> {
        self.owned_job(user_id, job_id).await?;
        self.store
            .erroneous_rows(job_id)
            .await
            .map_err(|err| PipelineError::internal("store", err.to_string()))
    }

    /// Failed rows as an importable file: canonical header, one line per row.
    pub async fn export_errors_csv(
        &self,
        user_id: &str,
        job_id: Uuid,
    ) -> Result<String, PipelineError> {
        let rows = self.erroneous_rows(user_id, job_id).await?;
        let mut out = schema::header_line();
        out.push('\n');
        for row in rows {
            out.push_str(&row.row_csv);
            out.push('\n');
        }
        Ok(out)
    }

    /// Deletes the job, its row outcomes and the uploaded file.
    pub async fn delete(&self, user_id: &str, job_id: Uuid) -> Result<(), PipelineError> {
        let job = self.owned_job(user_id, job_id).await?;
        self.store
            .delete_job(job_id)
            .await
            .map_err(|err| PipelineError::internal("store", err.to_string()))?;
        if let Err(err) = self.attachments.remove(&job.file) {
            warn!(
                target = "hermes.import",
                job_id = %job_id,
                error = %err,
                "failed to remove uploaded file"
            );
        }
        info!(target = "hermes.import", job_id = %job_id, "import deleted");
        Ok(())
    }
}

#[async_trait]
impl WorkHandler for ImportPipeline {
    async fn handle(&self, unit: WorkUnit) {
        let job_id = unit.job_id();
        let kind = unit.kind();
        let result = match unit {
            WorkUnit::StartIngestion { job_id } => self.ingest(job_id).await,
            WorkUnit::ProcessBatch { job_id, payload } => {
                self.process_batch(job_id, &payload).await.map(|_| ())
            }
        };
        if let Err(err) = result {
            error!(
                target = "hermes.import",
                job_id = %job_id,
                kind,
                stage = err.stage(),
                error = %err,
                "work unit failed"
            );
        }
    }

    async fn on_panic(&self, job_id: Uuid) {
        if let Err(err) = self.lifecycle.error(job_id, FailureReason::UnknownError).await {
            error!(
                target = "hermes.import",
                job_id = %job_id,
                error = %err,
                "failed to mark job failed after panic"
            );
        }
    }
}

/// Logs an error with a timestamp and its full source chain.
pub fn log_exception(context: &str, job_id: Uuid, err: &(dyn std::error::Error + 'static)) {
    let mut chain = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    error!(
        target = "hermes.import",
        job_id = %job_id,
        at = %Utc::now().to_rfc3339(),
        chain = %chain.join(": "),
        "{context} failed"
    );
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    NotFound,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::NotFound,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::MemoryAttachments;
    use crate::domain::{DemoCatalog, StaticCategories};
    use crate::i18n::Locale;
    use crate::models::JobState;
    use crate::notify::{RecordingNotifier, Severity};
    use crate::processor::BatchStatus;
    use crate::queue::{JobQueue, QueueError, WorkerPool};
    use crate::store::MemoryStore;
    use encoding_rs::UTF_8;
    use pretty_assertions::assert_eq;
    use std::{io::Cursor, time::Duration};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingQueue {
        units: Mutex<Vec<WorkUnit>>,
    }

    impl RecordingQueue {
        async fn batches(&self) -> Vec<Batch> {
            self.units
                .lock()
                .await
                .iter()
                .filter_map(|unit| match unit {
                    WorkUnit::ProcessBatch { payload, .. } => Batch::from_payload(payload).ok(),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl WorkQueue for RecordingQueue {
        async fn enqueue(&self, unit: WorkUnit) -> Result<(), QueueError> {
            self.units.lock().await.push(unit);
            Ok(())
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        attachments: Arc<MemoryAttachments>,
        notifier: Arc<RecordingNotifier>,
        pipeline: ImportPipeline,
    }

    fn config() -> ImportConfig {
        ImportConfig {
            locale: Locale::En,
            ..ImportConfig::default()
        }
    }

    fn harness(queue: Arc<dyn WorkQueue>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let attachments = Arc::new(MemoryAttachments::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline = ImportPipeline::new(
            &config(),
            Collaborators {
                store: store.clone(),
                attachments: attachments.clone(),
                queue,
                builder: Arc::new(DemoCatalog::new()),
                categories: Arc::new(StaticCategories::default()),
                notifier: notifier.clone(),
            },
        );
        Harness {
            store,
            attachments,
            notifier,
            pipeline,
        }
    }

    fn listing_file(rows: usize, broken_row: Option<usize>) -> Vec<u8> {
        let mut text = String::from("€;id;title;categories;price_cents;quantity;action\n");
        for index in 1..=rows {
            let title = if Some(index) == broken_row {
                String::new()
            } else {
                format!("Item {index}")
            };
            text.push_str(&format!(";sku-{index};{title};Books;{};1;create\n", index * 100));
        }
        text.into_bytes()
    }

    async fn wait_for_terminal(store: &MemoryStore, job_id: Uuid) -> ImportJob {
        for _ in 0..500 {
            let job = store.job(job_id).await.unwrap().unwrap();
            if job.state.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never settled");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn end_to_end_import_with_worker_pool() {
        let (queue, receiver) = JobQueue::channel();
        let h = harness(Arc::new(queue));
        let _pool = WorkerPool::spawn(Arc::new(h.pipeline.clone()), receiver, 4);

        let job = h
            .pipeline
            .submit("seller-1", "listings.csv", &listing_file(120, Some(2)))
            .await
            .unwrap();
        let settled = wait_for_terminal(&h.store, job.id).await;
        assert_eq!(settled.state, JobState::Finished);
        assert_eq!(settled.row_count, Some(120));

        let status = h.pipeline.status("seller-1", job.id).await.unwrap();
        assert_eq!(status.processed_articles_count, 120);
        assert_eq!(status.erroneous_rows_count, 1);
        assert_eq!(status.actions.created, 119);

        let errors = h.pipeline.erroneous_rows("seller-1", job.id).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].row_index, 2);

        let sent = h.notifier.settle(1).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, Severity::Info);
        assert_eq!(sent[0].link, format!("/imports/{}", job.id));
    }

    #[tokio::test]
    async fn ingest_schedules_batches_then_sets_row_count() {
        let queue = Arc::new(RecordingQueue::default());
        let h = harness(queue.clone());
        let job = h
            .pipeline
            .submit("seller-1", "listings.csv", &listing_file(120, None))
            .await
            .unwrap();
        h.pipeline.ingest(job.id).await.unwrap();

        let sizes: Vec<usize> = queue.batches().await.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        let stored = h.store.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Processing);
        assert_eq!(stored.row_count, Some(120));

        h.pipeline.ingest(job.id).await.unwrap();
        assert_eq!(queue.batches().await.len(), 3);
    }

    #[tokio::test]
    async fn undecodable_file_fails_without_batches() {
        let queue = Arc::new(RecordingQueue::default());
        let h = harness(queue.clone());
        let job = h
            .pipeline
            .submit("seller-1", "bad.csv", b"\xEF\xBB\xBFid;title\n1;\xFF\xFE\xFD\n")
            .await
            .unwrap();
        h.pipeline.ingest(job.id).await.unwrap();

        let stored = h.store.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(
            stored.failure_reason.as_deref(),
            Some(FailureReason::WrongEncoding.localized(Locale::En))
        );
        assert_eq!(stored.row_count, None);
        assert!(queue.batches().await.is_empty());

        let sent = h.notifier.settle(1).await;
        assert_eq!(sent[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn broken_structure_fails_without_batches() {
        let queue = Arc::new(RecordingQueue::default());
        let h = harness(queue.clone());
        let mut file = listing_file(60, None);
        file.extend_from_slice(b";sku-61;\"Mug;Books\n");
        let job = h.pipeline.submit("seller-1", "q.csv", &file).await.unwrap();
        h.pipeline.ingest(job.id).await.unwrap();

        let stored = h.store.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(
            stored.failure_reason.as_deref(),
            Some(FailureReason::IllegalQuoting.localized(Locale::En))
        );
        assert!(queue.batches().await.is_empty());
    }

    #[tokio::test]
    async fn header_only_file_finishes_at_once() {
        let queue = Arc::new(RecordingQueue::default());
        let h = harness(queue.clone());
        let job = h
            .pipeline
            .submit("seller-1", "empty.csv", &listing_file(0, None))
            .await
            .unwrap();
        h.pipeline.ingest(job.id).await.unwrap();

        let stored = h.store.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Finished);
        assert_eq!(stored.row_count, Some(0));
    }

    #[tokio::test]
    async fn batches_done_before_row_count_finish_once_counted() {
        let h = harness(Arc::new(RecordingQueue::default()));
        let bytes = listing_file(3, None);
        let job = h
            .pipeline
            .submit("seller-1", "listings.csv", &bytes)
            .await
            .unwrap();
        h.pipeline.lifecycle.start(job.id).await.unwrap();

        let mut batches = Vec::new();
        Splitter::default()
            .split(Cursor::new(bytes), UTF_8, |batch| {
                batches.push(batch);
                Ok(())
            })
            .unwrap();
        let report = h
            .pipeline
            .process_batch(job.id, &batches[0].to_payload().unwrap())
            .await
            .unwrap();
        assert_eq!(report.published, 3);
        assert_eq!(report.status, BatchStatus::Completed);

        h.store.set_row_count(job.id, 3).await.unwrap();
        assert!(h.pipeline.lifecycle.finish(job.id).await.unwrap());
        let stored = h.store.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Finished);
    }

    #[tokio::test]
    async fn rejected_upload_creates_no_job() {
        let queue = Arc::new(RecordingQueue::default());
        let h = harness(queue.clone());
        let err = h
            .pipeline
            .submit("seller-1", "listings.xlsx", b"id;title\n")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(err.stage(), "upload");
        assert!(queue.units.lock().await.is_empty());
    }

    #[tokio::test]
    async fn other_users_cannot_see_or_delete_a_job() {
        let h = harness(Arc::new(RecordingQueue::default()));
        let job = h
            .pipeline
            .submit("seller-1", "listings.csv", &listing_file(1, None))
            .await
            .unwrap();
        let err = h.pipeline.status("seller-2", job.id).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::NotFound);
        let err = h.pipeline.delete("seller-2", job.id).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::NotFound);
        assert!(h.store.job(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn errors_export_as_reimportable_csv() {
        let queue = Arc::new(RecordingQueue::default());
        let h = harness(queue.clone());
        let job = h
            .pipeline
            .submit("seller-1", "listings.csv", &listing_file(3, Some(3)))
            .await
            .unwrap();
        h.pipeline.ingest(job.id).await.unwrap();
        for batch in queue.batches().await {
            h.pipeline
                .process_batch(job.id, &batch.to_payload().unwrap())
                .await
                .unwrap();
        }

        let csv = h.pipeline.export_errors_csv("seller-1", job.id).await.unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], schema::header_line());
        assert!(lines[1].starts_with("sku-3;;Books;"));
    }

    #[tokio::test]
    async fn delete_removes_job_and_file() {
        let h = harness(Arc::new(RecordingQueue::default()));
        let job = h
            .pipeline
            .submit("seller-1", "listings.csv", &listing_file(1, None))
            .await
            .unwrap();
        h.pipeline.delete("seller-1", job.id).await.unwrap();
        assert!(h.store.job(job.id).await.unwrap().is_none());
        assert!(h.attachments.open(&job.file).is_err());
        let err = h.pipeline.status("seller-1", job.id).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::NotFound);
    }

    #[tokio::test]
    async fn panic_in_a_unit_fails_the_job() {
        let h = harness(Arc::new(RecordingQueue::default()));
        let job = h
            .pipeline
            .submit("seller-1", "listings.csv", &listing_file(1, None))
            .await
            .unwrap();
        h.pipeline.lifecycle.start(job.id).await.unwrap();
        h.pipeline.on_panic(job.id).await;
        let stored = h.store.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
    }
}
