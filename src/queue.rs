use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error};
use uuid::Uuid;

/// One unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkUnit {
    StartIngestion { job_id: Uuid },
    /// `payload` is a serialized batch of `{row_index: {column: value}}`.
    ProcessBatch { job_id: Uuid, payload: String },
}

impl WorkUnit {
    pub fn job_id(&self) -> Uuid {
        match self {
            WorkUnit::StartIngestion { job_id } | WorkUnit::ProcessBatch { job_id, .. } => *job_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkUnit::StartIngestion { .. } => "start_ingestion",
            WorkUnit::ProcessBatch { .. } => "process_batch",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("work queue is closed")]
    Closed,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, unit: WorkUnit) -> Result<(), QueueError>;
}

/// In-process queue. Producers never wait; the worker pool bounds how much
/// work runs at once.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<WorkUnit>,
}

impl JobQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkUnit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl WorkQueue for JobQueue {
    async fn enqueue(&self, unit: WorkUnit) -> Result<(), QueueError> {
        debug!(
            target = "hermes.queue",
            job_id = %unit.job_id(),
            kind = unit.kind(),
            "work enqueued"
        );
        self.tx.send(unit).map_err(|_| QueueError::Closed)
    }
}

#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(&self, unit: WorkUnit);

    /// Called when handling a unit of `job_id` panicked.
    async fn on_panic(&self, job_id: Uuid);
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `workers` tasks pulling from `receiver` until every sender is gone.
    pub fn spawn(
        handler: Arc<dyn WorkHandler>,
        receiver: mpsc::UnboundedReceiver<WorkUnit>,
        workers: usize,
    ) -> Self {
        let receiver = Arc::new(Mutex::new(receiver));
        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    loop {
                        let next = { receiver.lock().await.recv().await };
                        let Some(unit) = next else { break };
                        let job_id = unit.job_id();
                        let kind = unit.kind();

                        let task_handler = handler.clone();
                        let result =
                            tokio::spawn(async move { task_handler.handle(unit).await }).await;
                        if let Err(err) = result
                            && err.is_panic()
                        {
                            error!(
                                target = "hermes.queue",
                                worker,
                                job_id = %job_id,
                                kind,
                                "work unit panicked"
                            );
                            handler.on_panic(job_id).await;
                        }
                    }
                    debug!(target = "hermes.queue", worker, "worker stopped");
                })
            })
            .collect();
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Waits for all workers; they stop once the queue is closed and drained.
    #[cfg(test)]
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
