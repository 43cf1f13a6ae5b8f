//! Import job state machine.
//!
//! [`transition`] decides what an event does to a job; [`Lifecycle`] applies
//! that decision with a compare-and-set on the stored state and dispatches the
//! resulting notifications once the write has landed.

use crate::i18n::{self, FailureReason, Locale};
use crate::metrics;
use crate::models::{ImportJob, JobState, Tally};
use crate::notify::{self, Notification, Notifier, Severity};
use crate::store::{ImportStore, StoreError};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    Error(FailureReason),
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    NotifyFinished,
    NotifyFailed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: JobState,
    pub to: JobState,
    pub failure_reason: Option<FailureReason>,
    pub effects: Vec<Effect>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Apply(Transition),
    /// Nothing to do; not an error.
    Noop,
    /// The event is not valid in the current state.
    Rejected,
}

/// `tally` is only consulted for [`Event::Finish`].
pub fn transition(job: &ImportJob, event: Event, tally: &Tally) -> Decision {
    match (job.state, event) {
        (JobState::Pending, Event::Start) => Decision::Apply(Transition {
            from: JobState::Pending,
            to: JobState::Processing,
            failure_reason: None,
            effects: Vec::new(),
        }),
        (_, Event::Start) => Decision::Rejected,
        (JobState::Processing, Event::Error(reason)) => Decision::Apply(Transition {
            from: JobState::Processing,
            to: JobState::Failed,
            failure_reason: Some(reason),
            effects: vec![Effect::NotifyFailed(reason)],
        }),
        // Several workers may detect the same failure; the first reason stays.
        (JobState::Failed, Event::Error(_)) => Decision::Noop,
        (_, Event::Error(_)) => Decision::Rejected,
        (JobState::Processing, Event::Finish) => match job.row_count {
            Some(row_count) if tally.accounted_rows() >= row_count => {
                Decision::Apply(Transition {
                    from: JobState::Processing,
                    to: JobState::Finished,
                    failure_reason: None,
                    effects: vec![Effect::NotifyFinished],
                })
            }
            _ => Decision::Noop,
        },
        (_, Event::Finish) => Decision::Noop,
    }
}

#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn ImportStore>,
    notifier: Arc<dyn Notifier>,
    locale: Locale,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn ImportStore>, notifier: Arc<dyn Notifier>, locale: Locale) -> Self {
        Self {
            store,
            notifier,
            locale,
        }
    }

    /// Returns whether this call moved the job.
    pub async fn start(&self, job_id: Uuid) -> Result<bool, StoreError> {
        self.fire(job_id, Event::Start).await
    }

    pub async fn error(&self, job_id: Uuid, reason: FailureReason) -> Result<bool, StoreError> {
        self.fire(job_id, Event::Error(reason)).await
    }

    /// Speculative; a job whose rows are not all accounted for stays put.
    pub async fn finish(&self, job_id: Uuid) -> Result<bool, StoreError> {
        self.fire(job_id, Event::Finish).await
    }

    async fn fire(&self, job_id: Uuid, event: Event) -> Result<bool, StoreError> {
        for attempt in 1..=MAX_ATTEMPTS {
            let job = self
                .store
                .job(job_id)
                .await?
                .ok_or(StoreError::NotFound(job_id))?;
            let tally = match event {
                Event::Finish => self.store.tally(job_id).await?,
                _ => Tally::default(),
            };

            let planned = match transition(&job, event, &tally) {
                Decision::Apply(planned) => planned,
                Decision::Noop => return Ok(false),
                Decision::Rejected => {
                    warn!(
                        target = "hermes.lifecycle",
                        job_id = %job_id,
                        state = job.state.as_str(),
                        event = ?event,
                        "event rejected in current state"
                    );
                    return Ok(false);
                }
            };

            let reason = planned
                .failure_reason
                .map(|reason| reason.localized(self.locale));
            let applied = self
                .store
                .compare_and_set_state(job_id, planned.from, planned.to, reason)
                .await?;
            if applied {
                info!(
                    target = "hermes.lifecycle",
                    job_id = %job_id,
                    from = planned.from.as_str(),
                    to = planned.to.as_str(),
                    "job transitioned"
                );
                metrics::transition(planned.to.as_str());
                self.dispatch(&job, &planned.effects);
                return Ok(true);
            }
            debug!(
                target = "hermes.lifecycle",
                job_id = %job_id,
                attempt,
                "state changed underneath, re-reading job"
            );
        }
        warn!(
            target = "hermes.lifecycle",
            job_id = %job_id,
            event = ?event,
            "giving up after repeated state races"
        );
        Ok(false)
    }

    fn dispatch(&self, job: &ImportJob, effects: &[Effect]) {
        for effect in effects {
            let notification = match effect {
                Effect::NotifyFinished => Notification {
                    user_id: job.user_id.clone(),
                    message: i18n::finished_label(self.locale).to_string(),
                    link: notify::job_link(job.id),
                    severity: Severity::Info,
                },
                Effect::NotifyFailed(reason) => Notification {
                    user_id: job.user_id.clone(),
                    message: format!(
                        "{} {}",
                        i18n::failed_label(self.locale),
                        reason.localized(self.locale)
                    ),
                    link: notify::user_imports_link(&job.user_id),
                    severity: Severity::Error,
                },
            };
            let notifier = self.notifier.clone();
            let job_id = job.id;
            tokio::spawn(async move {
                if let Err(err) = notifier.notify(&notification).await {
                    warn!(
                        target = "hermes.lifecycle",
                        job_id = %job_id,
                        error = %err,
                        "notification delivery failed"
                    );
                }
            });
        }
    }
}
