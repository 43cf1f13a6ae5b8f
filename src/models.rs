use crate::attachments::FileRef;
use crate::schema::{self, RawRow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Failed,
    Finished,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Failed => "failed",
            JobState::Finished => "finished",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "pending" => Some(JobState::Pending),
            "processing" => Some(JobState::Processing),
            "failed" => Some(JobState::Failed),
            "finished" => Some(JobState::Finished),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Failed | JobState::Finished)
    }
}

/// One uploaded file and its processing lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub user_id: String,
    pub file: FileRef,
    pub filename: String,
    pub row_count: Option<u64>,
    pub state: JobState,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    pub fn new(user_id: impl Into<String>, file: FileRef, filename: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            file,
            filename: filename.into(),
            row_count: None,
            state: JobState::Pending,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-row intent carried in the `action` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Activate,
    Deactivate,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Activate => "activate",
            Action::Deactivate => "deactivate",
            Action::Delete => "delete",
        }
    }

    /// A blank action means `create`.
    pub fn parse(field: Option<&str>) -> Result<Self, String> {
        let value = field.map(str::trim).unwrap_or_default().to_lowercase();
        match value.as_str() {
            "" | "c" | "create" => Ok(Action::Create),
            "u" | "update" => Ok(Action::Update),
            "a" | "activate" => Ok(Action::Activate),
            "de" | "deactivate" => Ok(Action::Deactivate),
            "x" | "delete" => Ok(Action::Delete),
            other => Err(format!("unknown action `{other}`")),
        }
    }
}

/// Provenance entry for a listing the import published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub listing_id: String,
    pub external_id: Option<String>,
    pub action: Action,
    pub fee_cents: i64,
    pub import_job_id: Uuid,
}

/// A row that failed validation, kept so the user can fix and re-upload it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErroneousRow {
    pub import_job_id: Uuid,
    pub row_index: u64,
    pub validation_errors: Vec<String>,
    pub row_csv: String,
}

impl ErroneousRow {
    pub fn new(import_job_id: Uuid, row_index: u64, original: &RawRow, messages: Vec<String>) -> Self {
        let row_csv = schema::to_csv_line(original).unwrap_or_else(|err| {
            tracing::warn!(
                target = "hermes.batch",
                job_id = %import_job_id,
                row_index,
                error = %err,
                "failed to serialize erroneous row"
            );
            String::new()
        });
        Self {
            import_job_id,
            row_index,
            validation_errors: messages,
            row_csv,
        }
    }
}

/// Durable result of one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RowOutcome {
    Published(ListingRecord),
    Failed(ErroneousRow),
    Skipped {
        external_id: Option<String>,
        action: Action,
    },
}

impl RowOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            RowOutcome::Published(_) => "published",
            RowOutcome::Failed(_) => "erroneous",
            RowOutcome::Skipped { .. } => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounts {
    pub created: u64,
    pub updated: u64,
    pub activated: u64,
    pub deactivated: u64,
    pub deleted: u64,
}

impl ActionCounts {
    pub fn add(&mut self, action: Action) {
        match action {
            Action::Create => self.created += 1,
            Action::Update => self.updated += 1,
            Action::Activate => self.activated += 1,
            Action::Deactivate => self.deactivated += 1,
            Action::Delete => self.deleted += 1,
        }
    }

    /// Listings that end up active and can be offered for mass activation.
    pub fn activatable(&self) -> u64 {
        self.created + self.updated + self.activated
    }
}

/// Aggregate recomputed from stored row outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub published: u64,
    pub erroneous: u64,
    pub skipped: u64,
    pub actions: ActionCounts,
}

impl Tally {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a RowOutcome>) -> Self {
        let mut tally = Tally::default();
        for outcome in outcomes {
            match outcome {
                RowOutcome::Published(record) => {
                    tally.published += 1;
                    tally.actions.add(record.action);
                }
                RowOutcome::Failed(_) => tally.erroneous += 1,
                RowOutcome::Skipped { .. } => tally.skipped += 1,
            }
        }
        tally
    }

    pub fn processed_articles_count(&self) -> u64 {
        self.published + self.erroneous
    }

    /// Rows with any recorded outcome, skipped reimports included.
    pub fn accounted_rows(&self) -> u64 {
        self.processed_articles_count() + self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.accounted_rows() == 0
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub id: Uuid,
    pub filename: String,
    pub state: JobState,
    pub row_count: Option<u64>,
    pub processed_articles_count: u64,
    pub erroneous_rows_count: u64,
    pub skipped_rows_count: u64,
    pub failure_reason: Option<String>,
    pub actions: ActionCounts,
    pub activatable_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatusView {
    pub fn new(job: &ImportJob, tally: &Tally) -> Self {
        Self {
            id: job.id,
            filename: job.filename.clone(),
            state: job.state,
            row_count: job.row_count,
            processed_articles_count: tally.processed_articles_count(),
            erroneous_rows_count: tally.erroneous,
            skipped_rows_count: tally.skipped,
            failure_reason: job.failure_reason.clone(),
            actions: tally.actions,
            activatable_count: tally.actions.activatable(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub state: JobState,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_parsing_accepts_words_and_short_codes() {
        assert_eq!(Action::parse(None), Ok(Action::Create));
        assert_eq!(Action::parse(Some(" Update ")), Ok(Action::Update));
        assert_eq!(Action::parse(Some("de")), Ok(Action::Deactivate));
        assert_eq!(Action::parse(Some("x")), Ok(Action::Delete));
        assert!(Action::parse(Some("archive")).is_err());
    }

    #[test]
    fn tally_counts_skips_only_towards_accounted_rows() {
        let tally = Tally {
            published: 3,
            erroneous: 2,
            skipped: 1,
            actions: ActionCounts::default(),
        };
        assert_eq!(tally.processed_articles_count(), 5);
        assert_eq!(tally.accounted_rows(), 6);
    }

    #[test]
    fn tally_is_recomputed_from_outcomes() {
        let job_id = Uuid::new_v4();
        let published = |action| {
            RowOutcome::Published(ListingRecord {
                listing_id: "l-1".into(),
                external_id: None,
                action,
                fee_cents: 10,
                import_job_id: job_id,
            })
        };
        let outcomes = vec![
            published(Action::Create),
            published(Action::Create),
            published(Action::Delete),
            RowOutcome::Failed(ErroneousRow {
                import_job_id: job_id,
                row_index: 3,
                validation_errors: vec!["Title is required".into()],
                row_csv: "3;;create".into(),
            }),
            RowOutcome::Skipped {
                external_id: Some("sku-9".into()),
                action: Action::Deactivate,
            },
        ];
        let tally = Tally::from_outcomes(&outcomes);
        assert_eq!(tally.published, 3);
        assert_eq!(tally.erroneous, 1);
        assert_eq!(tally.skipped, 1);
        assert_eq!(tally.actions.created, 2);
        assert_eq!(tally.actions.deleted, 1);
        assert_eq!(tally.actions.deactivated, 0);
        assert_eq!(tally.accounted_rows(), 5);
        assert!(Tally::from_outcomes(&Vec::<RowOutcome>::new()).is_empty());
    }

    #[test]
    fn job_state_round_trips_through_its_name() {
        for state in [
            JobState::Pending,
            JobState::Processing,
            JobState::Failed,
            JobState::Finished,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert!(JobState::Finished.is_terminal());
        assert!(!JobState::Processing.is_terminal());
    }

    #[test]
    fn row_outcome_serializes_with_tag() {
        let outcome = RowOutcome::Skipped {
            external_id: Some("sku-1".into()),
            action: Action::Update,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["action"], "update");
    }
}
