use super::{ImportStore, StoreError};
use crate::attachments::FileRef;
use crate::models::{ErroneousRow, ImportJob, JobState, RowOutcome, Tally};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use redis::{AsyncCommands, Script, aio::MultiplexedConnection};
use std::collections::HashMap;
use uuid::Uuid;

const KEY_PREFIX: &str = "hermes:import";

// KEYS[1] job hash; ARGV expected, next, reason ('' for none), updated_at
static CAS_STATE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local current = redis.call('HGET', KEYS[1], 'state')
if not current then return -1 end
if current ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'state', ARGV[2], 'updated_at', ARGV[4])
if ARGV[3] ~= '' then redis.call('HSETNX', KEYS[1], 'failure_reason', ARGV[3]) end
return 1
"#,
    )
});

// KEYS[1] job hash; ARGV row_count, updated_at
static SET_ROW_COUNT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
local existing = redis.call('HGET', KEYS[1], 'row_count')
if not existing then
  redis.call('HSET', KEYS[1], 'row_count', ARGV[1], 'updated_at', ARGV[2])
  return 1
end
if existing == ARGV[1] then return 1 end
return 0
"#,
    )
});

// KEYS[1] job hash, KEYS[2] outcomes hash; ARGV row index, outcome json
static RECORD_OUTCOME: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
return redis.call('HSETNX', KEYS[2], ARGV[1], ARGV[2])
"#,
    )
});

/// What a guarded-write script reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptReply {
    MissingJob,
    Rejected,
    Applied,
}

fn script_reply(code: i64) -> Result<ScriptReply, StoreError> {
    match code {
        -1 => Ok(ScriptReply::MissingJob),
        0 => Ok(ScriptReply::Rejected),
        1 => Ok(ScriptReply::Applied),
        other => Err(corrupt(format!("unexpected script reply {other}"))),
    }
}

/// CAS and insert-if-absent: whether the write happened.
fn applied(id: Uuid, reply: ScriptReply) -> Result<bool, StoreError> {
    match reply {
        ScriptReply::MissingJob => Err(StoreError::NotFound(id)),
        ScriptReply::Rejected => Ok(false),
        ScriptReply::Applied => Ok(true),
    }
}

/// Store shared by every process that points at the same Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        Ok(Self { conn })
    }

    fn job_key(id: Uuid) -> String {
        format!("{KEY_PREFIX}:{id}")
    }

    fn outcomes_key(id: Uuid) -> String {
        format!("{KEY_PREFIX}:{id}:outcomes")
    }
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn corrupt(message: impl Into<String>) -> StoreError {
    StoreError::Corrupt(message.into())
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| corrupt(format!("timestamp `{raw}`: {err}")))
}

fn parse_job(fields: &HashMap<String, String>) -> Result<ImportJob, StoreError> {
    let field = |name: &str| {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| corrupt(format!("missing field `{name}`")))
    };
    let id = Uuid::parse_str(field("id")?).map_err(|err| corrupt(err.to_string()))?;
    let state = JobState::parse(field("state")?)
        .ok_or_else(|| corrupt(format!("unknown state for job {id}")))?;
    let row_count = fields
        .get("row_count")
        .map(|value| value.parse::<u64>())
        .transpose()
        .map_err(|err| corrupt(format!("row_count of job {id}: {err}")))?;
    Ok(ImportJob {
        id,
        user_id: field("user_id")?.to_string(),
        file: FileRef::new(field("file")?),
        filename: field("filename")?.to_string(),
        row_count,
        state,
        failure_reason: fields.get("failure_reason").cloned(),
        created_at: parse_time(field("created_at")?)?,
        updated_at: parse_time(field("updated_at")?)?,
    })
}

fn decode_outcomes(payloads: &[String]) -> Result<Vec<RowOutcome>, StoreError> {
    payloads
        .iter()
        .map(|payload| serde_json::from_str::<RowOutcome>(payload).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl ImportStore for RedisStore {
    async fn create_job(&self, job: &ImportJob) -> Result<(), StoreError> {
        let mut fields = vec![
            ("id", job.id.to_string()),
            ("user_id", job.user_id.clone()),
            ("file", job.file.as_str().to_string()),
            ("filename", job.filename.clone()),
            ("state", job.state.as_str().to_string()),
            ("created_at", job.created_at.to_rfc3339()),
            ("updated_at", job.updated_at.to_rfc3339()),
        ];
        if let Some(row_count) = job.row_count {
            fields.push(("row_count", row_count.to_string()));
        }
        if let Some(reason) = &job.failure_reason {
            fields.push(("failure_reason", reason.clone()));
        }
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(Self::job_key(job.id), &fields)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn job(&self, id: Uuid) -> Result<Option<ImportJob>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(Self::job_key(id)).await.map_err(backend)?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_job(&fields).map(Some)
    }

    async fn set_row_count(&self, id: Uuid, row_count: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = SET_ROW_COUNT.prepare_invoke();
        invocation
            .key(Self::job_key(id))
            .arg(row_count.to_string())
            .arg(Utc::now().to_rfc3339());
        let code: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        match script_reply(code)? {
            ScriptReply::Applied => Ok(()),
            ScriptReply::MissingJob => Err(StoreError::NotFound(id)),
            ScriptReply::Rejected => {
                let existing: Option<String> = conn
                    .hget(Self::job_key(id), "row_count")
                    .await
                    .map_err(backend)?;
                let existing = existing
                    .and_then(|value| value.parse::<u64>().ok())
                    .ok_or_else(|| corrupt(format!("row_count of job {id}")))?;
                Err(StoreError::RowCountConflict {
                    id,
                    existing,
                    attempted: row_count,
                })
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
        let mut conn = self.conn.clone();
        let mut invocation = CAS_STATE.prepare_invoke();
        invocation
            .key(Self::job_key(id))
            .arg(expected.as_str())
            .arg(next.as_str())
            .arg(failure_reason.unwrap_or(""))
            .arg(Utc::now().to_rfc3339());
        let code: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        applied(id, script_reply(code)?)
    }

    async fn has_outcome(&self, id: Uuid, row_index: u64) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.hexists(Self::outcomes_key(id), row_index)
            .await
            .map_err(backend)
    }

    async fn record_outcome(
        &self,
        id: Uuid,
        row_index: u64,
        outcome: &RowOutcome,
    ) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(outcome)?;
        let mut conn = self.conn.clone();
        let mut invocation = RECORD_OUTCOME.prepare_invoke();
        invocation
            .key(Self::job_key(id))
            .key(Self::outcomes_key(id))
            .arg(row_index)
            .arg(payload);
        let code: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        applied(id, script_reply(code)?)
    }

    async fn tally(&self, id: Uuid) -> Result<Tally, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(Self::job_key(id)).await.map_err(backend)?;
        if !exists {
            return Err(StoreError::NotFound(id));
        }
        let payloads: Vec<String> = conn.hvals(Self::outcomes_key(id)).await.map_err(backend)?;
        Ok(Tally::from_outcomes(&decode_outcomes(&payloads)?))
    }

    async fn erroneous_rows(&self, id: Uuid) -> Result<Vec<ErroneousRow>, StoreError> {
        let mut conn = self.conn.clone();
        let payloads: Vec<String> = conn.hvals(Self::outcomes_key(id)).await.map_err(backend)?;
        let mut rows: Vec<ErroneousRow> = decode_outcomes(&payloads)?
            .into_iter()
            .filter_map(|outcome| match outcome {
                RowOutcome::Failed(row) => Some(row),
                _ => None,
            })
            .collect();
        rows.sort_by_key(|row| row.row_index);
        Ok(rows)
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let keys = vec![Self::job_key(id), Self::outcomes_key(id)];
        let existed: bool = conn.exists(Self::job_key(id)).await.map_err(backend)?;
        let _: u64 = conn.del(keys).await.map_err(backend)?;
        Ok(existed)
    }
}
