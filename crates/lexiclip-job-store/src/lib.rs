//! Persistent job queue: one record per fingerprint, status progressing
//! monotonically through non-terminal phases to a terminal state.

use chrono::{DateTime, Utc};
use lexiclip_result_store::Segment;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Searching,
    Downloading,
    Transcribing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn as_db_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Searching => "searching",
            JobStatus::Downloading => "downloading",
            JobStatus::Transcribing => "transcribing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    fn from_db_str(s: &str) -> Self {
        match s {
            "queued" => JobStatus::Queued,
            "searching" => JobStatus::Searching,
            "downloading" => JobStatus::Downloading,
            "transcribing" => JobStatus::Transcribing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            other => panic!("unknown job status in database: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobInit {
    pub fingerprint: String,
    pub original_query: String,
    pub canonical: String,
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub fingerprint: String,
    pub original_query: String,
    pub canonical: String,
    pub kind: String,
    pub status: JobStatus,
    pub current_video_id: Option<String>,
    pub result: Option<Segment>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("a job already exists for this fingerprint")]
    DuplicateKey,
    #[error("no job found")]
    NotFound,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct JobStore {
    db: lexiclip_db::Db,
}

impl JobStore {
    pub fn new(db: lexiclip_db::Db) -> Self {
        Self { db }
    }

    pub async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Job>, JobStoreError> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            select id, fingerprint, original_query, canonical, kind, status,
                   current_video_id, result, error, created_at, updated_at
            from jobs where fingerprint = $1
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.db.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>, JobStoreError> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            select id, fingerprint, original_query, canonical, kind, status,
                   current_video_id, result, error, created_at, updated_at
            from jobs where id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Fails with `DuplicateKey` if a job already exists for this
    /// fingerprint; callers must fetch the existing job instead (§4.4).
    pub async fn create(&self, init: JobInit) -> Result<Job, JobStoreError> {
        let id = Uuid::new_v4();
        let result = sqlx::query(
            r#"
            insert into jobs (id, fingerprint, original_query, canonical, kind, status)
            values ($1, $2, $3, $4, $5, 'queued')
            on conflict (fingerprint) do nothing
            "#,
        )
        .bind(id)
        .bind(&init.fingerprint)
        .bind(&init.original_query)
        .bind(&init.canonical)
        .bind(init.kind)
        .execute(&self.db.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::DuplicateKey);
        }

        self.find_by_fingerprint(&init.fingerprint)
            .await?
            .ok_or(JobStoreError::NotFound)
    }

    /// Non-terminal status transition. Never call with `Completed`/`Failed`;
    /// use `set_result`/`set_error` for those so the result/error payload is
    /// written atomically with the terminal status.
    pub async fn set_status(
        &self,
        fingerprint: &str,
        status: JobStatus,
        current_video_id: Option<&str>,
    ) -> Result<(), JobStoreError> {
        debug_assert!(!status.is_terminal(), "use set_result/set_error instead");
        sqlx::query(
            r#"
            update jobs set status = $2, current_video_id = $3, updated_at = now()
            where fingerprint = $1
            "#,
        )
        .bind(fingerprint)
        .bind(status.as_db_str())
        .bind(current_video_id)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    pub async fn set_result(
        &self,
        fingerprint: &str,
        segment: &Segment,
    ) -> Result<(), JobStoreError> {
        let result = serde_json::to_value(segment)?;
        sqlx::query(
            r#"
            update jobs set status = 'completed', result = $2, updated_at = now()
            where fingerprint = $1
            "#,
        )
        .bind(fingerprint)
        .bind(result)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    pub async fn set_error(&self, fingerprint: &str, message: &str) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            update jobs set status = 'failed', error = $2, updated_at = now()
            where fingerprint = $1
            "#,
        )
        .bind(fingerprint)
        .bind(message)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    /// Queued jobs in FIFO (creation) order.
    pub async fn list_queued(&self) -> Result<Vec<Job>, JobStoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            select id, fingerprint, original_query, canonical, kind, status,
                   current_video_id, result, error, created_at, updated_at
            from jobs where status = 'queued'
            order by created_at asc
            "#,
        )
        .fetch_all(&self.db.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    fingerprint: String,
    original_query: String,
    canonical: String,
    kind: String,
    status: String,
    current_video_id: Option<String>,
    result: Option<serde_json::Value>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            fingerprint: row.fingerprint,
            original_query: row.original_query,
            canonical: row.canonical,
            kind: row.kind,
            status: JobStatus::from_db_str(&row.status),
            current_video_id: row.current_video_id,
            result: row.result.map(serde_json::from_value).transpose()?,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
