//! Persistent cache of completed segments, keyed by fingerprint. Records are
//! immutable once inserted and are never evicted.

use chrono::{DateTime, Utc};
use lexiclip_db::Db;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cue {
    pub start: f64,
    pub duration: f64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub fingerprint: String,
    pub original_query: String,
    pub video_id: String,
    pub start_time: f64,
    pub end_time: f64,
    pub caption: String,
    pub captions: Vec<Cue>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ResultStoreError {
    #[error("a segment already exists for this fingerprint")]
    DuplicateKey,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct ResultStore {
    db: Db,
}

impl ResultStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<Segment>, ResultStoreError> {
        let row: Option<SegmentRow> = sqlx::query_as(
            r#"
            select fingerprint, original_query, video_id, start_time, end_time,
                   caption, captions, created_at
            from segments where fingerprint = $1
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.db.pool)
        .await?;

        Ok(row.map(Segment::from))
    }

    /// Insert a segment. Fails with `DuplicateKey` if a segment already
    /// exists for this fingerprint; callers that treat re-processing as a
    /// no-op (the job pipeline) swallow that error deliberately — see
    /// DESIGN.md, Open Question (a).
    pub async fn insert(&self, segment: &Segment) -> Result<(), ResultStoreError> {
        let captions = serde_json::to_value(&segment.captions)?;

        let result = sqlx::query(
            r#"
            insert into segments
                (fingerprint, original_query, video_id, start_time, end_time, caption, captions)
            values ($1, $2, $3, $4, $5, $6, $7)
            on conflict (fingerprint) do nothing
            "#,
        )
        .bind(&segment.fingerprint)
        .bind(&segment.original_query)
        .bind(&segment.video_id)
        .bind(segment.start_time)
        .bind(segment.end_time)
        .bind(&segment.caption)
        .bind(captions)
        .execute(&self.db.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ResultStoreError::DuplicateKey);
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct SegmentRow {
    fingerprint: String,
    original_query: String,
    video_id: String,
    start_time: f64,
    end_time: f64,
    caption: String,
    captions: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<SegmentRow> for Segment {
    fn from(row: SegmentRow) -> Self {
        Segment {
            fingerprint: row.fingerprint,
            original_query: row.original_query,
            video_id: row.video_id,
            start_time: row.start_time,
            end_time: row.end_time,
            caption: row.caption,
            captions: serde_json::from_value(row.captions).unwrap_or_default(),
            created_at: row.created_at,
        }
    }
}

impl From<serde_json::Error> for ResultStoreError {
    fn from(e: serde_json::Error) -> Self {
        ResultStoreError::Db(sqlx::Error::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cue_roundtrips_through_json() {
        let cue = Cue {
            start: 1.0,
            duration: 2.5,
            text: "hello".into(),
        };
        let value = serde_json::to_value(&cue).unwrap();
        let back: Cue = serde_json::from_value(value).unwrap();
        assert_eq!(cue, back);
    }
}
