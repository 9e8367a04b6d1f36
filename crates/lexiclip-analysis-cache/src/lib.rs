//! Persisted transcript of a streamed sentence analysis, and the pacing law
//! used both to replay a cache hit and (by the stream registry) to replay a
//! late subscriber's view of a still-growing chunk log.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkLogEntry {
    pub text: String,
    /// Milliseconds since the stream's `createdAt`.
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub fingerprint: String,
    pub sentence: String,
    pub target_word: String,
    pub target_language: String,
    pub native_language: String,
    pub context_before: Option<String>,
    pub context_after: Option<String>,
    pub full_translation: String,
    pub literal_translation: String,
    pub grammar_analysis: String,
    pub breakdown: serde_json::Value,
    pub idioms: serde_json::Value,
    pub difficulty_notes: Option<String>,
    pub chunk_log: Option<Vec<ChunkLogEntry>>,
    pub access_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AnalysisCacheError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct AnalysisCache {
    db: lexiclip_db::Db,
}

impl AnalysisCache {
    pub fn new(db: lexiclip_db::Db) -> Self {
        Self { db }
    }

    /// Inserts a completed analysis. Retried up to 3 times with exponential
    /// backoff (1s, 2s, 4s); a persistent failure is reported to the caller,
    /// who must not fail the in-flight streamed response because of it.
    pub async fn persist_with_retry(&self, record: &AnalysisRecord) -> Result<(), AnalysisCacheError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_factor(2.0)
            .with_max_times(3);

        (|| async { self.insert(record).await })
            .retry(backoff)
            .notify(|err: &AnalysisCacheError, dur: Duration| {
                tracing::warn!(
                    fingerprint = %record.fingerprint,
                    error = %err,
                    retry_delay_ms = dur.as_millis(),
                    "retrying_analysis_persist"
                );
            })
            .await
    }

    async fn insert(&self, record: &AnalysisRecord) -> Result<(), AnalysisCacheError> {
        let chunk_log = record
            .chunk_log
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            insert into analyses (
                fingerprint, sentence, target_word, target_language, native_language,
                context_before, context_after, full_translation, literal_translation,
                grammar_analysis, breakdown, idioms, difficulty_notes, chunk_log
            )
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            on conflict (fingerprint) do nothing
            "#,
        )
        .bind(&record.fingerprint)
        .bind(&record.sentence)
        .bind(&record.target_word)
        .bind(&record.target_language)
        .bind(&record.native_language)
        .bind(&record.context_before)
        .bind(&record.context_after)
        .bind(&record.full_translation)
        .bind(&record.literal_translation)
        .bind(&record.grammar_analysis)
        .bind(&record.breakdown)
        .bind(&record.idioms)
        .bind(&record.difficulty_notes)
        .bind(chunk_log)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    /// Looks up a cached analysis, bumping its access accounting. Returns
    /// `None` on a cache miss without touching access accounting.
    pub async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<AnalysisRecord>, AnalysisCacheError> {
        let row: Option<AnalysisRow> = sqlx::query_as(
            r#"
            update analyses
               set access_count = access_count + 1, last_accessed_at = now()
             where fingerprint = $1
            returning fingerprint, sentence, target_word, target_language, native_language,
                      context_before, context_after, full_translation, literal_translation,
                      grammar_analysis, breakdown, idioms, difficulty_notes, chunk_log,
                      access_count, created_at, last_accessed_at
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.db.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct AnalysisRow {
    fingerprint: String,
    sentence: String,
    target_word: String,
    target_language: String,
    native_language: String,
    context_before: Option<String>,
    context_after: Option<String>,
    full_translation: String,
    literal_translation: String,
    grammar_analysis: String,
    breakdown: serde_json::Value,
    idioms: serde_json::Value,
    difficulty_notes: Option<String>,
    chunk_log: Option<serde_json::Value>,
    access_count: i64,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
}

impl TryFrom<AnalysisRow> for AnalysisRecord {
    type Error = AnalysisCacheError;

    fn try_from(row: AnalysisRow) -> Result<Self, Self::Error> {
        Ok(AnalysisRecord {
            fingerprint: row.fingerprint,
            sentence: row.sentence,
            target_word: row.target_word,
            target_language: row.target_language,
            native_language: row.native_language,
            context_before: row.context_before,
            context_after: row.context_after,
            full_translation: row.full_translation,
            literal_translation: row.literal_translation,
            grammar_analysis: row.grammar_analysis,
            breakdown: row.breakdown,
            idioms: row.idioms,
            difficulty_notes: row.difficulty_notes,
            chunk_log: row.chunk_log.map(serde_json::from_value).transpose()?,
            access_count: row.access_count,
            created_at: row.created_at,
            last_accessed_at: row.last_accessed_at,
        })
    }
}

/// Pacing law shared by the analysis cache's replay of a cache hit and the
/// stream registry's replay of a late subscriber's view of a live stream:
/// the delay before the next chunk is a third of the original inter-chunk
/// gap, clamped to `[5ms, 30ms]`.
pub fn replay_delay_ms(current_ts_ms: u64, next_ts_ms: u64) -> u64 {
    let gap = next_ts_ms.saturating_sub(current_ts_ms);
    (gap / 3).clamp(5, 30)
}

const LEGACY_CHUNK_MAX_LEN: usize = 100;
pub const LEGACY_CHUNK_DELAY_MS: u64 = 15;

/// Splits a legacy record's full text (one with no stored chunk log) into
/// chunks of at most 100 characters, breaking at whitespace/punctuation
/// boundaries where possible, for synthetic replay.
pub fn synthesize_legacy_chunks(full_text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = full_text;

    while !remaining.is_empty() {
        if remaining.chars().count() <= LEGACY_CHUNK_MAX_LEN {
            chunks.push(remaining.to_string());
            break;
        }

        let boundary = remaining
            .char_indices()
            .take(LEGACY_CHUNK_MAX_LEN)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .find(|&(_, c)| c.is_whitespace() || ".,!?;:".contains(c))
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or_else(|| {
                remaining
                    .char_indices()
                    .nth(LEGACY_CHUNK_MAX_LEN)
                    .map(|(i, _)| i)
                    .unwrap_or(remaining.len())
            });

        let (chunk, rest) = remaining.split_at(boundary);
        chunks.push(chunk.to_string());
        remaining = rest.trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_delay_clamps_to_bounds() {
        assert_eq!(replay_delay_ms(0, 0), 5);
        assert_eq!(replay_delay_ms(0, 3), 5);
        assert_eq!(replay_delay_ms(0, 1000), 30);
        assert_eq!(replay_delay_ms(0, 30), 10);
    }

    #[test]
    fn legacy_chunks_respect_max_length() {
        let text = "word ".repeat(40);
        let chunks = synthesize_legacy_chunks(&text);
        assert!(chunks.iter().all(|c| c.chars().count() <= LEGACY_CHUNK_MAX_LEN));
    }

    #[test]
    fn legacy_chunks_reconstruct_original_text() {
        let text = "The quick brown fox jumps over the lazy dog, again and again.";
        let chunks = synthesize_legacy_chunks(text);
        let rejoined = chunks.join(" ").split_whitespace().collect::<Vec<_>>().join(" ");
        let original = text.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(rejoined, original);
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = synthesize_legacy_chunks("hi there");
        assert_eq!(chunks, vec!["hi there".to_string()]);
    }
}
