//! Reverse index from word to the segments it occurs in. Append-only at the
//! granularity of a single `(video_id, start, end)` segment reference.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Extract the distinct words in `text`: lowercase, strip punctuation to
/// spaces, split on whitespace, drop empties, deduplicate. Order is not
/// significant to callers (`add_segment_to_words` iterates the set).
pub fn extract_words(text: &str) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| {
            if ".,!?;:'\"()[]{}—–-".contains(c) {
                ' '
            } else {
                c
            }
        })
        .collect();

    let mut words: Vec<String> = cleaned
        .split_whitespace()
        .map(|w| w.to_string())
        .collect();
    words.sort();
    words.dedup();
    words
}

#[derive(Debug, Clone)]
pub struct SegmentRef {
    pub video_id: String,
    pub start_time: f64,
    pub end_time: f64,
    pub caption: String,
}

#[derive(Debug, Clone)]
pub struct WordExample {
    pub video_id: String,
    pub start_time: f64,
    pub end_time: f64,
    pub caption: String,
    pub inserted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WordIndexStats {
    pub total_words: i64,
    pub total_mappings: i64,
}

#[derive(Debug, Error)]
pub enum WordIndexError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct WordIndex {
    db: lexiclip_db::Db,
}

impl WordIndex {
    pub fn new(db: lexiclip_db::Db) -> Self {
        Self { db }
    }

    /// Adds `segment` to the index under every word extracted from its
    /// caption. Runs inside a single transaction: for each word the entry is
    /// upserted and the example is inserted only if no row already shares
    /// `(word, video_id, start_time, end_time)` — the spec's per-reference
    /// deduplication, enforced at the application layer since the table has
    /// no word-level uniqueness constraint of its own.
    pub async fn add_segment(&self, segment: &SegmentRef) -> Result<(), WordIndexError> {
        let words = extract_words(&segment.caption);
        if words.is_empty() {
            return Ok(());
        }

        let mut tx = self.db.pool.begin().await?;

        for word in &words {
            sqlx::query(
                r#"
                insert into word_index_entries (word)
                values ($1)
                on conflict (word) do update set updated_at = now()
                "#,
            )
            .bind(word)
            .execute(&mut *tx)
            .await?;

            let existing = sqlx::query_scalar::<_, i64>(
                r#"
                select count(*) from word_index_examples
                where word = $1 and video_id = $2 and start_time = $3 and end_time = $4
                "#,
            )
            .bind(word)
            .bind(&segment.video_id)
            .bind(segment.start_time)
            .bind(segment.end_time)
            .fetch_one(&mut *tx)
            .await?;

            if existing > 0 {
                continue;
            }

            let position = sqlx::query_scalar::<_, i64>(
                r#"select coalesce(max(position), -1) + 1 from word_index_examples where word = $1"#,
            )
            .bind(word)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                insert into word_index_examples
                    (word, video_id, start_time, end_time, caption, position)
                values ($1, $2, $3, $4, $5, $6)
                on conflict (word, video_id, start_time, end_time) do nothing
                "#,
            )
            .bind(word)
            .bind(&segment.video_id)
            .bind(segment.start_time)
            .bind(segment.end_time)
            .bind(&segment.caption)
            .bind(position)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Examples for `word`, in insertion order.
    pub async fn find_by_word(&self, word: &str) -> Result<Vec<WordExample>, WordIndexError> {
        let rows: Vec<WordExampleRow> = sqlx::query_as(
            r#"
            select video_id, start_time, end_time, caption, inserted_at
            from word_index_examples
            where word = $1
            order by position asc
            "#,
        )
        .bind(word)
        .fetch_all(&self.db.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Alphabetical page of indexed words.
    pub async fn list_words(&self, limit: i64, offset: i64) -> Result<Vec<String>, WordIndexError> {
        let words: Vec<String> = sqlx::query_scalar(
            r#"
            select word from word_index_entries
            order by word asc
            limit $1 offset $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(words)
    }

    pub async fn stats(&self) -> Result<WordIndexStats, WordIndexError> {
        let total_words: i64 = sqlx::query_scalar("select count(*) from word_index_entries")
            .fetch_one(&self.db.pool)
            .await?;
        let total_mappings: i64 = sqlx::query_scalar("select count(*) from word_index_examples")
            .fetch_one(&self.db.pool)
            .await?;
        Ok(WordIndexStats {
            total_words,
            total_mappings,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WordExampleRow {
    video_id: String,
    start_time: f64,
    end_time: f64,
    caption: String,
    inserted_at: DateTime<Utc>,
}

impl From<WordExampleRow> for WordExample {
    fn from(row: WordExampleRow) -> Self {
        WordExample {
            video_id: row.video_id,
            start_time: row.start_time,
            end_time: row.end_time,
            caption: row.caption,
            inserted_at: row.inserted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_lowercase_deduplicated_words() {
        let words = extract_words("Hello, hello world!");
        assert_eq!(words, vec!["hello", "world"]);
    }

    #[test]
    fn strips_punctuation_set() {
        let words = extract_words("semi-colon; (parens) [brackets] \"quotes\"");
        assert!(words.contains(&"semi".to_string()));
        assert!(words.contains(&"colon".to_string()));
        assert!(words.contains(&"parens".to_string()));
        assert!(!words.iter().any(|w| w.contains('(')));
    }

    #[test]
    fn drops_empty_tokens() {
        let words = extract_words("   ...   !!!   ");
        assert!(words.is_empty());
    }
}
