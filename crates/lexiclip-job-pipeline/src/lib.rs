//! The per-job state machine: search, candidate-by-candidate download and
//! chunked transcription with early termination, caption parsing, English
//! gating, phrase matching, boundary detection, then caching and indexing.
//! Errors from external collaborators inside a single candidate are
//! isolated to that candidate; only exhaustion or an infra fault fails the
//! job.

use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use hypr_analytics::{AnalyticsClient, PipelineEvent};
use lexiclip_adapters::{AudioDownloader, ChunkedTranscriber, EmbeddabilityCheck, VideoCatalog};
use lexiclip_canonicalize::QueryKind;
use lexiclip_caption_parser::Cue;
use lexiclip_job_store::{Job, JobStatus, JobStore};
use lexiclip_result_store::{Cue as ResultCue, ResultStore, Segment};
use lexiclip_word_index::{SegmentRef, WordIndex};
use regex::Regex;
use thiserror::Error;

pub const JOB_WALL_CLOCK: Duration = Duration::from_secs(15 * 60);
const MAX_CANDIDATES: usize = 10;
const SEARCH_TARGET_PER_STRATEGY: usize = 5;
const MAX_TRANSCRIBE_CHUNKS: u32 = 10;
const CHUNK_DURATION_SECS: f64 = 30.0;

/// Defaults for the English heuristic gate, overridable via `Env` (spec.md
/// §9 Open Question (c)).
pub const DEFAULT_ENGLISH_MIN_FUNCTION_WORDS: usize = 5;
pub const DEFAULT_ENGLISH_MAX_NON_ASCII_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Copy)]
pub struct EnglishGateConfig {
    pub min_function_word_hits: usize,
    pub max_non_ascii_ratio: f64,
}

impl Default for EnglishGateConfig {
    fn default() -> Self {
        Self {
            min_function_word_hits: DEFAULT_ENGLISH_MIN_FUNCTION_WORDS,
            max_non_ascii_ratio: DEFAULT_ENGLISH_MAX_NON_ASCII_RATIO,
        }
    }
}

/// Ordered list of search-catalog queries tried for a canonicalized input.
pub fn search_strategies(canonical: &str, kind: QueryKind) -> Vec<String> {
    match kind {
        QueryKind::Word => vec![
            format!("\"{canonical}\" explained"),
            format!("{canonical} explained"),
            canonical.to_string(),
            format!("\"{canonical}\""),
        ],
        QueryKind::Sentence => vec![
            format!("\"{canonical}\""),
            canonical.to_string(),
            format!("{canonical} example"),
            format!("\"{canonical}\" explained"),
        ],
    }
}

const ENGLISH_FUNCTION_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "and", "or", "but", "of", "to", "in", "on",
    "at", "for", "with", "this", "that", "it", "you", "i", "we", "they", "he", "she",
];

static FUNCTION_WORD_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ENGLISH_FUNCTION_WORDS
        .iter()
        .map(|w| Regex::new(&format!(r"\b{}\b", regex::escape(w))).unwrap())
        .collect()
});

/// Heuristic English gate: at least `config.min_function_word_hits` isolated-
/// token hits from a fixed list of common function words, and a non-ASCII
/// character ratio below `config.max_non_ascii_ratio`.
pub fn passes_english_gate(text: &str, config: EnglishGateConfig) -> bool {
    let lower = text.to_lowercase();
    let hits: usize = FUNCTION_WORD_PATTERNS
        .iter()
        .map(|re| re.find_iter(&lower).count())
        .sum();

    let total_chars = text.chars().count();
    if total_chars == 0 {
        return false;
    }
    let non_ascii_ratio =
        text.chars().filter(|c| !c.is_ascii()).count() as f64 / total_chars as f64;

    hits >= config.min_function_word_hits && non_ascii_ratio < config.max_non_ascii_ratio
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Terminal(String),
    #[error("job store error: {0}")]
    JobStore(#[from] lexiclip_job_store::JobStoreError),
    #[error("scratch directory error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Pipeline {
    job_store: JobStore,
    result_store: ResultStore,
    word_index: WordIndex,
    catalog: Arc<dyn VideoCatalog>,
    embeddability: Arc<dyn EmbeddabilityCheck>,
    downloader: Arc<dyn AudioDownloader>,
    transcriber: Arc<dyn ChunkedTranscriber>,
    english_gate: EnglishGateConfig,
    analytics: Arc<AnalyticsClient>,
}

impl Pipeline {
    pub fn new(
        job_store: JobStore,
        result_store: ResultStore,
        word_index: WordIndex,
        catalog: Arc<dyn VideoCatalog>,
        embeddability: Arc<dyn EmbeddabilityCheck>,
        downloader: Arc<dyn AudioDownloader>,
        transcriber: Arc<dyn ChunkedTranscriber>,
        english_gate: EnglishGateConfig,
        analytics: Arc<AnalyticsClient>,
    ) -> Self {
        Self {
            job_store,
            result_store,
            word_index,
            catalog,
            embeddability,
            downloader,
            transcriber,
            english_gate,
            analytics,
        }
    }

    /// Entry point handed to the worker pool. Applies the 15-minute
    /// wall-clock bound as a backstop around the whole state machine; the
    /// internal per-candidate deadline check produces the same terminal
    /// reason earlier when possible.
    pub async fn run_job(&self, job: Job) {
        let fingerprint = job.fingerprint.clone();
        let deadline = Instant::now() + JOB_WALL_CLOCK;

        let outcome = tokio::time::timeout(JOB_WALL_CLOCK, self.execute(&job, deadline)).await;

        match outcome {
            Ok(Ok(())) => {
                self.analytics
                    .event(
                        PipelineEvent::builder("job_completed")
                            .with("fingerprint", fingerprint.clone())
                            .build(),
                    )
                    .await;
            }
            Ok(Err(err)) => {
                tracing::warn!(%fingerprint, error = %err, "job_failed");
                let _ = self.job_store.set_error(&fingerprint, &err.to_string()).await;
                self.analytics
                    .event(
                        PipelineEvent::builder("job_failed")
                            .with("fingerprint", fingerprint.clone())
                            .with("reason", err.to_string())
                            .build(),
                    )
                    .await;
            }
            Err(_) => {
                tracing::warn!(%fingerprint, "job_wall_clock_exceeded");
                let _ = self
                    .job_store
                    .set_error(&fingerprint, "job exceeded 15 minute wall clock")
                    .await;
                self.analytics
                    .event(
                        PipelineEvent::builder("job_failed")
                            .with("fingerprint", fingerprint.clone())
                            .with("reason", "wall_clock_exceeded")
                            .build(),
                    )
                    .await;
            }
        }
    }

    async fn execute(&self, job: &Job, deadline: Instant) -> Result<(), PipelineError> {
        self.job_store
            .set_status(&job.fingerprint, JobStatus::Searching, None)
            .await?;

        let kind = if job.kind == "word" {
            QueryKind::Word
        } else {
            QueryKind::Sentence
        };

        let candidates = self.search_candidates(&job.canonical, kind).await;
        if candidates.is_empty() {
            return Err(PipelineError::Terminal("no videos found".to_string()));
        }

        let scratch = tempfile::tempdir()?;
        let mut tried = 0usize;

        for video in &candidates {
            if Instant::now() >= deadline {
                return Err(PipelineError::Terminal(
                    "job exceeded 15 minute wall clock".to_string(),
                ));
            }
            tried += 1;

            match self
                .process_candidate(job, kind, video, scratch.path())
                .await
            {
                Some(mut segment) => {
                    segment.original_query = job.original_query.clone();
                    self.job_store.set_result(&job.fingerprint, &segment).await?;

                    if let Err(err) = self.result_store.insert(&segment).await {
                        if !matches!(err, lexiclip_result_store::ResultStoreError::DuplicateKey) {
                            tracing::warn!(fingerprint = %job.fingerprint, error = %err, "result_store_insert_failed");
                        }
                    }

                    if let Err(err) = self
                        .word_index
                        .add_segment(&SegmentRef {
                            video_id: segment.video_id.clone(),
                            start_time: segment.start_time,
                            end_time: segment.end_time,
                            caption: segment.caption.clone(),
                        })
                        .await
                    {
                        tracing::warn!(fingerprint = %job.fingerprint, error = %err, "word_index_update_failed");
                    }

                    return Ok(());
                }
                None => continue,
            }
        }

        Err(PipelineError::Terminal(format!(
            "no English video found; tried {tried} videos"
        )))
    }

    async fn search_candidates(
        &self,
        canonical: &str,
        kind: QueryKind,
    ) -> Vec<lexiclip_adapters::CandidateVideo> {
        let mut seen = std::collections::HashSet::new();
        let mut candidates = Vec::new();

        for strategy in search_strategies(canonical, kind) {
            if candidates.len() >= MAX_CANDIDATES {
                break;
            }
            let Ok(results) = self
                .catalog
                .search(&strategy, SEARCH_TARGET_PER_STRATEGY)
                .await
            else {
                continue;
            };
            for video in results {
                if candidates.len() >= MAX_CANDIDATES {
                    break;
                }
                if seen.insert(video.video_id.clone()) {
                    candidates.push(video);
                }
            }
        }

        candidates
    }

    /// Returns `Some(segment)` on success, `None` if this candidate should
    /// be skipped for any reason (not embeddable, download failure, no
    /// phrase match, failed English gate, ...).
    async fn process_candidate(
        &self,
        job: &Job,
        kind: QueryKind,
        video: &lexiclip_adapters::CandidateVideo,
        scratch_dir: &Path,
    ) -> Option<Segment> {
        match self.embeddability.is_embeddable(&video.video_id).await {
            Ok(true) => {}
            _ => return None,
        }

        self.job_store
            .set_status(&job.fingerprint, JobStatus::Downloading, Some(&video.video_id))
            .await
            .ok()?;

        let audio_path = scratch_dir.join(format!("{}.mp3", video.video_id));
        if self
            .downloader
            .download_audio(&video.video_id, &audio_path)
            .await
            .is_err()
        {
            let _ = tokio::fs::remove_file(&audio_path).await;
            return None;
        }

        self.job_store
            .set_status(
                &job.fingerprint,
                JobStatus::Transcribing,
                Some(&video.video_id),
            )
            .await
            .ok()?;

        let is_word = matches!(kind, QueryKind::Word);
        let cues = self
            .transcribe_until_match(&audio_path, &job.canonical, is_word)
            .await;
        let _ = tokio::fs::remove_file(&audio_path).await;
        let cues = cues?;

        let joined: String = cues
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        if !passes_english_gate(&joined, self.english_gate) {
            return None;
        }

        let match_index = lexiclip_phrase_match::find_match(&job.canonical, is_word, &cues)?;
        let boundary = lexiclip_phrase_match::detect_boundary(match_index, &cues)?;

        let captions: Vec<ResultCue> = cues
            .iter()
            .filter(|c| {
                c.start + c.duration >= boundary.start_time && c.start <= boundary.end_time
            })
            .map(|c| ResultCue {
                start: c.start,
                duration: c.duration,
                text: c.text.clone(),
            })
            .collect();

        Some(Segment {
            fingerprint: job.fingerprint.clone(),
            original_query: job.original_query.clone(),
            video_id: video.video_id.clone(),
            start_time: boundary.start_time,
            end_time: boundary.end_time,
            caption: boundary.caption,
            captions,
            created_at: chrono::Utc::now(),
        })
    }

    /// Transcribes 30s chunks one at a time, up to 10, stopping one chunk
    /// after the target phrase first appears so a sentence spilling across
    /// the chunk boundary is captured. Returns `None` if no chunk in the
    /// first 10 matches.
    async fn transcribe_until_match(
        &self,
        audio_path: &Path,
        canonical: &str,
        is_word: bool,
    ) -> Option<Vec<Cue>> {
        let mut chunk_cues: Vec<Vec<Cue>> = Vec::new();
        let mut matched = false;
        let mut chunk_index = 0u32;

        loop {
            let text = match self.transcriber.transcribe_chunk(audio_path, chunk_index).await {
                Ok(text) => text,
                // A matched phrase's lookahead chunk commonly runs past the end of
                // the available audio; treat that as end-of-audio, not failure.
                Err(_) if matched => break,
                Err(_) => return None,
            };
            let cues = lexiclip_caption_parser::parse(&text).ok()?;
            chunk_cues.push(cues);
            chunk_index += 1;

            if !matched {
                let merged = lexiclip_caption_parser::merge_chunks(chunk_cues.clone(), CHUNK_DURATION_SECS);
                matched = lexiclip_phrase_match::find_match(canonical, is_word, &merged).is_some();
            } else {
                break;
            }

            if !matched && chunk_index >= MAX_TRANSCRIBE_CHUNKS {
                break;
            }
        }

        if matched {
            Some(lexiclip_caption_parser::merge_chunks(
                chunk_cues,
                CHUNK_DURATION_SECS,
            ))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_strategies_follow_spec_order() {
        let strategies = search_strategies("rust", QueryKind::Word);
        assert_eq!(
            strategies,
            vec![
                "\"rust\" explained".to_string(),
                "rust explained".to_string(),
                "rust".to_string(),
                "\"rust\"".to_string(),
            ]
        );
    }

    #[test]
    fn sentence_strategies_follow_spec_order() {
        let strategies = search_strategies("rust is fast", QueryKind::Sentence);
        assert_eq!(
            strategies,
            vec![
                "\"rust is fast\"".to_string(),
                "rust is fast".to_string(),
                "rust is fast example".to_string(),
                "\"rust is fast\" explained".to_string(),
            ]
        );
    }

    #[test]
    fn english_gate_accepts_plausible_english_text() {
        let text = "This is a sentence that talks about the weather and the news of the day.";
        assert!(passes_english_gate(text, EnglishGateConfig::default()));
    }

    #[test]
    fn english_gate_rejects_sparse_function_words() {
        assert!(!passes_english_gate(
            "Rust Python JavaScript TypeScript Go",
            EnglishGateConfig::default()
        ));
    }

    #[test]
    fn english_gate_rejects_high_non_ascii_ratio() {
        let text = "是的 这是一个很长的中文句子 the a to of in";
        assert!(!passes_english_gate(text, EnglishGateConfig::default()));
    }

    #[test]
    fn english_gate_respects_configured_thresholds() {
        let text = "the a to";
        assert!(!passes_english_gate(text, EnglishGateConfig::default()));
        let lenient = EnglishGateConfig {
            min_function_word_hits: 3,
            max_non_ascii_ratio: 0.2,
        };
        assert!(passes_english_gate(text, lenient));
    }
}
