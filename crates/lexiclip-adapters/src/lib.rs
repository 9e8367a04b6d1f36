//! Narrow trait contracts between the job pipeline / stream registry and the
//! external collaborators the top-level spec treats as out of scope: the
//! video catalog, the audio-extraction tool, the speech-to-text engine, the
//! upstream generative-AI service, and the subscription-entitlement
//! provider. Each trait is the minimal surface its caller needs, not a
//! full client for the underlying service.

pub mod http;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("upstream rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("upstream returned malformed data: {0}")]
    MalformedResponse(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateVideo {
    pub video_id: String,
    pub title: String,
}

/// Searches the external video catalog for a single query strategy.
#[async_trait]
pub trait VideoCatalog: Send + Sync {
    async fn search(
        &self,
        query: &str,
        target_results: usize,
    ) -> Result<Vec<CandidateVideo>, AdapterError>;
}

/// Checks whether a candidate video can legally be embedded/downloaded.
#[async_trait]
pub trait EmbeddabilityCheck: Send + Sync {
    async fn is_embeddable(&self, video_id: &str) -> Result<bool, AdapterError>;
}

/// Downloads a video's audio track to a scratch path on disk.
#[async_trait]
pub trait AudioDownloader: Send + Sync {
    async fn download_audio(&self, video_id: &str, dest: &Path) -> Result<(), AdapterError>;
}

/// Transcribes a single fixed-length chunk of an audio file, returning a
/// WEBVTT-like timed-caption document scoped to that chunk (callers shift
/// timestamps by chunk offset via `lexiclip_caption_parser::merge_chunks`).
#[async_trait]
pub trait ChunkedTranscriber: Send + Sync {
    async fn transcribe_chunk(
        &self,
        audio_path: &Path,
        chunk_index: u32,
    ) -> Result<String, AdapterError>;
}

/// Reports whether a user currently holds an active paid entitlement.
#[async_trait]
pub trait SubscriptionProvider: Send + Sync {
    async fn is_entitled(&self, user_id: &str) -> Result<bool, AdapterError>;
}

/// Callback invoked once per incremental text delta from the upstream AI
/// call, in arrival order.
pub type ChunkSink<'a> = &'a mut (dyn FnMut(String) + Send);

/// Drives a single streaming generation call against the upstream
/// generative-AI service, invoking `on_chunk` for every delta as it arrives
/// and returning the fully accumulated text on completion.
#[async_trait]
pub trait AiStreamProvider: Send + Sync {
    async fn stream_generate(
        &self,
        prompt: &str,
        on_chunk: ChunkSink<'_>,
    ) -> Result<String, AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct StaticCatalog(Vec<CandidateVideo>);

    #[async_trait]
    impl VideoCatalog for StaticCatalog {
        async fn search(
            &self,
            _query: &str,
            target_results: usize,
        ) -> Result<Vec<CandidateVideo>, AdapterError> {
            Ok(self.0.iter().take(target_results).cloned().collect())
        }
    }

    #[tokio::test]
    async fn catalog_trait_object_is_dyn_compatible() {
        let catalog: Box<dyn VideoCatalog> = Box::new(StaticCatalog(vec![CandidateVideo {
            video_id: "abc".into(),
            title: "example".into(),
        }]));
        let results = catalog.search("python explained", 5).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    struct EchoAiProvider;

    #[async_trait]
    impl AiStreamProvider for EchoAiProvider {
        async fn stream_generate(
            &self,
            prompt: &str,
            on_chunk: ChunkSink<'_>,
        ) -> Result<String, AdapterError> {
            for word in prompt.split_whitespace() {
                on_chunk(word.to_string());
            }
            Ok(prompt.to_string())
        }
    }

    #[tokio::test]
    async fn stream_provider_invokes_callback_in_order() {
        let provider = EchoAiProvider;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let mut sink = move |chunk: String| seen_clone.lock().unwrap().push(chunk);
        let full = provider.stream_generate("a b c", &mut sink).await.unwrap();
        assert_eq!(full, "a b c");
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }
}
