use std::sync::Arc;

use lexiclip_adapters::AiStreamProvider;
use lexiclip_analysis_cache::AnalysisCache;
use lexiclip_job_pipeline::Pipeline;
use lexiclip_job_store::JobStore;
use lexiclip_quota::{AiQuota, GenericThrottle};
use lexiclip_result_store::ResultStore;
use lexiclip_stream_registry::StreamRegistry;
use lexiclip_word_index::WordIndex;

/// Everything a route handler needs, built once at startup and cheaply
/// cloned into every request (every field is a pool handle or an `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub job_store: JobStore,
    pub result_store: ResultStore,
    pub word_index: WordIndex,
    pub pipeline: Arc<Pipeline>,
    pub stream_registry: StreamRegistry,
    pub analysis_cache: AnalysisCache,
    pub ai_quota: Arc<AiQuota>,
    pub search_throttle: Arc<GenericThrottle>,
    pub analyze_throttle: Arc<GenericThrottle>,
    pub ai_provider: Arc<dyn AiStreamProvider>,
}
