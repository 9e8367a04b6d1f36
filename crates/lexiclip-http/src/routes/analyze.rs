use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures_util::stream::{self, Stream};
use lexiclip_analysis_cache::AnalysisRecord;
use lexiclip_fingerprint::fingerprint_analysis;
use lexiclip_quota::{QuotaStatus, ThrottleIdentity};
use lexiclip_stream_registry::{ServerFrame, StreamParams};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;

const MAX_SENTENCE_LEN: usize = 1000;
const MAX_TARGET_WORD_LEN: usize = 100;
const MAX_CONTEXT_LEN: usize = 500;

/// ISO 639-1 subset plus the Chinese locale variants the spec calls out by
/// name; not meant to be exhaustive of every language the upstream provider
/// can actually translate into.
const LANGUAGE_CODES: &[&str] = &[
    "en", "es", "fr", "de", "it", "pt", "nl", "ru", "ja", "ko", "ar", "hi", "tr", "pl", "sv", "da",
    "no", "fi", "vi", "th", "id", "zh", "zh-cn", "zh-tw", "zh-hk",
];

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub sentence: String,
    pub target_word: String,
    pub target_language: String,
    pub native_language: String,
    #[serde(default)]
    pub context_before: Option<String>,
    #[serde(default)]
    pub context_after: Option<String>,
    #[serde(default)]
    pub video_timestamp: Option<f64>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub full_translation: String,
    pub literal_translation: String,
    pub grammar_analysis: String,
    pub breakdown: serde_json::Value,
    pub idioms: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty_notes: Option<String>,
    pub cached: bool,
    pub access_count: i64,
}

impl AnalyzeResponse {
    fn from_record(record: &AnalysisRecord, cached: bool) -> Self {
        AnalyzeResponse {
            full_translation: record.full_translation.clone(),
            literal_translation: record.literal_translation.clone(),
            grammar_analysis: record.grammar_analysis.clone(),
            breakdown: record.breakdown.clone(),
            idioms: record.idioms.clone(),
            difficulty_notes: record.difficulty_notes.clone(),
            cached,
            access_count: record.access_count,
        }
    }
}

fn validate(req: &AnalyzeRequest) -> Result<(), ApiError> {
    if req.sentence.trim().is_empty() {
        return Err(ApiError::InvalidInput("sentence must not be empty".to_string()));
    }
    if req.sentence.chars().count() > MAX_SENTENCE_LEN {
        return Err(ApiError::InvalidInput(format!(
            "sentence must be at most {MAX_SENTENCE_LEN} characters"
        )));
    }
    if req.target_word.trim().is_empty() {
        return Err(ApiError::InvalidInput("targetWord must not be empty".to_string()));
    }
    if req.target_word.chars().count() > MAX_TARGET_WORD_LEN {
        return Err(ApiError::InvalidInput(format!(
            "targetWord must be at most {MAX_TARGET_WORD_LEN} characters"
        )));
    }
    if let Some(ctx) = &req.context_before {
        if ctx.chars().count() > MAX_CONTEXT_LEN {
            return Err(ApiError::InvalidInput(format!(
                "contextBefore must be at most {MAX_CONTEXT_LEN} characters"
            )));
        }
    }
    if let Some(ctx) = &req.context_after {
        if ctx.chars().count() > MAX_CONTEXT_LEN {
            return Err(ApiError::InvalidInput(format!(
                "contextAfter must be at most {MAX_CONTEXT_LEN} characters"
            )));
        }
    }
    if !LANGUAGE_CODES.contains(&req.target_language.to_lowercase().as_str()) {
        return Err(ApiError::InvalidInput(format!(
            "unsupported targetLanguage: {}",
            req.target_language
        )));
    }
    if !LANGUAGE_CODES.contains(&req.native_language.to_lowercase().as_str()) {
        return Err(ApiError::InvalidInput(format!(
            "unsupported nativeLanguage: {}",
            req.native_language
        )));
    }
    Ok(())
}

fn analysis_fingerprint(req: &AnalyzeRequest) -> lexiclip_fingerprint::Fingerprint {
    fingerprint_analysis(
        req.sentence.trim(),
        req.target_word.trim(),
        req.target_language.trim(),
        req.native_language.trim(),
        req.context_before.as_deref().unwrap_or("").trim(),
        req.context_after.as_deref().unwrap_or("").trim(),
    )
}

fn build_prompt(req: &AnalyzeRequest) -> String {
    let mut prompt = format!(
        "Analyze the word \"{}\" as used in the sentence \"{}\". Explain it for a speaker of {} \
         learning {}.",
        req.target_word, req.sentence, req.native_language, req.target_language,
    );
    if let Some(before) = &req.context_before {
        prompt.push_str(&format!(" Context before: \"{before}\"."));
    }
    if let Some(after) = &req.context_after {
        prompt.push_str(&format!(" Context after: \"{after}\"."));
    }
    prompt.push_str(
        " Respond with a single JSON object with keys fullTranslation, literalTranslation, \
         grammarAnalysis, breakdown (array of strings), idioms (array of strings), and an \
         optional difficultyNotes string. Emit nothing outside the JSON object.",
    );
    prompt
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.strip_prefix("```") {
        Some(rest) => {
            let body = rest.find('\n').map(|i| &rest[i + 1..]).unwrap_or(rest);
            body.strip_suffix("```").unwrap_or(body).trim()
        }
        None => trimmed,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParsedAnalysis {
    full_translation: String,
    literal_translation: String,
    grammar_analysis: String,
    #[serde(default)]
    breakdown: serde_json::Value,
    #[serde(default)]
    idioms: serde_json::Value,
    #[serde(default)]
    difficulty_notes: Option<String>,
}

fn parse_structured_analysis(text: &str) -> Result<ParsedAnalysis, ApiError> {
    serde_json::from_str(strip_code_fence(text))
        .map_err(|err| ApiError::UpstreamConfig(format!("malformed analysis JSON from provider: {err}")))
}

/// The raw JSON blob a completed analysis accumulates to; this is both what
/// gets recorded as a legacy-free "full response" and what a stream resumes
/// replaying on a cache hit.
fn reconstruct_full_response(record: &AnalysisRecord) -> String {
    serde_json::to_string(&json!({
        "fullTranslation": record.full_translation,
        "literalTranslation": record.literal_translation,
        "grammarAnalysis": record.grammar_analysis,
        "breakdown": record.breakdown,
        "idioms": record.idioms,
        "difficultyNotes": record.difficulty_notes,
    }))
    .unwrap_or_default()
}

fn apply_quota_headers(headers: &mut HeaderMap, status: &QuotaStatus) {
    headers.insert(
        HeaderName::from_static("x-paywall-has-subscription"),
        HeaderValue::from_static(if status.has_subscription { "true" } else { "false" }),
    );
    let (used, limit) = if status.has_subscription {
        ("0".to_string(), "unlimited".to_string())
    } else {
        (status.used.to_string(), status.limit.to_string())
    };
    if let Ok(value) = HeaderValue::from_str(&used) {
        headers.insert(HeaderName::from_static("x-paywall-requests-used"), value);
    }
    if let Ok(value) = HeaderValue::from_str(&limit) {
        headers.insert(HeaderName::from_static("x-paywall-requests-limit"), value);
    }
}

/// Non-streaming analysis: a cache hit returns immediately, otherwise the
/// whole upstream call is awaited before responding.
#[utoipa::path(
    post,
    path = "/analyze",
    request_body = AnalyzeRequest,
    responses((status = 200, description = "Sentence analysis", body = AnalyzeResponse)),
    tag = "analyze",
)]
pub async fn analyze(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<AnalyzeRequest>,
) -> Result<(HeaderMap, Json<AnalyzeResponse>), ApiError> {
    validate(&payload)?;

    let throttle_identity = match &payload.user_id {
        Some(user_id) => ThrottleIdentity::User(user_id),
        None => ThrottleIdentity::Ip(addr.ip()),
    };
    state.analyze_throttle.check(throttle_identity)?;

    let mut headers = HeaderMap::new();
    if let Some(user_id) = &payload.user_id {
        let status = state.ai_quota.check_and_increment(user_id).await?;
        apply_quota_headers(&mut headers, &status);
    }

    let fingerprint = analysis_fingerprint(&payload);
    let fp = fingerprint.as_str();

    if let Some(record) = state.analysis_cache.find_by_fingerprint(fp).await? {
        return Ok((headers, Json(AnalyzeResponse::from_record(&record, true))));
    }

    let prompt = build_prompt(&payload);
    let mut sink = |_chunk: String| {};
    let full = state.ai_provider.stream_generate(&prompt, &mut sink).await?;
    let parsed = parse_structured_analysis(&full)?;
    let now = Utc::now();
    let record = AnalysisRecord {
        fingerprint: fp.to_string(),
        sentence: payload.sentence.clone(),
        target_word: payload.target_word.clone(),
        target_language: payload.target_language.clone(),
        native_language: payload.native_language.clone(),
        context_before: payload.context_before.clone(),
        context_after: payload.context_after.clone(),
        full_translation: parsed.full_translation,
        literal_translation: parsed.literal_translation,
        grammar_analysis: parsed.grammar_analysis,
        breakdown: parsed.breakdown,
        idioms: parsed.idioms,
        difficulty_notes: parsed.difficulty_notes,
        chunk_log: None,
        access_count: 1,
        created_at: now,
        last_accessed_at: now,
    };

    if let Err(err) = state.analysis_cache.persist_with_retry(&record).await {
        tracing::warn!(fingerprint = fp, error = %err, "analysis_persist_failed");
    }

    Ok((headers, Json(AnalyzeResponse::from_record(&record, false))))
}

struct UnsubscribeGuard {
    registry: lexiclip_stream_registry::StreamRegistry,
    fingerprint: String,
    id: u64,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.fingerprint, self.id);
    }
}

fn frame_to_event(frame: ServerFrame) -> Event {
    let value = match frame {
        ServerFrame::Chunk { text } => json!({ "chunk": text }),
        ServerFrame::Done { full_response } => json!({ "done": true, "fullResponse": full_response }),
        ServerFrame::Error { message } => json!({ "error": message }),
    };
    Event::default()
        .json_data(value)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

fn live_stream(
    rx: tokio::sync::mpsc::UnboundedReceiver<ServerFrame>,
    guard: UnsubscribeGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((rx, Some(guard), false), |(mut rx, guard, done)| async move {
        if done {
            return None;
        }
        let frame = rx.recv().await?;
        let terminal = matches!(frame, ServerFrame::Done { .. } | ServerFrame::Error { .. });
        Some((Ok(frame_to_event(frame)), (rx, guard, terminal)))
    })
}

fn replay_cached_stream(record: AnalysisRecord) -> impl Stream<Item = Result<Event, Infallible>> {
    let full_response = reconstruct_full_response(&record);

    let pieces: Vec<(String, u64)> = match &record.chunk_log {
        Some(log) if !log.is_empty() => log
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let delay = log
                    .get(i + 1)
                    .map(|next| lexiclip_analysis_cache::replay_delay_ms(entry.timestamp_ms, next.timestamp_ms))
                    .unwrap_or(0);
                (entry.text.clone(), delay)
            })
            .collect(),
        _ => lexiclip_analysis_cache::synthesize_legacy_chunks(&full_response)
            .into_iter()
            .map(|chunk| (chunk, lexiclip_analysis_cache::LEGACY_CHUNK_DELAY_MS))
            .collect(),
    };

    stream::unfold(
        (pieces.into_iter(), Some(full_response), false),
        |(mut iter, full, done)| async move {
            if done {
                return None;
            }
            match iter.next() {
                Some((text, delay)) => {
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    Some((Ok(frame_to_event(ServerFrame::Chunk { text })), (iter, full, false)))
                }
                None => {
                    let full_response = full.unwrap_or_default();
                    let event = frame_to_event(ServerFrame::Done { full_response });
                    Some((Ok(event), (iter, None, true)))
                }
            }
        },
    )
}

fn sse_response(headers: HeaderMap, stream: impl Stream<Item = Result<Event, Infallible>> + Send + 'static) -> Response {
    let mut response = Sse::new(stream).into_response();
    response.headers_mut().extend(headers);
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response.headers_mut().insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

/// Streaming analysis: fans out through the stream registry so concurrent
/// requests for the same fingerprint share a single upstream call, or
/// replays a cached analysis at the same pacing a live stream would use.
#[utoipa::path(
    post,
    path = "/analyze/stream",
    request_body = AnalyzeRequest,
    responses((status = 200, description = "Server-sent analysis chunks", content_type = "text/event-stream")),
    tag = "analyze",
)]
pub async fn analyze_stream(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<AnalyzeRequest>,
) -> Result<Response, ApiError> {
    validate(&payload)?;

    let throttle_identity = match &payload.user_id {
        Some(user_id) => ThrottleIdentity::User(user_id),
        None => ThrottleIdentity::Ip(addr.ip()),
    };
    state.analyze_throttle.check(throttle_identity)?;

    let mut headers = HeaderMap::new();
    if let Some(user_id) = &payload.user_id {
        let status = state.ai_quota.check_and_increment(user_id).await?;
        apply_quota_headers(&mut headers, &status);
    }

    let fingerprint = analysis_fingerprint(&payload);
    let fp = fingerprint.as_str().to_string();

    if let Some(record) = state.analysis_cache.find_by_fingerprint(&fp).await? {
        return Ok(sse_response(headers, replay_cached_stream(record)));
    }

    let params = StreamParams {
        sentence: payload.sentence.clone(),
        target_word: payload.target_word.clone(),
        target_language: payload.target_language.clone(),
        native_language: payload.native_language.clone(),
    };

    let ai_provider = state.ai_provider.clone();
    let analysis_cache = state.analysis_cache.clone();
    let stream_registry = state.stream_registry.clone();
    let prompt = build_prompt(&payload);
    let record_fingerprint = fp.clone();
    let request = payload.clone();

    state.stream_registry.get_or_create(&fp, params, move |active_stream| {
        let stream_registry = stream_registry.clone();
        async move {
            let outcome = {
                let active_stream = active_stream.clone();
                let mut sink = move |chunk: String| active_stream.publish_chunk(&chunk);
                ai_provider.stream_generate(&prompt, &mut sink).await
            };

            match outcome {
                Ok(_) => match parse_structured_analysis(&active_stream.accumulated_text()) {
                    Ok(parsed) => {
                        let now = Utc::now();
                        let record = AnalysisRecord {
                            fingerprint: record_fingerprint.clone(),
                            sentence: request.sentence.clone(),
                            target_word: request.target_word.clone(),
                            target_language: request.target_language.clone(),
                            native_language: request.native_language.clone(),
                            context_before: request.context_before.clone(),
                            context_after: request.context_after.clone(),
                            full_translation: parsed.full_translation,
                            literal_translation: parsed.literal_translation,
                            grammar_analysis: parsed.grammar_analysis,
                            breakdown: parsed.breakdown,
                            idioms: parsed.idioms,
                            difficulty_notes: parsed.difficulty_notes,
                            chunk_log: Some(active_stream.chunk_log()),
                            access_count: 1,
                            created_at: now,
                            last_accessed_at: now,
                        };
                        if let Err(err) = analysis_cache.persist_with_retry(&record).await {
                            tracing::warn!(fingerprint = %record_fingerprint, error = %err, "analysis_persist_failed");
                        }
                        active_stream.complete();
                    }
                    Err(err) => active_stream.fail(err.to_string()),
                },
                Err(err) => active_stream.fail(ApiError::from(err).to_string()),
            }

            stream_registry.schedule_cleanup(&record_fingerprint);
        }
    });

    let (id, rx, _stream) = state
        .stream_registry
        .subscribe(&fp)
        .ok_or_else(|| ApiError::Persistence("stream vanished immediately after creation".to_string()))?;

    let guard = UnsubscribeGuard {
        registry: state.stream_registry.clone(),
        fingerprint: fp,
        id,
    };

    Ok(sse_response(headers, live_stream(rx, guard)))
}
