use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::Json;
use lexiclip_canonicalize::{canonicalize, QueryKind};
use lexiclip_fingerprint::fingerprint_query;
use lexiclip_job_store::{Job, JobInit, JobStatus, JobStoreError};
use lexiclip_quota::ThrottleIdentity;
use lexiclip_result_store::Segment;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub job_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CueDto {
    pub start: f64,
    pub duration: f64,
    pub text: String,
}

impl From<&lexiclip_result_store::Cue> for CueDto {
    fn from(cue: &lexiclip_result_store::Cue) -> Self {
        CueDto {
            start: cue.start,
            duration: cue.duration,
            text: cue.text.clone(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub status: &'static str,
    pub job_id: Uuid,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captions: Option<Vec<CueDto>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_video_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn video_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "queued",
        JobStatus::Searching => "searching",
        JobStatus::Downloading => "downloading",
        JobStatus::Transcribing => "transcribing",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}

impl SearchResponse {
    fn from_segment(job_id: Uuid, query: String, segment: &Segment) -> Self {
        SearchResponse {
            status: "completed",
            job_id,
            query,
            video_id: Some(segment.video_id.clone()),
            video_url: Some(video_url(&segment.video_id)),
            start_time: Some(segment.start_time),
            end_time: Some(segment.end_time),
            caption: Some(segment.caption.clone()),
            captions: Some(segment.captions.iter().map(CueDto::from).collect()),
            message: None,
            current_video_id: None,
            error: None,
        }
    }

    fn from_job(job: Job) -> Self {
        match job.status {
            JobStatus::Completed => match &job.result {
                Some(segment) => SearchResponse::from_segment(job.id, job.original_query, segment),
                None => SearchResponse {
                    status: "failed",
                    job_id: job.id,
                    query: job.original_query,
                    video_id: None,
                    video_url: None,
                    start_time: None,
                    end_time: None,
                    caption: None,
                    captions: None,
                    message: None,
                    current_video_id: None,
                    error: Some("job completed without a result".to_string()),
                },
            },
            JobStatus::Failed => SearchResponse {
                status: "failed",
                job_id: job.id,
                query: job.original_query,
                video_id: None,
                video_url: None,
                start_time: None,
                end_time: None,
                caption: None,
                captions: None,
                message: None,
                current_video_id: None,
                error: Some(job.error.unwrap_or_else(|| "unknown error".to_string())),
            },
            other => SearchResponse {
                status: status_str(other),
                job_id: job.id,
                query: job.original_query,
                video_id: None,
                video_url: None,
                start_time: None,
                end_time: None,
                caption: None,
                captions: None,
                message: Some(format!("job is {}", status_str(other))),
                current_video_id: job.current_video_id,
                error: None,
            },
        }
    }
}

/// Resolves or creates a job for a search query: a cache hit short-circuits
/// straight to a completed response without ever touching the Job Store.
#[utoipa::path(
    post,
    path = "/search",
    request_body = SearchRequest,
    responses((status = 200, description = "Search result or job status", body = SearchResponse)),
    tag = "search",
)]
pub async fn search(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    state.search_throttle.check(ThrottleIdentity::Ip(addr.ip()))?;

    let canonical_query = canonicalize(&payload.query)?;
    let fingerprint = fingerprint_query(&canonical_query.canonical);
    let fingerprint = fingerprint.as_str();

    if let Some(segment) = state.result_store.find_by_fingerprint(fingerprint).await? {
        let job_id = payload.job_id.unwrap_or_else(Uuid::nil);
        return Ok(Json(SearchResponse::from_segment(job_id, payload.query, &segment)));
    }

    let job = match state.job_store.find_by_fingerprint(fingerprint).await? {
        Some(job) => job,
        None => {
            let kind: &'static str = match canonical_query.kind {
                QueryKind::Word => "word",
                QueryKind::Sentence => "sentence",
            };
            let init = JobInit {
                fingerprint: fingerprint.to_string(),
                original_query: payload.query.clone(),
                canonical: canonical_query.canonical.clone(),
                kind,
            };
            match state.job_store.create(init).await {
                Ok(job) => job,
                Err(JobStoreError::DuplicateKey) => state
                    .job_store
                    .find_by_fingerprint(fingerprint)
                    .await?
                    .ok_or_else(|| ApiError::Persistence("job vanished after duplicate key".to_string()))?,
                Err(err) => return Err(err.into()),
            }
        }
    };

    Ok(Json(SearchResponse::from_job(job)))
}

#[utoipa::path(
    get,
    path = "/jobs/{id}",
    params(("id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job status", body = SearchResponse),
        (status = 404, description = "No such job"),
    ),
    tag = "search",
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SearchResponse>, ApiError> {
    let job = state.job_store.find_by_id(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(SearchResponse::from_job(job)))
}
