use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use lexiclip_adapters::AdapterError;
use lexiclip_analysis_cache::AnalysisCacheError;
use lexiclip_canonicalize::CanonicalizeError;
use lexiclip_job_store::JobStoreError;
use lexiclip_quota::{AiQuotaError, ThrottleError};
use lexiclip_result_store::ResultStoreError;
use lexiclip_word_index::WordIndexError;

/// The spec's error taxonomy collapsed into the single type the HTTP
/// boundary converts every internal crate error into. Internal crates never
/// depend on axum; conversion only happens here.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found")]
    NotFound,
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: i64 },
    #[error("quota exceeded, retry after {retry_after_secs}s")]
    QuotaExceeded { retry_after_secs: i64 },
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream misconfigured: {0}")]
    UpstreamConfig(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_formatted: Option<String>,
}

fn format_retry_after(secs: i64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m{}s", secs / 60, secs % 60)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidInput(message) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: message,
                    retry_after_seconds: None,
                    retry_after_formatted: None,
                }),
            )
                .into_response(),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: "not found".to_string(),
                    retry_after_seconds: None,
                    retry_after_formatted: None,
                }),
            )
                .into_response(),
            ApiError::RateLimited { retry_after_secs } | ApiError::QuotaExceeded { retry_after_secs } => {
                let status = if matches!(self, ApiError::RateLimited { .. }) {
                    StatusCode::TOO_MANY_REQUESTS
                } else {
                    StatusCode::FORBIDDEN
                };
                let mut response = (
                    status,
                    Json(ErrorBody {
                        error: self.to_string(),
                        retry_after_seconds: Some(retry_after_secs),
                        retry_after_formatted: Some(format_retry_after(retry_after_secs)),
                    }),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            ApiError::UpstreamUnavailable(message) => {
                tracing::warn!(error = %message, "upstream_unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ErrorBody {
                        error: "upstream service unavailable".to_string(),
                        retry_after_seconds: None,
                        retry_after_formatted: None,
                    }),
                )
                    .into_response()
            }
            ApiError::UpstreamConfig(message) => {
                tracing::error!(error = %message, "upstream_misconfigured");
                sentry::capture_message(&message, sentry::Level::Error);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: "internal server error".to_string(),
                        retry_after_seconds: None,
                        retry_after_formatted: None,
                    }),
                )
                    .into_response()
            }
            ApiError::Persistence(message) => {
                tracing::error!(error = %message, "persistence_error");
                sentry::capture_message(&message, sentry::Level::Error);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: "internal server error".to_string(),
                        retry_after_seconds: None,
                        retry_after_formatted: None,
                    }),
                )
                    .into_response()
            }
        }
    }
}

impl From<CanonicalizeError> for ApiError {
    fn from(err: CanonicalizeError) -> Self {
        ApiError::InvalidInput(err.to_string())
    }
}

impl From<ResultStoreError> for ApiError {
    fn from(err: ResultStoreError) -> Self {
        ApiError::Persistence(err.to_string())
    }
}

impl From<JobStoreError> for ApiError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound => ApiError::NotFound,
            other => ApiError::Persistence(other.to_string()),
        }
    }
}

impl From<WordIndexError> for ApiError {
    fn from(err: WordIndexError) -> Self {
        ApiError::Persistence(err.to_string())
    }
}

impl From<AnalysisCacheError> for ApiError {
    fn from(err: AnalysisCacheError) -> Self {
        ApiError::Persistence(err.to_string())
    }
}

impl From<ThrottleError> for ApiError {
    fn from(err: ThrottleError) -> Self {
        match err {
            ThrottleError::RateLimited { retry_after } => ApiError::RateLimited {
                retry_after_secs: retry_after.as_secs() as i64,
            },
        }
    }
}

impl From<AiQuotaError> for ApiError {
    fn from(err: AiQuotaError) -> Self {
        match err {
            AiQuotaError::Exceeded { retry_after_secs } => ApiError::QuotaExceeded { retry_after_secs },
            AiQuotaError::Db(err) => ApiError::Persistence(err.to_string()),
        }
    }
}

impl From<AdapterError> for ApiError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Upstream(message) => ApiError::UpstreamUnavailable(message),
            AdapterError::RateLimited { retry_after_secs } => ApiError::UpstreamUnavailable(format!(
                "upstream rate limited, retry after {retry_after_secs}s"
            )),
            AdapterError::MalformedResponse(message) => ApiError::UpstreamConfig(message),
            AdapterError::Io(err) => ApiError::UpstreamUnavailable(err.to_string()),
        }
    }
}
