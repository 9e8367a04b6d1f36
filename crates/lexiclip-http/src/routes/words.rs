use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use lexiclip_word_index::WordExample;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct WordExampleDto {
    pub video_id: String,
    pub start_time: f64,
    pub end_time: f64,
    pub caption: String,
    pub inserted_at: DateTime<Utc>,
}

impl From<WordExample> for WordExampleDto {
    fn from(example: WordExample) -> Self {
        WordExampleDto {
            video_id: example.video_id,
            start_time: example.start_time,
            end_time: example.end_time,
            caption: example.caption,
            inserted_at: example.inserted_at,
        }
    }
}

#[utoipa::path(
    get,
    path = "/examples/{word}",
    params(("word" = String, Path, description = "Indexed word")),
    responses(
        (status = 200, description = "Segment references", body = [WordExampleDto]),
        (status = 404, description = "Word not indexed"),
    ),
    tag = "word-index",
)]
pub async fn examples(
    State(state): State<AppState>,
    Path(word): Path<String>,
) -> Result<Json<Vec<WordExampleDto>>, ApiError> {
    let examples = state.word_index.find_by_word(&word.to_lowercase()).await?;
    if examples.is_empty() {
        return Err(ApiError::NotFound);
    }
    Ok(Json(examples.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WordResponse {
    pub word: String,
    pub examples: Vec<WordExampleDto>,
    pub count: usize,
}

#[utoipa::path(
    get,
    path = "/word/{word}",
    params(("word" = String, Path, description = "Indexed word")),
    responses(
        (status = 200, description = "Word with its examples", body = WordResponse),
        (status = 404, description = "Word not indexed"),
    ),
    tag = "word-index",
)]
pub async fn word(
    State(state): State<AppState>,
    Path(word): Path<String>,
) -> Result<Json<WordResponse>, ApiError> {
    let lowered = word.to_lowercase();
    let examples = state.word_index.find_by_word(&lowered).await?;
    if examples.is_empty() {
        return Err(ApiError::NotFound);
    }
    let examples: Vec<WordExampleDto> = examples.into_iter().map(Into::into).collect();
    Ok(Json(WordResponse {
        word: lowered,
        count: examples.len(),
        examples,
    }))
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct WordsQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[utoipa::path(
    get,
    path = "/words",
    params(("limit" = Option<i64>, Query), ("offset" = Option<i64>, Query)),
    responses((status = 200, description = "Page of indexed words", body = [String])),
    tag = "word-index",
)]
pub async fn words(
    State(state): State<AppState>,
    Query(query): Query<WordsQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let words = state.word_index.list_words(query.limit, query.offset).await?;
    Ok(Json(words))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total_words: i64,
    pub total_mappings: i64,
}

#[utoipa::path(
    get,
    path = "/stats",
    responses((status = 200, description = "Word index size", body = StatsResponse)),
    tag = "word-index",
)]
pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.word_index.stats().await?;
    Ok(Json(StatsResponse {
        total_words: stats.total_words,
        total_mappings: stats.total_mappings,
    }))
}
