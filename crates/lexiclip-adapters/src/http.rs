//! `reqwest`-backed implementations of the adapter traits, one HTTP
//! collaborator per trait. Each wraps a single base URL and (where the
//! collaborator requires one) an API key, following the teacher's
//! `OpenRouterProvider` shape: a small struct over a shared `reqwest::Client`,
//! no retry/backoff of its own (that lives at the call site, e.g. the
//! Analysis Cache's `persist_with_retry`).

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    AdapterError, AiStreamProvider, AudioDownloader, CandidateVideo, ChunkSink, ChunkedTranscriber,
    EmbeddabilityCheck, SubscriptionProvider, VideoCatalog,
};

fn map_reqwest_err(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() || err.is_connect() {
        AdapterError::Upstream(err.to_string())
    } else {
        AdapterError::Io(std::io::Error::other(err.to_string()))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);
        return Err(AdapterError::RateLimited { retry_after_secs });
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AdapterError::Upstream(format!("http {status}: {body}")));
    }
    Ok(response)
}

/// Video catalog search over the YouTube Data API v3 `search` endpoint.
pub struct YoutubeDataApiCatalog {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl YoutubeDataApiCatalog {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: "https://www.googleapis.com/youtube/v3".to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct SearchListResponse {
    items: Vec<SearchResultItem>,
}

#[derive(Debug, Deserialize)]
struct SearchResultItem {
    id: SearchResultId,
    snippet: SearchResultSnippet,
}

#[derive(Debug, Deserialize)]
struct SearchResultId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResultSnippet {
    title: String,
}

#[async_trait]
impl VideoCatalog for YoutubeDataApiCatalog {
    async fn search(
        &self,
        query: &str,
        target_results: usize,
    ) -> Result<Vec<CandidateVideo>, AdapterError> {
        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[
                ("part", "snippet"),
                ("type", "video"),
                ("q", query),
                ("maxResults", &target_results.to_string()),
                ("key", &self.api_key),
            ])
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let response = check_status(response).await?;
        let parsed: SearchListResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::MalformedResponse(e.to_string()))?;

        Ok(parsed
            .items
            .into_iter()
            .filter_map(|item| {
                item.id.video_id.map(|video_id| CandidateVideo {
                    video_id,
                    title: item.snippet.title,
                })
            })
            .collect())
    }
}

/// Embeddability check via YouTube's oEmbed endpoint: a 404 means the video
/// cannot be embedded (private, removed, or embedding disabled); any other
/// non-success status is an upstream fault, not a negative answer.
pub struct YoutubeOembedCheck {
    client: reqwest::Client,
    oembed_base_url: String,
}

impl YoutubeOembedCheck {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            oembed_base_url: "https://www.youtube.com/oembed".to_string(),
        }
    }

    pub fn with_oembed_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.oembed_base_url = base_url.into();
        self
    }
}

#[async_trait]
impl EmbeddabilityCheck for YoutubeOembedCheck {
    async fn is_embeddable(&self, video_id: &str) -> Result<bool, AdapterError> {
        let url = format!(
            "{}?url=https://www.youtube.com/watch?v={video_id}&format=json",
            self.oembed_base_url
        );
        let response = self.client.get(url).send().await.map_err(map_reqwest_err)?;
        match response.status() {
            reqwest::StatusCode::OK => Ok(true),
            reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::UNAUTHORIZED => Ok(false),
            other => Err(AdapterError::Upstream(format!("oembed returned {other}"))),
        }
    }
}

/// Audio extraction delegated to a sidecar HTTP service (a thin wrapper
/// around a tool like `yt-dlp` running out of process); this adapter only
/// speaks the HTTP contract, streaming the response body to `dest`.
pub struct HttpAudioDownloader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAudioDownloader {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl AudioDownloader for HttpAudioDownloader {
    async fn download_audio(&self, video_id: &str, dest: &Path) -> Result<(), AdapterError> {
        use tokio::io::AsyncWriteExt;

        let response = self
            .client
            .get(format!("{}/audio/{video_id}", self.base_url))
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let response = check_status(response).await?;
        let bytes = response.bytes().await.map_err(map_reqwest_err)?;

        let mut file = tokio::fs::File::create(dest).await?;
        file.write_all(&bytes).await?;
        Ok(())
    }
}

/// Chunked transcription delegated to a sidecar HTTP speech-to-text service;
/// the response body is the WEBVTT-like caption document for that chunk.
pub struct HttpChunkedTranscriber {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChunkedTranscriber {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ChunkedTranscriber for HttpChunkedTranscriber {
    async fn transcribe_chunk(
        &self,
        audio_path: &Path,
        chunk_index: u32,
    ) -> Result<String, AdapterError> {
        let bytes = tokio::fs::read(audio_path).await?;
        let form = reqwest::multipart::Form::new()
            .text("chunkIndex", chunk_index.to_string())
            .part(
                "audio",
                reqwest::multipart::Part::bytes(bytes)
                    .file_name(audio_path.file_name().and_then(|n| n.to_str()).unwrap_or("chunk.mp3").to_string()),
            );

        let response = self
            .client
            .post(format!("{}/transcribe", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let response = check_status(response).await?;
        response.text().await.map_err(map_reqwest_err)
    }
}

#[derive(Debug, Deserialize)]
struct EntitlementResponse {
    entitled: bool,
}

/// Subscription status reported by the billing/entitlement service.
pub struct HttpSubscriptionProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpSubscriptionProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl SubscriptionProvider for HttpSubscriptionProvider {
    async fn is_entitled(&self, user_id: &str) -> Result<bool, AdapterError> {
        let response = self
            .client
            .get(format!("{}/entitlements/{user_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let response = check_status(response).await?;
        let parsed: EntitlementResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::MalformedResponse(e.to_string()))?;
        Ok(parsed.entitled)
    }
}

/// Streaming generation against an OpenAI-chat-completions-shaped upstream
/// (OpenRouter et al.), accumulating `delta.content` across
/// `text/event-stream` lines the way the teacher's `OpenRouterProvider`
/// parses `data: ` lines up to `[DONE]`.
pub struct ChatCompletionsStreamProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ChatCompletionsStreamProvider {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[async_trait]
impl AiStreamProvider for ChatCompletionsStreamProvider {
    async fn stream_generate(
        &self,
        prompt: &str,
        on_chunk: ChunkSink<'_>,
    ) -> Result<String, AdapterError> {
        use futures_util::StreamExt;

        let body = serde_json::json!({
            "model": self.model,
            "stream": true,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let response = check_status(response).await?;

        let mut full = String::new();
        let mut byte_stream = response.bytes_stream();
        let mut trailing = String::new();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(map_reqwest_err)?;
            trailing.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = trailing.find('\n') {
                let line = trailing[..line_end].trim_end_matches('\r').to_string();
                trailing.drain(..=line_end);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data.trim() == "[DONE]" {
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<StreamChunk>(data) else {
                    continue;
                };
                for choice in parsed.choices {
                    if let Some(text) = choice.delta.content {
                        full.push_str(&text);
                        on_chunk(text);
                    }
                }
            }
        }

        Ok(full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn oembed_check_treats_404_as_not_embeddable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oembed"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let check = YoutubeOembedCheck::new(reqwest::Client::new())
            .with_oembed_base_url(server.uri() + "/oembed");
        assert!(!check.is_embeddable("deadbeef").await.unwrap());
    }

    #[tokio::test]
    async fn oembed_check_treats_200_as_embeddable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oembed"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let check = YoutubeOembedCheck::new(reqwest::Client::new())
            .with_oembed_base_url(server.uri() + "/oembed");
        assert!(check.is_embeddable("deadbeef").await.unwrap());
    }

    #[tokio::test]
    async fn subscription_provider_parses_entitlement() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entitlements/user-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "entitled": true
            })))
            .mount(&server)
            .await;

        let provider =
            HttpSubscriptionProvider::new(reqwest::Client::new(), server.uri(), "test-key");
        let entitled = provider.is_entitled("user-1").await.unwrap();
        assert!(entitled);
    }

    #[tokio::test]
    async fn subscription_provider_rate_limited_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entitlements/user-2"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
            .mount(&server)
            .await;

        let provider =
            HttpSubscriptionProvider::new(reqwest::Client::new(), server.uri(), "test-key");
        let err = provider.is_entitled("user-2").await.unwrap_err();
        assert!(matches!(
            err,
            AdapterError::RateLimited { retry_after_secs: 30 }
        ));
    }

    #[tokio::test]
    async fn chat_completions_provider_accumulates_sse_deltas() {
        let server = MockServer::start().await;
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\", world\"}}]}\n\
                    data: [DONE]\n";
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let provider = ChatCompletionsStreamProvider::new(
            reqwest::Client::new(),
            server.uri(),
            "test-key",
            "gpt-test",
        );

        let mut seen = Vec::new();
        let mut sink = |chunk: String| seen.push(chunk);
        let full = provider.stream_generate("hi", &mut sink).await.unwrap();

        assert_eq!(full, "Hello, world");
        assert_eq!(seen, vec!["Hello".to_string(), ", world".to_string()]);
    }

    #[tokio::test]
    async fn video_catalog_filters_results_missing_a_video_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"id": {"videoId": "abc123"}, "snippet": {"title": "Rust explained"}},
                    {"id": {}, "snippet": {"title": "playlist result, no video id"}},
                ]
            })))
            .mount(&server)
            .await;

        let catalog =
            YoutubeDataApiCatalog::new(reqwest::Client::new(), "key").with_base_url(server.uri());
        let results = catalog.search("rust", 5).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].video_id, "abc123");
    }
}
