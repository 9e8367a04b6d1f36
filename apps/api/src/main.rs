mod env;
mod openapi;

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, body::Body, extract::MatchedPath, http::Request};
use lexiclip_adapters::http::{
    ChatCompletionsStreamProvider, HttpAudioDownloader, HttpChunkedTranscriber,
    HttpSubscriptionProvider, YoutubeDataApiCatalog, YoutubeOembedCheck,
};
use lexiclip_http::AppState;
use lexiclip_job_pipeline::{EnglishGateConfig, Pipeline};
use lexiclip_job_store::JobStore;
use lexiclip_quota::{AiQuota, GenericThrottle, ThrottleConfig};
use lexiclip_result_store::ResultStore;
use lexiclip_stream_registry::StreamRegistry;
use lexiclip_word_index::WordIndex;
use lexiclip_worker_pool::WorkerPool;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;
use tower_http::{
    classify::ServerErrorsFailureClass,
    cors::{self, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::prelude::*;

use env::env;

async fn app() -> Router {
    let env = env();

    let db = lexiclip_db::Db::connect(&env.database_url).await;
    let http_client = reqwest::Client::new();

    let job_store = JobStore::new(db.clone());
    let result_store = ResultStore::new(db.clone());
    let word_index = WordIndex::new(db.clone());
    let analysis_cache = lexiclip_analysis_cache::AnalysisCache::new(db.clone());

    let catalog = Arc::new(YoutubeDataApiCatalog::new(
        http_client.clone(),
        env.youtube_api_key.clone(),
    ));
    let embeddability = Arc::new(YoutubeOembedCheck::new(http_client.clone()));
    let downloader = Arc::new(HttpAudioDownloader::new(
        http_client.clone(),
        env.audio_service_base_url.clone(),
    ));
    let transcriber = Arc::new(HttpChunkedTranscriber::new(
        http_client.clone(),
        env.transcribe_service_base_url.clone(),
    ));
    let subscriptions = Arc::new(HttpSubscriptionProvider::new(
        http_client.clone(),
        env.subscription_service_base_url.clone(),
        env.subscription_service_api_key.clone(),
    ));
    let ai_provider = Arc::new(ChatCompletionsStreamProvider::new(
        http_client.clone(),
        env.ai_provider_base_url.clone(),
        env.ai_provider_api_key.clone(),
        env.ai_provider_model.clone(),
    ));

    let english_gate = EnglishGateConfig {
        min_function_word_hits: env.english_min_function_words,
        max_non_ascii_ratio: env.english_max_non_ascii_ratio,
    };
    let analytics = Arc::new(hypr_analytics::AnalyticsClientBuilder::default().build());

    let pipeline = Arc::new(Pipeline::new(
        job_store.clone(),
        result_store.clone(),
        word_index.clone(),
        catalog,
        embeddability,
        downloader,
        transcriber,
        english_gate,
        analytics,
    ));

    let worker_pool = WorkerPool::new(job_store.clone());
    let driver_pipeline = pipeline.clone();
    tokio::spawn(async move {
        worker_pool
            .run(move |job| {
                let pipeline = driver_pipeline.clone();
                async move { pipeline.run_job(job).await }
            })
            .await;
    });

    let state = AppState {
        job_store,
        result_store,
        word_index,
        pipeline,
        stream_registry: StreamRegistry::new(),
        analysis_cache,
        ai_quota: Arc::new(AiQuota::new(db.clone(), subscriptions)),
        search_throttle: Arc::new(GenericThrottle::new(ThrottleConfig {
            user_limit: NonZeroU32::new(30).unwrap(),
            ip_limit: NonZeroU32::new(30).unwrap(),
            window: Duration::from_secs(60 * 60),
        })),
        analyze_throttle: Arc::new(GenericThrottle::new(ThrottleConfig {
            user_limit: NonZeroU32::new(60).unwrap(),
            ip_limit: NonZeroU32::new(60).unwrap(),
            window: Duration::from_secs(60 * 60),
        })),
        ai_provider,
    };

    Router::new()
        .route("/health", axum::routing::get(version))
        .route("/openapi.json", axum::routing::get(openapi_json))
        .merge(lexiclip_http::router(state))
        .layer(
            CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods(cors::Any)
                .allow_headers(cors::Any),
        )
        .layer(
            ServiceBuilder::new()
                .layer(NewSentryLayer::<Request<Body>>::new_from_top())
                .layer(SentryHttpLayer::new().enable_transaction())
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(|request: &Request<Body>| {
                            let path = request.uri().path();

                            if path == "/health" {
                                return tracing::Span::none();
                            }

                            let method = request.method();
                            let matched_path = request
                                .extensions()
                                .get::<MatchedPath>()
                                .map(MatchedPath::as_str)
                                .unwrap_or(path);
                            let (service, span_op) = match path {
                                p if p.starts_with("/search") || p.starts_with("/jobs") => {
                                    ("search", "http.server.search")
                                }
                                p if p.starts_with("/analyze") => {
                                    ("analyze", "http.server.analyze")
                                }
                                p if p.starts_with("/word") || p.starts_with("/examples") || p.starts_with("/stats") => {
                                    ("word-index", "http.server.word_index")
                                }
                                _ => ("unknown", "http.server"),
                            };

                            tracing::info_span!(
                                "http_request",
                                method = %method,
                                http.route = %matched_path,
                                service = %service,
                                otel.name = %format!("{} {}", method, matched_path),
                                span.op = %span_op,
                            )
                        })
                        .on_request(|request: &Request<Body>, _span: &tracing::Span| {
                            if request.uri().path() == "/health" {
                                return;
                            }
                            tracing::info!(
                                method = %request.method(),
                                path = %request.uri().path(),
                                "http_request_started"
                            );
                        })
                        .on_response(
                            |response: &axum::http::Response<axum::body::Body>,
                             latency: std::time::Duration,
                             span: &tracing::Span| {
                                if span.is_disabled() {
                                    return;
                                }
                                tracing::info!(
                                    parent: span,
                                    http_status = %response.status().as_u16(),
                                    latency_ms = %latency.as_millis(),
                                    "http_request_finished"
                                );
                            },
                        )
                        .on_failure(
                            |failure_class: ServerErrorsFailureClass,
                             latency: std::time::Duration,
                             span: &tracing::Span| {
                                if span.is_disabled() {
                                    return;
                                }
                                tracing::error!(
                                    parent: span,
                                    failure_class = ?failure_class,
                                    latency_ms = %latency.as_millis(),
                                    "http_request_failed"
                                );
                            },
                        ),
                ),
        )
}

fn main() -> std::io::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let _ = openapi::write_openapi_json();

    let env = env();

    let _guard = sentry::init(sentry::ClientOptions {
        dsn: env.sentry_dsn.as_ref().and_then(|s| s.parse().ok()),
        release: option_env!("APP_VERSION").map(|v| format!("lexiclip-api@{}", v).into()),
        environment: Some(
            if cfg!(debug_assertions) {
                "development"
            } else {
                "production"
            }
            .into(),
        ),
        traces_sample_rate: 1.0,
        sample_rate: 1.0,
        send_default_pii: true,
        auto_session_tracking: true,
        session_mode: sentry::SessionMode::Request,
        attach_stacktrace: true,
        max_breadcrumbs: 100,
        ..Default::default()
    });

    sentry::configure_scope(|scope| {
        scope.set_tag("service", "lexiclip-api");
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(sentry::integrations::tracing::layer())
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            let addr = SocketAddr::from(([0, 0, 0, 0], env.port));
            tracing::info!(addr = %addr, "server_listening");

            let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
            axum::serve(
                listener,
                app().await.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal())
            .await
            .unwrap();
        });

    if let Some(client) = sentry::Hub::current().client() {
        client.close(Some(Duration::from_secs(2)));
    }

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("shutdown_signal_received");
}

async fn openapi_json() -> axum::Json<utoipa::openapi::OpenApi> {
    axum::Json(openapi::openapi())
}

async fn version() -> &'static str {
    option_env!("VERGEN_GIT_SHA").unwrap_or("unknown")
}
