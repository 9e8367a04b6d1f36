use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::search::search,
        crate::routes::search::get_job,
        crate::routes::analyze::analyze,
        crate::routes::analyze::analyze_stream,
        crate::routes::words::examples,
        crate::routes::words::word,
        crate::routes::words::words,
        crate::routes::words::stats,
    ),
    components(
        schemas(
            crate::routes::search::SearchRequest,
            crate::routes::search::SearchResponse,
            crate::routes::search::CueDto,
            crate::routes::analyze::AnalyzeRequest,
            crate::routes::analyze::AnalyzeResponse,
            crate::routes::words::WordExampleDto,
            crate::routes::words::WordResponse,
            crate::routes::words::WordsQuery,
            crate::routes::words::StatsResponse,
        )
    ),
    tags(
        (name = "search", description = "Clip search and job polling"),
        (name = "analyze", description = "Streaming and non-streaming sentence analysis"),
        (name = "word-index", description = "Indexed-word lookups"),
    )
)]
struct ApiDoc;

pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}
