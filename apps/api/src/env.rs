use std::path::Path;
use std::sync::OnceLock;

use serde::Deserialize;

fn default_port() -> u16 {
    3001
}

fn default_english_min_function_words() -> usize {
    lexiclip_job_pipeline::DEFAULT_ENGLISH_MIN_FUNCTION_WORDS
}

fn default_english_max_non_ascii_ratio() -> f64 {
    lexiclip_job_pipeline::DEFAULT_ENGLISH_MAX_NON_ASCII_RATIO
}

fn filter_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

#[derive(Deserialize)]
pub struct Env {
    #[serde(default = "default_port")]
    pub port: u16,

    pub database_url: String,

    #[serde(default, deserialize_with = "filter_empty")]
    pub sentry_dsn: Option<String>,

    pub youtube_api_key: String,
    pub audio_service_base_url: String,
    pub transcribe_service_base_url: String,
    pub subscription_service_base_url: String,
    pub subscription_service_api_key: String,
    pub ai_provider_base_url: String,
    pub ai_provider_api_key: String,
    pub ai_provider_model: String,

    #[serde(default = "default_english_min_function_words")]
    pub english_min_function_words: usize,
    #[serde(default = "default_english_max_non_ascii_ratio")]
    pub english_max_non_ascii_ratio: f64,
}

static ENV: OnceLock<Env> = OnceLock::new();

pub fn env() -> &'static Env {
    ENV.get_or_init(|| {
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        let _ = dotenvy::from_path(manifest_dir.join(".env"));
        envy::from_env().expect("failed to load environment")
    })
}
