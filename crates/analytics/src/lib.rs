//! Structured event log for pipeline lifecycle events (job enqueued,
//! completed, failed; stream replays coalesced onto a live publisher). Every
//! event is logged via `tracing` so it shows up in the same place as the
//! rest of the service's operational logs; a sink can additionally be
//! plugged in to forward events to an external collector.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub name: &'static str,
    #[serde(flatten)]
    pub props: HashMap<String, Value>,
}

impl PipelineEvent {
    pub fn builder(name: &'static str) -> PipelineEventBuilder {
        PipelineEventBuilder {
            name,
            props: HashMap::new(),
        }
    }
}

pub struct PipelineEventBuilder {
    name: &'static str,
    props: HashMap<String, Value>,
}

impl PipelineEventBuilder {
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> PipelineEvent {
        PipelineEvent {
            name: self.name,
            props: self.props,
        }
    }
}

/// A destination for pipeline events beyond the local trace log, e.g. a
/// product-analytics collector. Implementations must not block the caller
/// on network I/O failures; this trait has no error return because a
/// dropped event is never fatal to the pipeline.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn emit(&self, event: &PipelineEvent);
}

#[derive(Clone, Default)]
pub struct AnalyticsClient {
    sink: Option<Arc<dyn AnalyticsSink>>,
}

#[derive(Default)]
pub struct AnalyticsClientBuilder {
    sink: Option<Arc<dyn AnalyticsSink>>,
}

impl AnalyticsClientBuilder {
    pub fn with_sink(mut self, sink: Arc<dyn AnalyticsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> AnalyticsClient {
        AnalyticsClient { sink: self.sink }
    }
}

impl AnalyticsClient {
    pub async fn event(&self, event: PipelineEvent) {
        tracing::info!(event = event.name, props = ?event.props, "pipeline_event");

        if let Some(sink) = &self.sink {
            sink.emit(&event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AnalyticsSink for RecordingSink {
        async fn emit(&self, event: &PipelineEvent) {
            self.events.lock().unwrap().push(event.name.to_string());
        }
    }

    #[tokio::test]
    async fn event_without_sink_just_logs() {
        let client = AnalyticsClientBuilder::default().build();
        client
            .event(PipelineEvent::builder("job_enqueued").with("fingerprint", "abc").build())
            .await;
    }

    #[tokio::test]
    async fn event_with_sink_forwards_to_it() {
        let sink = Arc::new(RecordingSink::default());
        let client = AnalyticsClientBuilder::default()
            .with_sink(sink.clone())
            .build();

        client
            .event(PipelineEvent::builder("job_completed").build())
            .await;

        assert_eq!(*sink.events.lock().unwrap(), vec!["job_completed"]);
    }
}
