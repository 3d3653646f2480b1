use async_trait::async_trait;
use metrics::{counter, histogram};

use pipeline_common::envelope::EventEnvelope;

use crate::api::IngestError;

pub mod kafka;
pub mod kinesis;

/// A destination for accepted envelopes. The internal log and the partner
/// stream are two strategies behind this one trait; the route handler picks
/// which one to publish to.
#[async_trait]
pub trait Event {
    async fn send(&self, envelope: EventEnvelope) -> Result<(), IngestError>;
    async fn send_batch(&self, envelopes: Vec<EventEnvelope>) -> Result<(), IngestError>;
}

pub struct PrintSink {}

#[async_trait]
impl Event for PrintSink {
    async fn send(&self, envelope: EventEnvelope) -> Result<(), IngestError> {
        tracing::info!("single event: {:?}", envelope);
        counter!("ingest_events_published_total").increment(1);

        Ok(())
    }

    async fn send_batch(&self, envelopes: Vec<EventEnvelope>) -> Result<(), IngestError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of events");
        let _enter = span.enter();

        histogram!("ingest_event_batch_size").record(envelopes.len() as f64);
        counter!("ingest_events_published_total").increment(envelopes.len() as u64);
        for envelope in envelopes {
            tracing::info!("event: {:?}", envelope);
        }

        Ok(())
    }
}
