use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kinesis::config::Region;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::Client;
use metrics::counter;
use tracing::{error, info};

use pipeline_common::envelope::EventEnvelope;

use crate::api::IngestError;
use crate::config::PartnerStreamConfig;
use crate::sinks::Event;

/// Publishes envelopes to the partner-facing shard stream, again keyed by
/// tenant id so per-tenant ordering holds within a shard. The partner path
/// bypasses the internal log entirely.
#[derive(Clone)]
pub struct KinesisSink {
    client: Client,
    stream_name: String,
}

impl KinesisSink {
    /// Uses the default AWS credential chain (env vars, instance profile,
    /// etc.); the endpoint override is for localstack.
    pub async fn new(config: &PartnerStreamConfig) -> KinesisSink {
        let region = Region::new(config.partner_stream_region.clone());

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .load()
            .await;

        let mut builder = aws_sdk_kinesis::config::Builder::from(&aws_config).region(region);
        if let Some(endpoint) = &config.partner_stream_endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(
            "publishing partner events to stream {}",
            config.partner_stream_name
        );

        KinesisSink {
            client: Client::from_conf(builder.build()),
            stream_name: config.partner_stream_name.clone(),
        }
    }
}

#[async_trait]
impl Event for KinesisSink {
    async fn send(&self, envelope: EventEnvelope) -> Result<(), IngestError> {
        let payload = envelope.to_payload().map_err(|e| {
            error!("failed to serialize envelope: {}", e);
            IngestError::NonRetryableSinkError
        })?;

        self.client
            .put_record()
            .stream_name(&self.stream_name)
            .partition_key(&envelope.tenant_id)
            .data(Blob::new(payload.into_bytes()))
            .send()
            .await
            .map_err(|e| {
                counter!("ingest_partner_publish_errors_total").increment(1);
                error!("failed to put record on partner stream: {}", e);
                IngestError::RetryableSinkError
            })?;

        counter!("ingest_partner_events_published_total").increment(1);
        Ok(())
    }

    async fn send_batch(&self, envelopes: Vec<EventEnvelope>) -> Result<(), IngestError> {
        for envelope in envelopes {
            self.send(envelope).await?;
        }
        Ok(())
    }
}
